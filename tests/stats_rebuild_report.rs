use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn expect_ok(resp: &serde_json::Value, method: &str) -> serde_json::Value {
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result")
}

#[test]
fn batch_rebuild_diffs_snapshots_and_writes_run_report() {
    let workspace = temp_dir("schoolbook-rebuild");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );

    let mut students = Vec::new();
    for (i, name) in ["Alpha", "Bravo", "NoData"].iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "firstName": "Test", "lastName": name }),
        );
        students.push(
            expect_ok(&resp, "students.create")["studentId"]
                .as_str()
                .expect("studentId")
                .to_string(),
        );
    }

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "firstName": "Lead", "lastName": "Teacher" }),
    );
    let teacher_id = expect_ok(&resp, "teachers.create")["userId"]
        .as_str()
        .expect("userId")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({
            "academicYear": "2025-2026",
            "teacherIds": [teacher_id],
            "sessions": [{
                "subject": "Arabic",
                "dayOfWeek": "saturday_morning",
                "startTime": "09:00",
                "endTime": "10:30",
                "studentIds": [students[0], students[1]]
            }]
        }),
    );
    let course_id = expect_ok(&resp, "courses.create")["courseId"]
        .as_str()
        .expect("courseId")
        .to_string();

    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "4",
            "attendance.create",
            json!({
                "courseId": course_id,
                "date": "2025-09-06",
                "records": [
                    { "studentId": students[0], "isPresent": true },
                    { "studentId": students[1], "isPresent": false }
                ]
            }),
        ),
        "attendance.create",
    );
    expect_ok(
        &request(
            &mut stdin,
            &mut reader,
            "5",
            "behavior.create",
            json!({
                "courseId": course_id,
                "date": "2025-09-06",
                "records": [
                    { "studentId": students[0], "rating": 5 },
                    { "studentId": students[1], "rating": 3 }
                ]
            }),
        ),
        "behavior.create",
    );

    let resp = request(&mut stdin, &mut reader, "6", "stats.rebuildAll", json!({}));
    let outcome = expect_ok(&resp, "stats.rebuildAll");
    let stats = &outcome["stats"];
    assert_eq!(stats["totalStudents"].as_i64(), Some(3));
    assert_eq!(stats["updatedStudents"].as_i64(), Some(2));
    assert_eq!(stats["studentsWithoutData"].as_i64(), Some(1));
    assert_eq!(stats["skippedStudents"].as_i64(), Some(1));
    assert_eq!(stats["statsChanges"].as_array().map(Vec::len), Some(2));

    let report_path = outcome["reportPath"].as_str().expect("reportPath");
    let body = std::fs::read_to_string(report_path).expect("read run report");
    let report: serde_json::Value = serde_json::from_str(&body).expect("parse run report");
    assert_eq!(report["stats"]["updatedStudents"].as_i64(), Some(2));

    // Nothing changed since: every student is either unchanged or dataless.
    let resp = request(&mut stdin, &mut reader, "7", "stats.rebuildAll", json!({}));
    let outcome = expect_ok(&resp, "stats.rebuildAll");
    let stats = &outcome["stats"];
    assert_eq!(stats["updatedStudents"].as_i64(), Some(0));
    assert_eq!(stats["skippedStudents"].as_i64(), Some(3));
    assert_eq!(stats["statsChanges"].as_array().map(Vec::len), Some(0));

    let resp = request(&mut stdin, &mut reader, "8", "stats.global", json!({}));
    let global = expect_ok(&resp, "stats.global");
    assert_eq!(global["totalStudents"].as_i64(), Some(3));
    assert_eq!(global["totalTeachers"].as_i64(), Some(1));
    assert_eq!(global["averageAttendanceRate"].as_f64(), Some(50.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
