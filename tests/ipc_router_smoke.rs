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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(resp: &serde_json::Value, key: &str) -> String {
    resp.get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{} in {}", key, resp))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoolbook-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let family = request(
        &mut stdin,
        &mut reader,
        "3",
        "families.create",
        json!({ "name": "Smoke Family" }),
    );
    let family_id = result_str(&family, "familyId");

    let student = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "firstName": "Smoke",
            "lastName": "Student",
            "gender": "female",
            "dateOfBirth": "2014-03-15",
            "familyId": family_id
        }),
    );
    let student_id = result_str(&student, "studentId");

    let teacher = request(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "firstName": "Smoke", "lastName": "Teacher" }),
    );
    let teacher_id = result_str(&teacher, "userId");

    let _ = request(&mut stdin, &mut reader, "6", "students.list", json!({}));
    let _ = request(&mut stdin, &mut reader, "7", "teachers.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
    );

    let course = request(
        &mut stdin,
        &mut reader,
        "9",
        "courses.create",
        json!({
            "academicYear": "2025-2026",
            "teacherIds": [teacher_id],
            "sessions": [{
                "subject": "Arabic",
                "level": "A1",
                "dayOfWeek": "saturday_morning",
                "startTime": "09:00",
                "endTime": "10:30",
                "studentIds": [student_id]
            }]
        }),
    );
    let course_id = result_str(&course, "courseId");
    let session_id = course
        .get("result")
        .and_then(|v| v.get("sessionIds"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .expect("sessionIds[0]")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "10", "courses.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "courses.setRoster",
        json!({ "sessionId": session_id, "studentIds": [student_id] }),
    );

    // Sessions only exist on the weekend slots.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "11b",
        "courses.create",
        json!({
            "academicYear": "2025-2026",
            "teacherIds": [teacher_id],
            "sessions": [{
                "subject": "Arabic",
                "dayOfWeek": "monday",
                "startTime": "09:00",
                "endTime": "10:30"
            }]
        }),
    );
    assert_eq!(rejected.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        rejected
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let attendance = request(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.create",
        json!({
            "courseId": course_id,
            "date": "2025-09-06",
            "records": [{ "studentId": student_id, "isPresent": true }]
        }),
    );
    let attendance_id = result_str(&attendance, "attendanceId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.open",
        json!({ "attendanceId": attendance_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.update",
        json!({
            "attendanceId": attendance_id,
            "records": [{ "studentId": student_id, "isPresent": false, "comment": "sick" }]
        }),
    );

    let behavior = request(
        &mut stdin,
        &mut reader,
        "15",
        "behavior.create",
        json!({
            "courseId": course_id,
            "date": "2025-09-06",
            "records": [{ "studentId": student_id, "rating": 4 }]
        }),
    );
    let behavior_id = result_str(&behavior, "behaviorId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "behavior.open",
        json!({ "behaviorId": behavior_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "behavior.update",
        json!({
            "behaviorId": behavior_id,
            "records": [{ "studentId": student_id, "rating": 5 }]
        }),
    );

    let grade = request(
        &mut stdin,
        &mut reader,
        "18",
        "grades.create",
        json!({
            "courseSessionId": session_id,
            "date": "2025-09-06",
            "records": [{ "studentId": student_id, "value": 15.5 }]
        }),
    );
    let grade_id = result_str(&grade, "gradeId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "grades.update",
        json!({
            "gradeId": grade_id,
            "records": [{ "studentId": student_id, "value": 16.0 }]
        }),
    );

    let fee = request(
        &mut stdin,
        &mut reader,
        "20",
        "fees.create",
        json!({
            "familyId": family_id,
            "academicYear": "2025-2026",
            "amountDueCents": 35000,
            "label": "Tuition"
        }),
    );
    let fee_id = result_str(&fee, "feeId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "fees.update",
        json!({ "feeId": fee_id, "patch": { "label": "Tuition 25/26" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "fees.addPayment",
        json!({ "feeId": fee_id, "amountPaidCents": 10000, "method": "cash" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "fees.addNote",
        json!({ "feeId": fee_id, "note": "paid in two installments" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "fees.listByFamily",
        json!({ "familyId": family_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "stats.studentAttendance",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "stats.studentBehavior",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "stats.studentGrades",
        json!({ "studentId": student_id }),
    );
    let _ = request(&mut stdin, &mut reader, "28", "stats.refresh", json!({}));
    let _ = request(&mut stdin, &mut reader, "29", "stats.rebuildAll", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "stats.teacherRefresh",
        json!({ "teacherId": teacher_id, "academicYear": "2025-2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "stats.teacherAnalytics",
        json!({ "academicYear": "2025-2026" }),
    );
    let _ = request(&mut stdin, &mut reader, "32", "stats.global", json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn methods_require_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let resp = request(&mut stdin, &mut reader, "1", "students.list", json!({}));
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("no_workspace")
    );

    drop(stdin);
    let _ = child.wait();
}
