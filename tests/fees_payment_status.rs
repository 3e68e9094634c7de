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
fn payment_status_is_derived_from_integer_cents() {
    let workspace = temp_dir("schoolbook-fees");
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

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "families.create",
        json!({ "name": "Durand" }),
    );
    let family_id = expect_ok(&resp, "families.create")["familyId"]
        .as_str()
        .expect("familyId")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "fees.create",
        json!({
            "familyId": family_id,
            "academicYear": "2025-2026",
            "amountDueCents": 50000,
            "label": "Tuition"
        }),
    );
    let fee_id = expect_ok(&resp, "fees.create")["feeId"]
        .as_str()
        .expect("feeId")
        .to_string();

    // 200.00 of 500.00: partial.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.addPayment",
        json!({ "feeId": fee_id, "amountPaidCents": 20000, "method": "cash" }),
    );
    let result = expect_ok(&resp, "fees.addPayment");
    assert_eq!(result["paidTotalCents"].as_i64(), Some(20000));
    assert_eq!(result["paymentStatus"].as_str(), Some("partial"));

    // Remaining 300.00: paid, with no floating point drift possible.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "fees.addPayment",
        json!({ "feeId": fee_id, "amountPaidCents": 30000, "method": "transfer" }),
    );
    let result = expect_ok(&resp, "fees.addPayment");
    assert_eq!(result["paidTotalCents"].as_i64(), Some(50000));
    assert_eq!(result["paymentStatus"].as_str(), Some("paid"));

    // A second fee with no payments reads as unpaid.
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "fees.create",
        json!({
            "familyId": family_id,
            "academicYear": "2025-2026",
            "amountDueCents": 12000,
            "label": "Books"
        }),
    );
    expect_ok(&resp, "fees.create");

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "fees.addNote",
        json!({ "feeId": fee_id, "note": "settled at enrolment" }),
    );
    expect_ok(&resp, "fees.addNote");

    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "fees.listByFamily",
        json!({ "familyId": family_id }),
    );
    let listing = expect_ok(&resp, "fees.listByFamily");
    let fees = listing["fees"].as_array().expect("fees");
    assert_eq!(fees.len(), 2);

    let tuition = fees
        .iter()
        .find(|f| f["label"].as_str() == Some("Tuition"))
        .expect("tuition fee");
    assert_eq!(tuition["paymentStatus"].as_str(), Some("paid"));
    assert_eq!(tuition["paidTotalCents"].as_i64(), Some(50000));
    assert_eq!(tuition["payments"].as_array().map(Vec::len), Some(2));
    assert_eq!(tuition["notes"].as_array().map(Vec::len), Some(1));

    let books = fees
        .iter()
        .find(|f| f["label"].as_str() == Some("Books"))
        .expect("books fee");
    assert_eq!(books["paymentStatus"].as_str(), Some("unpaid"));
    assert_eq!(books["paidTotalCents"].as_i64(), Some(0));

    // Family rollup: 500.00 paid of 620.00 due.
    assert_eq!(listing["totalDueCents"].as_i64(), Some(62000));
    assert_eq!(listing["totalPaidCents"].as_i64(), Some(50000));
    assert_eq!(listing["paymentStatus"].as_str(), Some("partial"));

    // Negative amounts never enter the ledger.
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "fees.addPayment",
        json!({ "feeId": fee_id, "amountPaidCents": -500 }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
