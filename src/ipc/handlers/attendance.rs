use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    course_exists, get_opt_str, get_required_array, get_required_str, now_iso, parse_date_param,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::round2;

struct RecordInput {
    student_id: String,
    is_present: bool,
    comment: Option<String>,
}

/// Parses the wire-side records array, keeping the last entry per student
/// when the client sends duplicates.
fn parse_records(params: &serde_json::Value) -> Result<Vec<RecordInput>, HandlerErr> {
    let raw = get_required_array(params, "records")?;
    if raw.is_empty() {
        return Err(HandlerErr::bad_params("records must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for entry in raw.iter().rev() {
        let student_id = get_required_str(entry, "studentId")?;
        if !seen.insert(student_id.clone()) {
            continue;
        }
        let is_present = entry
            .get("isPresent")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| HandlerErr::bad_params("records[].isPresent must be boolean"))?;
        records.push(RecordInput {
            student_id,
            is_present,
            comment: get_opt_str(entry, "comment"),
        });
    }
    records.reverse();
    Ok(records)
}

fn presence_rate(records: &[RecordInput]) -> f64 {
    let present = records.iter().filter(|r| r.is_present).count();
    round2(present as f64 / records.len() as f64 * 100.0)
}

fn write_records(
    conn: &Connection,
    attendance_id: &str,
    records: &[RecordInput],
) -> Result<(), HandlerErr> {
    for record in records {
        if !student_exists(conn, &record.student_id)? {
            return Err(HandlerErr::not_found(format!(
                "student not found: {}",
                record.student_id
            )));
        }
        conn.execute(
            "INSERT INTO attendance_records(id, attendance_id, student_id, is_present, comment)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                attendance_id,
                &record.student_id,
                record.is_present as i64,
                &record.comment,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "attendance_records"))?;
    }
    Ok(())
}

fn attendance_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_date_param(params, "date")?;
    let records = parse_records(params)?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendances WHERE course_id = ? AND date = ?",
            (&course_id, &date),
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(HandlerErr::query(other)),
        })?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr {
            code: "conflict",
            message: "attendance already recorded for this course and date".to_string(),
            details: Some(json!({ "attendanceId": existing_id })),
        });
    }

    let attendance_id = Uuid::new_v4().to_string();
    let rate = presence_rate(&records);
    let now = now_iso();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "attendances"))?;
    tx.execute(
        "INSERT INTO attendances(id, course_id, date, presence_rate, total_students, last_update)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &attendance_id,
            &course_id,
            &date,
            rate,
            records.len() as i64,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "attendances"))?;
    write_records(&tx, &attendance_id, &records)?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "attendances"))?;

    let dirty = records.iter().map(|r| r.student_id.clone()).collect();
    Ok((
        json!({ "attendanceId": attendance_id, "presenceRate": rate }),
        dirty,
    ))
}

fn attendance_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = match get_opt_str(params, "attendanceId") {
        Some(id) => id,
        None => {
            let course_id = get_required_str(params, "courseId")?;
            let date = parse_date_param(params, "date")?;
            conn.query_row(
                "SELECT id FROM attendances WHERE course_id = ? AND date = ?",
                (&course_id, &date),
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    HandlerErr::not_found("attendance not found")
                }
                other => HandlerErr::query(other),
            })?
        }
    };

    let header = conn
        .query_row(
            "SELECT course_id, date, presence_rate, total_students, last_update
             FROM attendances WHERE id = ?",
            [&attendance_id],
            |r| {
                Ok(json!({
                    "id": attendance_id,
                    "courseId": r.get::<_, String>(0)?,
                    "date": r.get::<_, String>(1)?,
                    "presenceRate": r.get::<_, f64>(2)?,
                    "totalStudents": r.get::<_, i64>(3)?,
                    "lastUpdate": r.get::<_, String>(4)?,
                }))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("attendance not found"),
            other => HandlerErr::query(other),
        })?;

    let mut stmt = conn
        .prepare(
            "SELECT ar.student_id, u.last_name, u.first_name, ar.is_present, ar.comment
             FROM attendance_records ar JOIN users u ON u.id = ar.student_id
             WHERE ar.attendance_id = ?
             ORDER BY u.last_name, u.first_name",
        )
        .map_err(HandlerErr::query)?;
    let records: Vec<serde_json::Value> = stmt
        .query_map([&attendance_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "isPresent": r.get::<_, i64>(3)? != 0,
                "comment": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut result = header;
    result["records"] = json!(records);
    Ok(result)
}

fn attendance_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let records = parse_records(params)?;

    let mut stmt = conn
        .prepare("SELECT student_id FROM attendance_records WHERE attendance_id = ?")
        .map_err(HandlerErr::query)?;
    let previous: Vec<String> = stmt
        .query_map([&attendance_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    if previous.is_empty() {
        return Err(HandlerErr::not_found("attendance not found"));
    }

    let rate = presence_rate(&records);
    let now = now_iso();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "attendances"))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE attendance_id = ?",
        [&attendance_id],
    )
    .map_err(|e| HandlerErr::update(e, "attendance_records"))?;
    write_records(&tx, &attendance_id, &records)?;
    tx.execute(
        "UPDATE attendances SET presence_rate = ?, total_students = ?, last_update = ?
         WHERE id = ?",
        (rate, records.len() as i64, &now, &attendance_id),
    )
    .map_err(|e| HandlerErr::update(e, "attendances"))?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "attendances"))?;

    // Students removed from the sheet need a recompute just as much as the
    // ones still on it.
    let mut dirty = previous;
    dirty.extend(records.iter().map(|r| r.student_id.clone()));
    Ok((
        json!({ "attendanceId": attendance_id, "presenceRate": rate }),
        dirty,
    ))
}

fn with_conn_mut<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<(serde_json::Value, Vec<String>), HandlerErr>,
{
    let outcome = {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        f(conn, &req.params)
    };
    match outcome {
        Ok((result, dirty)) => {
            state.dirty_students.extend(dirty);
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.create" => Some(with_conn_mut(state, req, attendance_create)),
        "attendance.open" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match attendance_open(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        "attendance.update" => Some(with_conn_mut(state, req, attendance_update)),
        _ => None,
    }
}
