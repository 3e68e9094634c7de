use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_bool, get_required_array, get_required_str, now_iso, parse_date_param, student_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

struct MarkInput {
    student_id: String,
    value: f64,
    is_absent: bool,
}

fn parse_marks(params: &serde_json::Value) -> Result<Vec<MarkInput>, HandlerErr> {
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
        let is_absent = entry
            .get("isAbsent")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        // Absent students carry no mark; store zero so the row shape stays uniform.
        let value = if is_absent {
            entry.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0)
        } else {
            entry
                .get("value")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| HandlerErr::bad_params("records[].value must be a number"))?
        };
        if !is_absent && !(0.0..=20.0).contains(&value) {
            return Err(HandlerErr::bad_params("value must be between 0 and 20"));
        }
        records.push(MarkInput {
            student_id,
            value,
            is_absent,
        });
    }
    records.reverse();
    Ok(records)
}

fn write_marks(
    conn: &Connection,
    grade_id: &str,
    records: &[MarkInput],
) -> Result<(), HandlerErr> {
    for record in records {
        if !student_exists(conn, &record.student_id)? {
            return Err(HandlerErr::not_found(format!(
                "student not found: {}",
                record.student_id
            )));
        }
        conn.execute(
            "INSERT INTO grade_records(id, grade_id, student_id, value, is_absent)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                grade_id,
                &record.student_id,
                record.value,
                record.is_absent as i64,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "grade_records"))?;
    }
    Ok(())
}

fn grade_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let session_id = get_required_str(params, "courseSessionId")?;
    let date = parse_date_param(params, "date")?;
    let is_draft = get_bool(params, "isDraft", false);
    let records = parse_marks(params)?;

    // Subject is pinned from the session at creation time so a later session
    // edit does not rewrite history.
    let subject: String = conn
        .query_row(
            "SELECT subject FROM course_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("session not found"),
            other => HandlerErr::query(other),
        })?;

    let grade_id = Uuid::new_v4().to_string();
    let now = now_iso();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "grades"))?;
    tx.execute(
        "INSERT INTO grades(id, course_session_id, subject, date, is_draft, last_update)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &session_id,
            &subject,
            &date,
            is_draft as i64,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "grades"))?;
    write_marks(&tx, &grade_id, &records)?;
    tx.commit().map_err(|e| HandlerErr::update(e, "grades"))?;

    // Drafts are invisible to the averages, so nothing needs recomputing yet.
    let dirty = if is_draft {
        Vec::new()
    } else {
        records.iter().map(|r| r.student_id.clone()).collect()
    };
    Ok((json!({ "gradeId": grade_id, "subject": subject }), dirty))
}

fn grade_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let records = parse_marks(params)?;

    let was_draft: Option<i64> = conn
        .query_row("SELECT is_draft FROM grades WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(HandlerErr::query(other)),
        })?;
    let Some(was_draft) = was_draft else {
        return Err(HandlerErr::not_found("grade not found"));
    };
    let is_draft = params
        .get("isDraft")
        .and_then(|v| v.as_bool())
        .unwrap_or(was_draft != 0);

    let mut stmt = conn
        .prepare("SELECT student_id FROM grade_records WHERE grade_id = ?")
        .map_err(HandlerErr::query)?;
    let previous: Vec<String> = stmt
        .query_map([&grade_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let now = now_iso();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "grades"))?;
    tx.execute("DELETE FROM grade_records WHERE grade_id = ?", [&grade_id])
        .map_err(|e| HandlerErr::update(e, "grade_records"))?;
    write_marks(&tx, &grade_id, &records)?;
    tx.execute(
        "UPDATE grades SET is_draft = ?, last_update = ? WHERE id = ?",
        (is_draft as i64, &now, &grade_id),
    )
    .map_err(|e| HandlerErr::update(e, "grades"))?;
    tx.commit().map_err(|e| HandlerErr::update(e, "grades"))?;

    // An update can publish a draft or retract a published sheet, so the
    // previous roster goes dirty whenever either side was published.
    let mut dirty = Vec::new();
    if was_draft == 0 || !is_draft {
        dirty = previous;
        dirty.extend(records.iter().map(|r| r.student_id.clone()));
    }
    Ok((json!({ "gradeId": grade_id, "isDraft": is_draft }), dirty))
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
        "grades.create" => Some(with_conn_mut(state, req, grade_create)),
        "grades.update" => Some(with_conn_mut(state, req, grade_update)),
        _ => None,
    }
}
