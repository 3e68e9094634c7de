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

struct RatingInput {
    student_id: String,
    rating: i64,
    comment: Option<String>,
}

fn parse_ratings(params: &serde_json::Value) -> Result<Vec<RatingInput>, HandlerErr> {
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
        let rating = entry
            .get("rating")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| HandlerErr::bad_params("records[].rating must be an integer"))?;
        if !(1..=5).contains(&rating) {
            return Err(HandlerErr::bad_params("rating must be between 1 and 5"));
        }
        records.push(RatingInput {
            student_id,
            rating,
            comment: get_opt_str(entry, "comment"),
        });
    }
    records.reverse();
    Ok(records)
}

fn behavior_rate(records: &[RatingInput]) -> f64 {
    let sum: i64 = records.iter().map(|r| r.rating).sum();
    round2(sum as f64 / records.len() as f64)
}

fn write_ratings(
    conn: &Connection,
    behavior_id: &str,
    records: &[RatingInput],
) -> Result<(), HandlerErr> {
    for record in records {
        if !student_exists(conn, &record.student_id)? {
            return Err(HandlerErr::not_found(format!(
                "student not found: {}",
                record.student_id
            )));
        }
        conn.execute(
            "INSERT INTO behavior_records(id, behavior_id, student_id, rating, comment)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                behavior_id,
                &record.student_id,
                record.rating,
                &record.comment,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "behavior_records"))?;
    }
    Ok(())
}

fn behavior_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_date_param(params, "date")?;
    let records = parse_ratings(params)?;

    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM behaviors WHERE course_id = ? AND date = ?",
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
            message: "behavior already recorded for this course and date".to_string(),
            details: Some(json!({ "behaviorId": existing_id })),
        });
    }

    let behavior_id = Uuid::new_v4().to_string();
    let rate = behavior_rate(&records);
    let now = now_iso();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "behaviors"))?;
    tx.execute(
        "INSERT INTO behaviors(id, course_id, date, behavior_rate, total_students, is_active, last_update)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &behavior_id,
            &course_id,
            &date,
            rate,
            records.len() as i64,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "behaviors"))?;
    write_ratings(&tx, &behavior_id, &records)?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "behaviors"))?;

    let dirty = records.iter().map(|r| r.student_id.clone()).collect();
    Ok((
        json!({ "behaviorId": behavior_id, "behaviorRate": rate }),
        dirty,
    ))
}

fn behavior_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let behavior_id = match get_opt_str(params, "behaviorId") {
        Some(id) => id,
        None => {
            let course_id = get_required_str(params, "courseId")?;
            let date = parse_date_param(params, "date")?;
            conn.query_row(
                "SELECT id FROM behaviors WHERE course_id = ? AND date = ?",
                (&course_id, &date),
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("behavior not found"),
                other => HandlerErr::query(other),
            })?
        }
    };

    let header = conn
        .query_row(
            "SELECT course_id, date, behavior_rate, total_students, last_update
             FROM behaviors WHERE id = ? AND is_active = 1",
            [&behavior_id],
            |r| {
                Ok(json!({
                    "id": behavior_id,
                    "courseId": r.get::<_, String>(0)?,
                    "date": r.get::<_, String>(1)?,
                    "behaviorRate": r.get::<_, f64>(2)?,
                    "totalStudents": r.get::<_, i64>(3)?,
                    "lastUpdate": r.get::<_, String>(4)?,
                }))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("behavior not found"),
            other => HandlerErr::query(other),
        })?;

    let mut stmt = conn
        .prepare(
            "SELECT br.student_id, u.last_name, u.first_name, br.rating, br.comment
             FROM behavior_records br JOIN users u ON u.id = br.student_id
             WHERE br.behavior_id = ?
             ORDER BY u.last_name, u.first_name",
        )
        .map_err(HandlerErr::query)?;
    let records: Vec<serde_json::Value> = stmt
        .query_map([&behavior_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "rating": r.get::<_, i64>(3)?,
                "comment": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut result = header;
    result["records"] = json!(records);
    Ok(result)
}

fn behavior_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(serde_json::Value, Vec<String>), HandlerErr> {
    let behavior_id = get_required_str(params, "behaviorId")?;
    let records = parse_ratings(params)?;

    let mut stmt = conn
        .prepare("SELECT student_id FROM behavior_records WHERE behavior_id = ?")
        .map_err(HandlerErr::query)?;
    let previous: Vec<String> = stmt
        .query_map([&behavior_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    if previous.is_empty() {
        return Err(HandlerErr::not_found("behavior not found"));
    }

    let rate = behavior_rate(&records);
    let now = now_iso();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "behaviors"))?;
    tx.execute(
        "DELETE FROM behavior_records WHERE behavior_id = ?",
        [&behavior_id],
    )
    .map_err(|e| HandlerErr::update(e, "behavior_records"))?;
    write_ratings(&tx, &behavior_id, &records)?;
    tx.execute(
        "UPDATE behaviors SET behavior_rate = ?, total_students = ?, last_update = ?
         WHERE id = ?",
        (rate, records.len() as i64, &now, &behavior_id),
    )
    .map_err(|e| HandlerErr::update(e, "behaviors"))?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "behaviors"))?;

    let mut dirty = previous;
    dirty.extend(records.iter().map(|r| r.student_id.clone()));
    Ok((
        json!({ "behaviorId": behavior_id, "behaviorRate": rate }),
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
        "behavior.create" => Some(with_conn_mut(state, req, behavior_create)),
        "behavior.open" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match behavior_open(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        "behavior.update" => Some(with_conn_mut(state, req, behavior_update)),
        _ => None,
    }
}
