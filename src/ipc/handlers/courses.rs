use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_bool, get_opt_str, get_required_array, get_required_str, row_exists, student_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::is_work_slot;

fn read_string_array(
    values: &[serde_json::Value],
    what: &str,
) -> Result<Vec<String>, HandlerErr> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", what)))
        })
        .collect()
}

fn insert_roster(
    conn: &Connection,
    session_id: &str,
    student_ids: &[String],
) -> Result<(), HandlerErr> {
    for student_id in student_ids {
        if !student_exists(conn, student_id)? {
            return Err(HandlerErr::not_found(format!(
                "student not found: {}",
                student_id
            )));
        }
        conn.execute(
            "INSERT OR IGNORE INTO course_session_students(session_id, student_id) VALUES(?, ?)",
            (session_id, student_id),
        )
        .map_err(|e| HandlerErr::update(e, "course_session_students"))?;
    }
    Ok(())
}

fn course_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let academic_year = get_required_str(params, "academicYear")?;
    let teacher_ids = read_string_array(
        get_required_array(params, "teacherIds")?,
        "teacherIds",
    )?;
    let sessions = get_required_array(params, "sessions")?;
    if sessions.is_empty() {
        return Err(HandlerErr::bad_params("sessions must not be empty"));
    }

    for teacher_id in &teacher_ids {
        if !row_exists(
            conn,
            "SELECT 1 FROM users WHERE role = 'teacher' AND id = ?",
            teacher_id,
        )? {
            return Err(HandlerErr::not_found(format!(
                "teacher not found: {}",
                teacher_id
            )));
        }
    }

    let course_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "courses"))?;

    tx.execute(
        "INSERT INTO courses(id, academic_year, is_active) VALUES(?, ?, 1)",
        (&course_id, &academic_year),
    )
    .map_err(|e| HandlerErr::update(e, "courses"))?;

    for teacher_id in &teacher_ids {
        tx.execute(
            "INSERT OR IGNORE INTO course_teachers(course_id, teacher_id) VALUES(?, ?)",
            (&course_id, teacher_id),
        )
        .map_err(|e| HandlerErr::update(e, "course_teachers"))?;
    }

    let mut session_ids = Vec::with_capacity(sessions.len());
    for session in sessions {
        let subject = get_required_str(session, "subject")?;
        let level = get_opt_str(session, "level");
        let day_of_week = get_required_str(session, "dayOfWeek")?;
        if !is_work_slot(&day_of_week) {
            return Err(HandlerErr::bad_params(format!(
                "unknown dayOfWeek: {}",
                day_of_week
            )));
        }
        let start_time = get_required_str(session, "startTime")?;
        let end_time = get_required_str(session, "endTime")?;
        let classroom = get_opt_str(session, "classroom");

        let session_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO course_sessions(
                id, course_id, subject, level, day_of_week, start_time, end_time, classroom)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &session_id,
                &course_id,
                &subject,
                &level,
                &day_of_week,
                &start_time,
                &end_time,
                &classroom,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "course_sessions"))?;

        if let Some(roster) = session.get("studentIds").and_then(|v| v.as_array()) {
            let student_ids = read_string_array(roster, "studentIds")?;
            insert_roster(&tx, &session_id, &student_ids)?;
        }
        session_ids.push(session_id);
    }

    tx.commit().map_err(|e| HandlerErr::update(e, "courses"))?;
    Ok(json!({ "courseId": course_id, "sessionIds": session_ids }))
}

fn course_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let academic_year = get_opt_str(params, "academicYear");
    let active_only = get_bool(params, "activeOnly", true);

    let mut stmt = conn
        .prepare(
            "SELECT id, academic_year, is_active FROM courses
             WHERE (academic_year = ? OR ? IS NULL) AND (is_active = 1 OR ? = 0)
             ORDER BY academic_year, id",
        )
        .map_err(HandlerErr::query)?;
    let courses: Vec<(String, String, bool)> = stmt
        .query_map(
            (&academic_year, &academic_year, active_only as i64),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut teacher_stmt = conn
        .prepare(
            "SELECT ct.teacher_id, u.last_name, u.first_name
             FROM course_teachers ct JOIN users u ON u.id = ct.teacher_id
             WHERE ct.course_id = ?
             ORDER BY u.last_name, u.first_name",
        )
        .map_err(HandlerErr::query)?;
    let mut session_stmt = conn
        .prepare(
            "SELECT cs.id, cs.subject, cs.level, cs.day_of_week, cs.start_time, cs.end_time,
                    cs.classroom,
                    (SELECT COUNT(*) FROM course_session_students s WHERE s.session_id = cs.id)
             FROM course_sessions cs
             WHERE cs.course_id = ?
             ORDER BY cs.day_of_week, cs.start_time",
        )
        .map_err(HandlerErr::query)?;

    let mut rows = Vec::with_capacity(courses.len());
    for (course_id, academic_year, active) in courses {
        let teachers: Vec<serde_json::Value> = teacher_stmt
            .query_map([&course_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "firstName": r.get::<_, String>(2)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        let sessions: Vec<serde_json::Value> = session_stmt
            .query_map([&course_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "subject": r.get::<_, String>(1)?,
                    "level": r.get::<_, Option<String>>(2)?,
                    "dayOfWeek": r.get::<_, String>(3)?,
                    "startTime": r.get::<_, String>(4)?,
                    "endTime": r.get::<_, String>(5)?,
                    "classroom": r.get::<_, Option<String>>(6)?,
                    "studentCount": r.get::<_, i64>(7)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        rows.push(json!({
            "id": course_id,
            "academicYear": academic_year,
            "active": active,
            "teachers": teachers,
            "sessions": sessions,
        }));
    }
    Ok(json!({ "courses": rows }))
}

fn set_roster(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_ids = read_string_array(
        get_required_array(params, "studentIds")?,
        "studentIds",
    )?;

    if !row_exists(conn, "SELECT 1 FROM course_sessions WHERE id = ?", &session_id)? {
        return Err(HandlerErr::not_found("session not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::update(e, "course_session_students"))?;
    tx.execute(
        "DELETE FROM course_session_students WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr::update(e, "course_session_students"))?;
    insert_roster(&tx, &session_id, &student_ids)?;
    tx.commit()
        .map_err(|e| HandlerErr::update(e, "course_session_students"))?;

    Ok(json!({ "sessionId": session_id, "studentCount": student_ids.len() }))
}

fn with_conn<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(with_conn(state, req, course_create)),
        "courses.list" => Some(with_conn(state, req, course_list)),
        "courses.setRoster" => Some(with_conn(state, req, set_roster)),
        _ => None,
    }
}
