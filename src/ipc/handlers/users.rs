use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_bool, get_opt_str, get_required_str, now_iso, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn family_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO families(id, name) VALUES(?, ?)",
        (&id, &name),
    )
    .map_err(|e| HandlerErr::update(e, "families"))?;
    Ok(json!({ "familyId": id }))
}

fn user_create(
    conn: &Connection,
    params: &serde_json::Value,
    role: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = get_opt_str(params, "email");
    let gender = get_opt_str(params, "gender");
    let date_of_birth = get_opt_str(params, "dateOfBirth");
    let family_id = get_opt_str(params, "familyId");

    if let Some(family_id) = &family_id {
        if !row_exists(conn, "SELECT 1 FROM families WHERE id = ?", family_id)? {
            return Err(HandlerErr::not_found("family not found"));
        }
    }

    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO users(
            id, role, last_name, first_name, email, gender, date_of_birth,
            family_id, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            role,
            &last_name,
            &first_name,
            &email,
            &gender,
            &date_of_birth,
            &family_id,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "users"))?;

    Ok(json!({ "userId": id }))
}

fn users_list(
    conn: &Connection,
    params: &serde_json::Value,
    role: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let active_only = get_bool(params, "activeOnly", true);
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, email, gender, date_of_birth, family_id, is_active
             FROM users
             WHERE role = ? AND (is_active = 1 OR ? = 0)
             ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::query)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map((role, active_only as i64), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lastName": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "gender": r.get::<_, Option<String>>(4)?,
                "dateOfBirth": r.get::<_, Option<String>>(5)?,
                "familyId": r.get::<_, Option<String>>(6)?,
                "active": r.get::<_, i64>(7)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "users": rows }))
}

fn student_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    if !row_exists(
        conn,
        "SELECT 1 FROM users WHERE role = 'student' AND id = ?",
        &student_id,
    )? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // Column allowlist; unknown patch keys are rejected, not ignored.
    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    for (key, value) in patch {
        let column = match key.as_str() {
            "firstName" => "first_name",
            "lastName" => "last_name",
            "email" => "email",
            "gender" => "gender",
            "dateOfBirth" => "date_of_birth",
            "familyId" => "family_id",
            "active" => "is_active",
            other => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown patch field: {}",
                    other
                )))
            }
        };
        sets.push(format!("{} = ?", column));
        let bind = if column == "is_active" {
            match value.as_bool() {
                Some(b) => rusqlite::types::Value::Integer(b as i64),
                None => return Err(HandlerErr::bad_params("active must be boolean")),
            }
        } else if value.is_null() {
            rusqlite::types::Value::Null
        } else {
            match value.as_str() {
                Some(s) => rusqlite::types::Value::Text(s.to_string()),
                None => {
                    return Err(HandlerErr::bad_params(format!(
                        "{} must be string or null",
                        key
                    )))
                }
            }
        };
        binds.push(bind);
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("empty patch"));
    }

    sets.push("updated_at = ?".to_string());
    binds.push(rusqlite::types::Value::Text(now_iso()));
    binds.push(rusqlite::types::Value::Text(student_id.clone()));

    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(|e| HandlerErr::update(e, "users"))?;

    Ok(json!({ "studentId": student_id }))
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
        "families.create" => Some(with_conn(state, req, family_create)),
        "students.create" => Some(with_conn(state, req, |c, p| user_create(c, p, "student"))),
        "students.list" => Some(with_conn(state, req, |c, p| users_list(c, p, "student"))),
        "students.update" => Some(with_conn(state, req, student_update)),
        "teachers.create" => Some(with_conn(state, req, |c, p| user_create(c, p, "teacher"))),
        "teachers.list" => Some(with_conn(state, req, |c, p| users_list(c, p, "teacher"))),
        _ => None,
    }
}
