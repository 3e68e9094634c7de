use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, student_exists, teacher_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::{report, stats};

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value)
        .map_err(|e| HandlerErr::new("internal", format!("serialize failed: {}", e)))
}

fn student_attendance(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let summary = stats::student_attendance(conn, &student_id)?;
    to_json(&summary)
}

fn student_behavior(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let summary = stats::student_behavior(conn, &student_id)?;
    to_json(&summary)
}

fn student_grades(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    match stats::student_grades(conn, &student_id)? {
        Some(summary) => to_json(&summary),
        None => Ok(json!({
            "studentId": student_id,
            "totalGradeRecords": 0,
            "bySubject": {},
            "overallAverage": null,
        })),
    }
}

fn refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let queued: Vec<String> = state.dirty_students.iter().cloned().collect();
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    if queued.is_empty() {
        return ok(&req.id, json!({ "refreshed": [], "remaining": 0 }));
    }
    match report::refresh_students(conn, &queued) {
        Ok(refreshed) => {
            // An Ok pass visited every queued student, including the ones
            // with no raw data yet; all of them leave the queue.
            for id in &queued {
                state.dirty_students.remove(id);
            }
            ok(
                &req.id,
                json!({ "refreshed": refreshed, "remaining": state.dirty_students.len() }),
            )
        }
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn rebuild_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = state.workspace.clone();
    let Some(conn) = state.db.as_ref() else {
        return no_workspace().response(&req.id);
    };
    match report::rebuild_all(conn, workspace.as_deref()) {
        Ok(outcome) => {
            // A full rebuild supersedes any queued work.
            state.dirty_students.clear();
            match serde_json::to_value(&outcome) {
                Ok(result) => ok(&req.id, result),
                Err(e) => err(
                    &req.id,
                    "internal",
                    format!("serialize failed: {}", e),
                    None,
                ),
            }
        }
        Err(e) => err(&req.id, "rebuild_failed", e.to_string(), None),
    }
}

fn teacher_refresh(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let teacher_id = get_required_str(&req.params, "teacherId")?;
    let academic_year = get_required_str(&req.params, "academicYear")?;
    if !teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let roster = report::refresh_teacher(conn, &teacher_id, &academic_year)?;
    to_json(&roster)
}

fn teacher_analytics(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let academic_year = get_required_str(&req.params, "academicYear")?;
    let analytics = stats::analyze_teacher_sessions(conn, &academic_year)?;
    to_json(&analytics)
}

fn global(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let global = report::refresh_global(conn)?;
    to_json(&global)
}

fn no_workspace() -> HandlerErr {
    HandlerErr::new("no_workspace", "select a workspace first")
}

fn respond(req: &Request, outcome: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match outcome {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.studentAttendance" => Some(respond(req, student_attendance(state, req))),
        "stats.studentBehavior" => Some(respond(req, student_behavior(state, req))),
        "stats.studentGrades" => Some(respond(req, student_grades(state, req))),
        "stats.refresh" => Some(refresh(state, req)),
        "stats.rebuildAll" => Some(rebuild_all(state, req)),
        "stats.teacherRefresh" => Some(respond(req, teacher_refresh(state, req))),
        "stats.teacherAnalytics" => Some(respond(req, teacher_analytics(state, req))),
        "stats.global" => Some(respond(req, global(state, req))),
        _ => None,
    }
}
