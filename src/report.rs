use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::stats::{self, StatsError, FLOAT_TOLERANCE};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Everything `student_stats` caches for one student, freshly recomputed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSnapshot {
    pub student_id: String,
    pub absences_rate: f64,
    pub absences_count: i64,
    pub behavior_average: f64,
    pub grade_average: Option<f64>,
    pub last_activity: Option<String>,
    #[serde(skip)]
    pub absences: Vec<stats::AbsenceDetail>,
}

/// Rebuild one student's snapshot from raw records. `None` when the student
/// has no attendance, behavior, or grade data at all.
pub fn build_student_snapshot(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<StudentSnapshot>, StatsError> {
    let attendance = stats::student_attendance(conn, student_id)?;
    let behavior = stats::student_behavior(conn, student_id)?;
    let grades = stats::student_grades(conn, student_id)?;

    if attendance.total_sessions == 0 && behavior.total_sessions == 0 && grades.is_none() {
        return Ok(None);
    }

    let last_activity = match (&attendance.last_activity, &behavior.last_activity) {
        (Some(a), Some(b)) => Some(if a >= b { a.clone() } else { b.clone() }),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };

    Ok(Some(StudentSnapshot {
        student_id: student_id.to_string(),
        absences_rate: attendance.absences_rate,
        absences_count: attendance.absences_count,
        behavior_average: behavior.behavior_average,
        grade_average: grades.map(|g| g.overall_average),
        last_activity,
        absences: attendance.absences,
    }))
}

#[derive(Debug, Clone)]
struct StoredStats {
    absences_rate: f64,
    absences_count: i64,
    behavior_average: f64,
    last_activity: Option<String>,
}

fn load_stored_stats(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<StoredStats>, StatsError> {
    conn.query_row(
        "SELECT absences_rate, absences_count, behavior_average, last_activity
         FROM student_stats WHERE user_id = ?",
        [student_id],
        |r| {
            Ok(StoredStats {
                absences_rate: r.get(0)?,
                absences_count: r.get(1)?,
                behavior_average: r.get(2)?,
                last_activity: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(StatsError::db)
}

fn diff_stats(old: Option<&StoredStats>, new: &StudentSnapshot) -> Vec<String> {
    let mut differences = Vec::new();
    let old_rate = old.map(|o| o.absences_rate).unwrap_or(0.0);
    if (old_rate - new.absences_rate).abs() > FLOAT_TOLERANCE {
        differences.push(format!(
            "absences rate: {:.2} -> {:.2}",
            old_rate, new.absences_rate
        ));
    }
    let old_count = old.map(|o| o.absences_count).unwrap_or(0);
    if old_count != new.absences_count {
        differences.push(format!(
            "absences count: {} -> {}",
            old_count, new.absences_count
        ));
    }
    let old_behavior = old.map(|o| o.behavior_average).unwrap_or(0.0);
    if (old_behavior - new.behavior_average).abs() > FLOAT_TOLERANCE {
        differences.push(format!(
            "behavior average: {:.2} -> {:.2}",
            old_behavior, new.behavior_average
        ));
    }
    let old_activity = old.and_then(|o| o.last_activity.clone());
    if old_activity != new.last_activity {
        differences.push(format!(
            "last activity: {} -> {}",
            old_activity.as_deref().unwrap_or("never"),
            new.last_activity.as_deref().unwrap_or("never")
        ));
    }
    differences
}

/// Upsert the cache row and replace the absence detail rows, atomically.
pub fn upsert_student_stats(
    conn: &Connection,
    snapshot: &StudentSnapshot,
) -> Result<(), StatsError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| StatsError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO student_stats(
            user_id, absences_rate, absences_count, behavior_average,
            grade_average, last_activity, last_update)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           absences_rate = excluded.absences_rate,
           absences_count = excluded.absences_count,
           behavior_average = excluded.behavior_average,
           grade_average = excluded.grade_average,
           last_activity = excluded.last_activity,
           last_update = excluded.last_update",
        (
            &snapshot.student_id,
            snapshot.absences_rate,
            snapshot.absences_count,
            snapshot.behavior_average,
            snapshot.grade_average,
            &snapshot.last_activity,
            now_iso(),
        ),
    )
    .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;

    tx.execute(
        "DELETE FROM student_stats_absences WHERE user_id = ?",
        [&snapshot.student_id],
    )
    .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    for absence in &snapshot.absences {
        tx.execute(
            "INSERT INTO student_stats_absences(id, user_id, date, course_id, reason)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &snapshot.student_id,
                &absence.date,
                &absence.course_id,
                &absence.reason,
            ),
        )
        .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| StatsError::new("db_commit_failed", e.to_string()))
}

/// Recompute and upsert a set of students, e.g. the drained dirty queue.
/// Returns the ids that actually had data to write.
pub fn refresh_students(
    conn: &Connection,
    student_ids: &[String],
) -> Result<Vec<String>, StatsError> {
    let mut written = Vec::new();
    for student_id in student_ids {
        if let Some(snapshot) = build_student_snapshot(conn, student_id)? {
            upsert_student_stats(conn, &snapshot)?;
            written.push(student_id.clone());
        }
    }
    Ok(written)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsChange {
    pub student_id: String,
    pub student_name: String,
    pub differences: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStats {
    pub total_students: i64,
    pub updated_students: i64,
    pub skipped_students: i64,
    pub students_without_data: i64,
    pub stats_changes: Vec<StatsChange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildOutcome {
    pub stats: UpdateStats,
    pub report_path: Option<String>,
}

/// Full batch rebuild: every active student, diff against the stored
/// snapshot, upsert on change. A single student failing is logged and counted
/// as skipped; only failing to list the students aborts the run.
pub fn rebuild_all(conn: &Connection, workspace: Option<&Path>) -> anyhow::Result<RebuildOutcome> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name FROM users
         WHERE role = 'student' AND is_active = 1
         ORDER BY last_name, first_name",
    )?;
    let students: Vec<(String, String)> = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((id, format!("{} {}", first, last)))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut update = UpdateStats {
        total_students: students.len() as i64,
        updated_students: 0,
        skipped_students: 0,
        students_without_data: 0,
        stats_changes: Vec::new(),
    };

    for (student_id, student_name) in &students {
        match rebuild_one(conn, student_id) {
            Ok(RebuildStep::NoData) => {
                update.students_without_data += 1;
                update.skipped_students += 1;
            }
            Ok(RebuildStep::Unchanged) => {
                update.skipped_students += 1;
            }
            Ok(RebuildStep::Updated(differences)) => {
                update.updated_students += 1;
                update.stats_changes.push(StatsChange {
                    student_id: student_id.clone(),
                    student_name: student_name.clone(),
                    differences,
                });
            }
            Err(e) => {
                tracing::warn!(student_id = %student_id, code = %e.code, message = %e.message,
                    "student stats rebuild failed, skipping");
                update.skipped_students += 1;
            }
        }
    }

    let report_path = workspace.and_then(|ws| write_report(ws, &update));

    tracing::info!(
        total = update.total_students,
        updated = update.updated_students,
        skipped = update.skipped_students,
        without_data = update.students_without_data,
        "student stats rebuild finished"
    );

    Ok(RebuildOutcome {
        stats: update,
        report_path,
    })
}

enum RebuildStep {
    NoData,
    Unchanged,
    Updated(Vec<String>),
}

fn rebuild_one(conn: &Connection, student_id: &str) -> Result<RebuildStep, StatsError> {
    let Some(snapshot) = build_student_snapshot(conn, student_id)? else {
        return Ok(RebuildStep::NoData);
    };
    let stored = load_stored_stats(conn, student_id)?;
    let differences = diff_stats(stored.as_ref(), &snapshot);
    if differences.is_empty() {
        return Ok(RebuildStep::Unchanged);
    }
    upsert_student_stats(conn, &snapshot)?;
    Ok(RebuildStep::Updated(differences))
}

/// Best-effort JSON run report under `<workspace>/reports/`. Failures (e.g. a
/// read-only deployment target) are logged and otherwise ignored.
fn write_report(workspace: &Path, update: &UpdateStats) -> Option<String> {
    let report = serde_json::json!({
        "date": now_iso(),
        "stats": update,
    });
    let dir = workspace.join("reports");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(error = %e, "cannot create reports directory");
        return None;
    }
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let path: PathBuf = dir.join(format!("student_stats_update_{}.json", timestamp));
    let body = match serde_json::to_string_pretty(&report) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "cannot serialize stats report");
            return None;
        }
    };
    if let Err(e) = std::fs::write(&path, body) {
        tracing::warn!(error = %e, path = %path.display(), "cannot write stats report");
        return None;
    }
    Some(path.to_string_lossy().to_string())
}

/// Recompute one teacher's roster stats and upsert `teacher_stats`.
pub fn refresh_teacher(
    conn: &Connection,
    teacher_id: &str,
    academic_year: &str,
) -> Result<stats::TeacherRosterStats, StatsError> {
    let today = Utc::now().date_naive();
    let roster = stats::teacher_roster_stats(conn, teacher_id, academic_year, today)?;
    conn.execute(
        "INSERT INTO teacher_stats(
            user_id, total_students, course_count, min_age, max_age, average_age,
            male_count, female_count, unknown_gender_count, last_update)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           total_students = excluded.total_students,
           course_count = excluded.course_count,
           min_age = excluded.min_age,
           max_age = excluded.max_age,
           average_age = excluded.average_age,
           male_count = excluded.male_count,
           female_count = excluded.female_count,
           unknown_gender_count = excluded.unknown_gender_count,
           last_update = excluded.last_update",
        (
            teacher_id,
            roster.total_students,
            roster.course_count,
            roster.ages.min_age,
            roster.ages.max_age,
            roster.ages.average_age,
            roster.gender.counts.male,
            roster.gender.counts.female,
            roster.gender.counts.unknown,
            now_iso(),
        ),
    )
    .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    Ok(roster)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_students: i64,
    pub total_teachers: i64,
    pub average_attendance_rate: f64,
    pub last_update: String,
}

/// Recompute headline totals and upsert the single `global_stats` row.
pub fn refresh_global(conn: &Connection) -> Result<GlobalStats, StatsError> {
    let count_role = |role: &str| -> Result<i64, StatsError> {
        conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = ? AND is_active = 1",
            [role],
            |r| r.get(0),
        )
        .map_err(StatsError::db)
    };
    let total_students = count_role("student")?;
    let total_teachers = count_role("teacher")?;
    let average_attendance_rate: f64 = conn
        .query_row(
            "SELECT COALESCE(AVG(presence_rate), 0) FROM attendances",
            [],
            |r| r.get(0),
        )
        .map_err(StatsError::db)?;
    let global = GlobalStats {
        total_students,
        total_teachers,
        average_attendance_rate: stats::round2(average_attendance_rate),
        last_update: now_iso(),
    };
    conn.execute(
        "INSERT INTO global_stats(
            id, total_students, total_teachers, average_attendance_rate, last_update)
         VALUES(1, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           total_students = excluded.total_students,
           total_teachers = excluded.total_teachers,
           average_attendance_rate = excluded.average_attendance_rate,
           last_update = excluded.last_update",
        (
            global.total_students,
            global.total_teachers,
            global.average_attendance_rate,
            &global.last_update,
        ),
    )
    .map_err(|e| StatsError::new("db_update_failed", e.to_string()))?;
    Ok(global)
}
