use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;

/// Float comparison tolerance used when diffing recomputed stats against the
/// stored snapshot.
pub const FLOAT_TOLERANCE: f64 = 0.01;

pub const SATURDAY_MORNING: &str = "saturday_morning";
pub const SATURDAY_AFTERNOON: &str = "saturday_afternoon";
pub const SUNDAY_MORNING: &str = "sunday_morning";

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

fn text_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}

// ---------------------------------------------------------------------------
// Attendance

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbsenceDetail {
    pub date: String,
    pub course_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub student_id: String,
    pub total_sessions: i64,
    pub absences_count: i64,
    pub attendance_rate: f64,
    pub absences_rate: f64,
    pub last_activity: Option<String>,
    pub absences: Vec<AbsenceDetail>,
}

/// Walk every attendance record for one student. Every record counts as a
/// session: a student enrolled in two courses on the same date contributes
/// two sessions, and an absence in either one shows up.
pub fn student_attendance(
    conn: &Connection,
    student_id: &str,
) -> Result<AttendanceSummary, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.date, a.course_id, r.is_present, r.comment
             FROM attendance_records r
             JOIN attendances a ON a.id = r.attendance_id
             WHERE r.student_id = ?
             ORDER BY a.date",
        )
        .map_err(StatsError::db)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    let mut total_sessions = 0_i64;
    let mut present_sessions = 0_i64;
    let mut absences: Vec<AbsenceDetail> = Vec::new();
    let mut last_activity: Option<String> = None;

    for (date, course_id, is_present, comment) in rows {
        total_sessions += 1;
        if is_present {
            present_sessions += 1;
        } else {
            absences.push(AbsenceDetail {
                date: date.clone(),
                course_id,
                reason: comment,
            });
        }
        // Rows are date-ordered; the last date wins.
        last_activity = Some(date);
    }

    let absences_count = absences.len() as i64;
    let attendance_rate = if total_sessions > 0 {
        round2(100.0 * present_sessions as f64 / total_sessions as f64)
    } else {
        0.0
    };
    let absences_rate = if total_sessions > 0 {
        round2(100.0 * absences_count as f64 / total_sessions as f64)
    } else {
        0.0
    };

    Ok(AttendanceSummary {
        student_id: student_id.to_string(),
        total_sessions,
        absences_count,
        attendance_rate,
        absences_rate,
        last_activity,
        absences,
    })
}

// ---------------------------------------------------------------------------
// Behavior

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorDetail {
    pub date: String,
    pub rating: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSummary {
    pub student_id: String,
    pub total_sessions: i64,
    pub behavior_average: f64,
    pub last_activity: Option<String>,
    pub records: Vec<BehaviorDetail>,
}

pub fn student_behavior(
    conn: &Connection,
    student_id: &str,
) -> Result<BehaviorSummary, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT b.date, r.rating, r.comment
             FROM behavior_records r
             JOIN behaviors b ON b.id = r.behavior_id
             WHERE r.student_id = ? AND b.is_active = 1
             ORDER BY b.date",
        )
        .map_err(StatsError::db)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    let mut seen_dates: HashSet<String> = HashSet::new();
    let mut rating_sum = 0_i64;
    let mut records: Vec<BehaviorDetail> = Vec::new();
    let mut last_activity: Option<String> = None;

    for (date, rating, comment) in rows {
        if !seen_dates.insert(date.clone()) {
            continue;
        }
        rating_sum += rating;
        records.push(BehaviorDetail {
            date: date.clone(),
            rating,
            comment,
        });
        last_activity = Some(date);
    }

    let total_sessions = records.len() as i64;
    let behavior_average = if total_sessions > 0 {
        round2(rating_sum as f64 / total_sessions as f64)
    } else {
        0.0
    };

    Ok(BehaviorSummary {
        student_id: student_id.to_string(),
        total_sessions,
        behavior_average,
        last_activity,
        records,
    })
}

// ---------------------------------------------------------------------------
// Grades

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub count: i64,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub student_id: String,
    pub total_grade_records: i64,
    pub by_subject: BTreeMap<String, SubjectAverage>,
    pub overall_average: f64,
}

/// Per-subject and overall averages over final (non-draft) grades where the
/// student was present. `None` when the student has no usable grade rows.
pub fn student_grades(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<GradeSummary>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.subject, gr.value
             FROM grade_records gr
             JOIN grades g ON g.id = gr.grade_id
             WHERE gr.student_id = ? AND gr.is_absent = 0 AND g.is_draft = 0
             ORDER BY g.date",
        )
        .map_err(StatsError::db)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut by_subject: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut sum = 0.0_f64;
    for (subject, value) in &rows {
        by_subject.entry(subject.clone()).or_default().push(*value);
        sum += value;
    }

    let overall_average = round2(sum / rows.len() as f64);
    let by_subject = by_subject
        .into_iter()
        .map(|(subject, values)| {
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            (
                subject,
                SubjectAverage {
                    count: values.len() as i64,
                    average: round2(avg),
                },
            )
        })
        .collect();

    Ok(Some(GradeSummary {
        student_id: student_id.to_string(),
        total_grade_records: rows.len() as i64,
        by_subject,
        overall_average,
    }))
}

// ---------------------------------------------------------------------------
// Fees

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Partial,
    Unpaid,
}

impl PaymentStatus {
    /// Pure function of due vs paid, in integer cents. A zero-due fee is paid.
    pub fn classify(amount_due_cents: i64, paid_total_cents: i64) -> Self {
        if paid_total_cents >= amount_due_cents {
            PaymentStatus::Paid
        } else if paid_total_cents == 0 {
            PaymentStatus::Unpaid
        } else {
            PaymentStatus::Partial
        }
    }
}

pub fn paid_total_cents(payments: &[i64]) -> i64 {
    payments.iter().sum()
}

// ---------------------------------------------------------------------------
// Teacher analytics

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRoster {
    pub day_of_week: String,
    pub student_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherCourseInfo {
    pub course_id: String,
    pub subject: String,
    pub level: String,
    pub sessions: Vec<SessionRoster>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherSessionInfo {
    pub teacher_id: String,
    pub work_days: Vec<String>,
    pub courses: Vec<TeacherCourseInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherCourseCount {
    pub teacher_id: String,
    pub teacher_name: String,
    pub course_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherAnalytics {
    pub substitute_teachers: Vec<TeacherRef>,
    pub categories: BTreeMap<String, Vec<TeacherSessionInfo>>,
    pub uncategorized: Vec<String>,
    pub course_counts: Vec<TeacherCourseCount>,
}

/// The fixed category set: each single slot, each pair, and the full triple.
pub fn category_buckets() -> Vec<String> {
    vec![
        SATURDAY_MORNING.to_string(),
        SATURDAY_AFTERNOON.to_string(),
        SUNDAY_MORNING.to_string(),
        format!("{}+{}", SATURDAY_MORNING, SATURDAY_AFTERNOON),
        format!("{}+{}", SATURDAY_MORNING, SUNDAY_MORNING),
        format!("{}+{}", SATURDAY_AFTERNOON, SUNDAY_MORNING),
        format!(
            "{}+{}+{}",
            SATURDAY_MORNING, SATURDAY_AFTERNOON, SUNDAY_MORNING
        ),
    ]
}

pub fn is_work_slot(day: &str) -> bool {
    matches!(day, SATURDAY_MORNING | SATURDAY_AFTERNOON | SUNDAY_MORNING)
}

/// Map a teacher's sorted distinct work slots to a category key. Any slot
/// outside the fixed weekend set, or more than three distinct slots, has no
/// bucket.
pub fn categorize_work_days(work_days: &[String]) -> Option<String> {
    if !work_days.iter().all(|d| is_work_slot(d)) {
        return None;
    }
    match work_days.len() {
        1 => Some(work_days[0].clone()),
        2 => Some(format!("{}+{}", work_days[0], work_days[1])),
        3 => Some(format!(
            "{}+{}+{}",
            SATURDAY_MORNING, SATURDAY_AFTERNOON, SUNDAY_MORNING
        )),
        _ => None,
    }
}

/// Count a teacher's logical courses. Only courses with 2, 4 or 6 sessions
/// participate; within a course, exactly two same-day sessions with identical
/// rosters merge into one logical course, any other roster difference keeps
/// them separate.
pub fn count_teacher_courses(courses: &[TeacherCourseInfo]) -> i64 {
    courses
        .iter()
        .filter(|c| matches!(c.sessions.len(), 2 | 4 | 6))
        .map(count_courses_by_day_groups)
        .sum()
}

fn count_courses_by_day_groups(course: &TeacherCourseInfo) -> i64 {
    let mut by_day: BTreeMap<&str, Vec<&SessionRoster>> = BTreeMap::new();
    for session in &course.sessions {
        by_day
            .entry(session.day_of_week.as_str())
            .or_default()
            .push(session);
    }

    let mut total = 0_i64;
    for sessions in by_day.values() {
        if sessions.len() == 2 {
            let a: HashSet<&String> = sessions[0].student_ids.iter().collect();
            let b: HashSet<&String> = sessions[1].student_ids.iter().collect();
            total += if a == b { 1 } else { 2 };
        } else {
            total += sessions.len() as i64;
        }
    }
    total
}

struct CourseRow {
    id: String,
    teacher_ids: Vec<String>,
    sessions: Vec<SessionRow>,
}

struct SessionRow {
    subject: String,
    level: String,
    day_of_week: String,
    student_ids: Vec<String>,
}

fn fetch_active_courses(
    conn: &Connection,
    academic_year: &str,
) -> Result<Vec<CourseRow>, StatsError> {
    let mut stmt = conn
        .prepare("SELECT id FROM courses WHERE academic_year = ? AND is_active = 1")
        .map_err(StatsError::db)?;
    let course_ids: Vec<String> = stmt
        .query_map([academic_year], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    if course_ids.is_empty() {
        return Ok(Vec::new());
    }

    // Batched lookups: one query per table, never one per course.
    let holder = placeholders(course_ids.len());

    let mut teachers_by_course: HashMap<String, Vec<String>> = HashMap::new();
    let sql = format!(
        "SELECT course_id, teacher_id FROM course_teachers WHERE course_id IN ({})",
        holder
    );
    let mut stmt = conn.prepare(&sql).map_err(StatsError::db)?;
    let rows = stmt
        .query_map(params_from_iter(text_params(&course_ids)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;
    for (course_id, teacher_id) in rows {
        teachers_by_course.entry(course_id).or_default().push(teacher_id);
    }

    let sql = format!(
        "SELECT id, course_id, subject, COALESCE(level, ''), day_of_week
         FROM course_sessions WHERE course_id IN ({})",
        holder
    );
    let mut stmt = conn.prepare(&sql).map_err(StatsError::db)?;
    let session_rows = stmt
        .query_map(params_from_iter(text_params(&course_ids)), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    let session_ids: Vec<String> = session_rows.iter().map(|s| s.0.clone()).collect();
    let mut students_by_session: HashMap<String, Vec<String>> = HashMap::new();
    if !session_ids.is_empty() {
        let sql = format!(
            "SELECT session_id, student_id FROM course_session_students
             WHERE session_id IN ({})",
            placeholders(session_ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(StatsError::db)?;
        let rows = stmt
            .query_map(params_from_iter(text_params(&session_ids)), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(StatsError::db)?;
        for (session_id, student_id) in rows {
            students_by_session
                .entry(session_id)
                .or_default()
                .push(student_id);
        }
    }

    let mut courses: Vec<CourseRow> = course_ids
        .iter()
        .map(|id| CourseRow {
            id: id.clone(),
            teacher_ids: teachers_by_course.remove(id).unwrap_or_default(),
            sessions: Vec::new(),
        })
        .collect();
    let index: HashMap<String, usize> = courses
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.clone(), i))
        .collect();
    for (session_id, course_id, subject, level, day_of_week) in session_rows {
        if let Some(&i) = index.get(&course_id) {
            courses[i].sessions.push(SessionRow {
                subject,
                level,
                day_of_week,
                student_ids: students_by_session.remove(&session_id).unwrap_or_default(),
            });
        }
    }

    Ok(courses)
}

pub fn analyze_teacher_sessions(
    conn: &Connection,
    academic_year: &str,
) -> Result<TeacherAnalytics, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name FROM users
             WHERE role = 'teacher' AND is_active = 1",
        )
        .map_err(StatsError::db)?;
    let teachers: Vec<(String, String)> = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((id, format!("{} {}", first, last)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)?;

    let courses = fetch_active_courses(conn, academic_year)?;

    let mut info_by_teacher: BTreeMap<String, TeacherSessionInfo> = BTreeMap::new();
    for course in &courses {
        for teacher_id in &course.teacher_ids {
            let info = info_by_teacher
                .entry(teacher_id.clone())
                .or_insert_with(|| TeacherSessionInfo {
                    teacher_id: teacher_id.clone(),
                    work_days: Vec::new(),
                    courses: Vec::new(),
                });

            let first = course.sessions.first();
            let mut course_info = TeacherCourseInfo {
                course_id: course.id.clone(),
                subject: first.map(|s| s.subject.clone()).unwrap_or_default(),
                level: first.map(|s| s.level.clone()).unwrap_or_default(),
                sessions: Vec::new(),
            };
            for session in &course.sessions {
                if !info.work_days.contains(&session.day_of_week) {
                    info.work_days.push(session.day_of_week.clone());
                }
                course_info.sessions.push(SessionRoster {
                    day_of_week: session.day_of_week.clone(),
                    student_ids: session.student_ids.clone(),
                });
            }
            info.courses.push(course_info);
        }
    }

    let mut categories: BTreeMap<String, Vec<TeacherSessionInfo>> = category_buckets()
        .into_iter()
        .map(|bucket| (bucket, Vec::new()))
        .collect();
    let mut uncategorized: Vec<String> = Vec::new();
    let mut course_counts: Vec<TeacherCourseCount> = Vec::new();

    let name_by_id: HashMap<&str, &str> = teachers
        .iter()
        .map(|(id, name)| (id.as_str(), name.as_str()))
        .collect();

    for info in info_by_teacher.values_mut() {
        info.work_days.sort();
        let category = categorize_work_days(&info.work_days);
        course_counts.push(TeacherCourseCount {
            teacher_id: info.teacher_id.clone(),
            teacher_name: name_by_id
                .get(info.teacher_id.as_str())
                .map(|n| n.to_string())
                .unwrap_or_else(|| info.teacher_id.clone()),
            course_count: count_teacher_courses(&info.courses),
        });
        let slot = category.and_then(|c| categories.get_mut(&c));
        match slot {
            Some(slot) => slot.push(info.clone()),
            None => uncategorized.push(info.teacher_id.clone()),
        }
    }

    let assigned: HashSet<&String> = info_by_teacher.keys().collect();
    let substitute_teachers: Vec<TeacherRef> = teachers
        .iter()
        .filter(|(id, _)| !assigned.contains(id))
        .map(|(id, name)| TeacherRef {
            id: id.clone(),
            name: name.clone(),
        })
        .collect();

    Ok(TeacherAnalytics {
        substitute_teachers,
        categories,
        uncategorized,
        course_counts,
    })
}

// ---------------------------------------------------------------------------
// Teacher roster stats

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderCounts {
    pub male: i64,
    pub female: i64,
    pub unknown: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderDistribution {
    pub counts: GenderCounts,
    pub percentages: GenderPercentages,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderPercentages {
    pub male: f64,
    pub female: f64,
    pub unknown: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeStatistics {
    pub min_age: i64,
    pub max_age: i64,
    pub average_age: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRosterStats {
    pub teacher_id: String,
    pub total_students: i64,
    pub course_count: i64,
    pub gender: GenderDistribution,
    pub ages: AgeStatistics,
}

/// Distinct student ids across every session of every active course the
/// teacher is assigned to.
pub fn collect_teacher_students(
    conn: &Connection,
    teacher_id: &str,
    academic_year: &str,
) -> Result<Vec<String>, StatsError> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT css.student_id
             FROM course_session_students css
             JOIN course_sessions cs ON cs.id = css.session_id
             JOIN courses c ON c.id = cs.course_id
             JOIN course_teachers ct ON ct.course_id = c.id
             WHERE ct.teacher_id = ? AND c.academic_year = ? AND c.is_active = 1
             ORDER BY css.student_id",
        )
        .map_err(StatsError::db)?;
    stmt.query_map((teacher_id, academic_year), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StatsError::db)
}

pub fn gender_distribution(
    conn: &Connection,
    student_ids: &[String],
) -> Result<GenderDistribution, StatsError> {
    let mut counts = GenderCounts {
        male: 0,
        female: 0,
        unknown: 0,
    };
    if !student_ids.is_empty() {
        let sql = format!(
            "SELECT gender FROM users WHERE role = 'student' AND id IN ({})",
            placeholders(student_ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(StatsError::db)?;
        let genders: Vec<Option<String>> = stmt
            .query_map(params_from_iter(text_params(student_ids)), |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(StatsError::db)?;
        for gender in genders {
            match gender.as_deref() {
                Some("male") => counts.male += 1,
                Some("female") => counts.female += 1,
                _ => counts.unknown += 1,
            }
        }
    }

    let total = counts.male + counts.female + counts.unknown;
    let pct = |n: i64| {
        if total > 0 {
            round2(100.0 * n as f64 / total as f64)
        } else {
            0.0
        }
    };
    Ok(GenderDistribution {
        percentages: GenderPercentages {
            male: pct(counts.male),
            female: pct(counts.female),
            unknown: pct(counts.unknown),
        },
        counts,
    })
}

pub fn age_statistics(
    conn: &Connection,
    student_ids: &[String],
    today: NaiveDate,
) -> Result<AgeStatistics, StatsError> {
    let mut ages: Vec<i64> = Vec::new();
    if !student_ids.is_empty() {
        let sql = format!(
            "SELECT date_of_birth FROM users
             WHERE role = 'student' AND date_of_birth IS NOT NULL AND id IN ({})",
            placeholders(student_ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(StatsError::db)?;
        let births: Vec<Option<String>> = stmt
            .query_map(params_from_iter(text_params(student_ids)), |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(StatsError::db)?;
        for birth in births.into_iter().flatten() {
            let Ok(dob) = NaiveDate::parse_from_str(&birth, "%Y-%m-%d") else {
                continue;
            };
            if let Some(age) = today.years_since(dob) {
                ages.push(age as i64);
            }
        }
    }

    if ages.is_empty() {
        return Ok(AgeStatistics {
            min_age: 0,
            max_age: 0,
            average_age: 0.0,
        });
    }

    let min_age = *ages.iter().min().unwrap_or(&0);
    let max_age = *ages.iter().max().unwrap_or(&0);
    let average_age =
        ((ages.iter().sum::<i64>() as f64 / ages.len() as f64) * 10.0).round() / 10.0;
    Ok(AgeStatistics {
        min_age,
        max_age,
        average_age,
    })
}

pub fn teacher_roster_stats(
    conn: &Connection,
    teacher_id: &str,
    academic_year: &str,
    today: NaiveDate,
) -> Result<TeacherRosterStats, StatsError> {
    let student_ids = collect_teacher_students(conn, teacher_id, academic_year)?;
    let gender = gender_distribution(conn, &student_ids)?;
    let ages = age_statistics(conn, &student_ids, today)?;

    let courses = fetch_active_courses(conn, academic_year)?;
    let teacher_courses: Vec<TeacherCourseInfo> = courses
        .iter()
        .filter(|c| c.teacher_ids.iter().any(|t| t == teacher_id))
        .map(|c| TeacherCourseInfo {
            course_id: c.id.clone(),
            subject: c.sessions.first().map(|s| s.subject.clone()).unwrap_or_default(),
            level: c.sessions.first().map(|s| s.level.clone()).unwrap_or_default(),
            sessions: c
                .sessions
                .iter()
                .map(|s| SessionRoster {
                    day_of_week: s.day_of_week.clone(),
                    student_ids: s.student_ids.clone(),
                })
                .collect(),
        })
        .collect();

    Ok(TeacherRosterStats {
        teacher_id: teacher_id.to_string(),
        total_students: student_ids.len() as i64,
        course_count: count_teacher_courses(&teacher_courses),
        gender,
        ages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(day: &str, students: &[&str]) -> SessionRoster {
        SessionRoster {
            day_of_week: day.to_string(),
            student_ids: students.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn course(sessions: Vec<SessionRoster>) -> TeacherCourseInfo {
        TeacherCourseInfo {
            course_id: "c1".to_string(),
            subject: "arabic".to_string(),
            level: "1".to_string(),
            sessions,
        }
    }

    #[test]
    fn payment_status_classification() {
        assert_eq!(PaymentStatus::classify(10_000, 10_000), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::classify(10_000, 12_000), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::classify(10_000, 0), PaymentStatus::Unpaid);
        assert_eq!(PaymentStatus::classify(10_000, 1), PaymentStatus::Partial);
        assert_eq!(
            PaymentStatus::classify(10_000, 9_999),
            PaymentStatus::Partial
        );
        // Zero due means nothing is owed.
        assert_eq!(PaymentStatus::classify(0, 0), PaymentStatus::Paid);
    }

    #[test]
    fn two_day_teacher_lands_in_exactly_one_pair_bucket() {
        let days = vec![
            SATURDAY_MORNING.to_string(),
            SUNDAY_MORNING.to_string(),
        ];
        let category = categorize_work_days(&days).expect("category");
        assert_eq!(category, format!("{}+{}", SATURDAY_MORNING, SUNDAY_MORNING));

        let buckets = category_buckets();
        assert_eq!(buckets.iter().filter(|b| **b == category).count(), 1);
        // Not a single-day bucket.
        assert!(!buckets[..3].contains(&category));
    }

    #[test]
    fn four_distinct_days_have_no_bucket() {
        let days: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(categorize_work_days(&days), None);
    }

    #[test]
    fn non_slot_days_have_no_bucket() {
        let weekdays: Vec<String> = ["monday", "tuesday", "wednesday"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(categorize_work_days(&weekdays), None);
        assert_eq!(categorize_work_days(&weekdays[..1]), None);

        let mixed = vec![SATURDAY_MORNING.to_string(), "monday".to_string()];
        assert_eq!(categorize_work_days(&mixed), None);
    }

    #[test]
    fn same_day_sessions_with_identical_roster_merge() {
        let c = course(vec![
            roster(SATURDAY_MORNING, &["s1", "s2"]),
            roster(SATURDAY_MORNING, &["s2", "s1"]),
        ]);
        assert_eq!(count_teacher_courses(&[c]), 1);
    }

    #[test]
    fn same_day_sessions_with_different_roster_count_separately() {
        let c = course(vec![
            roster(SATURDAY_MORNING, &["s1", "s2"]),
            roster(SATURDAY_MORNING, &["s1", "s3"]),
        ]);
        assert_eq!(count_teacher_courses(&[c]), 2);
    }

    #[test]
    fn odd_session_counts_are_ignored() {
        let c = course(vec![roster(SATURDAY_MORNING, &["s1"])]);
        assert_eq!(count_teacher_courses(&[c]), 0);

        let c3 = course(vec![
            roster(SATURDAY_MORNING, &["s1"]),
            roster(SATURDAY_AFTERNOON, &["s1"]),
            roster(SUNDAY_MORNING, &["s1"]),
        ]);
        assert_eq!(count_teacher_courses(&[c3]), 0);
    }

    #[test]
    fn four_sessions_two_days_mixed_merge() {
        // Saturday pair merges, Sunday pair does not.
        let c = course(vec![
            roster(SATURDAY_MORNING, &["s1", "s2"]),
            roster(SATURDAY_MORNING, &["s1", "s2"]),
            roster(SUNDAY_MORNING, &["s1"]),
            roster(SUNDAY_MORNING, &["s3"]),
        ]);
        assert_eq!(count_teacher_courses(&[c]), 3);
    }

    #[test]
    fn attendance_math_over_raw_rows() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO users(id, role, last_name, first_name, is_active)
             VALUES('s1', 'student', 'Doe', 'Jane', 1)",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO courses(id, academic_year, is_active) VALUES('c1', '2024', 1)",
            [],
        )
        .expect("course");
        let presences = [("2024-09-07", 1), ("2024-09-14", 0), ("2024-09-21", 1)];
        for (i, (date, present)) in presences.iter().enumerate() {
            conn.execute(
                "INSERT INTO attendances(id, course_id, date, presence_rate, total_students)
                 VALUES(?, 'c1', ?, 0.0, 1)",
                (format!("a{}", i), date),
            )
            .expect("attendance");
            conn.execute(
                "INSERT INTO attendance_records(id, attendance_id, student_id, is_present)
                 VALUES(?, ?, 's1', ?)",
                (format!("r{}", i), format!("a{}", i), present),
            )
            .expect("record");
        }

        let summary = student_attendance(&conn, "s1").expect("summary");
        assert_eq!(summary.total_sessions, 3);
        assert_eq!(summary.absences_count, 1);
        assert!((summary.absences_rate - 33.33).abs() < 0.1);
        assert!((summary.attendance_rate - 66.67).abs() < 0.1);
        assert_eq!(summary.last_activity.as_deref(), Some("2024-09-21"));
        assert_eq!(summary.absences.len(), 1);
        assert_eq!(summary.absences[0].date, "2024-09-14");
    }

    #[test]
    fn same_date_records_in_two_courses_both_count() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO users(id, role, last_name, first_name, is_active)
             VALUES('s1', 'student', 'Doe', 'Jane', 1)",
            [],
        )
        .expect("student");
        // Morning and afternoon course on the same Saturday.
        for (course, attendance, present) in [("c1", "a1", 1), ("c2", "a2", 0)] {
            conn.execute(
                "INSERT INTO courses(id, academic_year, is_active) VALUES(?, '2024', 1)",
                [course],
            )
            .expect("course");
            conn.execute(
                "INSERT INTO attendances(id, course_id, date, presence_rate, total_students)
                 VALUES(?, ?, '2024-09-07', 0.0, 1)",
                (attendance, course),
            )
            .expect("attendance");
            conn.execute(
                "INSERT INTO attendance_records(id, attendance_id, student_id, is_present)
                 VALUES(?, ?, 's1', ?)",
                (format!("r-{}", attendance), attendance, present),
            )
            .expect("record");
        }

        let summary = student_attendance(&conn, "s1").expect("summary");
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.absences_count, 1);
        assert!((summary.attendance_rate - 50.0).abs() < 1e-9);
        assert!((summary.absences_rate - 50.0).abs() < 1e-9);
        assert_eq!(summary.absences[0].course_id, "c2");
    }

    #[test]
    fn zero_attendance_records_give_zero_rates() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        let summary = student_attendance(&conn, "missing").expect("summary");
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.absences_count, 0);
        assert_eq!(summary.absences_rate, 0.0);
        assert_eq!(summary.attendance_rate, 0.0);
        assert_eq!(summary.last_activity, None);
    }

    #[test]
    fn draft_and_absent_grades_are_excluded() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        conn.execute(
            "INSERT INTO users(id, role, last_name, first_name, is_active)
             VALUES('s1', 'student', 'Doe', 'Jane', 1)",
            [],
        )
        .expect("student");
        conn.execute(
            "INSERT INTO courses(id, academic_year, is_active) VALUES('c1', '2024', 1)",
            [],
        )
        .expect("course");
        conn.execute(
            "INSERT INTO course_sessions(id, course_id, subject, level, day_of_week)
             VALUES('cs1', 'c1', 'arabic', '1', 'saturday_morning')",
            [],
        )
        .expect("session");

        let grades = [
            ("g1", "arabic", "2024-09-07", 0, 15.0, 0),
            ("g2", "arabic", "2024-09-14", 0, 10.0, 0),
            // Draft: must not count.
            ("g3", "arabic", "2024-09-21", 1, 2.0, 0),
            // Absent: must not count.
            ("g4", "arabic", "2024-09-28", 0, 0.0, 1),
        ];
        for (id, subject, date, draft, value, absent) in grades {
            conn.execute(
                "INSERT INTO grades(id, course_session_id, subject, date, is_draft)
                 VALUES(?, 'cs1', ?, ?, ?)",
                (id, subject, date, draft),
            )
            .expect("grade");
            conn.execute(
                "INSERT INTO grade_records(id, grade_id, student_id, value, is_absent)
                 VALUES(?, ?, 's1', ?, ?)",
                (format!("gr-{}", id), id, value, absent),
            )
            .expect("grade record");
        }

        let summary = student_grades(&conn, "s1").expect("ok").expect("some");
        assert_eq!(summary.total_grade_records, 2);
        assert!((summary.overall_average - 12.5).abs() < 1e-9);
        let arabic = summary.by_subject.get("arabic").expect("subject");
        assert_eq!(arabic.count, 2);
        assert!((arabic.average - 12.5).abs() < 1e-9);
    }

    #[test]
    fn no_grades_returns_none() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::db::init_schema(&conn).expect("schema");
        assert!(student_grades(&conn, "missing").expect("ok").is_none());
    }
}
