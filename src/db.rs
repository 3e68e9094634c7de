use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolbook.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS families(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT,
            gender TEXT,
            date_of_birth TEXT,
            family_id TEXT,
            is_active INTEGER NOT NULL,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(family_id) REFERENCES families(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role, is_active)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_family ON users(family_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            academic_year TEXT NOT NULL,
            is_active INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_teachers(
            course_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            PRIMARY KEY(course_id, teacher_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_teachers_teacher ON course_teachers(teacher_id)",
        [],
    )?;

    // One timeslot per session, so the slot lives on the session row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_sessions(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            level TEXT,
            day_of_week TEXT NOT NULL,
            start_time TEXT,
            end_time TEXT,
            classroom TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_sessions_course ON course_sessions(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_session_students(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES course_sessions(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_students_student
         ON course_session_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendances(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            date TEXT NOT NULL,
            presence_rate REAL NOT NULL,
            total_students INTEGER NOT NULL,
            last_update TEXT,
            UNIQUE(course_id, date),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            attendance_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            is_present INTEGER NOT NULL,
            comment TEXT,
            UNIQUE(attendance_id, student_id),
            FOREIGN KEY(attendance_id) REFERENCES attendances(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS behaviors(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            date TEXT NOT NULL,
            behavior_rate REAL NOT NULL,
            total_students INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_update TEXT,
            UNIQUE(course_id, date),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS behavior_records(
            id TEXT PRIMARY KEY,
            behavior_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            rating INTEGER NOT NULL,
            comment TEXT,
            UNIQUE(behavior_id, student_id),
            FOREIGN KEY(behavior_id) REFERENCES behaviors(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_behavior_records_student
         ON behavior_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            course_session_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            date TEXT NOT NULL,
            is_draft INTEGER NOT NULL DEFAULT 0,
            last_update TEXT,
            FOREIGN KEY(course_session_id) REFERENCES course_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            value REAL NOT NULL,
            is_absent INTEGER NOT NULL DEFAULT 0,
            UNIQUE(grade_id, student_id),
            FOREIGN KEY(grade_id) REFERENCES grades(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;

    // Money is integer cents everywhere; no REAL columns in fee math.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            id TEXT PRIMARY KEY,
            family_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            label TEXT,
            amount_due_cents INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(family_id) REFERENCES families(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fees_family ON fees(family_id, is_active)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            fee_id TEXT NOT NULL,
            amount_paid_cents INTEGER NOT NULL,
            method TEXT,
            paid_at TEXT,
            FOREIGN KEY(fee_id) REFERENCES fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_fee ON fee_payments(fee_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_notes(
            id TEXT PRIMARY KEY,
            fee_id TEXT NOT NULL,
            note TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(fee_id) REFERENCES fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_notes_fee ON fee_notes(fee_id)",
        [],
    )?;

    // Derived caches. Rebuilt from raw rows, never authoritative.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_stats(
            user_id TEXT PRIMARY KEY,
            absences_rate REAL NOT NULL,
            absences_count INTEGER NOT NULL,
            behavior_average REAL NOT NULL,
            grade_average REAL,
            last_activity TEXT,
            last_update TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_stats_absences(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            date TEXT NOT NULL,
            course_id TEXT NOT NULL,
            reason TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_stats_absences_user
         ON student_stats_absences(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_stats(
            user_id TEXT PRIMARY KEY,
            total_students INTEGER NOT NULL,
            course_count INTEGER NOT NULL,
            min_age INTEGER NOT NULL,
            max_age INTEGER NOT NULL,
            average_age REAL NOT NULL,
            male_count INTEGER NOT NULL,
            female_count INTEGER NOT NULL,
            unknown_gender_count INTEGER NOT NULL,
            last_update TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS global_stats(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            total_students INTEGER NOT NULL,
            total_teachers INTEGER NOT NULL,
            average_attendance_rate REAL NOT NULL,
            last_update TEXT NOT NULL
        )",
        [],
    )?;

    ensure_grades_is_draft(conn)?;
    ensure_fees_label(conn)?;

    Ok(())
}

fn ensure_grades_is_draft(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "is_draft")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grades ADD COLUMN is_draft INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_fees_label(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fees", "label")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE fees ADD COLUMN label TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
