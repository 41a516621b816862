use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("coursed.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            tags TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS people(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrolments(
            course_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            PRIMARY KEY(course_id, person_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(person_id) REFERENCES people(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrolments_person ON enrolments(person_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            open_at TEXT NOT NULL,
            close_at TEXT NOT NULL,
            max_marks REAL NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quizzes_course ON quizzes(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            text TEXT NOT NULL,
            kind TEXT NOT NULL,
            marks REAL NOT NULL,
            tag TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id),
            UNIQUE(quiz_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_quiz ON questions(quiz_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS choices(
            id TEXT PRIMARY KEY,
            question_id TEXT NOT NULL,
            text TEXT NOT NULL,
            correct INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(question_id) REFERENCES questions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_choices_question ON choices(question_id)",
        [],
    )?;

    // The one-attempt-per-(quiz, student) invariant lives here, in the
    // schema, so a racing second finish loses at insert time no matter how
    // requests are ordered.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            mark REAL NOT NULL DEFAULT 0,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id),
            FOREIGN KEY(student_id) REFERENCES people(id),
            UNIQUE(quiz_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_quiz ON attempts(quiz_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student ON attempts(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            marked INTEGER NOT NULL,
            mark REAL NOT NULL,
            answer TEXT,
            choice_ids TEXT,
            FOREIGN KEY(attempt_id) REFERENCES attempts(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            UNIQUE(attempt_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_attempt ON responses(attempt_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_question ON responses(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            max_marks REAL NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            marked INTEGER NOT NULL,
            mark REAL NOT NULL,
            success_tags TEXT NOT NULL DEFAULT '[]',
            improvement_tags TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES people(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_submissions_assignment
         ON assignment_submissions(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_submissions_student
         ON assignment_submissions(student_id)",
        [],
    )?;

    Ok(conn)
}
