use crate::grading::{self, WindowState};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, is_enrolled, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

struct QuizWindowRow {
    course_id: String,
    title: String,
    open_at: String,
    close_at: String,
    max_marks: f64,
}

struct QuestionDef {
    kind: String,
    marks: f64,
    choice_ids: HashSet<String>,
    correct_ids: BTreeSet<String>,
}

struct PreparedResponse {
    question_id: String,
    marked: bool,
    mark: f64,
    answer: Option<String>,
    choice_ids: Option<String>,
}

fn load_quiz(
    conn: &Connection,
    req: &Request,
    quiz_id: &str,
) -> Result<QuizWindowRow, serde_json::Value> {
    let row = conn
        .query_row(
            "SELECT course_id, title, open_at, close_at, max_marks FROM quizzes WHERE id = ?",
            [quiz_id],
            |r| {
                Ok(QuizWindowRow {
                    course_id: r.get(0)?,
                    title: r.get(1)?,
                    open_at: r.get(2)?,
                    close_at: r.get(3)?,
                    max_marks: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    row.ok_or_else(|| {
        err(
            &req.id,
            "not_found",
            "quiz not found",
            Some(json!({ "quizId": quiz_id })),
        )
    })
}

/// Check the quiz window against the clock right now. Called from both start
/// and finish: the instructor may move the window between the two calls, so
/// the row's current values always win.
fn check_window(req: &Request, quiz: &QuizWindowRow) -> Option<serde_json::Value> {
    match grading::window_state(&quiz.open_at, &quiz.close_at, Utc::now()) {
        Ok(WindowState::Open) => None,
        Ok(WindowState::NotYetOpen) => Some(err(
            &req.id,
            "quiz_not_open_yet",
            "quiz is not open yet",
            Some(json!({ "openAt": quiz.open_at })),
        )),
        Ok(WindowState::Closed) => Some(err(
            &req.id,
            "quiz_closed",
            "quiz is closed",
            Some(json!({ "closeAt": quiz.close_at })),
        )),
        Err(e) => Some(err(&req.id, "invalid_window", e.to_string(), None)),
    }
}

fn check_enrolment(
    conn: &Connection,
    req: &Request,
    course_id: &str,
    student_id: &str,
) -> Option<serde_json::Value> {
    match is_enrolled(conn, course_id, student_id) {
        Ok(true) => None,
        Ok(false) => Some(err(
            &req.id,
            "forbidden",
            "student is not enrolled in this course",
            Some(json!({ "studentId": student_id })),
        )),
        Err(e) => Some(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn attempt_exists(
    conn: &Connection,
    quiz_id: &str,
    student_id: &str,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attempts WHERE quiz_id = ? AND student_id = ?",
            (quiz_id, student_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// The student-facing snapshot: questions in order, with everything that
// would reveal the answer key stripped out.
fn question_snapshot(conn: &Connection, quiz_id: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut q_stmt = conn.prepare(
        "SELECT id, text, kind, marks FROM questions WHERE quiz_id = ? ORDER BY sort_order",
    )?;
    let questions = q_stmt
        .query_map([quiz_id], |r| {
            let id: String = r.get(0)?;
            let text: String = r.get(1)?;
            let kind: String = r.get(2)?;
            let marks: f64 = r.get(3)?;
            Ok((id, text, kind, marks))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut c_stmt = conn.prepare(
        "SELECT id, text FROM choices WHERE question_id = ? ORDER BY sort_order",
    )?;

    let mut out = Vec::new();
    for (id, text, kind, marks) in questions {
        let mut item = json!({
            "questionId": id,
            "text": text,
            "kind": kind,
            "marks": marks
        });
        if kind == "choice" {
            let choices = c_stmt
                .query_map([&id], |r| {
                    let cid: String = r.get(0)?;
                    let ctext: String = r.get(1)?;
                    Ok(json!({ "choiceId": cid, "text": ctext }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            item["choices"] = json!(choices);
        }
        out.push(item);
    }
    Ok(out)
}

fn load_question_defs(
    conn: &Connection,
    quiz_id: &str,
) -> rusqlite::Result<HashMap<String, QuestionDef>> {
    let mut q_stmt =
        conn.prepare("SELECT id, kind, marks FROM questions WHERE quiz_id = ?")?;
    let mut defs: HashMap<String, QuestionDef> = q_stmt
        .query_map([quiz_id], |r| {
            let id: String = r.get(0)?;
            let kind: String = r.get(1)?;
            let marks: f64 = r.get(2)?;
            Ok((
                id,
                QuestionDef {
                    kind,
                    marks,
                    choice_ids: HashSet::new(),
                    correct_ids: BTreeSet::new(),
                },
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let mut c_stmt = conn.prepare(
        "SELECT c.question_id, c.id, c.correct
         FROM choices c
         JOIN questions q ON q.id = c.question_id
         WHERE q.quiz_id = ?",
    )?;
    let choice_rows = c_stmt
        .query_map([quiz_id], |r| {
            let question_id: String = r.get(0)?;
            let choice_id: String = r.get(1)?;
            let correct: i64 = r.get(2)?;
            Ok((question_id, choice_id, correct != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (question_id, choice_id, correct) in choice_rows {
        if let Some(def) = defs.get_mut(&question_id) {
            if correct {
                def.correct_ids.insert(choice_id.clone());
            }
            def.choice_ids.insert(choice_id);
        }
    }
    Ok(defs)
}

fn handle_attempts_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let quiz = match load_quiz(conn, req, &quiz_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(resp) = check_enrolment(conn, req, &quiz.course_id, &student_id) {
        return resp;
    }
    if let Some(resp) = check_window(req, &quiz) {
        return resp;
    }
    match attempt_exists(conn, &quiz_id, &student_id) {
        Ok(true) => {
            return err(
                &req.id,
                "already_attempted",
                "an attempt already exists for this quiz",
                Some(json!({ "quizId": quiz_id, "studentId": student_id })),
            );
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Starting persists nothing: "has attempted" is exactly "an attempt row
    // exists", and rows are only written at finish.
    let questions = match question_snapshot(conn, &quiz_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "quizId": quiz_id,
            "title": quiz.title,
            "maxMarks": quiz.max_marks,
            "closeAt": quiz.close_at,
            "questions": questions
        }),
    )
}

fn handle_attempts_finish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let quiz = match load_quiz(conn, req, &quiz_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(resp) = check_enrolment(conn, req, &quiz.course_id, &student_id) {
        return resp;
    }
    if let Some(resp) = check_window(req, &quiz) {
        return resp;
    }
    match attempt_exists(conn, &quiz_id, &student_id) {
        Ok(true) => {
            return err(
                &req.id,
                "already_attempted",
                "an attempt already exists for this quiz",
                Some(json!({ "quizId": quiz_id, "studentId": student_id })),
            );
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let Some(raw_responses) = req.params.get("responses").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing responses", None);
    };

    let defs = match load_question_defs(conn, &quiz_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Validate and grade everything before touching the database: any
    // failure below aborts with no attempt and no responses written.
    let mut seen: HashSet<String> = HashSet::new();
    let mut prepared: Vec<PreparedResponse> = Vec::new();
    for entry in raw_responses {
        let Some(question_id) = entry.get("questionId").and_then(|v| v.as_str()) else {
            return err(&req.id, "bad_params", "response is missing questionId", None);
        };
        if !seen.insert(question_id.to_string()) {
            return err(
                &req.id,
                "bad_params",
                "duplicate response for question",
                Some(json!({ "questionId": question_id })),
            );
        }
        let Some(def) = defs.get(question_id) else {
            return err(
                &req.id,
                "not_found",
                "question does not belong to this quiz",
                Some(json!({ "questionId": question_id })),
            );
        };

        if def.kind == "choice" {
            let Some(raw_ids) = entry.get("choiceIds").and_then(|v| v.as_array()) else {
                return err(
                    &req.id,
                    "bad_params",
                    "a choice question requires choiceIds",
                    Some(json!({ "questionId": question_id })),
                );
            };
            let mut submitted: BTreeSet<String> = BTreeSet::new();
            for raw in raw_ids {
                let Some(choice_id) = raw.as_str() else {
                    return err(
                        &req.id,
                        "bad_params",
                        "choiceIds must contain only strings",
                        None,
                    );
                };
                if !def.choice_ids.contains(choice_id) {
                    return err(
                        &req.id,
                        "bad_params",
                        "choice does not belong to this question",
                        Some(json!({ "questionId": question_id, "choiceId": choice_id })),
                    );
                }
                submitted.insert(choice_id.to_string());
            }
            let mark = grading::grade_choice_response(&def.correct_ids, &submitted, def.marks);
            let stored: Vec<&String> = submitted.iter().collect();
            prepared.push(PreparedResponse {
                question_id: question_id.to_string(),
                marked: true,
                mark,
                answer: None,
                choice_ids: Some(
                    serde_json::to_string(&stored).unwrap_or_else(|_| "[]".to_string()),
                ),
            });
        } else {
            let Some(answer) = entry.get("answer").and_then(|v| v.as_str()) else {
                return err(
                    &req.id,
                    "bad_params",
                    "an open question requires answer",
                    Some(json!({ "questionId": question_id })),
                );
            };
            // Open answers wait for manual grading; they contribute nothing
            // to the attempt mark until then.
            prepared.push(PreparedResponse {
                question_id: question_id.to_string(),
                marked: false,
                mark: 0.0,
                answer: Some(answer.to_string()),
                choice_ids: None,
            });
        }
    }

    let total: f64 = prepared.iter().map(|p| p.mark).sum();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let attempt_id = Uuid::new_v4().to_string();
    let submitted_at = Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO attempts(id, quiz_id, student_id, mark, submitted_at)
         VALUES(?, ?, ?, ?, ?)",
        (&attempt_id, &quiz_id, &student_id, total, &submitted_at),
    ) {
        let _ = tx.rollback();
        // The unique index on (quiz_id, student_id) is the real guard: a
        // second finish racing past the existence check above still loses
        // here.
        if is_unique_violation(&e) {
            return err(
                &req.id,
                "already_attempted",
                "an attempt already exists for this quiz",
                Some(json!({ "quizId": quiz_id, "studentId": student_id })),
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "attempts" })),
        );
    }

    let mut responses_out = Vec::new();
    for p in &prepared {
        let response_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO responses(id, attempt_id, question_id, marked, mark, answer, choice_ids)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &response_id,
                &attempt_id,
                &p.question_id,
                p.marked as i64,
                p.mark,
                &p.answer,
                &p.choice_ids,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "responses" })),
            );
        }
        responses_out.push(json!({
            "responseId": response_id,
            "questionId": p.question_id,
            "marked": p.marked,
            "mark": p.mark
        }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "attemptId": attempt_id,
            "mark": total,
            "maxMarks": quiz.max_marks,
            "submittedAt": submitted_at,
            "responses": responses_out
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => Some(handle_attempts_start(state, req)),
        "attempts.finish" => Some(handle_attempts_finish(state, req)),
        _ => None,
    }
}
