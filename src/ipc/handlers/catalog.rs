use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_f64, required_str, require_role};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

struct QuizRow {
    course_id: String,
    title: String,
    description: String,
    open_at: String,
    close_at: String,
    max_marks: f64,
}

fn load_quiz(
    conn: &rusqlite::Connection,
    req: &Request,
    quiz_id: &str,
) -> Result<QuizRow, serde_json::Value> {
    let row = conn
        .query_row(
            "SELECT course_id, title, description, open_at, close_at, max_marks
             FROM quizzes WHERE id = ?",
            [quiz_id],
            |r| {
                Ok(QuizRow {
                    course_id: r.get(0)?,
                    title: r.get(1)?,
                    description: r.get(2)?,
                    open_at: r.get(3)?,
                    close_at: r.get(4)?,
                    max_marks: r.get(5)?,
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

fn validate_window_bound(req: &Request, key: &str, raw: &str) -> Option<serde_json::Value> {
    if grading::parse_window_bound(raw).is_err() {
        return Some(err(
            &req.id,
            "bad_params",
            format!("{} must be an RFC 3339 timestamp", key),
            Some(json!({ key: raw })),
        ));
    }
    None
}

fn handle_quizzes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let max_marks = match required_f64(req, "maxMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if max_marks <= 0.0 {
        return err(&req.id, "bad_params", "maxMarks must be > 0", None);
    }
    let open_at = match required_str(req, "openAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let close_at = match required_str(req, "closeAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(resp) = validate_window_bound(req, "openAt", &open_at) {
        return resp;
    }
    if let Some(resp) = validate_window_bound(req, "closeAt", &close_at) {
        return resp;
    }

    let course_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let quiz_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO quizzes(id, course_id, title, description, open_at, close_at, max_marks)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &quiz_id,
            &course_id,
            &title,
            &description,
            &open_at,
            &close_at,
            max_marks,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }

    ok(&req.id, json!({ "quizId": quiz_id }))
}

// Partial update of quiz fields. Deliberately not validated against existing
// attempts: the window may move while attempts are in flight, and finish
// re-checks it against the row as it is at that moment.
fn handle_quizzes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut quiz = match load_quiz(conn, req, &quiz_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    for (key, value) in patch {
        match key.as_str() {
            "title" => match value.as_str() {
                Some(v) if !v.trim().is_empty() => quiz.title = v.trim().to_string(),
                _ => return err(&req.id, "bad_params", "title must not be empty", None),
            },
            "description" => match value.as_str() {
                Some(v) => quiz.description = v.to_string(),
                None => return err(&req.id, "bad_params", "description must be a string", None),
            },
            "maxMarks" => match value.as_f64() {
                Some(v) if v > 0.0 => quiz.max_marks = v,
                _ => return err(&req.id, "bad_params", "maxMarks must be > 0", None),
            },
            "openAt" => match value.as_str() {
                Some(v) => {
                    if let Some(resp) = validate_window_bound(req, "openAt", v) {
                        return resp;
                    }
                    quiz.open_at = v.to_string();
                }
                None => return err(&req.id, "bad_params", "openAt must be a string", None),
            },
            "closeAt" => match value.as_str() {
                Some(v) => {
                    if let Some(resp) = validate_window_bound(req, "closeAt", v) {
                        return resp;
                    }
                    quiz.close_at = v.to_string();
                }
                None => return err(&req.id, "bad_params", "closeAt must be a string", None),
            },
            other => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown patch field: {}", other),
                    None,
                );
            }
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE quizzes
         SET title = ?, description = ?, open_at = ?, close_at = ?, max_marks = ?
         WHERE id = ?",
        (
            &quiz.title,
            &quiz.description,
            &quiz.open_at,
            &quiz.close_at,
            quiz.max_marks,
            &quiz_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }

    ok(&req.id, json!({ "quizId": quiz_id }))
}

fn handle_quizzes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = load_quiz(conn, req, &quiz_id) {
        return resp;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM responses
         WHERE attempt_id IN (SELECT id FROM attempts WHERE quiz_id = ?)",
        [&quiz_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "responses" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM attempts WHERE quiz_id = ?", [&quiz_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attempts" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM choices
         WHERE question_id IN (SELECT id FROM questions WHERE quiz_id = ?)",
        [&quiz_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "choices" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM questions WHERE quiz_id = ?", [&quiz_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM quizzes WHERE id = ?", [&quiz_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_quizzes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           q.id,
           q.title,
           q.description,
           q.open_at,
           q.close_at,
           q.max_marks,
           (SELECT COUNT(*) FROM questions qu WHERE qu.quiz_id = q.id) AS question_count,
           (SELECT COUNT(*) FROM attempts a WHERE a.quiz_id = q.id) AS attempt_count
         FROM quizzes q
         WHERE q.course_id = ?
         ORDER BY q.open_at, q.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&course_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let description: String = row.get(2)?;
            let open_at: String = row.get(3)?;
            let close_at: String = row.get(4)?;
            let max_marks: f64 = row.get(5)?;
            let question_count: i64 = row.get(6)?;
            let attempt_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "openAt": open_at,
                "closeAt": close_at,
                "maxMarks": max_marks,
                "questionCount": question_count,
                "attemptCount": attempt_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(quizzes) => ok(&req.id, json!({ "quizzes": quizzes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_questions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let quiz = match load_quiz(conn, req, &quiz_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let text = match required_str(req, "text") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kind = match required_str(req, "kind") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if kind != "choice" && kind != "open" {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: choice, open",
            Some(json!({ "kind": kind })),
        );
    }
    let marks = match required_f64(req, "marks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if marks <= 0.0 {
        return err(&req.id, "bad_params", "marks must be > 0", None);
    }
    let tag = match required_str(req, "tag") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Tag whitelist check happens at creation time only; a later edit of the
    // course's tag set does not invalidate existing questions.
    let tags_json: Option<String> = match conn
        .query_row(
            "SELECT tags FROM courses WHERE id = ?",
            [&quiz.course_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let course_tags: Vec<String> = tags_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    if !course_tags.iter().any(|t| t == &tag) {
        return err(
            &req.id,
            "invalid_tag",
            "tag is not in the course tag set",
            Some(json!({ "tag": tag, "courseTags": course_tags })),
        );
    }

    let raw_choices = req.params.get("choices").and_then(|v| v.as_array());
    let mut choices: Vec<(String, bool)> = Vec::new();
    if let Some(raw) = raw_choices {
        for c in raw {
            let Some(text) = c.get("text").and_then(|v| v.as_str()) else {
                return err(&req.id, "bad_params", "choice is missing text", None);
            };
            let correct = c.get("correct").and_then(|v| v.as_bool()).unwrap_or(false);
            choices.push((text.to_string(), correct));
        }
    }
    if kind == "choice" && choices.is_empty() {
        return err(
            &req.id,
            "missing_choices",
            "a choice question requires at least one choice",
            None,
        );
    }
    if kind == "open" && !choices.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "an open question must not have choices",
            None,
        );
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM questions WHERE quiz_id = ?",
        [&quiz_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let question_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO questions(id, quiz_id, text, kind, marks, tag, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&question_id, &quiz_id, &text, &kind, marks, &tag, sort_order),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    let mut choices_out = Vec::new();
    for (i, (choice_text, correct)) in choices.iter().enumerate() {
        let choice_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO choices(id, question_id, text, correct, sort_order)
             VALUES(?, ?, ?, ?, ?)",
            (
                &choice_id,
                &question_id,
                choice_text,
                *correct as i64,
                i as i64,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "choices" })),
            );
        }
        choices_out.push(json!({ "choiceId": choice_id, "text": choice_text }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "questionId": question_id, "choices": choices_out }),
    )
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let quiz_id = match required_str(req, "quizId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM questions WHERE id = ? AND quiz_id = ?",
            (&question_id, &quiz_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "question not found",
            Some(json!({ "questionId": question_id })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM responses WHERE question_id = ?", [&question_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "responses" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM choices WHERE question_id = ?", [&question_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "choices" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM questions WHERE id = ?", [&question_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        );
    }

    // Dropping responses changes attempt totals; recompute from what is left
    // so the mark-sum invariant holds.
    if let Err(e) = tx.execute(
        "UPDATE attempts
         SET mark = (SELECT COALESCE(SUM(r.mark), 0) FROM responses r WHERE r.attempt_id = attempts.id)
         WHERE quiz_id = ?",
        [&quiz_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "attempts" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quizzes.create" => Some(handle_quizzes_create(state, req)),
        "quizzes.update" => Some(handle_quizzes_update(state, req)),
        "quizzes.delete" => Some(handle_quizzes_delete(state, req)),
        "quizzes.list" => Some(handle_quizzes_list(state, req)),
        "questions.create" => Some(handle_questions_create(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        _ => None,
    }
}
