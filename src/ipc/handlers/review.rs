use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_f64, required_str, require_role};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

// Manual grading has no deadline: it usually happens well after the quiz
// window has closed, so nothing here consults the window at all.

fn handle_review_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let quiz_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM quizzes WHERE id = ?", [&quiz_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if quiz_exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "quiz not found",
            Some(json!({ "quizId": quiz_id })),
        );
    }

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.text, q.marks, r.id, r.answer, a.student_id, p.display_name
         FROM responses r
         JOIN attempts a ON a.id = r.attempt_id
         JOIN questions q ON q.id = r.question_id
         JOIN people p ON p.id = a.student_id
         WHERE a.quiz_id = ? AND q.kind = 'open' AND r.marked = 0
         ORDER BY q.sort_order, p.display_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&quiz_id], |row| {
            let question_id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let marks: f64 = row.get(2)?;
            let response_id: String = row.get(3)?;
            let answer: Option<String> = row.get(4)?;
            let student_id: String = row.get(5)?;
            let student_name: String = row.get(6)?;
            Ok((question_id, text, marks, response_id, answer, student_id, student_name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Group rows per question; questions with nothing awaiting a mark simply
    // never show up.
    let mut questions: Vec<serde_json::Value> = Vec::new();
    for (question_id, text, marks, response_id, answer, student_id, student_name) in rows {
        let entry = json!({
            "responseId": response_id,
            "studentId": student_id,
            "studentName": student_name,
            "answer": answer.unwrap_or_default()
        });
        match questions.iter_mut().find(|q| {
            q.get("questionId").and_then(|v| v.as_str()) == Some(question_id.as_str())
        }) {
            Some(group) => {
                if let Some(arr) = group.get_mut("responses").and_then(|v| v.as_array_mut()) {
                    arr.push(entry);
                }
            }
            None => questions.push(json!({
                "questionId": question_id,
                "text": text,
                "marks": marks,
                "responses": [entry]
            })),
        }
    }

    ok(&req.id, json!({ "quizId": quiz_id, "questions": questions }))
}

fn handle_review_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let response_id = match required_str(req, "responseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mark = match required_f64(req, "mark") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row: Option<(String, f64, f64, String)> = match conn
        .query_row(
            "SELECT r.attempt_id, r.mark, q.marks, q.kind
             FROM responses r
             JOIN questions q ON q.id = r.question_id
             WHERE r.id = ?",
            [&response_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((attempt_id, old_mark, question_marks, kind)) = row else {
        return err(
            &req.id,
            "not_found",
            "response not found",
            Some(json!({ "responseId": response_id })),
        );
    };

    // Manual marks are for open responses only. Choice responses are owned
    // by the auto-grader, which keeps their marks at exactly 0 or full; an
    // instructor override here would break that.
    if kind != "open" {
        return err(
            &req.id,
            "bad_params",
            "only open responses can be graded manually",
            Some(json!({ "responseId": response_id, "kind": kind })),
        );
    }

    if mark < 0.0 {
        return err(
            &req.id,
            "invalid_mark",
            "mark must not be negative",
            Some(json!({ "kind": "negative", "mark": mark })),
        );
    }
    if mark > question_marks {
        return err(
            &req.id,
            "invalid_mark",
            "mark exceeds the question maximum",
            Some(json!({ "kind": "exceeds_max", "mark": mark, "maxMarks": question_marks })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "UPDATE responses SET mark = ?, marked = 1 WHERE id = ?",
        (mark, &response_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "responses" })),
        );
    }

    // Apply the delta, not a blind add: a first grade adds the full mark
    // (the response carried 0 from finish), and a re-grade replaces the old
    // value instead of double counting.
    if let Err(e) = tx.execute(
        "UPDATE attempts SET mark = mark + ? WHERE id = ?",
        (mark - old_mark, &attempt_id),
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

    let attempt_mark: f64 = match conn.query_row(
        "SELECT mark FROM attempts WHERE id = ?",
        [&attempt_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "responseId": response_id,
            "mark": mark,
            "attemptId": attempt_id,
            "attemptMark": attempt_mark
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "review.list" => Some(handle_review_list(state, req)),
        "review.grade" => Some(handle_review_grade(state, req)),
        _ => None,
    }
}
