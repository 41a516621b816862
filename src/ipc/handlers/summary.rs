use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};

// Read-only rollups. These views never write, and missing data (an
// unattempted quiz, an unmarked open response) degrades to omitted fields
// rather than an error; only an unknown parent id is a hard failure.

fn parse_id_set(raw: Option<&str>) -> BTreeSet<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
        .into_iter()
        .collect()
}

fn parse_tag_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    label: &str,
) -> Result<(), serde_json::Value> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} not found", label),
            Some(json!({ "id": id })),
        ));
    }
    Ok(())
}

fn correct_sets_for_quiz(
    conn: &Connection,
    quiz_id: &str,
) -> rusqlite::Result<HashMap<String, BTreeSet<String>>> {
    let mut stmt = conn.prepare(
        "SELECT c.question_id, c.id, c.correct
         FROM choices c
         JOIN questions q ON q.id = c.question_id
         WHERE q.quiz_id = ?",
    )?;
    let rows = stmt
        .query_map([quiz_id], |r| {
            let question_id: String = r.get(0)?;
            let choice_id: String = r.get(1)?;
            let correct: i64 = r.get(2)?;
            Ok((question_id, choice_id, correct != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: HashMap<String, BTreeSet<String>> = HashMap::new();
    for (question_id, choice_id, correct) in rows {
        let set = out.entry(question_id).or_default();
        if correct {
            set.insert(choice_id);
        }
    }
    Ok(out)
}

struct ResponseRow {
    question_id: String,
    marked: bool,
    mark: f64,
    choice_ids: Option<String>,
}

fn responses_for_attempt(
    conn: &Connection,
    attempt_id: &str,
) -> rusqlite::Result<Vec<ResponseRow>> {
    let mut stmt = conn.prepare(
        "SELECT question_id, marked, mark, choice_ids FROM responses WHERE attempt_id = ?",
    )?;
    let rows = stmt
        .query_map([attempt_id], |r| {
            Ok(ResponseRow {
                question_id: r.get(0)?,
                marked: r.get::<_, i64>(1)? != 0,
                mark: r.get(2)?,
                choice_ids: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = exists(conn, req, "courses", &course_id, "course") {
        return resp;
    }
    if let Err(resp) = exists(conn, req, "people", &student_id, "student") {
        return resp;
    }

    let mut items: Vec<serde_json::Value> = Vec::new();

    let quiz_rows: Result<Vec<(String, String, f64)>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, title, max_marks FROM quizzes WHERE course_id = ? ORDER BY open_at, title",
        )?;
        let rows = stmt
            .query_map([&course_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect();
        rows
    })();
    let quiz_rows = match quiz_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    for (quiz_id, title, max_marks) in quiz_rows {
        // Never attempted: the quiz is omitted from the summary entirely.
        let attempt: Option<(String, f64)> = match conn
            .query_row(
                "SELECT id, mark FROM attempts WHERE quiz_id = ? AND student_id = ?",
                (&quiz_id, &student_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some((attempt_id, attempt_mark)) = attempt else {
            continue;
        };

        let responses = match responses_for_attempt(conn, &attempt_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let correct_sets = match correct_sets_for_quiz(conn, &quiz_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let tag_rows: Result<HashMap<String, (String, String)>, rusqlite::Error> = (|| {
            let mut stmt =
                conn.prepare("SELECT id, kind, tag FROM questions WHERE quiz_id = ?")?;
            let rows = stmt
                .query_map([&quiz_id], |r| {
                    let id: String = r.get(0)?;
                    let kind: String = r.get(1)?;
                    let tag: String = r.get(2)?;
                    Ok((id, (kind, tag)))
                })?
                .collect();
            rows
        })();
        let question_meta = match tag_rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let any_graded = responses.iter().any(|r| r.marked);
        let mut incorrect_tags: Vec<String> = Vec::new();
        let mut seen_tags: HashSet<String> = HashSet::new();
        let empty = BTreeSet::new();
        for r in &responses {
            let Some((kind, tag)) = question_meta.get(&r.question_id) else {
                continue;
            };
            let correct = correct_sets.get(&r.question_id).unwrap_or(&empty);
            let submitted = parse_id_set(r.choice_ids.as_deref());
            if grading::response_is_incorrect(kind, correct, &submitted)
                && seen_tags.insert(tag.clone())
            {
                incorrect_tags.push(tag.clone());
            }
        }

        let mut item = json!({
            "kind": "quiz",
            "id": quiz_id,
            "title": title,
            "maxMarks": max_marks,
            "incorrectTags": incorrect_tags
        });
        if any_graded {
            item["marksAwarded"] = json!(attempt_mark);
        }
        items.push(item);
    }

    let assignment_rows: Result<Vec<(String, String, f64)>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id, title, max_marks FROM assignments WHERE course_id = ? ORDER BY title",
        )?;
        let rows = stmt
            .query_map([&course_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect();
        rows
    })();
    let assignment_rows = match assignment_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    for (assignment_id, title, max_marks) in assignment_rows {
        let submission: Option<(bool, f64, String, String)> = match conn
            .query_row(
                "SELECT marked, mark, success_tags, improvement_tags
                 FROM assignment_submissions
                 WHERE assignment_id = ? AND student_id = ?",
                (&assignment_id, &student_id),
                |r| {
                    Ok((
                        r.get::<_, i64>(0)? != 0,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some((marked, mark, success_raw, improvement_raw)) = submission else {
            continue;
        };

        let mut item = json!({
            "kind": "assignment",
            "id": assignment_id,
            "title": title,
            "maxMarks": max_marks,
            "successTags": parse_tag_list(&success_raw),
            "improvementTags": parse_tag_list(&improvement_raw)
        });
        if marked {
            item["marksAwarded"] = json!(mark);
        }
        items.push(item);
    }

    ok(
        &req.id,
        json!({ "courseId": course_id, "studentId": student_id, "items": items }),
    )
}

fn handle_quiz_breakdown(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(resp) = exists(conn, req, "quizzes", &quiz_id, "quiz") {
        return resp;
    }
    if let Err(resp) = exists(conn, req, "people", &student_id, "student") {
        return resp;
    }

    let attempt_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM attempts WHERE quiz_id = ? AND student_id = ?",
            (&quiz_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(attempt_id) = attempt_id else {
        return ok(&req.id, json!({ "quizId": quiz_id, "questions": [] }));
    };

    let responses = match responses_for_attempt(conn, &attempt_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let by_question: HashMap<&str, &ResponseRow> = responses
        .iter()
        .map(|r| (r.question_id.as_str(), r))
        .collect();

    let question_rows: Result<Vec<(String, String, String, f64, String)>, rusqlite::Error> =
        (|| {
            let mut stmt = conn.prepare(
                "SELECT id, text, kind, marks, tag FROM questions WHERE quiz_id = ? ORDER BY sort_order",
            )?;
            let rows = stmt
                .query_map([&quiz_id], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                })?
                .collect();
            rows
        })();
    let question_rows = match question_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut c_stmt = match conn.prepare(
        "SELECT id, text, correct FROM choices WHERE question_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut questions_out: Vec<serde_json::Value> = Vec::new();
    for (question_id, text, kind, marks, tag) in question_rows {
        // Questions the student never answered carry no submission to
        // analyze; they are left out along with the fully correct ones.
        let Some(response) = by_question.get(question_id.as_str()) else {
            continue;
        };

        let choice_rows: Result<Vec<(String, String, bool)>, rusqlite::Error> = c_stmt
            .query_map([&question_id], |r| {
                let id: String = r.get(0)?;
                let text: String = r.get(1)?;
                let correct: i64 = r.get(2)?;
                Ok((id, text, correct != 0))
            })
            .and_then(|it| it.collect());
        let choice_rows = match choice_rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let correct_set: BTreeSet<String> = choice_rows
            .iter()
            .filter(|(_, _, correct)| *correct)
            .map(|(id, _, _)| id.clone())
            .collect();
        let chosen_set = parse_id_set(response.choice_ids.as_deref());

        if !grading::response_is_incorrect(&kind, &correct_set, &chosen_set) {
            continue;
        }

        let mut item = json!({
            "questionId": question_id,
            "text": text,
            "tag": tag,
            "kind": kind,
            "marks": marks
        });
        // An ungraded open response has no mark yet; the field stays absent
        // rather than reading as a zero score.
        if response.marked {
            item["mark"] = json!(response.mark);
        }
        if kind == "choice" {
            let choices: Vec<serde_json::Value> = choice_rows
                .iter()
                .map(|(id, text, correct)| {
                    json!({
                        "choiceId": id,
                        "text": text,
                        "correct": correct,
                        "chosen": chosen_set.contains(id)
                    })
                })
                .collect();
            item["choices"] = json!(choices);
        }
        questions_out.push(item);
    }

    ok(
        &req.id,
        json!({ "quizId": quiz_id, "studentId": student_id, "questions": questions_out }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.studentSummary" => Some(handle_student_summary(state, req)),
        "analytics.quizBreakdown" => Some(handle_quiz_breakdown(state, req)),
        _ => None,
    }
}
