use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_f64, required_str, require_role, str_array};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

// Courses, people, enrolments and recorded assignment grades are the
// boundary to the external course/identity/assignment services: the quiz
// core consults these rows but does not own their lifecycle beyond this
// minimal intake surface.

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let tags = match str_array(req, "tags") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let course_id = Uuid::new_v4().to_string();
    let tags_json = serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, title, tags) VALUES(?, ?, ?)",
        (&course_id, &title, &tags_json),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "title": title }))
}

fn handle_people_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let display_name = match required_str(req, "displayName") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if display_name.is_empty() {
        return err(&req.id, "bad_params", "displayName must not be empty", None);
    }
    let role = match required_str(req, "role") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if role != "student" && role != "instructor" {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: student, instructor",
            Some(json!({ "role": role })),
        );
    }

    let person_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO people(id, display_name, role) VALUES(?, ?, ?)",
        (&person_id, &display_name, &role),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "people" })),
        );
    }

    ok(&req.id, json!({ "personId": person_id }))
}

fn handle_courses_enrol(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let person_id = match required_str(req, "personId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

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
    let person_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM people WHERE id = ?", [&person_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if person_exists.is_none() {
        return err(&req.id, "not_found", "person not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO enrolments(course_id, person_id) VALUES(?, ?)
         ON CONFLICT(course_id, person_id) DO NOTHING",
        (&course_id, &person_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrolments" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_marks = match required_f64(req, "maxMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if max_marks <= 0.0 {
        return err(&req.id, "bad_params", "maxMarks must be > 0", None);
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

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, course_id, title, max_marks) VALUES(?, ?, ?, ?)",
        (&assignment_id, &course_id, &title, max_marks),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_record_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(conn, req, "instructorId", "instructor") {
        return resp;
    }
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mark = match required_f64(req, "mark") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let success_tags = match str_array(req, "successTags") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let improvement_tags = match str_array(req, "improvementTags") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let max_marks: Option<f64> = match conn
        .query_row(
            "SELECT max_marks FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(max_marks) = max_marks else {
        return err(&req.id, "not_found", "assignment not found", None);
    };
    if mark < 0.0 {
        return err(
            &req.id,
            "invalid_mark",
            "mark must not be negative",
            Some(json!({ "kind": "negative", "mark": mark })),
        );
    }
    if mark > max_marks {
        return err(
            &req.id,
            "invalid_mark",
            "mark exceeds the assignment maximum",
            Some(json!({ "kind": "exceeds_max", "mark": mark, "maxMarks": max_marks })),
        );
    }

    let submission_id = Uuid::new_v4().to_string();
    let success_json = serde_json::to_string(&success_tags).unwrap_or_else(|_| "[]".to_string());
    let improvement_json =
        serde_json::to_string(&improvement_tags).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO assignment_submissions(
             id, assignment_id, student_id, marked, mark, success_tags, improvement_tags)
         VALUES(?, ?, ?, 1, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           marked = 1,
           mark = excluded.mark,
           success_tags = excluded.success_tags,
           improvement_tags = excluded.improvement_tags",
        (
            &submission_id,
            &assignment_id,
            &student_id,
            mark,
            &success_json,
            &improvement_json,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignment_submissions" })),
        );
    }

    ok(&req.id, json!({ "assignmentId": assignment_id, "studentId": student_id, "mark": mark }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "people.create" => Some(handle_people_create(state, req)),
        "courses.enrol" => Some(handle_courses_enrol(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.recordGrade" => Some(handle_assignments_record_grade(state, req)),
        _ => None,
    }
}
