
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_ok, result_str, rfc3339_in_minutes, spawn_sidecar, temp_dir};

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    course_id: &str,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "people.create",
        json!({ "displayName": name, "role": "student" }),
    );
    let student_id = result_str(&created, "personId");
    let _ = request_ok(
        stdin,
        reader,
        &format!("{}e", id),
        "courses.enrol",
        json!({ "courseId": course_id, "personId": student_id }),
    );
    student_id
}

#[test]
fn choice_grading_is_exact_match_all_or_nothing() {
    let workspace = temp_dir("coursed-autograding");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "title": "Algebra I", "tags": ["equations"] }),
    );
    let course_id = result_str(&course, "courseId");
    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "people.create",
        json!({ "displayName": "Rivera, Sam", "role": "instructor" }),
    );
    let instructor_id = result_str(&instructor, "personId");

    let s1 = create_student(&mut stdin, &mut reader, "4", &course_id, "Au, Mei");
    let s2 = create_student(&mut stdin, &mut reader, "5", &course_id, "Bell, Kit");
    let s3 = create_student(&mut stdin, &mut reader, "6", &course_id, "Cho, Ada");

    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "quizzes.create",
        json!({
            "courseId": course_id,
            "instructorId": instructor_id,
            "title": "Linear equations",
            "maxMarks": 2,
            "openAt": rfc3339_in_minutes(-5),
            "closeAt": rfc3339_in_minutes(60)
        }),
    );
    let quiz_id = result_str(&quiz, "quizId");

    let question = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "questions.create",
        json!({
            "quizId": quiz_id,
            "instructorId": instructor_id,
            "text": "Solve 2x = 6",
            "kind": "choice",
            "marks": 2,
            "tag": "equations",
            "choices": [
                { "text": "x = 3", "correct": true },
                { "text": "x = 4", "correct": false }
            ]
        }),
    );
    let question_id = result_str(&question, "questionId");
    let choices = question
        .get("choices")
        .and_then(|v| v.as_array())
        .expect("choices");
    let c1 = choices[0].get("choiceId").and_then(|v| v.as_str()).expect("c1");
    let c2 = choices[1].get("choiceId").and_then(|v| v.as_str()).expect("c2");

    // The snapshot handed to the student must not reveal the answer key.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attempts.start",
        json!({ "quizId": quiz_id, "studentId": s1 }),
    );
    let start_choices = started
        .get("questions")
        .and_then(|v| v.as_array())
        .and_then(|qs| qs.first())
        .and_then(|q| q.get("choices"))
        .and_then(|v| v.as_array())
        .expect("snapshot choices");
    assert_eq!(start_choices.len(), 2);
    for c in start_choices {
        assert!(c.get("correct").is_none(), "snapshot leaks correctness: {}", c);
    }

    // Exactly the correct set earns full marks.
    let full = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": s1,
            "responses": [{ "questionId": question_id, "choiceIds": [c1] }]
        }),
    );
    assert_eq!(full.get("mark").and_then(|v| v.as_f64()), Some(2.0));
    let r = &full.get("responses").and_then(|v| v.as_array()).expect("responses")[0];
    assert_eq!(r.get("mark").and_then(|v| v.as_f64()), Some(2.0));
    assert_eq!(r.get("marked").and_then(|v| v.as_bool()), Some(true));

    // An extra wrong choice wipes the question: no partial credit.
    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": s2,
            "responses": [{ "questionId": question_id, "choiceIds": [c1, c2] }]
        }),
    );
    assert_eq!(extra.get("mark").and_then(|v| v.as_f64()), Some(0.0));

    // Empty selection scores zero but is still a graded response.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": s3,
            "responses": [{ "questionId": question_id, "choiceIds": [] }]
        }),
    );
    assert_eq!(empty.get("mark").and_then(|v| v.as_f64()), Some(0.0));
    let r = &empty.get("responses").and_then(|v| v.as_array()).expect("responses")[0];
    assert_eq!(r.get("marked").and_then(|v| v.as_bool()), Some(true));

    // Every choice response mark is 0 or full marks, never in between.
    for resp in [&full, &extra, &empty] {
        let mark = resp.get("mark").and_then(|v| v.as_f64()).expect("mark");
        assert!(mark == 0.0 || mark == 2.0, "unexpected mark {}", mark);
    }
}
