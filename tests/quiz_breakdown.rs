
use serde_json::json;
use test_support::{request_ok, result_str, rfc3339_in_minutes, spawn_sidecar, temp_dir};

#[test]
fn breakdown_reports_only_incorrect_questions_with_choice_detail() {
    let workspace = temp_dir("coursed-quiz-breakdown");
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
        json!({ "title": "Physics", "tags": ["forces", "energy"] }),
    );
    let course_id = result_str(&course, "courseId");
    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "people.create",
        json!({ "displayName": "Marsh, Uma", "role": "instructor" }),
    );
    let instructor_id = result_str(&instructor, "personId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "people.create",
        json!({ "displayName": "Reyes, Ziv", "role": "student" }),
    );
    let student_id = result_str(&student, "personId");
    let other_student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "people.create",
        json!({ "displayName": "Lund, Pia", "role": "student" }),
    );
    let other_student_id = result_str(&other_student, "personId");
    for (i, pid) in [&student_id, &other_student_id].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "courses.enrol",
            json!({ "courseId": course_id, "personId": pid }),
        );
    }

    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "quizzes.create",
        json!({
            "courseId": course_id,
            "instructorId": instructor_id,
            "title": "Forces check",
            "maxMarks": 5,
            "openAt": rfc3339_in_minutes(-5),
            "closeAt": rfc3339_in_minutes(60)
        }),
    );
    let quiz_id = result_str(&quiz, "quizId");

    let wrong_q = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "questions.create",
        json!({
            "quizId": quiz_id,
            "instructorId": instructor_id,
            "text": "Net force on a body at rest?",
            "kind": "choice",
            "marks": 2,
            "tag": "forces",
            "choices": [
                { "text": "zero", "correct": true },
                { "text": "its weight", "correct": false }
            ]
        }),
    );
    let wrong_q_id = result_str(&wrong_q, "questionId");
    let wrong_q_choices = wrong_q.get("choices").and_then(|v| v.as_array()).expect("choices");
    let correct_choice = wrong_q_choices[0].get("choiceId").and_then(|v| v.as_str()).expect("c");
    let wrong_choice = wrong_q_choices[1].get("choiceId").and_then(|v| v.as_str()).expect("c");

    let right_q = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "questions.create",
        json!({
            "quizId": quiz_id,
            "instructorId": instructor_id,
            "text": "Unit of energy?",
            "kind": "choice",
            "marks": 1,
            "tag": "energy",
            "choices": [
                { "text": "joule", "correct": true },
                { "text": "newton", "correct": false }
            ]
        }),
    );
    let right_q_id = result_str(&right_q, "questionId");
    let right_choice = right_q
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("choiceId"))
        .and_then(|v| v.as_str())
        .expect("c")
        .to_string();

    let open_q = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "questions.create",
        json!({
            "quizId": quiz_id,
            "instructorId": instructor_id,
            "text": "Explain conservation of energy",
            "kind": "open",
            "marks": 2,
            "tag": "energy"
        }),
    );
    let open_q_id = result_str(&open_q, "questionId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": student_id,
            "responses": [
                { "questionId": wrong_q_id, "choiceIds": [wrong_choice] },
                { "questionId": right_q_id, "choiceIds": [right_choice] },
                { "questionId": open_q_id, "answer": "energy is conserved" }
            ]
        }),
    );

    let breakdown = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "analytics.quizBreakdown",
        json!({ "quizId": quiz_id, "studentId": student_id }),
    );
    let questions = breakdown.get("questions").and_then(|v| v.as_array()).expect("questions");

    // The fully correct choice question is excluded; the missed choice and
    // the open response remain.
    assert_eq!(questions.len(), 2, "breakdown: {:?}", questions);
    assert!(questions
        .iter()
        .all(|q| q.get("questionId").and_then(|v| v.as_str()) != Some(right_q_id.as_str())));

    let wrong_item = questions
        .iter()
        .find(|q| q.get("questionId").and_then(|v| v.as_str()) == Some(wrong_q_id.as_str()))
        .expect("missed choice question");
    assert_eq!(wrong_item.get("mark").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(wrong_item.get("tag").and_then(|v| v.as_str()), Some("forces"));
    let detail = wrong_item.get("choices").and_then(|v| v.as_array()).expect("choice detail");
    let by_id = |cid: &str| {
        detail
            .iter()
            .find(|c| c.get("choiceId").and_then(|v| v.as_str()) == Some(cid))
            .cloned()
            .expect("choice row")
    };
    let correct_row = by_id(correct_choice);
    assert_eq!(correct_row.get("correct").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(correct_row.get("chosen").and_then(|v| v.as_bool()), Some(false));
    let wrong_row = by_id(wrong_choice);
    assert_eq!(wrong_row.get("correct").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(wrong_row.get("chosen").and_then(|v| v.as_bool()), Some(true));

    // The open question is always present, ungraded, with no mark field and
    // no choice detail.
    let open_item = questions
        .iter()
        .find(|q| q.get("questionId").and_then(|v| v.as_str()) == Some(open_q_id.as_str()))
        .expect("open question");
    assert!(open_item.get("mark").is_none(), "ungraded: {}", open_item);
    assert!(open_item.get("choices").is_none());

    // A student with no attempt gets an empty breakdown, not an error.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "analytics.quizBreakdown",
        json!({ "quizId": quiz_id, "studentId": other_student_id }),
    );
    assert_eq!(
        empty.get("questions").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}
