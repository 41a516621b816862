
use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    request_err, request_ok, result_str, rfc3339_in_minutes, spawn_sidecar, temp_dir,
};

struct Fixture {
    course_id: String,
    instructor_id: String,
    student_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &str) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace }),
    );
    let course = request_ok(
        stdin,
        reader,
        "s2",
        "courses.create",
        json!({ "title": "History", "tags": ["dates"] }),
    );
    let course_id = result_str(&course, "courseId");
    let instructor = request_ok(
        stdin,
        reader,
        "s3",
        "people.create",
        json!({ "displayName": "Okafor, Jo", "role": "instructor" }),
    );
    let instructor_id = result_str(&instructor, "personId");
    let student = request_ok(
        stdin,
        reader,
        "s4",
        "people.create",
        json!({ "displayName": "Dunn, Max", "role": "student" }),
    );
    let student_id = result_str(&student, "personId");
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "courses.enrol",
        json!({ "courseId": course_id, "personId": student_id }),
    );
    Fixture {
        course_id,
        instructor_id,
        student_id,
    }
}

fn create_quiz(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    fx: &Fixture,
    open_minutes: i64,
    close_minutes: i64,
) -> String {
    let quiz = request_ok(
        stdin,
        reader,
        id,
        "quizzes.create",
        json!({
            "courseId": fx.course_id,
            "instructorId": fx.instructor_id,
            "title": "Timed quiz",
            "maxMarks": 1,
            "openAt": rfc3339_in_minutes(open_minutes),
            "closeAt": rfc3339_in_minutes(close_minutes)
        }),
    );
    let quiz_id = result_str(&quiz, "quizId");
    let _ = request_ok(
        stdin,
        reader,
        &format!("{}q", id),
        "questions.create",
        json!({
            "quizId": quiz_id,
            "instructorId": fx.instructor_id,
            "text": "When?",
            "kind": "open",
            "marks": 1,
            "tag": "dates"
        }),
    );
    quiz_id
}

#[test]
fn start_respects_current_window() {
    let workspace = temp_dir("coursed-window-start");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());

    let not_open = create_quiz(&mut stdin, &mut reader, "1", &fx, 10, 60);
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "attempts.start",
        json!({ "quizId": not_open, "studentId": fx.student_id }),
    );
    assert_eq!(code, "quiz_not_open_yet");

    let closed = create_quiz(&mut stdin, &mut reader, "3", &fx, -60, -10);
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.start",
        json!({ "quizId": closed, "studentId": fx.student_id }),
    );
    assert_eq!(code, "quiz_closed");
}

#[test]
fn finish_rechecks_window_after_close_moves_into_past() {
    let workspace = temp_dir("coursed-window-shrink");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());
    let quiz_id = create_quiz(&mut stdin, &mut reader, "1", &fx, -5, 60);

    // Student starts while the window is open.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attempts.start",
        json!({ "quizId": quiz_id, "studentId": fx.student_id }),
    );

    // The instructor shrinks the window before the student finishes. This is
    // the load-bearing case: finish must consult the row as it is now.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quizzes.update",
        json!({
            "quizId": quiz_id,
            "instructorId": fx.instructor_id,
            "patch": { "closeAt": rfc3339_in_minutes(-1) }
        }),
    );

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": fx.student_id,
            "responses": []
        }),
    );
    assert_eq!(code, "quiz_closed");

    // Nothing was persisted: widening the window again lets the same pair
    // finish cleanly.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "quizzes.update",
        json!({
            "quizId": quiz_id,
            "instructorId": fx.instructor_id,
            "patch": { "closeAt": rfc3339_in_minutes(60) }
        }),
    );
    let finished = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": fx.student_id,
            "responses": []
        }),
    );
    assert!(finished.get("attemptId").is_some());
}

#[test]
fn finish_rechecks_window_after_open_moves_into_future() {
    let workspace = temp_dir("coursed-window-defer");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace.to_string_lossy());
    let quiz_id = create_quiz(&mut stdin, &mut reader, "1", &fx, -5, 60);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attempts.start",
        json!({ "quizId": quiz_id, "studentId": fx.student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "quizzes.update",
        json!({
            "quizId": quiz_id,
            "instructorId": fx.instructor_id,
            "patch": { "openAt": rfc3339_in_minutes(30) }
        }),
    );

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "attempts.finish",
        json!({
            "quizId": quiz_id,
            "studentId": fx.student_id,
            "responses": []
        }),
    );
    assert_eq!(code, "quiz_not_open_yet");
}
