mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_batch, request_err, request_ok, sample_form, spawn_sidecar,
    str_field, temp_dir,
};

#[test]
fn tasks_track_completion_per_student() {
    let workspace = temp_dir("sims-tasks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let batch_id = create_batch(&mut stdin, &mut reader);
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "reg",
        "registration.submit",
        json!({ "form": sample_form("Kashif Noor", "kashif@example.org") }),
    );
    let student_id = str_field(&student, "userId");

    let reading = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "tasks.create",
        json!({
            "classBatchId": batch_id,
            "name": "Reading log",
            "description": "Chapters 1-3",
            "dueDate": "2024-03-01"
        }),
    );
    let essay = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "tasks.create",
        json!({ "classBatchId": batch_id, "name": "Essay", "dueDate": "2024-02-20" }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "tasks.create",
        json!({ "classBatchId": batch_id, "name": "", "dueDate": "2024-02-20" }),
        "bad_params",
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "tasks.setStatus",
        json!({
            "taskId": str_field(&essay, "taskId"),
            "userId": student_id,
            "done": true,
            "note": "late"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "tasks.setStatus",
        json!({ "taskId": str_field(&reading, "taskId"), "userId": student_id, "done": false }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "tasks.setStatus",
        json!({ "taskId": str_field(&reading, "taskId"), "userId": student_id }),
        "bad_params",
    );

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "tasks.list",
        json!({ "classBatchId": batch_id }),
    );
    assert_eq!(list["tasks"][0]["name"], "Essay");
    assert_eq!(list["tasks"][0]["done"], 1);
    assert_eq!(list["tasks"][1]["done"], 0);
    assert_eq!(list["tasks"][1]["total"], 1);

    let mine = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "tasks.forUser",
        json!({ "userId": student_id }),
    );
    let tasks = mine["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["done"], true);
    assert_eq!(tasks[0]["note"], "late");
    assert_eq!(tasks[1]["done"], false);

    // The admin belongs to no batch and has no statuses.
    let none = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "tasks.forUser",
        json!({ "userId": admin_id }),
    );
    assert_eq!(none["tasks"], json!([]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scores_are_bounded_and_summarised() {
    let workspace = temp_dir("sims-scores");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let batch_id = create_batch(&mut stdin, &mut reader);

    let mut students = Vec::new();
    for (i, name) in ["Omar Farooq", "Yusuf Iqbal", "Zaid Hasan"].iter().enumerate() {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("reg{}", i),
            "registration.submit",
            json!({ "form": sample_form(name, &format!("score{}@example.org", i)) }),
        );
        students.push(str_field(&s, "userId"));
    }

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-04-01", "maxScore": 0 }),
        "bad_params",
    );
    let test = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-04-01", "maxScore": 50 }),
    );
    let test_id = str_field(&test, "testSessionId");

    for (i, (student, score)) in students.iter().zip([40, 25, 45]).enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("set{}", i),
            "scores.set",
            json!({ "testSessionId": test_id, "userId": student, "score": score }),
        );
    }
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "scores.set",
        json!({ "testSessionId": test_id, "userId": students[0], "score": 51 }),
        "bad_params",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "scores.set",
        json!({ "testSessionId": test_id, "userId": students[0], "score": -1 }),
        "bad_params",
    );
    // A re-score replaces the earlier value.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.set",
        json!({ "testSessionId": test_id, "userId": students[1], "score": 30, "note": "retake" }),
    );

    let for_test = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.forTest",
        json!({ "testSessionId": test_id }),
    );
    assert_eq!(for_test["maxScore"], 50);
    assert_eq!(for_test["rows"].as_array().map(|r| r.len()), Some(3));
    assert_eq!(for_test["rows"][1]["note"], "retake");
    let stats = &for_test["stats"];
    assert_eq!(stats["count"], 3);
    assert_eq!(stats["min"], 30);
    assert_eq!(stats["max"], 45);
    let mean = stats["mean"].as_f64().expect("mean");
    assert!((mean - 115.0 / 3.0).abs() < 1e-9, "{mean}");

    let tests = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "tests.list",
        json!({ "classBatchId": batch_id }),
    );
    assert_eq!(tests["tests"][0]["scored"], 3);

    let for_user = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "scores.forUser",
        json!({ "userId": students[0] }),
    );
    assert_eq!(for_user["scores"][0]["score"], 40);
    assert_eq!(for_user["scores"][0]["percent"].as_f64(), Some(80.0));

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "scores.forTest",
        json!({ "testSessionId": "missing" }),
        "not_found",
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scores_at_the_integer_limit_are_summarised() {
    let workspace = temp_dir("sims-scores-limit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let batch_id = create_batch(&mut stdin, &mut reader);

    let test = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-05-01", "maxScore": i64::MAX }),
    );
    let test_id = str_field(&test, "testSessionId");
    for (i, name) in ["Irfan Baig", "Sohail Mirza"].iter().enumerate() {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("reg{}", i),
            "registration.submit",
            json!({ "form": sample_form(name, &format!("limit{}@example.org", i)) }),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("set{}", i),
            "scores.set",
            json!({
                "testSessionId": test_id,
                "userId": str_field(&s, "userId"),
                "score": i64::MAX
            }),
        );
    }

    let for_test = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.forTest",
        json!({ "testSessionId": test_id }),
    );
    assert_eq!(for_test["stats"]["count"], 2);
    assert_eq!(for_test["stats"]["max"], i64::MAX);
    let percent = for_test["stats"]["meanPercent"].as_f64().expect("meanPercent");
    assert!((percent - 100.0).abs() < 1e-9, "{percent}");

    // The daemon is still answering.
    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health["authenticated"], true);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn one_test_per_batch_and_date() {
    let workspace = temp_dir("sims-scores-unique");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let batch_id = create_batch(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-06-02", "maxScore": 20 }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-06-02", "maxScore": 30 }),
        "conflict",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "tests.create",
        json!({ "classBatchId": batch_id, "testDate": "2024-06-09", "maxScore": 30 }),
    );
    let tests = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "tests.list",
        json!({ "classBatchId": batch_id }),
    );
    assert_eq!(tests["tests"].as_array().map(|t| t.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
