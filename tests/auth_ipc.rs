mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_batch, request_err, request_ok, sample_form, spawn_sidecar_with,
    str_field, temp_dir,
};

#[test]
fn lockout_unlock_and_password_change() {
    let workspace = temp_dir("sims-auth-lockout");
    let (mut child, mut stdin, mut reader) =
        spawn_sidecar_with(&[("SIMSD_MAX_LOGIN_ATTEMPTS", "2")]);

    let _ = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "auth.bootstrap",
        json!({ "username": "Second", "email": "second@example.org", "password": "second-pass" }),
        "conflict",
    );

    let _ = create_batch(&mut stdin, &mut reader);
    let mut form = sample_form("Bilal Ahmed", "bilal@example.org");
    form["password"] = json!("student-pass");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registration.submit",
        json!({ "form": form }),
    );
    let student_id = str_field(&student, "userId");

    let _ = request_ok(&mut stdin, &mut reader, "3", "auth.logout", json!({}));
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "auth.whoami",
        json!({}),
        "not_authenticated",
    );

    let first = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "login": "bilal@example.org", "password": "wrong" }),
        "invalid_credentials",
    );
    assert_eq!(first["details"]["attemptsLeft"], 1);
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "login": "Bilal Ahmed", "password": "still wrong" }),
        "invalid_credentials",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "login": "bilal@example.org", "password": "student-pass" }),
        "account_locked",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "auth.login",
        json!({ "login": "nobody@example.org", "password": "whatever" }),
        "invalid_credentials",
    );

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "auth.login",
        json!({ "login": "ADMIN@Example.org", "password": "admin-pass-1" }),
    );
    assert_eq!(admin["forceChange"], false);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.unlock",
        json!({ "userId": student_id }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "11", "auth.logout", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "auth.login",
        json!({ "login": "bilal@example.org", "password": "student-pass" }),
    );
    let me = request_ok(&mut stdin, &mut reader, "13", "auth.whoami", json!({}));
    assert_eq!(me["userId"], student_id.as_str());
    assert_eq!(me["studentNo"], 2);
    assert_eq!(me["roles"], json!([]));

    let _ = request_err(
        &mut stdin,
        &mut reader,
        "14",
        "auth.setPassword",
        json!({ "password": "new-password", "confirmPassword": "new-passw0rd" }),
        "bad_params",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "auth.setPassword",
        json!({ "password": "short", "confirmPassword": "short" }),
        "bad_params",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "auth.setPassword",
        json!({ "password": "new-password", "confirmPassword": "new-password" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "17", "auth.logout", json!({}));
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "auth.login",
        json!({ "login": "bilal@example.org", "password": "student-pass" }),
        "invalid_credentials",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "auth.login",
        json!({ "login": "bilal@example.org", "password": "new-password" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn data_calls_require_a_session_and_selecting_a_workspace_signs_out() {
    let workspace = temp_dir("sims-auth-session");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with(&[]);

    let admin_id = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["authenticated"], true);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "classNames.create",
        json!({ "name": "GLB" }),
        "not_authenticated",
    );
    for (i, (method, params)) in [
        ("classNames.list", json!({})),
        ("users.list", json!({})),
        ("users.get", json!({ "userId": admin_id })),
        ("settings.get", json!({ "key": "registration.countries" })),
        ("scores.forUser", json!({ "userId": admin_id })),
        ("progress.list", json!({ "userId": admin_id })),
    ]
    .into_iter()
    .enumerate()
    {
        let _ = request_err(
            &mut stdin,
            &mut reader,
            &format!("r{}", i),
            method,
            params,
            "not_authenticated",
        );
    }

    // Option lists stay open for the registration form.
    let countries = request_ok(&mut stdin, &mut reader, "4", "lookup.options", json!({}));
    assert!(countries["countries"]
        .as_array()
        .is_some_and(|c| c.iter().any(|n| n == "India")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn whoami_reports_a_renamed_user() {
    let workspace = temp_dir("sims-auth-rename");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with(&[]);

    let admin_id = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.update",
        json!({ "userId": admin_id, "patch": { "username": "Office Admin" } }),
    );
    let me = request_ok(&mut stdin, &mut reader, "2", "auth.whoami", json!({}));
    assert_eq!(me["username"], "Office Admin");
    assert_eq!(me["studentNo"], 1);

    let _ = request_ok(&mut stdin, &mut reader, "3", "auth.logout", json!({}));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "login": "Office Admin", "password": "admin-pass-1" }),
    );
    assert_eq!(again["username"], "Office Admin");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
