mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_batch, request_err, request_ok, sample_form, spawn_sidecar,
    str_field, temp_dir,
};

#[test]
fn messages_flow_between_users() {
    let workspace = temp_dir("sims-messages");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let admin_id = bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let _ = create_batch(&mut stdin, &mut reader);

    let mut form = sample_form("Faisal Akhtar", "faisal@example.org");
    form["password"] = json!("faisal-pass-1");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "reg",
        "registration.submit",
        json!({ "form": form }),
    );
    let student_id = str_field(&student, "userId");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "messages.send",
        json!({ "recipient": "faisal akhtar", "body": "Welcome to GLB-B03" }),
    );
    assert_eq!(first["recipientId"], student_id.as_str());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "messages.send",
        json!({ "recipient": student_id, "body": "Class starts at 9" }),
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "messages.send",
        json!({ "recipient": "nobody", "body": "hello" }),
        "not_found",
    );
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "messages.send",
        json!({ "recipient": student_id, "body": "x".repeat(501) }),
        "bad_params",
    );

    let sent = request_ok(&mut stdin, &mut reader, "5", "messages.sent", json!({}));
    assert_eq!(sent["messages"].as_array().map(|m| m.len()), Some(2));
    assert_eq!(sent["messages"][0]["recipient"], "Faisal Akhtar");

    // Only the recipient can mark a message read.
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "messages.markRead",
        json!({ "messageId": str_field(&first, "messageId") }),
        "not_found",
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "login": "faisal@example.org", "password": "faisal-pass-1" }),
    );
    let inbox = request_ok(&mut stdin, &mut reader, "8", "messages.inbox", json!({}));
    let messages = inbox["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m["senderId"] == admin_id.as_str()));
    assert!(messages.iter().all(|m| m["readAt"].is_null()));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "messages.markRead",
        json!({ "messageId": str_field(&first, "messageId") }),
    );
    let unread = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "messages.inbox",
        json!({ "unreadOnly": true }),
    );
    assert_eq!(unread["messages"].as_array().map(|m| m.len()), Some(1));
    assert_eq!(unread["messages"][0]["body"], "Class starts at 9");

    let _ = request_ok(&mut stdin, &mut reader, "11", "auth.logout", json!({}));
    let _ = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "messages.inbox",
        json!({}),
        "not_authenticated",
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
