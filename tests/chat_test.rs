//! Integration tests for the conversation lifecycle: direct-pair
//! de-duplication, the chat request/accept/decline state machine, follow
//! reconciliation, group creation, and listing.

mod common;

use common::{create_user, follow, open_direct, send_message, start_test_server};
use serde_json::json;

#[tokio::test]
async fn direct_conversation_is_deduplicated() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let first = open_direct(&base_url, &alice_token, &bob_id).await;
    let second = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(first["id"], second["id"], "Same pair must map to one conversation");

    // Opening from the other side lands on the same conversation too.
    let from_bob = open_direct(&base_url, &bob_token, &alice_id).await;
    assert_eq!(first["id"], from_bob["id"]);
}

#[tokio::test]
async fn conversation_with_follower_starts_active() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    follow(&base_url, &bob_token, &alice_id).await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "active");
}

#[tokio::test]
async fn conversation_without_follow_requires_accept() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "requested");
    let conv_id = conv["id"].as_str().unwrap();

    // The requester may keep writing while the request is pending.
    send_message(&base_url, &alice_token, conv_id, "hello?").await;

    // The recipient may not write until they accept.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations/{}/messages", base_url, conv_id))
        .bearer_auth(&bob_token)
        .json(&json!({ "body": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Accept, then both sides can write.
    let resp = client
        .post(format!("{}/api/conversations/{}/accept", base_url, conv_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let accepted: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(accepted["status"], "active");

    send_message(&base_url, &bob_token, conv_id, "hi").await;
}

#[tokio::test]
async fn creator_cannot_accept_own_request() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (_bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations/{}/accept", base_url, conv_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn accept_is_single_shot() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    let url = format!("{}/api/conversations/{}/accept", base_url, conv_id);
    let resp = client.post(&url).bearer_auth(&bob_token).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    // The status no longer matches, so a repeat reads as not-found.
    let resp = client.post(&url).bearer_auth(&bob_token).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn declined_request_can_be_rerequested() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations/{}/decline", base_url, conv_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let declined: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(declined["status"], "declined");

    // Reopening flips it back to requested on the same conversation row.
    let reopened = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(reopened["id"].as_str().unwrap(), conv_id);
    assert_eq!(reopened["status"], "requested");
}

#[tokio::test]
async fn accepted_conversation_survives_reopen() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    // Bob never follows Alice; the conversation goes active by explicit accept.
    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "requested");
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations/{}/accept", base_url, conv_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    send_message(&base_url, &bob_token, conv_id, "accepted and writing").await;

    // A routine re-open by the requester must not revoke the acceptance.
    let reopened = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(reopened["id"], conv["id"]);
    assert_eq!(reopened["status"], "active");
    send_message(&base_url, &bob_token, conv_id, "still writing").await;
}

#[tokio::test]
async fn unfollow_demotes_conversation_on_reopen() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    follow(&base_url, &bob_token, &alice_id).await;
    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "active");

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{}/api/users/{}/follow", base_url, alice_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The next open re-derives the status from the current follow edge.
    let reopened = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(reopened["id"], conv["id"]);
    assert_eq!(reopened["status"], "requested");
    assert_eq!(reopened["creator_id"].as_str().unwrap(), alice_id);
}

#[tokio::test]
async fn pending_request_promotes_when_followed() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "requested");

    follow(&base_url, &bob_token, &alice_id).await;

    let reopened = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(reopened["status"], "active");
}

#[tokio::test]
async fn pending_request_promotes_on_lookup() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    assert_eq!(conv["status"], "requested");
    let conv_id = conv["id"].as_str().unwrap();

    follow(&base_url, &bob_token, &alice_id).await;

    // A plain GET re-derives the status; no re-open is needed.
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/conversations/{}", base_url, conv_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let view: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(view["status"], "active");

    send_message(&base_url, &bob_token, conv_id, "no accept needed").await;
}

#[tokio::test]
async fn group_requires_three_participants() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (_bob_token, bob_id) = create_user(&base_url, "Bob").await;
    let (_carol_token, carol_id) = create_user(&base_url, "Carol").await;

    let client = reqwest::Client::new();

    // Two total participants is not a group.
    let resp = client
        .post(format!("{}/api/conversations", base_url))
        .bearer_auth(&alice_token)
        .json(&json!({ "participant_ids": [bob_id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/conversations", base_url))
        .bearer_auth(&alice_token)
        .json(&json!({ "participant_ids": [bob_id, carol_id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let group: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(group["kind"], "group");
    assert_eq!(group["status"], "active");
    assert_eq!(group["participant_ids"].as_array().unwrap().len(), 3);
    // Creator is the initial admin.
    let admins = group["admin_ids"].as_array().unwrap();
    assert_eq!(admins.len(), 1);
}

#[tokio::test]
async fn list_filters_by_status() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;
    let (carol_token, carol_id) = create_user(&base_url, "Carol").await;

    follow(&base_url, &bob_token, &alice_id).await;
    open_direct(&base_url, &alice_token, &bob_id).await; // active
    open_direct(&base_url, &alice_token, &carol_id).await; // requested

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/conversations?status=requested", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["status"], "requested");
    assert_eq!(page["pagination"]["total"], 1);

    // Carol sees the pending request in her own list.
    let resp = client
        .get(format!("{}/api/conversations", base_url))
        .bearer_auth(&carol_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn declined_conversation_hidden_from_decliner() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/conversations/{}/decline", base_url, conv_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/api/conversations", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 0);

    // The creator still sees it.
    let resp = client
        .get(format!("{}/api/conversations", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["status"], "declined");

    // The explicit status filter does not leak it back to the decliner.
    let resp = client
        .get(format!("{}/api/conversations?status=declined", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 0);
    assert_eq!(page["pagination"]["total"], 0);

    let resp = client
        .get(format!("{}/api/conversations?status=declined", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn mute_round_trips() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id) = create_user(&base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(&base_url, "Bob").await;

    follow(&base_url, &bob_token, &alice_id).await;
    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations/{}/mute", base_url, conv_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let view: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        view["muted_by"].as_array().unwrap(),
        &vec![json!(alice_id.clone())]
    );

    let resp = client
        .post(format!("{}/api/conversations/{}/unmute", base_url, conv_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let view: serde_json::Value = resp.json().await.unwrap();
    assert!(view["muted_by"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn outsider_cannot_read_conversation() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (_bob_token, bob_id) = create_user(&base_url, "Bob").await;
    let (mallory_token, _mallory_id) = create_user(&base_url, "Mallory").await;

    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/conversations/{}", base_url, conv_id))
        .bearer_auth(&mallory_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn maintenance_merge_reports_clean_database() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (_bob_token, bob_id) = create_user(&base_url, "Bob").await;
    open_direct(&base_url, &alice_token, &bob_id).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/admin/maintenance/conversations", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(report["conversations_removed"], 0);
    assert_eq!(report["messages_moved"], 0);
}
