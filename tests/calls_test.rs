//! Integration tests for the call signaling state machine: initiation
//! preconditions, the busy conflict, accept/decline/end transitions,
//! idempotent terminal handling, and history/stats.

mod common;

use common::{create_user, follow, open_direct, start_test_server, start_test_server_with_state};
use serde_json::json;

/// Two principals with an active direct conversation between them.
async fn call_fixture(base_url: &str) -> (String, String, String, String, String) {
    let (alice_token, alice_id) = create_user(base_url, "Alice").await;
    let (bob_token, bob_id) = create_user(base_url, "Bob").await;
    follow(base_url, &bob_token, &alice_id).await;
    follow(base_url, &alice_token, &bob_id).await;
    let conv = open_direct(base_url, &alice_token, &bob_id).await;
    let conv_id = conv["id"].as_str().unwrap().to_string();
    (alice_token, alice_id, bob_token, bob_id, conv_id)
}

async fn initiate(
    base_url: &str,
    token: &str,
    conversation_id: &str,
) -> (reqwest::StatusCode, serde_json::Value) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/calls", base_url))
        .bearer_auth(token)
        .json(&json!({ "conversation_id": conversation_id, "media": "voice" }))
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.json().await.unwrap();
    (status, body)
}

async fn transition(
    base_url: &str,
    token: &str,
    call_id: &str,
    action: &str,
) -> (reqwest::StatusCode, serde_json::Value) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/calls/{}/{}", base_url, call_id, action))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.json().await.unwrap();
    (status, body)
}

#[tokio::test]
async fn call_rings_and_connects() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id, bob_token, bob_id, conv_id) = call_fixture(&base_url).await;

    let (status, call) = initiate(&base_url, &alice_token, &conv_id).await;
    assert_eq!(status, 201);
    assert_eq!(call["status"], "ringing");
    assert_eq!(call["caller_id"].as_str().unwrap(), alice_id);
    assert_eq!(call["callee_id"].as_str().unwrap(), bob_id);
    // Relay is not configured in tests, so no credentials are attached.
    assert!(call["relay"].is_null());

    let call_id = call["id"].as_str().unwrap();
    let (status, accepted) = transition(&base_url, &bob_token, call_id, "accept").await;
    assert_eq!(status, 200);
    assert_eq!(accepted["status"], "connecting");
    assert!(accepted["started_at"].is_number());

    // Media came up; either side reports active.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/calls/{}/status", base_url, call_id))
        .bearer_auth(&bob_token)
        .json(&json!({ "status": "active" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let active: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(active["status"], "active");

    let (status, ended) = transition(&base_url, &alice_token, call_id, "end").await;
    assert_eq!(status, 200);
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["end_reason"], "normal");
    assert_eq!(ended["ended_by"].as_str().unwrap(), alice_id);
}

#[tokio::test]
async fn busy_participant_gets_conflict_with_existing_id() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, alice_id, bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;

    let (_, first) = initiate(&base_url, &alice_token, &conv_id).await;
    let first_id = first["id"].as_str().unwrap();

    // A third principal who shares a conversation with Alice cannot ring her.
    let (carol_token, carol_id) = create_user(&base_url, "Carol").await;
    follow(&base_url, &carol_token, &alice_id).await;
    follow(&base_url, &alice_token, &carol_id).await;
    let carol_conv = open_direct(&base_url, &carol_token, &alice_id).await;

    let (status, body) = initiate(
        &base_url,
        &carol_token,
        carol_conv["id"].as_str().unwrap(),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["existing_call_id"].as_str().unwrap(), first_id);

    // And the busy caller cannot start a second call either.
    let (status, body) = initiate(&base_url, &bob_token, &conv_id).await;
    assert_eq!(status, 409);
    assert_eq!(body["existing_call_id"].as_str().unwrap(), first_id);
}

#[tokio::test]
async fn decline_is_terminal_and_idempotent() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id, bob_token, bob_id, conv_id) = call_fixture(&base_url).await;

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap();

    let (status, declined) = transition(&base_url, &bob_token, call_id, "decline").await;
    assert_eq!(status, 200);
    assert_eq!(declined["status"], "declined");
    assert_eq!(declined["end_reason"], "declined");
    assert_eq!(declined["ended_by"].as_str().unwrap(), bob_id);
    assert_eq!(declined["duration_seconds"], 0);

    // Declining again is a no-op returning the same record.
    let (status, again) = transition(&base_url, &bob_token, call_id, "decline").await;
    assert_eq!(status, 200);
    assert_eq!(again["status"], "declined");

    // Accepting after the decline does not resurrect the call.
    let (status, after) = transition(&base_url, &bob_token, call_id, "accept").await;
    assert_eq!(status, 200);
    assert_eq!(after["status"], "declined");
}

#[tokio::test]
async fn declining_a_connected_call_conflicts() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id, bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap();
    transition(&base_url, &bob_token, call_id, "accept").await;

    let (status, _) = transition(&base_url, &bob_token, call_id, "decline").await;
    assert_eq!(status, 409);
}

#[tokio::test]
async fn ending_twice_is_idempotent() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id, bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap();
    transition(&base_url, &bob_token, call_id, "accept").await;

    let (status, first) = transition(&base_url, &alice_token, call_id, "end").await;
    assert_eq!(status, 200);
    assert_eq!(first["status"], "ended");
    assert_eq!(first["ended_by"].as_str().unwrap(), call["caller_id"].as_str().unwrap());

    // The second hang-up must not overwrite who ended the call.
    let (status, second) = transition(&base_url, &bob_token, call_id, "end").await;
    assert_eq!(status, 200);
    assert_eq!(second["ended_by"], first["ended_by"]);
    assert_eq!(second["ended_at"], first["ended_at"]);
}

#[tokio::test]
async fn call_requires_active_conversation() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id) = create_user(&base_url, "Alice").await;
    let (_bob_token, bob_id) = create_user(&base_url, "Bob").await;

    // No follow, so the conversation is only requested.
    let conv = open_direct(&base_url, &alice_token, &bob_id).await;
    let (status, _) = initiate(&base_url, &alice_token, conv["id"].as_str().unwrap()).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn outsider_cannot_touch_a_call() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id, _bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;
    let (mallory_token, _mallory_id) = create_user(&base_url, "Mallory").await;

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap();

    let (status, _) = transition(&base_url, &mallory_token, call_id, "accept").await;
    assert_eq!(status, 403);
    let (status, _) = transition(&base_url, &mallory_token, call_id, "end").await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn active_history_and_stats() {
    let (base_url, _addr) = start_test_server().await;
    let (alice_token, _alice_id, bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;
    let client = reqwest::Client::new();

    // No live call yet.
    let resp = client
        .get(format!("{}/api/calls/active", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let active: serde_json::Value = resp.json().await.unwrap();
    assert!(active.is_null());

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap();

    let resp = client
        .get(format!("{}/api/calls/active", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let active: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(active["id"].as_str().unwrap(), call_id);

    // Ring-phase calls are not history yet.
    let resp = client
        .get(format!("{}/api/calls/history", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert!(page["items"].as_array().unwrap().is_empty());

    transition(&base_url, &bob_token, call_id, "accept").await;
    transition(&base_url, &alice_token, call_id, "end").await;

    let resp = client
        .get(format!("{}/api/calls/history", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["status"], "ended");

    let resp = client
        .get(format!("{}/api/calls/stats", base_url))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["total_calls"], 1);
    assert_eq!(stats["completed_calls"], 1);
    assert_eq!(stats["missed_calls"], 0);
}

#[tokio::test]
async fn unanswered_call_is_swept_to_missed() {
    let (base_url, _addr, state) = start_test_server_with_state().await;
    let (alice_token, _alice_id, bob_token, _bob_id, conv_id) = call_fixture(&base_url).await;

    let (_, call) = initiate(&base_url, &alice_token, &conv_id).await;
    let call_id = call["id"].as_str().unwrap().to_string();

    // Backdate the ring past the timeout, then run the sweep.
    {
        let conn = state.db.lock().unwrap();
        let stale = (chrono::Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();
        conn.execute(
            "UPDATE calls SET initiated_at = ?1 WHERE id = ?2",
            rusqlite::params![stale, call_id],
        )
        .unwrap();
    }
    parlor_server::calls::lifecycle::sweep_stale_calls(&state).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/calls/active", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let active: serde_json::Value = resp.json().await.unwrap();
    assert!(active.is_null(), "Swept call must no longer count as live");

    let resp = client
        .get(format!("{}/api/calls/history", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let page: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["id"].as_str().unwrap(), call_id);
    assert_eq!(page["items"][0]["status"], "missed");
    assert_eq!(page["items"][0]["end_reason"], "missed");

    let resp = client
        .get(format!("{}/api/calls/stats", base_url))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["missed_calls"], 1);
}
