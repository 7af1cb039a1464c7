//! Shared harness for integration tests: boots the server on a random port
//! against a throwaway data directory and registers principals over HTTP.

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start the server on a random port and return (base_url, addr).
pub async fn start_test_server() -> (String, SocketAddr) {
    let (base_url, addr, _state) = start_test_server_with_state().await;
    (base_url, addr)
}

/// Like `start_test_server`, but also hands back the shared state so a test
/// can reach the database or drive background jobs directly.
pub async fn start_test_server_with_state(
) -> (String, SocketAddr, parlor_server::state::AppState) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = parlor_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = parlor_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let connections = parlor_server::ws::new_connection_registry();
    let rooms = Arc::new(parlor_server::ws::rooms::RoomRouter::new());
    let presence =
        parlor_server::presence::PresenceRegistry::new(db.clone(), "test-process".to_string());
    let push = parlor_server::notify::push::PushSender::new(None);
    let notifier = parlor_server::notify::Notifier::new(
        db.clone(),
        rooms.clone(),
        connections.clone(),
        push,
    );
    let relay = parlor_server::calls::relay::RelayClient::new(None);

    let state = parlor_server::state::AppState {
        db,
        jwt_secret,
        connections,
        rooms,
        presence,
        notifier,
        relay,
        calls_config: parlor_server::config::CallsConfig::default(),
        process_id: "test-process".to_string(),
    };

    let app = parlor_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    let base_url = format!("http://{}", addr);
    (base_url, addr, state)
}

/// Create a principal and return (access_token, user_id).
pub async fn create_user(base_url: &str, display_name: &str) -> (String, String) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/users", base_url))
        .json(&json!({ "display_name": display_name }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201, "User creation failed for {}", display_name);
    let body: serde_json::Value = resp.json().await.unwrap();
    let access_token = body["access_token"].as_str().unwrap().to_string();
    let user_id = body["user"]["id"].as_str().unwrap().to_string();
    (access_token, user_id)
}

/// Make `follower` follow `followee`.
pub async fn follow(base_url: &str, follower_token: &str, followee_id: &str) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/users/{}/follow", base_url, followee_id))
        .bearer_auth(follower_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "Follow failed");
}

/// Open a direct conversation and return its JSON view.
pub async fn open_direct(
    base_url: &str,
    token: &str,
    recipient_id: &str,
) -> serde_json::Value {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/conversations", base_url))
        .bearer_auth(token)
        .json(&json!({ "recipient_id": recipient_id }))
        .send()
        .await
        .unwrap();
    assert!(
        resp.status() == 201 || resp.status() == 200,
        "Open direct failed: {}",
        resp.status()
    );
    resp.json().await.unwrap()
}

/// Send a message and return its JSON view.
pub async fn send_message(
    base_url: &str,
    token: &str,
    conversation_id: &str,
    body: &str,
) -> serde_json::Value {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{}/api/conversations/{}/messages",
            base_url, conversation_id
        ))
        .bearer_auth(token)
        .json(&json!({ "body": body }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "Send message failed");
    resp.json().await.unwrap()
}
