use axum::{middleware, Router};

use crate::auth::middleware::JwtSecret;
use crate::calls::lifecycle as calls;
use crate::chat::{conversations, maintenance, messages};
use crate::notify::subscriptions;
use crate::presence;
use crate::state::AppState;
use crate::users;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Public: principal creation mints the caller's first access token.
    let public_routes = Router::new()
        .route("/api/users", axum::routing::post(users::create_user));

    let user_routes = Router::new()
        .route("/api/users/{id}/follow", axum::routing::post(users::follow))
        .route("/api/users/{id}/follow", axum::routing::delete(users::unfollow))
        .route("/api/presence/online", axum::routing::get(presence::list_online));

    let conversation_routes = Router::new()
        .route("/api/conversations", axum::routing::post(conversations::create_conversation))
        .route("/api/conversations", axum::routing::get(conversations::list_conversations))
        .route("/api/conversations/{id}", axum::routing::get(conversations::get_conversation))
        .route(
            "/api/conversations/{id}/accept",
            axum::routing::post(conversations::accept_conversation),
        )
        .route(
            "/api/conversations/{id}/decline",
            axum::routing::post(conversations::decline_conversation),
        )
        .route(
            "/api/conversations/{id}/mute",
            axum::routing::post(conversations::mute_conversation),
        )
        .route(
            "/api/conversations/{id}/unmute",
            axum::routing::post(conversations::unmute_conversation),
        );

    let message_routes = Router::new()
        .route(
            "/api/conversations/{id}/messages",
            axum::routing::post(messages::send_message),
        )
        .route(
            "/api/conversations/{id}/messages",
            axum::routing::get(messages::list_messages),
        )
        .route(
            "/api/conversations/{id}/messages/search",
            axum::routing::get(messages::search_messages),
        )
        .route(
            "/api/conversations/{id}/messages/read",
            axum::routing::post(messages::mark_read),
        )
        .route(
            "/api/conversations/{id}/messages/{message_id}",
            axum::routing::delete(messages::delete_message),
        )
        .route(
            "/api/conversations/{id}/messages/{message_id}/restore",
            axum::routing::post(messages::restore_message),
        )
        .route(
            "/api/conversations/{id}/messages/{message_id}/reactions",
            axum::routing::post(messages::add_reaction),
        )
        .route(
            "/api/conversations/{id}/messages/{message_id}/reactions",
            axum::routing::delete(messages::remove_reaction),
        )
        .route("/api/unread-counts", axum::routing::get(messages::get_unread_counts));

    let call_routes = Router::new()
        .route("/api/calls", axum::routing::post(calls::initiate_call))
        .route("/api/calls/active", axum::routing::get(calls::get_active_call))
        .route("/api/calls/history", axum::routing::get(calls::get_call_history))
        .route("/api/calls/stats", axum::routing::get(calls::get_call_stats))
        .route("/api/calls/{id}/accept", axum::routing::post(calls::accept_call))
        .route("/api/calls/{id}/decline", axum::routing::post(calls::decline_call))
        .route("/api/calls/{id}/end", axum::routing::post(calls::end_call))
        .route("/api/calls/{id}/status", axum::routing::post(calls::update_call_status));

    let push_routes = Router::new()
        .route(
            "/api/push/subscriptions",
            axum::routing::post(subscriptions::subscribe),
        )
        .route(
            "/api/push/subscriptions",
            axum::routing::delete(subscriptions::unsubscribe),
        );

    let admin_routes = Router::new().route(
        "/api/admin/maintenance/conversations",
        axum::routing::post(maintenance::run_merge),
    );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .merge(conversation_routes)
        .merge(message_routes)
        .merge(call_routes)
        .merge(push_routes)
        .merge(admin_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
