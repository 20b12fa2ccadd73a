// ============================
// crates/backend-lib/src/router.rs
// ============================
//! HTTP router.
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{auth, health, screening};
use crate::middleware::{api_rate_limit, handle_panic, require_admin, require_auth};
use crate::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let admin = from_fn_with_state(state.clone(), require_admin);

    // Bearer credential required; admin routes additionally check the user record
    let protected = Router::new()
        .route(
            "/screening/questions",
            get(screening::list_questions)
                .merge(post(screening::add_question).layer(admin.clone())),
        )
        .route(
            "/screening/questions/{id}",
            put(screening::update_question)
                .delete(screening::delete_question)
                .layer(admin),
        )
        .route("/screening/submit", post(screening::submit_screening))
        .route_layer(from_fn_with_state(state.clone(), api_rate_limit))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let api = Router::new()
        .route("/health", get(health::health))
        .route("/auth", post(auth::authenticate))
        .route("/refresh", post(auth::refresh))
        .merge(protected);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}
