use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod auth;
pub mod classes;
pub mod documents;
pub mod events;
pub mod health;
pub mod jobs;
pub mod progress;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/me", get(auth::me));

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::upload_document),
        )
        .route("/retry", post(documents::retry_documents))
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/:id/download", get(documents::download_document))
        .route("/:id/status", post(documents::update_status));

    let progress_routes =
        Router::new().route("/:item_type/:item_id", post(progress::record_progress));

    let courses_routes = Router::new().route("/:id/position", get(progress::course_position));

    let classes_routes = Router::new()
        .route("/", post(classes::create_class))
        .route("/:id", get(classes::get_class))
        .route("/:id/paths", post(classes::create_path));

    let paths_routes = Router::new().route("/:id/lessons", post(classes::create_lesson));

    let jobs_routes = Router::new()
        .route("/", get(jobs::list).post(jobs::create))
        .route("/:id", get(jobs::get).delete(jobs::delete))
        .route("/:id/run", post(jobs::run))
        .route("/:id/clear", post(jobs::clear));

    let events_routes = Router::new()
        .route("/jobs/:job_id", get(events::job_events))
        .route("/documents", get(events::document_events));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/documents", documents_routes)
        .nest("/api/progress", progress_routes)
        .nest("/api/courses", courses_routes)
        .nest("/api/classes", classes_routes)
        .nest("/api/paths", paths_routes)
        .nest("/api/jobs", jobs_routes)
        .nest("/api/events", events_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    let body_limit = state.config.max_upload_bytes.max(0) as usize;

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit + 64 * 1024))
}
