//! HTTP surface: admin API behind a bearer token, public booking API, iCal export.

mod admin;
mod error;
mod export;
mod public;

pub use error::{ApiError, ApiResult};

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::config::Config;
use crate::engine::Engine;
use crate::fetch::CalendarFetcher;
use crate::groups::Groups;
use crate::model::DateRange;
use crate::observability::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};
use crate::payment::PaymentGateway;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub groups: Arc<Groups>,
    pub fetcher: Arc<dyn CalendarFetcher>,
    pub payments: Arc<dyn PaymentGateway>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/units", get(admin::list_units).post(admin::create_unit))
        .route("/units/{id}", delete(admin::delete_unit))
        .route("/units/{id}/ical", post(admin::set_ical_url))
        .route(
            "/units/{id}/date-rates",
            get(admin::list_date_rates)
                .post(admin::set_date_rate)
                .delete(admin::clear_date_rate),
        )
        .route("/rates", post(admin::set_rates))
        .route(
            "/blocks",
            get(admin::list_blocks)
                .post(admin::add_block)
                .delete(admin::remove_block),
        )
        .route("/toggle_day/{slug}", post(admin::toggle_day))
        .route("/sync_now", post(admin::sync_now))
        .route("/sync_property/{slug}", post(admin::sync_property))
        .route("/check_ical", get(admin::check_ical))
        .route("/import", post(admin::import))
        .route("/export_links", get(export::export_links))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public = Router::new()
        .route("/properties", get(public::properties))
        .route("/config", get(public::public_config))
        .route("/availability/{slug}", get(public::availability))
        .route("/quote/{slug}", post(public::quote))
        .route("/create_intent/{slug}", post(public::create_intent))
        .route("/book_group/{slug}", post(public::book_group))
        .route("/book/{unit_id}", post(public::book_unit));

    Router::new()
        .route("/health", get(health))
        .route("/ical/export/{file}", get(export::unit_calendar))
        .nest("/api/admin", admin)
        .nest("/api/public", public)
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "roomsync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `Authorization: Bearer <ROOMSYNC_ADMIN_TOKEN>`. No configured token means
/// no admin access at all.
async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match (state.config.admin_token.as_deref(), presented) {
        (Some(expected), Some(given)) if token_eq(expected, given) => next.run(request).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

fn token_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().clone();

    let response = next.run(request).await;

    let status = response.status();
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status.as_u16().to_string())
        .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    if status.is_server_error() {
        tracing::warn!("{method} {route} -> {status} in {:?}", started.elapsed());
    } else {
        tracing::debug!("{method} {route} -> {status} in {:?}", started.elapsed());
    }
    response
}

/// Check-in/check-out pair from a request body. Both are required.
pub(crate) fn stay(start: Option<&str>, end: Option<&str>) -> ApiResult<DateRange> {
    match (start.map(str::trim), end.map(str::trim)) {
        (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => Ok(DateRange::parse(s, e)?),
        _ => Err(ApiError::bad_request("missing dates")),
    }
}
