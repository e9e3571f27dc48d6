use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use ulid::Ulid;

use super::{ApiError, ApiResult, AppState, stay};
use crate::model::{BlockInfo, DateRateInfo, DayAction, RatePlan, Source, UnitInfo, parse_date};
use crate::sync::{self, SyncOutcome};

// ── Units ───────────────────────────────────────────────────

pub async fn list_units(State(state): State<AppState>) -> Json<Vec<UnitInfo>> {
    Json(state.engine.list_units().await)
}

#[derive(Deserialize)]
pub struct CreateUnit {
    ota: String,
    #[serde(default)]
    property_id: String,
    ical_url: Option<String>,
}

pub async fn create_unit(
    State(state): State<AppState>,
    body: Result<Json<CreateUnit>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = body?;
    let id = state
        .engine
        .create_unit(&body.ota, &body.property_id, body.ical_url)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "id": id }))))
}

pub async fn delete_unit(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
) -> ApiResult<StatusCode> {
    let Path(id) = path?;
    state.engine.delete_unit(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct SetIcalUrl {
    ical_url: Option<String>,
}

pub async fn set_ical_url(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<SetIcalUrl>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Path(id) = path?;
    let Json(body) = body?;
    state.engine.set_ical_url(id, body.ical_url).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Rates ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SetRates {
    unit_id: Ulid,
    base_rate: f64,
    weekend_rate: Option<f64>,
    currency: Option<String>,
}

pub async fn set_rates(
    State(state): State<AppState>,
    body: Result<Json<SetRates>, JsonRejection>,
) -> ApiResult<Json<RatePlan>> {
    let Json(body) = body?;
    let plan = state
        .engine
        .set_rate_plan(body.unit_id, body.base_rate, body.weekend_rate, body.currency.as_deref())
        .await?;
    Ok(Json(plan))
}

#[derive(Deserialize)]
pub struct DateRateFilter {
    start: Option<String>,
    end: Option<String>,
}

pub async fn list_date_rates(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    filter: Result<Query<DateRateFilter>, QueryRejection>,
) -> ApiResult<Json<Vec<DateRateInfo>>> {
    let Path(id) = path?;
    let Query(filter) = filter?;
    let range = match (filter.start, filter.end) {
        (None, None) => None,
        (start, end) => Some(stay(start.as_deref(), end.as_deref())?),
    };
    Ok(Json(state.engine.list_date_rates(id, range).await?))
}

#[derive(Deserialize)]
pub struct SetDateRate {
    date: String,
    price: f64,
}

pub async fn set_date_rate(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<SetDateRate>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Path(id) = path?;
    let Json(body) = body?;
    let date = parse_date(&body.date)?;
    state.engine.set_date_rate(id, date, body.price).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct DateParam {
    date: Option<String>,
}

pub async fn clear_date_rate(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    param: Result<Query<DateParam>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Path(id) = path?;
    let Query(param) = param?;
    let date = param.date.ok_or_else(|| ApiError::bad_request("date required"))?;
    let removed = state.engine.clear_date_rate(id, parse_date(&date)?).await?;
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

// ── Blocks ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BlockFilter {
    unit_id: Option<Ulid>,
}

pub async fn list_blocks(
    State(state): State<AppState>,
    filter: Result<Query<BlockFilter>, QueryRejection>,
) -> ApiResult<Json<Vec<BlockInfo>>> {
    let Query(filter) = filter?;
    Ok(Json(state.engine.list_blocks(filter.unit_id).await))
}

#[derive(Deserialize)]
pub struct AddBlock {
    unit_id: Ulid,
    start_date: Option<String>,
    end_date: Option<String>,
    source: Option<String>,
    #[serde(default)]
    note: String,
}

pub async fn add_block(
    State(state): State<AppState>,
    body: Result<Json<AddBlock>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = body?;
    let range = stay(body.start_date.as_deref(), body.end_date.as_deref())?;
    let source = match body.source {
        Some(s) if !s.trim().is_empty() => Source::from(s),
        _ => Source::Manual,
    };
    let id = state
        .engine
        .add_block(body.unit_id, range, source, body.note)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "id": id }))))
}

#[derive(Deserialize)]
pub struct BlockId {
    id: Option<Ulid>,
}

pub async fn remove_block(
    State(state): State<AppState>,
    param: Result<Query<BlockId>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(param) = param?;
    let id = param.id.ok_or_else(|| ApiError::bad_request("id required"))?;
    let removed = state.engine.remove_block(id).await?;
    Ok(Json(json!({ "ok": true, "removed": removed })))
}

#[derive(Deserialize)]
pub struct ToggleDay {
    date: Option<String>,
    action: Option<String>,
}

pub async fn toggle_day(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: Result<Json<ToggleDay>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let unit_ids = state.groups.unit_ids(&slug)?;
    let Json(body) = body?;
    let day = parse_date(body.date.as_deref().unwrap_or_default())
        .map_err(|_| ApiError::bad_request("invalid date"))?;
    let action = match body.action.as_deref().map(|a| a.trim().to_ascii_lowercase()) {
        None => DayAction::Block,
        Some(a) if a == "block" => DayAction::Block,
        Some(a) if a == "unblock" => DayAction::Unblock,
        Some(_) => return Err(ApiError::bad_request("unknown action")),
    };
    let note = format!("admin calendar ({slug})");
    let changed = state.engine.toggle_day(unit_ids, day, action, &note).await?;
    Ok(Json(json!({ "ok": true, "changed": changed })))
}

// ── Sync ────────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct SyncSummary {
    ok: bool,
    summary: Vec<SyncOutcome>,
}

pub async fn sync_now(State(state): State<AppState>) -> Json<SyncSummary> {
    let summary = sync::sync_units(&state.engine, state.fetcher.as_ref(), None).await;
    Json(SyncSummary { ok: true, summary })
}

pub async fn sync_property(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<SyncSummary>> {
    let unit_ids = state.groups.unit_ids(&slug)?;
    let summary = sync::sync_units(&state.engine, state.fetcher.as_ref(), Some(unit_ids)).await;
    Ok(Json(SyncSummary { ok: true, summary }))
}

pub async fn check_ical(State(state): State<AppState>) -> Json<Vec<SyncOutcome>> {
    Json(sync::check_feeds(&state.engine, state.fetcher.as_ref()).await)
}

// ── Import ──────────────────────────────────────────────────

/// CSV body, one unit per row.
pub async fn import(State(state): State<AppState>, body: String) -> ApiResult<(StatusCode, Json<Value>)> {
    let created = crate::import::import_units(&state.engine, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "created": created })),
    ))
}
