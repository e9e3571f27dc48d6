use std::collections::{BTreeMap, HashSet};

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ulid::Ulid;

use super::{ApiError, ApiResult, AppState, stay};
use crate::engine::to_minor_units;
use crate::model::{DateRange, Guest, Quote};
use crate::observability::PAYMENT_INTENTS_TOTAL;
use crate::sync::{self, CalendarEntry};

const PLACEHOLDER_IMAGE: &str = "https://source.unsplash.com/featured/?pattaya,villa";

#[derive(Serialize)]
pub struct PublicProperty {
    title: String,
    image_url: String,
    unit_ids: Vec<Ulid>,
    price: Option<f64>,
    currency: String,
}

/// Every group with its display price: the base rate of the first listed unit.
pub async fn properties(State(state): State<AppState>) -> Json<BTreeMap<String, PublicProperty>> {
    let hidden: HashSet<Ulid> = state.config.ignore_public_unit_ids.iter().copied().collect();
    let mut out = BTreeMap::new();
    for (slug, group) in state.groups.iter() {
        let unit_ids: Vec<Ulid> = group
            .unit_ids
            .iter()
            .copied()
            .filter(|id| !hidden.contains(id))
            .collect();

        let plan = match unit_ids.first() {
            Some(first) => state
                .engine
                .unit_info(*first)
                .await
                .ok()
                .and_then(|info| info.rate_plan)
                .filter(|p| p.base_rate > 0.0),
            None => None,
        };
        let (price, currency) = match plan {
            Some(plan) => (Some(plan.base_rate), plan.currency),
            None => (None, state.config.default_currency.clone()),
        };

        out.insert(
            slug.to_string(),
            PublicProperty {
                title: group.title.clone().unwrap_or_else(|| slug.to_string()),
                image_url: group
                    .image_url
                    .clone()
                    .unwrap_or_else(|| PLACEHOLDER_IMAGE.to_string()),
                unit_ids,
                price,
                currency,
            },
        );
    }
    Json(out)
}

pub async fn public_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "stripe_publishable_key": state.config.stripe.publishable_key,
        "currency": state.config.default_currency,
    }))
}

pub async fn availability(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Vec<CalendarEntry>>> {
    let group = state.groups.get(&slug)?;
    let entries = sync::group_calendar(&state.engine, state.fetcher.as_ref(), &group.unit_ids).await;
    Ok(Json(entries))
}

#[derive(Deserialize)]
pub struct StayRequest {
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Serialize)]
pub struct QuoteResponse {
    #[serde(flatten)]
    quote: Quote,
    available: bool,
}

/// Quote on the group's pricing unit plus whether every unit is free.
async fn quote_group(state: &AppState, slug: &str, range: &DateRange) -> ApiResult<(Quote, bool)> {
    let group = state.groups.get(slug)?;
    let unit_ids = state.groups.unit_ids(slug)?;
    let pricing_unit = group
        .pricing_unit()
        .ok_or_else(|| ApiError::bad_request("no units linked to this property"))?;
    let quote = state.engine.calculate_total(pricing_unit, range).await?;
    let available = state.engine.group_available(unit_ids, range).await?;
    Ok((quote, available))
}

pub async fn quote(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: Result<Json<StayRequest>, JsonRejection>,
) -> ApiResult<Json<QuoteResponse>> {
    state.groups.get(&slug)?;
    let Json(body) = body?;
    let range = stay(body.start_date.as_deref(), body.end_date.as_deref())?;
    let (quote, available) = quote_group(&state, &slug, &range).await?;
    Ok(Json(QuoteResponse { quote, available }))
}

pub async fn create_intent(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: Result<Json<StayRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    state.groups.get(&slug)?;
    let Json(body) = body?;
    let range = stay(body.start_date.as_deref(), body.end_date.as_deref())?;
    let (quote, available) = quote_group(&state, &slug, &range).await?;
    if !available {
        return Err(ApiError::Conflict("Dates not available".into()));
    }
    let amount = to_minor_units(quote.total);
    let currency = quote.currency.to_ascii_lowercase();
    match state.payments.create_intent(amount, &currency).await {
        Ok(client_secret) => {
            metrics::counter!(PAYMENT_INTENTS_TOTAL, "status" => "created").increment(1);
            tracing::info!("payment intent for {slug} {range}: {amount} {currency}");
            Ok(Json(json!({
                "ok": true,
                "client_secret": client_secret,
                "amount": amount,
                "currency": currency,
            })))
        }
        Err(e) => {
            metrics::counter!(PAYMENT_INTENTS_TOTAL, "status" => "failed").increment(1);
            Err(e.into())
        }
    }
}

#[derive(Deserialize)]
pub struct BookingRequest {
    start_date: Option<String>,
    end_date: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
}

impl BookingRequest {
    fn into_parts(self) -> ApiResult<(DateRange, Guest)> {
        if self.name.trim().is_empty() || self.email.trim().is_empty() {
            return Err(ApiError::bad_request("missing fields"));
        }
        let range = stay(self.start_date.as_deref(), self.end_date.as_deref())?;
        Ok((
            range,
            Guest {
                name: self.name,
                email: self.email,
            },
        ))
    }
}

pub async fn book_group(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let unit_ids = state.groups.unit_ids(&slug)?;
    let Json(body) = body?;
    let (range, guest) = body.into_parts()?;
    let block_ids = state
        .engine
        .book_group(unit_ids, range, &guest, Some(&slug))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "block_ids": block_ids })),
    ))
}

pub async fn book_unit(
    State(state): State<AppState>,
    path: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Path(unit_id) = path?;
    let Json(body) = body?;
    let (range, guest) = body.into_parts()?;
    let block_ids = state
        .engine
        .book_group(&[unit_id], range, &guest, None)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "block_ids": block_ids })),
    ))
}
