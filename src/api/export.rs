use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use serde::Serialize;
use ulid::Ulid;

use super::{ApiError, ApiResult, AppState};
use crate::ical;

/// `GET /ical/export/{unit_id}.ics`: every stored block of the unit, for the
/// channels to import back.
pub async fn unit_calendar(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let unit_id = file
        .strip_suffix(".ics")
        .and_then(|id| id.parse::<Ulid>().ok())
        .ok_or_else(|| ApiError::NotFound("unit not found".into()))?;
    let (unit, blocks) = state.engine.unit_with_blocks(unit_id).await?;
    let body = ical::export_calendar(&unit, &blocks);
    Ok((
        [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
        body,
    ))
}

#[derive(Serialize)]
pub struct ExportLink {
    unit_id: Ulid,
    ota: String,
    property_id: String,
    url: String,
}

/// Export URL of every unit, built from the host the admin called us on.
pub async fn export_links(State(state): State<AppState>, headers: HeaderMap) -> Json<Vec<ExportLink>> {
    let base = base_url(&headers);
    let links = state
        .engine
        .list_units()
        .await
        .into_iter()
        .map(|u| ExportLink {
            url: format!("{base}/ical/export/{}.ics", u.id),
            unit_id: u.id,
            ota: u.ota,
            property_id: u.property_id,
        })
        .collect();
    Json(links)
}

fn base_url(headers: &HeaderMap) -> String {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let host = get("x-forwarded-host")
        .or_else(|| get(header::HOST.as_str()))
        .unwrap_or("localhost");
    let scheme = get("x-forwarded-proto").unwrap_or("http");
    format!("{scheme}://{host}")
}
