//! 流量查询 API 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use uuid::Uuid;

use super::router::TrafficState;
use super::types::{TrafficListResponse, TrafficQuery};

/// GET /api/traffic
pub async fn get_traffic(
    State(state): State<TrafficState>,
    Query(query): Query<TrafficQuery>,
) -> impl IntoResponse {
    let mut records = state.monitor.snapshot();
    if let Some(event) = query.event.as_deref() {
        records.retain(|record| record.event == event);
    }
    let total = records.len();
    if let Some(limit) = query.limit
        && records.len() > limit
    {
        records.drain(..records.len() - limit);
    }

    Json(TrafficListResponse {
        total,
        ignored_lines: state.monitor.ignored_lines(),
        records,
    })
}

/// GET /api/traffic/{id}
pub async fn get_traffic_record(
    State(state): State<TrafficState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.monitor.record(id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {"type": "not_found_error", "message": format!("记录不存在或已被淘汰: {}", id)}
            })),
        )
            .into_response(),
    }
}

/// DELETE /api/traffic
pub async fn clear_traffic(State(state): State<TrafficState>) -> impl IntoResponse {
    let cleared = state.monitor.len();
    state.monitor.clear();
    tracing::info!(cleared = cleared, "流量账本已清空");
    Json(serde_json::json!({
        "success": true,
        "message": format!("已清除 {} 条记录", cleared)
    }))
}
