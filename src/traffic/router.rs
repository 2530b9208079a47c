//! 流量查询 API 路由

use std::sync::Arc;

use axum::{Router, routing::get};

use super::handlers::{clear_traffic, get_traffic, get_traffic_record};
use super::store::TrafficMonitor;

/// 流量 API 状态
#[derive(Clone)]
pub struct TrafficState {
    pub monitor: Arc<TrafficMonitor>,
}

/// 创建流量查询 API 路由
///
/// 返回 Router<()>，可直接 nest 到主应用
pub fn create_traffic_router(monitor: Arc<TrafficMonitor>) -> Router {
    let state = TrafficState { monitor };

    Router::new()
        .route("/traffic", get(get_traffic).delete(clear_traffic))
        .route("/traffic/{id}", get(get_traffic_record))
        .with_state(state)
}
