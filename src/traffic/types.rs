//! 流量查询 API 请求/响应类型

use serde::{Deserialize, Serialize};

use super::model::TransactionRecord;

/// 列表查询过滤器
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficQuery {
    /// 仅返回最近 N 条（按到达顺序的尾部窗口）
    pub limit: Option<usize>,
    /// 按事件标签过滤（如 upstream / map_local）
    pub event: Option<String>,
}

/// 列表响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficListResponse {
    /// 过滤后的总条数（截断前）
    pub total: usize,
    /// 被丢弃的畸形/未识别行计数（诊断用）
    pub ignored_lines: u64,
    pub records: Vec<TransactionRecord>,
}
