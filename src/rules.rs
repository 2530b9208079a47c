//! 流量整形规则模型、校验与同步
//!
//! 面板侧维护规则草稿，校验通过后整体重放到引擎（先清空再按序添加）。
//! 规则的实际匹配与执行在引擎侧，本层只负责把合法配置送过边界

use std::sync::Arc;

use anyhow::{Result, bail};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::put,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::ProxyEngine;

/// Map Local 规则内容来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MapLocalSource {
    /// 本地文件路径
    File(String),
    /// 内联文本
    Text(String),
}

/// 放行规则草稿
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub matcher: String,
}

/// Map Local 规则草稿
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapLocalRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub matcher: String,
    pub source: MapLocalSource,
    #[serde(default = "default_map_local_status")]
    pub status_code: String,
    #[serde(default)]
    pub content_type: String,
}

/// Map Remote 规则草稿
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapRemoteRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub destination_url: String,
}

/// 状态码改写规则草稿
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRewriteRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub from_status_code: String,
    #[serde(default)]
    pub to_status_code: String,
}

fn default_enabled() -> bool {
    true
}

fn default_map_local_status() -> String {
    "200".to_string()
}

/// 校验后的 Map Local 规则（发往引擎）
#[derive(Debug, Clone, Serialize)]
pub struct MapLocalRuleConfig {
    pub matcher: String,
    pub source: MapLocalSource,
    pub status_code: u16,
    pub content_type: Option<String>,
}

/// 校验后的 Map Remote 规则（发往引擎）
#[derive(Debug, Clone, Serialize)]
pub struct MapRemoteRuleConfig {
    pub matcher: String,
    pub destination_url: String,
}

/// 校验后的状态码改写规则（发往引擎）
#[derive(Debug, Clone, Serialize)]
pub struct StatusRewriteRuleConfig {
    pub matcher: String,
    pub from_status_code: Option<u16>,
    pub to_status_code: u16,
}

/// 将当前规则草稿整体同步到引擎
pub async fn sync_rules(
    engine: &ProxyEngine,
    allow_rules: &[AllowRule],
    map_local_rules: &[MapLocalRule],
    map_remote_rules: &[MapRemoteRule],
    status_rewrite_rules: &[StatusRewriteRule],
) -> Result<()> {
    engine.clear_rules().await?;

    for matcher in normalized_allow_matchers(allow_rules) {
        engine.add_allow_rule(&matcher).await?;
    }

    for (index, draft) in map_local_rules.iter().enumerate() {
        if let Some(rule) = validate_map_local(draft, index)? {
            engine.add_map_local_rule(&rule).await?;
        }
    }

    for (index, draft) in map_remote_rules.iter().enumerate() {
        if let Some(rule) = validate_map_remote(draft, index)? {
            engine.add_map_remote_rule(&rule).await?;
        }
    }

    for (index, draft) in status_rewrite_rules.iter().enumerate() {
        if let Some(rule) = validate_status_rewrite(draft, index)? {
            engine.add_status_rewrite_rule(&rule).await?;
        }
    }

    Ok(())
}

/// 放行匹配串归一化：去空白、丢空值、大小写不敏感去重（保留首个写法）
pub fn normalized_allow_matchers(allow_rules: &[AllowRule]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut values = Vec::new();

    for draft in allow_rules {
        let matcher = draft.matcher.trim();
        if matcher.is_empty() {
            continue;
        }
        if seen.insert(matcher.to_lowercase()) {
            values.push(matcher.to_string());
        }
    }
    values
}

fn validate_map_local(draft: &MapLocalRule, index: usize) -> Result<Option<MapLocalRuleConfig>> {
    if !draft.enabled {
        return Ok(None);
    }

    let matcher = draft.matcher.trim();
    let source_value = match &draft.source {
        MapLocalSource::File(value) | MapLocalSource::Text(value) => value.trim(),
    };
    let content_type = optional_trimmed(&draft.content_type);
    let status = parse_status_code(
        &draft.status_code,
        Some(200),
        &format!("Map Local #{} 的状态码", index + 1),
    )?;

    // 全空草稿视为未填写，直接跳过
    if matcher.is_empty() && source_value.is_empty() && content_type.is_none() {
        return Ok(None);
    }
    if matcher.is_empty() {
        bail!("Map Local #{}: matcher 不能为空", index + 1);
    }
    if source_value.is_empty() {
        bail!("Map Local #{}: 内容来源不能为空", index + 1);
    }

    let source = match &draft.source {
        MapLocalSource::File(_) => MapLocalSource::File(source_value.to_string()),
        MapLocalSource::Text(_) => MapLocalSource::Text(source_value.to_string()),
    };

    Ok(Some(MapLocalRuleConfig {
        matcher: matcher.to_string(),
        source,
        status_code: status,
        content_type,
    }))
}

fn validate_map_remote(draft: &MapRemoteRule, index: usize) -> Result<Option<MapRemoteRuleConfig>> {
    if !draft.enabled {
        return Ok(None);
    }

    let matcher = draft.matcher.trim();
    let destination = draft.destination_url.trim();

    if matcher.is_empty() && destination.is_empty() {
        return Ok(None);
    }
    if matcher.is_empty() {
        bail!("Map Remote #{}: matcher 不能为空", index + 1);
    }
    if destination.is_empty() {
        bail!("Map Remote #{}: 目标地址不能为空", index + 1);
    }

    Ok(Some(MapRemoteRuleConfig {
        matcher: matcher.to_string(),
        destination_url: destination.to_string(),
    }))
}

fn validate_status_rewrite(
    draft: &StatusRewriteRule,
    index: usize,
) -> Result<Option<StatusRewriteRuleConfig>> {
    if !draft.enabled {
        return Ok(None);
    }

    let matcher = draft.matcher.trim();
    let from_status = parse_optional_status_code(
        &draft.from_status_code,
        &format!("Status Rewrite #{} 的 from", index + 1),
    )?;

    if matcher.is_empty() && from_status.is_none() && draft.to_status_code.trim().is_empty() {
        return Ok(None);
    }
    if matcher.is_empty() {
        bail!("Status Rewrite #{}: matcher 不能为空", index + 1);
    }

    let to_status = parse_status_code(
        &draft.to_status_code,
        None,
        &format!("Status Rewrite #{} 的 to", index + 1),
    )?;

    Ok(Some(StatusRewriteRuleConfig {
        matcher: matcher.to_string(),
        from_status_code: from_status,
        to_status_code: to_status,
    }))
}

/// 去空白后为空则视为未填写
fn optional_trimmed(input: &str) -> Option<String> {
    let value = input.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_status_code(input: &str, default: Option<u16>, field: &str) -> Result<u16> {
    let value = input.trim();
    if value.is_empty() {
        return match default {
            Some(code) => Ok(code),
            None => bail!("{field} 不能为空"),
        };
    }
    match value.parse::<u16>() {
        Ok(code) if (100..=599).contains(&code) => Ok(code),
        _ => bail!("{field} 必须是合法的 HTTP 状态码 (100-599)"),
    }
}

fn parse_optional_status_code(input: &str, field: &str) -> Result<Option<u16>> {
    let value = input.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<u16>() {
        Ok(code) if (100..=599).contains(&code) => Ok(Some(code)),
        _ => bail!("{field} 必须为空或为合法的 HTTP 状态码 (100-599)"),
    }
}

/// 规则文档（UI 整体提交）
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesDocument {
    #[serde(default)]
    pub allow_rules: Vec<AllowRule>,
    #[serde(default)]
    pub map_local_rules: Vec<MapLocalRule>,
    #[serde(default)]
    pub map_remote_rules: Vec<MapRemoteRule>,
    #[serde(default)]
    pub status_rewrite_rules: Vec<StatusRewriteRule>,
}

/// 规则 API 状态
#[derive(Clone)]
pub struct RulesState {
    pub engine: Option<Arc<ProxyEngine>>,
}

/// PUT /api/rules
pub async fn put_rules(
    State(state): State<RulesState>,
    Json(document): Json<RulesDocument>,
) -> impl IntoResponse {
    let Some(engine) = state.engine.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": {"type": "engine_unavailable", "message": "引擎进程未启动，无法同步规则"}
            })),
        )
            .into_response();
    };

    match sync_rules(
        engine,
        &document.allow_rules,
        &document.map_local_rules,
        &document.map_remote_rules,
        &document.status_rewrite_rules,
    )
    .await
    {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "规则已同步"
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("规则同步失败: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {"type": "invalid_request_error", "message": format!("{}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// 创建规则 API 路由
pub fn create_rules_router(engine: Option<Arc<ProxyEngine>>) -> Router {
    Router::new()
        .route("/rules", put(put_rules))
        .with_state(RulesState { engine })
}
