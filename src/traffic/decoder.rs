//! 结构化事件解码器与关联键构造
//!
//! 将引擎日志行解析为类型化事件。任何畸形输入都映射为 [`Decoded::Ignore`]，
//! 摄入路径绝不报错；headers/body 等辅助字段解码失败时降级为占位文本，
//! 不丢弃整个事件

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::model::{ClientPlatform, PendingMeta, TransactionRecord, level_label};

/// 结构化事件载荷标记，标记之前的自由文本只保留在 raw_line 中
pub const EVENT_MARKER: &str = "CRAB_JSON ";

const DEFAULT_LEVEL: u8 = 2; // INFO

/// 解码结果（封闭枚举，未识别形态一律落入 Ignore）
#[derive(Debug)]
pub enum Decoded {
    /// 事务摘要事件，物化为一条新记录
    Entry(Box<TransactionRecord>),
    /// 辅助元数据事件，按关联键合并
    Metadata { key: String, meta: PendingMeta },
    /// 非结构化行或畸形载荷
    Ignore,
}

/// 解析一行原始日志（调用方已去除首尾空白）
pub fn decode_line(line: &str) -> Decoded {
    let Some(pos) = line.find(EVENT_MARKER) else {
        return Decoded::Ignore;
    };
    let json_text = line[pos + EVENT_MARKER.len()..].trim();
    if json_text.is_empty() {
        return Decoded::Ignore;
    }
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(json_text) else {
        return Decoded::Ignore;
    };

    let payload_type = string_field(&object, "type").unwrap_or_default();
    let event = string_field(&object, "event").unwrap_or_default();

    match payload_type.as_str() {
        "entry" => decode_entry(&object, event, line),
        "meta" => decode_meta(&object, &event),
        _ => Decoded::Ignore,
    }
}

fn decode_entry(object: &Map<String, Value>, event: String, line: &str) -> Decoded {
    // method 与 url 是物化的必要条件，缺失则整行丢弃
    let (Some(method), Some(url)) = (
        string_field(object, "method"),
        string_field(object, "url"),
    ) else {
        return Decoded::Ignore;
    };

    let peer = string_field(object, "peer");
    let request_id = string_field(object, "request_id");
    let level = i64_field(object, "level")
        .and_then(|value| u8::try_from(value).ok())
        .unwrap_or(DEFAULT_LEVEL);
    let correlation_key =
        transaction_key(request_id.as_deref(), peer.as_deref(), &method, &url);
    let client_platform = infer_client_platform(None, peer.as_deref());

    Decoded::Entry(Box::new(TransactionRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        level,
        level_label: level_label(level),
        correlation_key,
        event,
        method,
        url,
        status_code: status_field(object),
        peer,
        map_local_matcher: string_field(object, "map_local"),
        map_remote_matcher: string_field(object, "map_remote"),
        map_remote_target: string_field(object, "map_remote_target"),
        client_platform,
        duration_ms: f64_field(object, "duration_ms"),
        response_size_bytes: i64_field(object, "response_size_bytes"),
        request_headers: None,
        response_headers: None,
        request_body_preview: None,
        response_body_preview: None,
        raw_line: line.to_string(),
    }))
}

fn decode_meta(object: &Map<String, Value>, event: &str) -> Decoded {
    let (Some(peer), Some(method), Some(url)) = (
        string_field(object, "peer"),
        string_field(object, "method"),
        string_field(object, "url"),
    ) else {
        return Decoded::Ignore;
    };
    let request_id = string_field(object, "request_id");
    let key = transaction_key(request_id.as_deref(), Some(&peer), &method, &url);

    match event {
        "request_headers" => {
            let decoded =
                decode_header_preview(&string_field(object, "headers_b64").unwrap_or_default());
            let client_platform = infer_client_platform(Some(&decoded), Some(&peer));
            Decoded::Metadata {
                key,
                meta: PendingMeta {
                    request_headers: Some(decoded),
                    client_platform,
                    ..Default::default()
                },
            }
        }
        "response_headers" => {
            let decoded =
                decode_header_preview(&string_field(object, "headers_b64").unwrap_or_default());
            Decoded::Metadata {
                key,
                meta: PendingMeta {
                    response_headers: Some(decoded),
                    ..Default::default()
                },
            }
        }
        "body_inspection" => {
            let direction = string_field(object, "direction").unwrap_or_default();
            let preview =
                decode_body_preview(&string_field(object, "sample_b64").unwrap_or_default());
            match direction.as_str() {
                "request" => Decoded::Metadata {
                    key,
                    meta: PendingMeta {
                        request_body_preview: preview,
                        ..Default::default()
                    },
                },
                "response" => Decoded::Metadata {
                    key,
                    meta: PendingMeta {
                        response_body_preview: preview,
                        response_size_bytes: i64_field(object, "body_bytes"),
                        ..Default::default()
                    },
                },
                _ => Decoded::Ignore,
            }
        }
        _ => Decoded::Ignore,
    }
}

/// 派生事务关联键
///
/// 引擎显式提供 request_id 时只用它派生，跨事件稳定；否则回退到
/// `peer|method|url` 元组。同一 peer 的并发同样请求在元组形式下可能
/// 错配，这是有意保留的近似行为
pub fn transaction_key(
    request_id: Option<&str>,
    peer: Option<&str>,
    method: &str,
    url: &str,
) -> String {
    if let Some(id) = request_id
        && !id.is_empty()
    {
        return format!("id|{id}");
    }
    format!("{}|{method}|{url}", peer.unwrap_or("-"))
}

/// 字符串字段读取，兼容以数字编码的值
fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn f64_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    match object.get(key)? {
        Value::Number(value) => value.as_f64(),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

fn i64_field(object: &Map<String, Value>, key: &str) -> Option<i64> {
    match object.get(key)? {
        Value::Number(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|float| float as i64)),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    }
}

/// 状态码有两个历史字段名，按 status、response_status 的顺序取第一个存在的
fn status_field(object: &Map<String, Value>) -> Option<String> {
    string_field(object, "status").or_else(|| string_field(object, "response_status"))
}

fn decode_header_preview(headers_b64: &str) -> String {
    match BASE64
        .decode(headers_b64)
        .ok()
        .and_then(|data| String::from_utf8(data).ok())
    {
        Some(raw) => normalize_header_preview(&raw),
        None => "<failed to decode headers>".to_string(),
    }
}

/// 头部预览归一化：逐行去空白、丢空行，统一为 `Key: Value`；
/// 值为空时渲染为 `Key:`，不带尾随空格
fn normalize_header_preview(raw: &str) -> String {
    raw.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            let Some(separator) = trimmed.find(':') else {
                return Some(trimmed.to_string());
            };
            let key = trimmed[..separator].trim();
            let value = trimmed[separator + 1..].trim();
            if value.is_empty() {
                Some(format!("{key}:"))
            } else {
                Some(format!("{key}: {value}"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_body_preview(sample_b64: &str) -> Option<String> {
    let data = match BASE64.decode(sample_b64) {
        Ok(data) => data,
        Err(_) => return Some("<failed to decode body>".to_string()),
    };
    if data.is_empty() {
        return None;
    }
    Some(pretty_body_text(&data))
}

/// 正文预览渲染：JSON 优先美化输出，其次按 UTF-8 文本原样展示，
/// 否则标注二进制长度并附前 256 字节的十六进制
fn pretty_body_text(data: &[u8]) -> String {
    if let Some(pretty) = pretty_json_text(data) {
        return pretty;
    }
    if let Ok(text) = std::str::from_utf8(data) {
        return text.to_string();
    }
    let hex = data
        .iter()
        .take(256)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("<binary {} bytes>\n{hex}", data.len())
}

fn pretty_json_text(data: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(data).ok()?;
    // serde_json 默认 Map 为 BTreeMap，pretty 输出的键即为字典序
    serde_json::to_string_pretty(&value).ok()
}

/// 客户端平台推断：请求头中的 User-Agent 优先于 peer 地址启发式
pub fn infer_client_platform(
    request_headers: Option<&str>,
    peer: Option<&str>,
) -> Option<ClientPlatform> {
    if let Some(user_agent) = user_agent_from_headers(request_headers) {
        let normalized = user_agent.to_lowercase();
        if ["iphone", "ipad", "ipod", "android", "mobile"]
            .iter()
            .any(|marker| normalized.contains(marker))
        {
            return Some(ClientPlatform::Mobile);
        }
        if normalized.contains("macintosh") || normalized.contains("mac os x") {
            return Some(ClientPlatform::MacOs);
        }
    }

    let host = host_from_peer(peer)?;
    if is_loopback_host(&host) {
        return Some(ClientPlatform::MacOs);
    }
    if is_likely_lan_host(&host) {
        return Some(ClientPlatform::Mobile);
    }
    None
}

fn user_agent_from_headers(headers: Option<&str>) -> Option<String> {
    for raw_line in headers?.lines() {
        let line = raw_line.trim();
        let Some(separator) = line.find(':') else {
            continue;
        };
        if !line[..separator].trim().eq_ignore_ascii_case("user-agent") {
            continue;
        }
        let value = line[separator + 1..].trim();
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

fn host_from_peer(peer: Option<&str>) -> Option<String> {
    let peer = peer?.trim();
    if peer.is_empty() {
        return None;
    }
    // [::1]:5000 形式的 IPv6 地址
    if let Some(rest) = peer.strip_prefix('[')
        && let Some(closing) = rest.find(']')
    {
        return Some(rest[..closing].to_lowercase());
    }
    if let Some(last_colon) = peer.rfind(':') {
        return Some(peer[..last_colon].to_lowercase());
    }
    Some(peer.to_lowercase())
}

fn is_loopback_host(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}

fn is_likely_lan_host(host: &str) -> bool {
    if host.starts_with("10.") || host.starts_with("192.168.") || host.starts_with("169.254.") {
        return true;
    }
    if host.starts_with("172.") {
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() >= 2
            && let Ok(second) = parts[1].parse::<u8>()
            && (16..=31).contains(&second)
        {
            return true;
        }
    }
    host.starts_with("fe80:") || host.starts_with("fd") || host.starts_with("fc")
}
