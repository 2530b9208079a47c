//! 流量事务记录数据模型

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// 客户端平台分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientPlatform {
    #[serde(rename = "macOS")]
    MacOs,
    #[serde(rename = "Mobile")]
    Mobile,
}

/// 数字级别映射为显示标签，未识别的级别一律视为 INFO
pub fn level_label(level: u8) -> &'static str {
    match level {
        4 => "ERROR",
        3 => "WARN",
        1 => "DEBUG",
        0 => "TRACE",
        _ => "INFO",
    }
}

/// 一条已物化的流量事务记录
///
/// 物化后 `id` 与 `correlation_key` 不再变化；其余可选字段只能经由
/// 元数据合并路径原地补全
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: Uuid,
    /// 捕获时间（由存储侧赋值，不信任事件自带时间）
    pub timestamp: DateTime<Utc>,
    pub level: u8,
    pub level_label: &'static str,
    pub correlation_key: String,
    /// 事件语义标签（upstream / map_local / tunnel / cert_portal 等）
    pub event: String,
    pub method: String,
    pub url: String,
    pub status_code: Option<String>,
    pub peer: Option<String>,
    pub map_local_matcher: Option<String>,
    pub map_remote_matcher: Option<String>,
    pub map_remote_target: Option<String>,
    pub client_platform: Option<ClientPlatform>,
    pub duration_ms: Option<f64>,
    pub response_size_bytes: Option<i64>,
    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
    pub request_body_preview: Option<String>,
    pub response_body_preview: Option<String>,
    /// 原始日志行，供诊断和原文展示
    pub raw_line: String,
}

/// 未物化事务的元数据累积器
///
/// 合并语义为字段级"后到的非空值覆盖"：后续的部分更新只覆盖它携带的
/// 字段，不会清掉未提及的字段
#[derive(Debug, Clone, Default)]
pub struct PendingMeta {
    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
    pub request_body_preview: Option<String>,
    pub response_body_preview: Option<String>,
    pub response_size_bytes: Option<i64>,
    pub client_platform: Option<ClientPlatform>,
}

impl PendingMeta {
    /// 所有字段均未设置时为真；空累积器不应被存入缓冲
    pub fn is_empty(&self) -> bool {
        self.request_headers.is_none()
            && self.response_headers.is_none()
            && self.request_body_preview.is_none()
            && self.response_body_preview.is_none()
            && self.response_size_bytes.is_none()
            && self.client_platform.is_none()
    }

    /// 字段级合并：`other` 中的非空字段覆盖自身对应字段
    pub fn merge(&mut self, other: PendingMeta) {
        if let Some(value) = other.request_headers {
            self.request_headers = Some(value);
        }
        if let Some(value) = other.response_headers {
            self.response_headers = Some(value);
        }
        if let Some(value) = other.request_body_preview {
            self.request_body_preview = Some(value);
        }
        if let Some(value) = other.response_body_preview {
            self.response_body_preview = Some(value);
        }
        if let Some(value) = other.response_size_bytes {
            self.response_size_bytes = Some(value);
        }
        if let Some(value) = other.client_platform {
            self.client_platform = Some(value);
        }
    }

    /// 应用到已物化记录，非空字段逐个覆盖
    pub fn apply_to(self, record: &mut TransactionRecord) {
        if let Some(value) = self.request_headers {
            record.request_headers = Some(value);
        }
        if let Some(value) = self.response_headers {
            record.response_headers = Some(value);
        }
        if let Some(value) = self.request_body_preview {
            record.request_body_preview = Some(value);
        }
        if let Some(value) = self.response_body_preview {
            record.response_body_preview = Some(value);
        }
        if let Some(value) = self.response_size_bytes {
            record.response_size_bytes = Some(value);
        }
        if let Some(value) = self.client_platform {
            record.client_platform = Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_label_mapping() {
        assert_eq!(level_label(4), "ERROR");
        assert_eq!(level_label(3), "WARN");
        assert_eq!(level_label(2), "INFO");
        assert_eq!(level_label(1), "DEBUG");
        assert_eq!(level_label(0), "TRACE");
        // 未识别的数字级别回退为 INFO
        assert_eq!(level_label(9), "INFO");
    }

    #[test]
    fn test_pending_meta_merge_keeps_unmentioned_fields() {
        let mut meta = PendingMeta {
            request_headers: Some("Host: a.test".to_string()),
            ..Default::default()
        };
        meta.merge(PendingMeta {
            response_headers: Some("Content-Type: text/html".to_string()),
            ..Default::default()
        });

        // 后到的更新只覆盖自己携带的字段
        assert_eq!(meta.request_headers.as_deref(), Some("Host: a.test"));
        assert_eq!(
            meta.response_headers.as_deref(),
            Some("Content-Type: text/html")
        );
    }

    #[test]
    fn test_pending_meta_last_non_null_wins() {
        let mut meta = PendingMeta {
            response_size_bytes: Some(100),
            ..Default::default()
        };
        meta.merge(PendingMeta {
            response_size_bytes: Some(348),
            ..Default::default()
        });
        assert_eq!(meta.response_size_bytes, Some(348));
    }

    #[test]
    fn test_pending_meta_is_empty() {
        assert!(PendingMeta::default().is_empty());
        assert!(
            !PendingMeta {
                client_platform: Some(ClientPlatform::Mobile),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
