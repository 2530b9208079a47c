//! 代理引擎进程边界
//!
//! 以子进程方式托管外部 crab-mitm 引擎：stdout 事件流逐行交接给流量
//! 监控服务，stdin 接收单行 JSON 控制命令。引擎自身的代理转发、TLS
//! 终止与规则匹配均发生在引擎侧，本层只建模命令与事件两个表面

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::rules::{MapLocalRuleConfig, MapRemoteRuleConfig, StatusRewriteRuleConfig};
use crate::traffic::TrafficMonitor;

/// 引擎启动配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 引擎可执行文件路径
    pub binary: PathBuf,
    /// 引擎代理监听地址
    pub listen_address: String,
}

/// 引擎进程句柄
pub struct ProxyEngine {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
}

impl ProxyEngine {
    /// 启动引擎进程并接管其事件流
    pub fn spawn(config: &EngineConfig, monitor: Arc<TrafficMonitor>) -> Result<Self> {
        let mut child = Command::new(&config.binary)
            .arg("--listen")
            .arg(&config.listen_address)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("启动引擎进程失败: {}", config.binary.display()))?;

        let stdin = child.stdin.take().context("引擎进程缺少 stdin 管道")?;
        let stdout = child.stdout.take().context("引擎进程缺少 stdout 管道")?;
        let stderr = child.stderr.take().context("引擎进程缺少 stderr 管道")?;

        // 事件泵：读取端只做交接，摄入发生在监控服务的写入任务里，
        // 确保慢消费不会堵住引擎的输出管道
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => monitor.ingest_line(line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("读取引擎输出失败: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("引擎输出流已结束");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "crab_engine", "{}", line);
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
        })
    }

    /// 向引擎写入一条单行 JSON 控制命令
    async fn send_command(&self, command: serde_json::Value) -> Result<()> {
        let mut line = command.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("写入引擎命令失败")?;
        stdin.flush().await.context("刷新引擎命令管道失败")?;
        Ok(())
    }

    pub async fn start_capture(&self) -> Result<()> {
        self.send_command(json!({"cmd": "start_capture"})).await
    }

    pub async fn stop_capture(&self) -> Result<()> {
        self.send_command(json!({"cmd": "stop_capture"})).await
    }

    pub async fn set_listen_address(&self, address: &str) -> Result<()> {
        self.send_command(json!({"cmd": "set_listen_address", "address": address}))
            .await
    }

    pub async fn clear_rules(&self) -> Result<()> {
        self.send_command(json!({"cmd": "clear_rules"})).await
    }

    pub async fn add_allow_rule(&self, matcher: &str) -> Result<()> {
        self.send_command(json!({"cmd": "add_allow_rule", "matcher": matcher}))
            .await
    }

    pub async fn add_map_local_rule(&self, rule: &MapLocalRuleConfig) -> Result<()> {
        self.send_command(json!({"cmd": "add_map_local_rule", "rule": rule}))
            .await
    }

    pub async fn add_map_remote_rule(&self, rule: &MapRemoteRuleConfig) -> Result<()> {
        self.send_command(json!({"cmd": "add_map_remote_rule", "rule": rule}))
            .await
    }

    pub async fn add_status_rewrite_rule(&self, rule: &StatusRewriteRuleConfig) -> Result<()> {
        self.send_command(json!({"cmd": "add_status_rewrite_rule", "rule": rule}))
            .await
    }

    /// 引擎进程是否仍存活
    pub async fn is_running(&self) -> bool {
        self.child
            .lock()
            .await
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }

    /// 请求引擎退出；宽限期内未退出则强制终止
    pub async fn stop(&self) -> Result<()> {
        // 命令失败说明管道已断，继续走终止路径即可
        let _ = self.send_command(json!({"cmd": "shutdown"})).await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
            Ok(status) => {
                let status = status.context("等待引擎退出失败")?;
                tracing::info!(status = %status, "引擎进程已退出");
            }
            Err(_) => {
                tracing::warn!("引擎未在宽限期内退出，强制终止");
                child.start_kill().context("终止引擎进程失败")?;
                child.wait().await.context("等待引擎退出失败")?;
            }
        }
        Ok(())
    }
}

/// 引擎控制 API 状态
#[derive(Clone)]
pub struct EngineState {
    pub engine: Option<Arc<ProxyEngine>>,
    pub monitor: Arc<TrafficMonitor>,
}

fn engine_unavailable() -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": {"type": "engine_unavailable", "message": "引擎进程未启动"}
        })),
    )
        .into_response()
}

/// GET /api/engine/status
pub async fn get_engine_status(State(state): State<EngineState>) -> impl IntoResponse {
    let running = match state.engine.as_deref() {
        Some(engine) => engine.is_running().await,
        None => false,
    };
    Json(json!({
        "engineRunning": running,
        "records": state.monitor.len(),
        "ignoredLines": state.monitor.ignored_lines(),
    }))
}

/// POST /api/engine/capture 请求体
#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub enabled: bool,
}

/// POST /api/engine/capture
pub async fn set_capture(
    State(state): State<EngineState>,
    Json(request): Json<CaptureRequest>,
) -> axum::response::Response {
    let Some(engine) = state.engine.as_deref() else {
        return engine_unavailable();
    };
    let result = if request.enabled {
        engine.start_capture().await
    } else {
        engine.stop_capture().await
    };
    match result {
        Ok(()) => Json(json!({"success": true, "capturing": request.enabled})).into_response(),
        Err(e) => {
            tracing::error!("切换捕获状态失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": {"type": "internal_error", "message": format!("{}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// PUT /api/engine/listen 请求体
#[derive(Debug, Deserialize)]
pub struct ListenRequest {
    pub address: String,
}

/// PUT /api/engine/listen
pub async fn put_listen_address(
    State(state): State<EngineState>,
    Json(request): Json<ListenRequest>,
) -> axum::response::Response {
    let Some(engine) = state.engine.as_deref() else {
        return engine_unavailable();
    };
    match engine.set_listen_address(&request.address).await {
        Ok(()) => Json(json!({"success": true, "address": request.address})).into_response(),
        Err(e) => {
            tracing::error!("更新监听地址失败: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": {"type": "internal_error", "message": format!("{}", e)}
                })),
            )
                .into_response()
        }
    }
}

/// 创建引擎控制 API 路由
pub fn create_engine_router(
    engine: Option<Arc<ProxyEngine>>,
    monitor: Arc<TrafficMonitor>,
) -> Router {
    Router::new()
        .route("/engine/status", get(get_engine_status))
        .route("/engine/capture", post(set_capture))
        .route("/engine/listen", put(put_listen_address))
        .with_state(EngineState { engine, monitor })
}
