//! crab-panel：crab-mitm 代理引擎的控制面板后端
//!
//! 托管外部引擎进程，消费其事件流重建流量账本，并向 UI 层提供
//! 流量查询与规则同步接口

mod engine;
mod model;
mod rules;
mod traffic;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use engine::{EngineConfig, ProxyEngine, create_engine_router};
use model::config::Config;
use rules::create_rules_router;
use traffic::{TrafficMonitor, create_traffic_router};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "crab-panel", about = "crab-mitm 代理引擎控制面板后端")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// 覆盖监听主机
    #[arg(long)]
    host: Option<String>,

    /// 覆盖监听端口
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_existed = Path::new(&args.config).exists();
    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !config_existed {
        config.save().context("写入默认配置文件失败")?;
        tracing::info!(path = %args.config, "已生成默认配置文件");
    }

    let monitor = Arc::new(TrafficMonitor::new(
        config.max_log_entries,
        config.log_channel_capacity,
    ));

    let mut engine_handle: Option<Arc<ProxyEngine>> = None;
    if let Some(binary) = config.engine_binary.clone() {
        let engine = ProxyEngine::spawn(
            &EngineConfig {
                binary,
                listen_address: config.engine_listen_address.clone(),
            },
            monitor.clone(),
        )?;
        engine.start_capture().await?;
        tracing::info!(listen = %config.engine_listen_address, "引擎进程已启动");
        engine_handle = Some(Arc::new(engine));
    } else {
        tracing::warn!("未配置 engineBinary，仅提供流量查询接口");
    }

    let api = create_traffic_router(monitor.clone())
        .merge(create_rules_router(engine_handle.clone()))
        .merge(create_engine_router(engine_handle.clone(), monitor.clone()));
    let app = axum::Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定监听地址失败: {addr}"))?;
    tracing::info!(addr = %addr, "crab-panel 已启动");

    axum::serve(listener, app).await?;

    if let Some(engine) = engine_handle {
        engine.stop().await?;
    }
    Ok(())
}
