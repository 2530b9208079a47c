use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// crab-panel 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 引擎可执行文件路径（未配置时不托管引擎进程，仅提供查询接口）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_binary: Option<PathBuf>,

    /// 引擎代理监听地址
    #[serde(default = "default_engine_listen_address")]
    pub engine_listen_address: String,

    /// 流量账本容量，超出按到达顺序淘汰最旧记录
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// 事件通道容量（引擎读取端与摄入任务之间的有界队列）
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7950
}

fn default_engine_listen_address() -> String {
    "127.0.0.1:8899".to_string()
}

fn default_max_log_entries() -> usize {
    800
}

fn default_log_channel_capacity() -> usize {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            engine_binary: None,
            engine_listen_address: default_engine_listen_address(),
            max_log_entries: default_max_log_entries(),
            log_channel_capacity: default_log_channel_capacity(),
            config_path: None,
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 将当前配置写回原始配置文件
    pub fn save(&self) -> anyhow::Result<()> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("配置文件路径未知，无法保存配置"))?;

        let content = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }
}
