use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::counter::RequestCounterOptions;

/// 环境变量前缀
const ENV_PREFIX: &str = "REQUEST_COUNTER_";

/// 默认配置文件
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// 服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub limits: LimitsConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

/// 诊断 HTTP 服务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// 准入与调用方账本
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 每个资源的在途上限；环境变量 `VIAM_RESOURCE_REQUESTS_LIMIT` 优先
    pub resource_requests_limit: Option<i64>,
    /// 空闲多久的调用方会被清理（秒）
    pub peer_idle_window_secs: u64,
    /// 后台清理间隔（秒）
    pub peer_sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            resource_requests_limit: None,
            peer_idle_window_secs: 300,
            peer_sweep_interval_secs: 60,
        }
    }
}

/// 统计轮询
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
        }
    }
}

/// 日志
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        config.validate()?;
        Ok(config)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limits.resource_requests_limit {
            anyhow::ensure!(limit > 0, "limits.resource_requests_limit 必须为正数: {}", limit);
        }
        anyhow::ensure!(
            self.limits.peer_idle_window_secs > 0,
            "limits.peer_idle_window_secs 必须大于 0"
        );
        anyhow::ensure!(
            self.limits.peer_sweep_interval_secs > 0,
            "limits.peer_sweep_interval_secs 必须大于 0"
        );
        anyhow::ensure!(
            self.telemetry.poll_interval_secs > 0,
            "telemetry.poll_interval_secs 必须大于 0"
        );
        Ok(())
    }

    /// 从环境变量合并配置（REQUEST_COUNTER_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        self.merge_from_lookup(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn merge_from_lookup(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HTTP_HOST") {
            self.http.host = host;
        }
        if let Some(port) = lookup("HTTP_PORT") {
            self.http.port = port
                .parse()
                .with_context(|| format!("{}HTTP_PORT 无效: {}", ENV_PREFIX, port))?;
        }
        if let Some(enabled) = lookup("HTTP_ENABLED") {
            self.http.enabled = parse_bool(&enabled).unwrap_or(self.http.enabled);
        }
        if let Some(limit) = lookup("RESOURCE_REQUESTS_LIMIT") {
            self.limits.resource_requests_limit = Some(
                limit
                    .parse()
                    .with_context(|| format!("{}RESOURCE_REQUESTS_LIMIT 无效: {}", ENV_PREFIX, limit))?,
            );
        }
        if let Some(secs) = lookup("PEER_IDLE_WINDOW_SECS") {
            self.limits.peer_idle_window_secs = secs.parse().unwrap_or(self.limits.peer_idle_window_secs);
        }
        if let Some(secs) = lookup("PEER_SWEEP_INTERVAL_SECS") {
            self.limits.peer_sweep_interval_secs =
                secs.parse().unwrap_or(self.limits.peer_sweep_interval_secs);
        }
        if let Some(enabled) = lookup("TELEMETRY_ENABLED") {
            self.telemetry.enabled = parse_bool(&enabled).unwrap_or(self.telemetry.enabled);
        }
        if let Some(secs) = lookup("TELEMETRY_POLL_INTERVAL_SECS") {
            self.telemetry.poll_interval_secs = secs.parse().unwrap_or(self.telemetry.poll_interval_secs);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        if let Some(file) = lookup("LOG_FILE") {
            self.logging.file = Some(file);
        }
        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(host) = &cli.host {
            self.http.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.http.port = port;
        }
        if let Some(limit) = cli.limit {
            self.limits.resource_requests_limit = Some(limit);
        }
        if cli.no_telemetry {
            self.telemetry.enabled = false;
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = match &cli.config_file {
            Some(config_file) if Path::new(config_file).exists() => {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            }
            Some(config_file) => {
                warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                info!("📄 从默认配置文件加载: {}", DEFAULT_CONFIG_FILE);
                Self::from_toml_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::new(),
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 诊断服务监听地址
    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.http.host, self.http.port)
            .parse()
            .with_context(|| format!("无效的监听地址: {}:{}", self.http.host, self.http.port))
    }

    pub fn peer_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limits.peer_sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.poll_interval_secs)
    }

    /// 构造计数器所需的选项
    pub fn counter_options(&self) -> RequestCounterOptions {
        RequestCounterOptions {
            limit: self.limits.resource_requests_limit,
            peer_idle_window: Duration::from_secs(self.limits.peer_idle_window_secs),
        }
    }

    /// 默认配置文件内容
    pub fn default_toml() -> String {
        r#"# request-counter 配置文件
# 此文件由 request-counter generate-config 生成

[http]
enabled = true
host = "0.0.0.0"
port = 9090

[limits]
# 每个资源的在途请求上限；环境变量 VIAM_RESOURCE_REQUESTS_LIMIT 优先
# resource_requests_limit = 100
peer_idle_window_secs = 300
peer_sweep_interval_secs = 60

[telemetry]
enabled = true
poll_interval_secs = 10

[logging]
level = "info"
format = "compact"
# file = "./logs/request-counter.log"
"#
        .to_string()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// 日志初始化前需要的那部分配置
#[derive(Debug, Default)]
pub struct EarlyLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EarlyToml {
    #[serde(default)]
    logging: EarlyTomlLogging,
}

#[derive(Debug, Default, Deserialize)]
struct EarlyTomlLogging {
    level: Option<String>,
    format: Option<String>,
    file: Option<String>,
}

/// 快速读取配置文件的 [logging] 段，失败时返回空配置
pub fn load_early_logging_config(config_file: Option<&str>) -> EarlyLoggingConfig {
    let path = config_file.unwrap_or(DEFAULT_CONFIG_FILE);
    let Ok(content) = fs::read_to_string(path) else {
        return EarlyLoggingConfig::default();
    };
    let Ok(parsed) = toml::from_str::<EarlyToml>(&content) else {
        return EarlyLoggingConfig::default();
    };
    EarlyLoggingConfig {
        level: parsed.logging.level,
        format: parsed.logging.format,
        file: parsed.logging.file,
    }
}
