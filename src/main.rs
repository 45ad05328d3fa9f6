use std::fs;
use std::process;

use anyhow::{Context, Result};
use request_counter::{
    cli::{Cli, Commands},
    config::{self, ServerConfig},
    logging, CounterServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        return match command {
            Commands::GenerateConfig { path } => generate_config(path),
            Commands::ValidateConfig { path } => validate_config(path),
            Commands::ShowConfig => show_config(&cli),
        };
    }

    // 快速读取 config.toml 的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > config.toml > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    let _log_guard = logging::init_logging(
        &log_level,
        log_format.as_deref(),
        log_file.as_deref(),
        cli.quiet,
    )?;

    tracing::info!("🚀 request-counter starting...");

    let config = ServerConfig::load(&cli).context("加载配置失败")?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }
    tracing::info!(
        "  - Log Format: {:?}",
        log_format.as_deref().unwrap_or("compact")
    );
    if let Some(f) = &log_file {
        tracing::info!("  - Log File: {}", f);
    }

    let server = CounterServer::new(config);
    if let Err(e) = server.run().await {
        tracing::error!("❌ 服务运行失败: {:#}", e);
        process::exit(1);
    }

    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, ServerConfig::default_toml())
        .with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = ServerConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - HTTP: {}:{} (enabled={})", config.http.host, config.http.port, config.http.enabled);
    match config.limits.resource_requests_limit {
        Some(limit) => println!("  - Resource Requests Limit: {}", limit),
        None => println!("  - Resource Requests Limit: (默认)"),
    }
    println!("  - Peer Idle Window: {}s", config.limits.peer_idle_window_secs);
    println!("  - Telemetry Poll Interval: {}s", config.telemetry.poll_interval_secs);

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    let _guard = logging::init_logging("info", None, None, false)?;

    let config = ServerConfig::load(cli).context("加载配置失败")?;

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!(
        "  - 生效的在途上限: {}",
        request_counter::admission::resolve_limit(config.limits.resource_requests_limit)
    );

    Ok(())
}
