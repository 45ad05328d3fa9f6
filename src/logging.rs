use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// 指定 `log_file` 时输出到按天滚动的文件，返回的 guard 需要保持到进程退出，
/// 否则缓冲中的日志会丢失。
pub fn init_logging(
    log_level: &str,
    log_format: Option<&str>,
    log_file: Option<&str>,
    quiet: bool,
) -> Result<Option<WorkerGuard>> {
    // 如果静默模式，只输出错误
    let level = if quiet { "error" } else { log_level };

    // RUST_LOG 优先
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match log_file {
        Some(file) => {
            let (dir, prefix) = split_log_path(file)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("无法创建日志目录: {}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let ansi = writer.is_none();

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match (log_format, writer) {
        (Some("json"), Some(w)) => registry.with(fmt::layer().json().with_writer(w)).try_init(),
        (Some("json"), None) => registry.with(fmt::layer().json()).try_init(),
        (Some("pretty") | Some("dev"), Some(w)) => registry
            .with(fmt::layer().pretty().with_ansi(ansi).with_writer(w))
            .try_init(),
        (Some("pretty") | Some("dev"), None) => registry.with(fmt::layer().pretty()).try_init(),
        (_, Some(w)) => registry
            .with(fmt::layer().compact().with_ansi(ansi).with_writer(w))
            .try_init(),
        (_, None) => registry.with(fmt::layer().compact()).try_init(),
    };
    result.context("日志系统已初始化")?;

    Ok(guard)
}

/// 拆分日志路径为（目录，文件名前缀）
fn split_log_path(file: &str) -> Result<(String, String)> {
    let path = Path::new(file);
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("无效的日志文件路径: {}", file))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    };
    Ok((dir, prefix))
}
