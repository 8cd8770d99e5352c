use crate::utils::error::Result;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dsi_toolkit=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dsi_toolkit=info"))
    }
}

pub fn init_cli_logger(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// 終端機輸出加上時間戳記的 log 檔案，回傳 log 檔路徑
pub fn init_session_logger(script_name: &str, logs_dir: &Path, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_file = logs_dir.join(format!("{}_{}.log", script_name, timestamp));
    let file = File::create(&log_file)?;

    let _ = tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init();

    tracing::info!("📄 Log file: {}", log_file.display());
    Ok(log_file)
}

pub fn init_json_logger(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .json(),
        )
        .try_init();
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub timestamp: String,
    pub datetime_str: String,
}

pub fn session_info() -> SessionInfo {
    let now = chrono::Local::now();
    SessionInfo {
        timestamp: now.to_rfc3339(),
        datetime_str: now.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

pub fn log_banner(title: &str) {
    let rule = "=".repeat(60);
    tracing::info!("{}", rule);
    tracing::info!("{}", title);
    tracing::info!("{}", rule);
}
