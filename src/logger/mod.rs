//! 日志初始化
//!
//! 控制台输出加可选的按天滚动文件输出；文件写入走非阻塞线程，
//! 返回的 `WorkerGuard` 必须由调用方持有到程序退出。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// 过滤指令，`RUST_LOG` 存在时以其为准
    pub level: String,
    pub format: LogFormat,
    /// 日志文件目录，为空则只输出到控制台
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "hublink=info".to_string(),
            format: LogFormat::Compact,
            directory: None,
            file_prefix: "hublink.log".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("日志过滤指令无效: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("创建日志目录失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("日志系统初始化失败: {0}")]
    Init(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter(config: &LoggerConfig) -> Result<EnvFilter, LoggerError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}

fn console_layer(config: &LoggerConfig) -> Result<BoxedLayer, LoggerError> {
    let layer = match config.format {
        LogFormat::Compact => fmt::layer().compact().with_filter(filter(config)?).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_filter(filter(config)?).boxed(),
        LogFormat::Json => fmt::layer().json().with_filter(filter(config)?).boxed(),
    };
    Ok(layer)
}

/// 初始化全局订阅者；配置了目录时额外返回文件写入线程的守卫
pub fn init(config: &LoggerConfig) -> Result<Option<WorkerGuard>, LoggerError> {
    let mut layers = vec![console_layer(config)?];

    let guard = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
                _ => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
            };
            layers.push(file_layer.with_filter(filter(config)?).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;
    Ok(guard)
}
