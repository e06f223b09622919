use thiserror::Error;

use crate::config::ConfigError;
use crate::logger::LoggerError;
use crate::pipeline::ClassifiedFault;
use crate::pool::PoolError;

/// 应用程序统一错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 连接池错误
    #[error("连接池错误: {0}")]
    Pool(#[from] PoolError),

    /// 操作最终失败
    #[error("操作失败: {0}")]
    Fault(#[from] ClassifiedFault),

    /// 日志初始化错误
    #[error("日志错误: {0}")]
    Logger(#[from] LoggerError),

    /// IO 错误
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

/// AppError 的 Result 类型别名
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Logger(_) => 3,
            AppError::Pool(_) => 4,
            AppError::Fault(fault) if fault.is_cancellation() => 5,
            AppError::Fault(_) => 6,
            AppError::IoError(_) | AppError::JsonError(_) | AppError::Unknown(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FaultKind;
    use crate::transport::HubError;

    #[test]
    fn test_fault_conversion() {
        let fault = ClassifiedFault::from_error(HubError::QuotaExceeded("daily".into()));
        let err: AppError = fault.into();

        assert!(matches!(&err, AppError::Fault(f) if f.kind() == FaultKind::Quota));
        assert_eq!(err.exit_code(), 6);
        assert!(err.to_string().starts_with("操作失败"));
    }

    #[test]
    fn test_cancellation_exit_code() {
        let err = AppError::from(ClassifiedFault::canceled("shutdown"));
        assert_eq!(err.exit_code(), 5);
        assert_eq!(AppError::from(PoolError::ShutDown).exit_code(), 4);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(AppError::from(ConfigError::ValidationError(
            "未知的故障类型: Nope".to_string(),
        )))
        .context("加载配置文件 hublink.toml 失败");

        let code = err.downcast_ref::<AppError>().map_or(1, AppError::exit_code);
        assert_eq!(code, 2);
        assert_eq!(AppError::Unknown("x".to_string()).exit_code(), 1);
    }
}
