//! 宿主错误类型与委派错误分类
//!
//! DelegationError 的 Display 文本就是写入结果文件 `error` 字段、最终交给调用方会话的那句话，
//! 所以保持简短、可读，不携带内部异常细节。

use thiserror::Error;

/// 宿主运行过程中的通用错误（IO、序列化、配置、注册表、进程）
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// 委派链路上的错误分类：授权、未知目标、繁忙、启动/崩溃、超时、协议
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DelegationError {
    /// 目标不在允许列表内（含非主群向主群提权）
    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Unknown group: {0}")]
    UnknownTarget(String),

    /// 委派池已满，立即失败而不是排队
    #[error("Delegation busy: {active}/{max} delegation sessions running, try again later")]
    Busy { active: usize, max: usize },

    #[error("Session failed: {0}")]
    Spawn(String),

    #[error("Delegation timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed request: {0}")]
    Protocol(String),
}
