//! 错误类型
//!
//! 所有错误都实现了 `Clone`，以便通过 watch 通道发布给观察者
//! （例如 "最近一次连接错误"）。

use crate::peripheral::Address;

/// 扫描器报告的错误（非致命，不影响已连接的外设）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Scanner unavailable: {0}")]
    Unavailable(String),

    #[error("Scan failed: {0}")]
    Failed(String),
}

/// 单次连接尝试失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// 平台（配对存储、适配器）错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not supported on this platform")]
    Unsupported,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Platform error: {0}")]
    Other(String),
}

/// 连接协调器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Can't connect to {name}: {source}")]
    Connect { name: String, source: ConnectError },

    #[error("Reconnection to {0} timed out")]
    ReconnectTimeout(Address),

    #[error("Can't connect to unknown peripheral type: {0}")]
    UnknownPeripheralType(Address),

    #[error("{0} is already being set up")]
    SetupInProgress(Address),

    #[error("Connection to {0} was cancelled")]
    Cancelled(Address),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Connection coordinator has shut down")]
    Shutdown,
}
