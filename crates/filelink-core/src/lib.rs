//! Filelink Core Library
//!
//! BLE / WiFi 文件传输外设的连接管理
//!
//! # 模块
//!
//! - **peripheral**: 外设身份、连接状态、传输抽象
//! - **scanner**: 多传输扫描结果聚合
//! - **coordinator**: 连接协调器（注册表、选择策略、有界自动重连）
//! - **bonded**: 已配对 BLE 外设与批量重连
//! - **ble**: BLE 传输（BlueZ 后端需 `bluez` feature）
//! - **wifi**: 基于 HTTP 的 WiFi 传输
//! - **config**: 应用设置
//! - **ipc**: 守护进程协议
//!
//! # 使用示例
//!
//! ```ignore
//! use filelink_core::{ConnectionCoordinator, CoordinatorConfig, Scanner};
//!
//! // 1. 组装扫描器、外设工厂和配对平台
//! let coordinator = ConnectionCoordinator::new(
//!     CoordinatorConfig::default(),
//!     factory,
//!     platform,
//!     Scanner::new(scanners),
//!     None,
//! );
//!
//! // 2. 重连已配对的外设，失败则扫描
//! if !coordinator.reconnect_to_bonded_peripherals(known).await {
//!     coordinator.start_scan();
//! }
//!
//! // 3. 观察当前选中的客户端
//! let mut selected = coordinator.selected_client();
//! selected.changed().await?;
//! ```

pub mod ble;
pub mod bonded;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ipc;
pub mod peripheral;
pub mod scanner;
pub mod wifi;

pub use bonded::{BondedPeripheral, BondedPeripherals, BondedPlatform, NoBondedPlatform};
pub use client::TransferClient;
pub use config::{AppSettings, WifiPeripheralConfig};
pub use coordinator::{ConnectionCoordinator, CoordinatorConfig, RECONNECT_TIMEOUT};
pub use error::{ConnectError, CoordinatorError, PlatformError, ScanError};
pub use peripheral::{
    Address, BleTransferPeripheral, ConnectionState, OnBonded, PasswordLookup, Peripheral,
    PeripheralFactory, TransferPeripheral, TransportKind, TransportPeripheral,
    WifiTransferPeripheral,
};
pub use scanner::{PeripheralScanner, Scanner, ScannerState, ScanningState, StaticScanner};
pub use wifi::HttpFileTransferPeripheral;
