//! 外设模型
//!
//! - [`Peripheral`]: 扫描器产生的身份记录（地址、名称、传输类型）
//! - [`TransferPeripheral`]: 每个外设的连接对象，暴露可观察的连接状态
//! - [`TransportPeripheral`]: BLE / WiFi 两种变体的标签联合

use crate::error::ConnectError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// 外设地址（不可变的身份键）
///
/// BLE 为 MAC 地址，WiFi 为 `host:port`。比较时不区分大小写。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Wifi => write!(f, "WiFi"),
        }
    }
}

/// 扫描器发现的外设
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub address: Address,
    pub name: Option<String>,
    pub kind: TransportKind,
}

impl Peripheral {
    pub fn new(address: impl Into<Address>, name: Option<String>, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            name,
            kind,
        }
    }

    pub fn ble(address: impl Into<Address>, name: Option<String>) -> Self {
        Self::new(address, name, TransportKind::Ble)
    }

    pub fn wifi(address: impl Into<Address>, name: Option<String>) -> Self {
        Self::new(address, name, TransportKind::Wifi)
    }

    /// 名称（若有），否则为地址
    pub fn name_or_address(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

/// 连接状态，由传输层驱动，协调器只观察不设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Enabled,
    Disconnected(Option<String>),
    Error(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(None)
    }
}

/// BLE 配对完成回调: `(name, address)`
pub type OnBonded = Arc<dyn Fn(Option<String>, Address) + Send + Sync>;

/// WiFi 密码查询回调: `(name, host) -> password`
pub type PasswordLookup = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// 单个外设的连接对象
#[async_trait]
pub trait TransferPeripheral: Send + Sync {
    /// 当前的身份记录（名称可能在连接后刷新）
    fn peripheral(&self) -> Peripheral;

    /// 订阅连接状态；接收端首先看到当前值
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// 连接并完成文件传输服务的准备工作
    ///
    /// 成功时状态为 [`ConnectionState::Enabled`]。不做任何隐式重试。
    async fn connect_and_setup(&self) -> Result<(), ConnectError>;

    /// 断开连接，`cause` 仅用于诊断
    async fn disconnect(&self, cause: Option<String>);
}

/// BLE 外设。配对回调在构造时注入。
pub trait BleTransferPeripheral: TransferPeripheral {}

/// WiFi 外设，带有可变的已存储密码
pub trait WifiTransferPeripheral: TransferPeripheral {
    fn password(&self) -> Option<String>;

    fn set_password(&self, password: String);
}

/// 按传输类型区分的外设句柄
#[derive(Clone)]
pub enum TransportPeripheral {
    Ble(Arc<dyn BleTransferPeripheral>),
    Wifi(Arc<dyn WifiTransferPeripheral>),
}

impl TransportPeripheral {
    pub fn peripheral(&self) -> Peripheral {
        match self {
            TransportPeripheral::Ble(p) => p.peripheral(),
            TransportPeripheral::Wifi(p) => p.peripheral(),
        }
    }

    pub fn address(&self) -> Address {
        self.peripheral().address
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportPeripheral::Ble(_) => TransportKind::Ble,
            TransportPeripheral::Wifi(_) => TransportKind::Wifi,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        match self {
            TransportPeripheral::Ble(p) => p.state(),
            TransportPeripheral::Wifi(p) => p.state(),
        }
    }

    pub async fn connect_and_setup(&self) -> Result<(), ConnectError> {
        match self {
            TransportPeripheral::Ble(p) => p.connect_and_setup().await,
            TransportPeripheral::Wifi(p) => p.connect_and_setup().await,
        }
    }

    pub async fn disconnect(&self, cause: Option<String>) {
        match self {
            TransportPeripheral::Ble(p) => p.disconnect(cause).await,
            TransportPeripheral::Wifi(p) => p.disconnect(cause).await,
        }
    }

    pub fn as_ble(&self) -> Option<&Arc<dyn BleTransferPeripheral>> {
        match self {
            TransportPeripheral::Ble(p) => Some(p),
            TransportPeripheral::Wifi(_) => None,
        }
    }

    pub fn as_wifi(&self) -> Option<&Arc<dyn WifiTransferPeripheral>> {
        match self {
            TransportPeripheral::Wifi(p) => Some(p),
            TransportPeripheral::Ble(_) => None,
        }
    }
}

impl fmt::Debug for TransportPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peripheral = self.peripheral();
        f.debug_struct("TransportPeripheral")
            .field("kind", &self.kind())
            .field("address", &peripheral.address)
            .field("name", &peripheral.name)
            .finish()
    }
}

/// 为发现的外设构造对应传输的连接对象
///
/// 返回 `None` 表示没有可用的传输实现（例如未启用 BLE 后端）。
pub trait PeripheralFactory: Send + Sync {
    fn create(&self, peripheral: &Peripheral) -> Option<TransportPeripheral>;
}
