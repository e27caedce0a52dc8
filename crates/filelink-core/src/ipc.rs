//! 守护进程 IPC 协议
//!
//! Unix Domain Socket 上的逐行 JSON：每行一个请求，对应一行响应。

use crate::bonded::BondedPeripheral;
use crate::client::TransferClient;
use crate::peripheral::{Address, Peripheral, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("filelink.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Scan { timeout_secs: u64 },
    /// 最近一次扫描发现的外设
    Peripherals,
    Connect { address: Address },
    Select { address: Address },
    Disconnect { address: Address },
    /// 地址为空时使用配置中的自动重连列表
    Reconnect { addresses: Vec<Address> },
    Password { address: Address, password: String },
    ClearError,
    Bonded,
    RemoveBond { address: Address },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok { message: String },
    Error { message: String },
    Status(StatusInfo),
    Peripherals { peripherals: Vec<PeripheralInfo> },
    Connected { peripheral: PeripheralInfo },
    Bonded { peripherals: Vec<BondedPeripheral> },
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        IpcResponse::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub address: Address,
    pub name: Option<String>,
    pub kind: TransportKind,
}

impl From<Peripheral> for PeripheralInfo {
    fn from(peripheral: Peripheral) -> Self {
        Self {
            address: peripheral.address,
            name: peripheral.name,
            kind: peripheral.kind,
        }
    }
}

impl From<&TransferClient> for PeripheralInfo {
    fn from(client: &TransferClient) -> Self {
        client.info().into()
    }
}

/// 协调器状态快照
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusInfo {
    pub selected: Option<PeripheralInfo>,
    pub connected: Vec<Address>,
    pub being_setup: Vec<Address>,
    pub reconnecting: bool,
    pub scanning: String,
    pub last_error: Option<String>,
}
