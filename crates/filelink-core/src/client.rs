//! TransferClient - 已就绪外设的应用层句柄
//!
//! 文件读写等传输操作由上层协议实现，这里只负责与外设一一绑定。

use crate::peripheral::{Address, ConnectionState, Peripheral, TransportKind, TransportPeripheral};
use std::fmt;

#[derive(Clone)]
pub struct TransferClient {
    peripheral: TransportPeripheral,
}

impl TransferClient {
    pub(crate) fn new(peripheral: TransportPeripheral) -> Self {
        Self { peripheral }
    }

    pub fn address(&self) -> Address {
        self.peripheral.address()
    }

    pub fn name(&self) -> Option<String> {
        self.peripheral.peripheral().name
    }

    pub fn kind(&self) -> TransportKind {
        self.peripheral.kind()
    }

    pub fn info(&self) -> Peripheral {
        self.peripheral.peripheral()
    }

    /// 底层连接对象，供文件传输协议使用
    pub fn transport(&self) -> &TransportPeripheral {
        &self.peripheral
    }

    pub fn is_ready(&self) -> bool {
        *self.peripheral.state().borrow() == ConnectionState::Enabled
    }
}

impl fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransferClient")
            .field(&self.peripheral)
            .finish()
    }
}
