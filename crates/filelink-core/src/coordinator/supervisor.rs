//! 重连监督任务
//!
//! 每个受管理的 BLE 外设对应一个后台任务，订阅其连接状态并把每次变化
//! 转发给协调器。任务本身不修改任何状态，所有反应都在协调器中串行执行。
//!
//! 事件携带所属条目的代号（generation），协调器据此丢弃已分离任务的迟到事件。

use super::Loopback;
use crate::peripheral::{Address, BleTransferPeripheral, ConnectionState};
use futures_util::StreamExt;
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

/// 监督任务转发的状态变化
#[derive(Debug)]
pub(crate) struct SupervisorEvent {
    pub address: Address,
    pub generation: u64,
    pub state: ConnectionState,
}

/// 受管理的外设及其监督任务
pub(crate) struct ManagedEntry {
    pub peripheral: Arc<dyn BleTransferPeripheral>,
    pub generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ManagedEntry {
    /// 启动监督任务；首个事件是外设的当前状态
    pub fn spawn(
        peripheral: Arc<dyn BleTransferPeripheral>,
        generation: u64,
        loopback: mpsc::UnboundedSender<Loopback>,
    ) -> Self {
        let address = peripheral.peripheral().address;
        let token = CancellationToken::new();
        let mut states = WatchStream::new(peripheral.state());
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    state = states.next() => match state {
                        Some(state) => state,
                        None => break,
                    },
                };

                let event = SupervisorEvent {
                    address: address.clone(),
                    generation,
                    state,
                };
                if loopback.send(Loopback::Supervisor(event)).is_err() {
                    break;
                }
            }
        });

        Self {
            peripheral,
            generation,
            token,
            handle,
        }
    }

    /// 取消监督任务
    pub fn cancel(self, cause: Option<&str>) {
        debug!(
            "Supervision of {} cancelled: {}",
            self.peripheral.peripheral().name_or_address(),
            cause.unwrap_or("detached")
        );
        self.token.cancel();
        self.handle.abort();
    }
}
