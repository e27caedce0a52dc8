//! 已配对 BLE 外设
//!
//! - [`BondedPlatform`]: 平台配对存储的抽象（列出已配对设备、按地址取得外设）
//! - [`reconnect_to_peripherals`]: 并行、限时的批量重连
//! - [`BondedPeripherals`]: 已配对设备记录列表（供界面/守护进程展示）
//!
//! 权限错误一律降级为空列表，不会让调用方失败。

use crate::error::{CoordinatorError, PlatformError};
use crate::peripheral::{Address, BleTransferPeripheral, OnBonded};
use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// 已配对设备记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondedPeripheral {
    pub name: Option<String>,
    pub address: Address,
}

/// 平台配对设施
#[async_trait]
pub trait BondedPlatform: Send + Sync {
    /// 列出当前已配对的设备
    async fn bonded_peripherals(&self) -> Result<Vec<BondedPeripheral>, PlatformError>;

    /// 为已配对地址构造一个（尚未连接的）外设对象
    async fn bonded_peripheral(
        &self,
        address: &Address,
        on_bonded: Option<OnBonded>,
    ) -> Result<Arc<dyn BleTransferPeripheral>, PlatformError>;

    /// 删除配对信息
    async fn remove_bond(&self, address: &Address) -> Result<(), PlatformError>;
}

/// 不支持 BLE 的平台（例如仅使用 WiFi 的部署）
pub struct NoBondedPlatform;

#[async_trait]
impl BondedPlatform for NoBondedPlatform {
    async fn bonded_peripherals(&self) -> Result<Vec<BondedPeripheral>, PlatformError> {
        Ok(Vec::new())
    }

    async fn bonded_peripheral(
        &self,
        _address: &Address,
        _on_bonded: Option<OnBonded>,
    ) -> Result<Arc<dyn BleTransferPeripheral>, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn remove_bond(&self, _address: &Address) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

/// 读取已配对设备列表，任何平台错误都降级为空列表
pub async fn bonded_peripherals_or_empty(platform: &dyn BondedPlatform) -> Vec<BondedPeripheral> {
    match platform.bonded_peripherals().await {
        Ok(peripherals) => peripherals,
        Err(PlatformError::PermissionDenied(e)) => {
            warn!("Bonded devices permission denied: {}", e);
            Vec::new()
        }
        Err(e) => {
            warn!("Failed to read bonded devices: {}", e);
            Vec::new()
        }
    }
}

/// 已配对地址集合
pub async fn bonded_addresses(platform: &dyn BondedPlatform) -> BTreeSet<Address> {
    bonded_peripherals_or_empty(platform)
        .await
        .into_iter()
        .map(|p| p.address)
        .collect()
}

/// 并行重连多个已配对外设，每个尝试最多耗时 `timeout`
///
/// 只返回成功就绪的外设（顺序与 `addresses` 一致）。
/// 传输层永不返回时按超时失败处理，并断开已取得的外设对象。
pub async fn reconnect_to_peripherals(
    platform: &dyn BondedPlatform,
    addresses: &[Address],
    timeout: Duration,
    on_bonded: Option<OnBonded>,
) -> Vec<Arc<dyn BleTransferPeripheral>> {
    let attempts = addresses
        .iter()
        .map(|address| reconnect_one(platform, address, timeout, on_bonded.clone()));

    let results = join_all(attempts).await;

    let mut ready = Vec::new();
    for (address, result) in addresses.iter().zip(results) {
        match result {
            Ok(peripheral) => {
                debug!("Reconnected to {}", address);
                ready.push(peripheral);
            }
            Err(e) => warn!("Reconnect to {} failed: {}", address, e),
        }
    }
    ready
}

async fn reconnect_one(
    platform: &dyn BondedPlatform,
    address: &Address,
    timeout: Duration,
    on_bonded: Option<OnBonded>,
) -> Result<Arc<dyn BleTransferPeripheral>, CoordinatorError> {
    let deadline = Instant::now() + timeout;

    let peripheral = time::timeout_at(deadline, platform.bonded_peripheral(address, on_bonded))
        .await
        .map_err(|_| CoordinatorError::ReconnectTimeout(address.clone()))??;

    match time::timeout_at(deadline, peripheral.connect_and_setup()).await {
        Ok(Ok(())) => Ok(peripheral),
        Ok(Err(source)) => Err(CoordinatorError::Connect {
            name: peripheral.peripheral().name_or_address(),
            source,
        }),
        Err(_) => {
            peripheral
                .disconnect(Some("reconnect timed out".to_string()))
                .await;
            Err(CoordinatorError::ReconnectTimeout(address.clone()))
        }
    }
}

/// 已配对设备记录列表
///
/// 平台的配对列表刷新有延迟，所以配对/删除后会手动更新本地列表。
pub struct BondedPeripherals {
    platform: Arc<dyn BondedPlatform>,
    records: watch::Sender<Vec<BondedPeripheral>>,
}

impl BondedPeripherals {
    pub async fn new(platform: Arc<dyn BondedPlatform>) -> Self {
        let initial = bonded_peripherals_or_empty(platform.as_ref()).await;
        let (records, _) = watch::channel(initial);
        Self { platform, records }
    }

    pub fn records(&self) -> watch::Receiver<Vec<BondedPeripheral>> {
        self.records.subscribe()
    }

    pub fn snapshot(&self) -> Vec<BondedPeripheral> {
        self.records.borrow().clone()
    }

    /// 新增记录；地址已存在且名称变化时更新名称
    pub fn add(&self, name: Option<String>, address: Address) {
        self.records.send_if_modified(|records| {
            match records.iter_mut().find(|r| r.address == address) {
                Some(existing) if existing.name == name => false,
                Some(existing) => {
                    existing.name = name;
                    true
                }
                None => {
                    info!("Bonded peripheral added: {}", address);
                    records.push(BondedPeripheral { name, address });
                    true
                }
            }
        });
    }

    /// 删除平台配对并移除记录
    pub async fn remove(&self, address: &Address) {
        match self.platform.remove_bond(address).await {
            Ok(()) => {
                self.records.send_if_modified(|records| {
                    let before = records.len();
                    records.retain(|r| &r.address != address);
                    records.len() != before
                });
            }
            Err(e) => warn!("Failed to remove bond for {}: {}", address, e),
        }
    }

    pub async fn refresh(&self) {
        let records = bonded_peripherals_or_empty(self.platform.as_ref()).await;
        self.records.send_replace(records);
    }

    /// 删除所有配对信息
    pub async fn clear(&self) {
        for record in self.snapshot() {
            if let Err(e) = self.platform.remove_bond(&record.address).await {
                warn!("Failed to remove bond for {}: {}", record.address, e);
            }
        }
        self.refresh().await;
    }
}
