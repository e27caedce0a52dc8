//! BlueZ 后端
//!
//! 使用 bluer (BlueZ D-Bus) 实现扫描、连接和配对存储。
//!
//! - [`BluezScanner`]: 发现广播文件传输服务的设备
//! - [`BluezPeripheral`]: 连接、配对并等待服务解析完成
//! - [`BluezPlatform`]: 配对设备列表与删除配对

use super::{FILE_TRANSFER_SERVICE_UUID, has_file_transfer_service};
use crate::bonded::{BondedPeripheral, BondedPlatform};
use crate::error::{ConnectError, PlatformError, ScanError};
use crate::peripheral::{
    Address, BleTransferPeripheral, ConnectionState, OnBonded, Peripheral, TransferPeripheral,
    TransportKind,
};
use crate::scanner::{PeripheralScanner, ScannerState};
use async_trait::async_trait;
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// 连接后等待 GATT 服务解析的上限
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn platform_error(e: &bluer::Error) -> PlatformError {
    match e.kind {
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
            PlatformError::PermissionDenied(e.message.clone())
        }
        _ => PlatformError::Other(e.to_string()),
    }
}

fn parse_address(address: &Address) -> Result<bluer::Address, PlatformError> {
    address
        .as_str()
        .parse()
        .map_err(|_| PlatformError::InvalidAddress(address.to_string()))
}

/// 打开 BlueZ 会话并取得适配器（未指定名称时使用默认适配器）
async fn open_adapter(adapter_name: Option<&str>) -> Result<(bluer::Session, bluer::Adapter), PlatformError> {
    let session = bluer::Session::new().await.map_err(|e| platform_error(&e))?;
    let adapter = match adapter_name {
        Some(name) => session.adapter(name),
        None => session.default_adapter().await,
    }
    .map_err(|e| platform_error(&e))?;

    debug!("Powering on adapter '{}'", adapter.name());
    adapter
        .set_powered(true)
        .await
        .map_err(|e| platform_error(&e))?;
    Ok((session, adapter))
}

// ============================================================================
// 外设
// ============================================================================

pub struct BluezPeripheral {
    device: bluer::Device,
    peripheral: Mutex<Peripheral>,
    on_bonded: Option<OnBonded>,
    state: Arc<watch::Sender<ConnectionState>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BluezPeripheral {
    pub fn new(device: bluer::Device, name: Option<String>, on_bonded: Option<OnBonded>) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            peripheral: Mutex::new(Peripheral::ble(device.address().to_string(), name)),
            device,
            on_bonded,
            state: Arc::new(state),
            monitor: Mutex::new(None),
        }
    }

    async fn setup(&self) -> Result<(), ConnectError> {
        let failed = |e: bluer::Error| ConnectError::Failed(e.to_string());

        if !self.device.is_connected().await.map_err(failed)? {
            self.device.connect().await.map_err(failed)?;
        }

        if !self.device.is_paired().await.map_err(failed)? {
            info!("Pairing with {}", self.device.address());
            self.device.pair().await.map_err(failed)?;
            if let Some(on_bonded) = &self.on_bonded {
                let peripheral = self.peripheral();
                on_bonded(peripheral.name, peripheral.address);
            }
        }

        let resolved = time::timeout(SERVICES_RESOLVE_TIMEOUT, async {
            loop {
                match self.device.is_services_resolved().await {
                    Ok(true) => return Ok(()),
                    Ok(false) => time::sleep(SERVICES_POLL_INTERVAL).await,
                    Err(e) => return Err(ConnectError::Setup(e.to_string())),
                }
            }
        })
        .await;
        match resolved {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::Setup("services not resolved".to_string())),
        }

        let uuids = self
            .device
            .uuids()
            .await
            .map_err(|e| ConnectError::Setup(e.to_string()))?
            .unwrap_or_default();
        if !has_file_transfer_service(&uuids) {
            return Err(ConnectError::Setup(format!(
                "service {FILE_TRANSFER_SERVICE_UUID} not found"
            )));
        }

        if let Ok(Some(name)) = self.device.name().await {
            self.peripheral
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .name = Some(name);
        }
        Ok(())
    }

    /// 监听链路断开
    async fn start_monitor(&self) -> Result<(), ConnectError> {
        let mut events = Box::pin(
            self.device
                .events()
                .await
                .map_err(|e| ConnectError::Setup(e.to_string()))?,
        );
        let state = Arc::clone(&self.state);
        let address = self.device.address();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    info!("{} link lost", address);
                    state.send_replace(ConnectionState::Disconnected(Some(
                        "link lost".to_string(),
                    )));
                    break;
                }
            }
        });

        if let Some(previous) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
        Ok(())
    }

    fn stop_monitor(&self) {
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransferPeripheral for BluezPeripheral {
    fn peripheral(&self) -> Peripheral {
        self.peripheral
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect_and_setup(&self) -> Result<(), ConnectError> {
        self.state.send_replace(ConnectionState::Connecting);

        let result = match self.setup().await {
            Ok(()) => self.start_monitor().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!("{} ready", self.device.address());
                self.state.send_replace(ConnectionState::Enabled);
                Ok(())
            }
            Err(e) => {
                warn!("Setup of {} failed: {}", self.device.address(), e);
                if let Err(e) = self.device.disconnect().await {
                    debug!("Disconnect after failed setup: {}", e);
                }
                self.state
                    .send_replace(ConnectionState::Disconnected(Some(e.to_string())));
                Err(e)
            }
        }
    }

    async fn disconnect(&self, cause: Option<String>) {
        self.stop_monitor();
        if let Err(e) = self.device.disconnect().await {
            warn!("Failed to disconnect {}: {}", self.device.address(), e);
        }
        self.state.send_replace(ConnectionState::Disconnected(cause));
    }
}

impl BleTransferPeripheral for BluezPeripheral {}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

// ============================================================================
// 配对存储
// ============================================================================

pub struct BluezPlatform {
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

impl BluezPlatform {
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, PlatformError> {
        let (session, adapter) = open_adapter(adapter_name).await?;
        Ok(Self {
            _session: session,
            adapter,
        })
    }

    pub fn adapter(&self) -> &bluer::Adapter {
        &self.adapter
    }

    /// 为扫描到的外设构造连接对象
    pub fn peripheral(
        &self,
        peripheral: &Peripheral,
        on_bonded: Option<OnBonded>,
    ) -> Result<BluezPeripheral, PlatformError> {
        let device = self
            .adapter
            .device(parse_address(&peripheral.address)?)
            .map_err(|e| platform_error(&e))?;
        Ok(BluezPeripheral::new(device, peripheral.name.clone(), on_bonded))
    }
}

#[async_trait]
impl BondedPlatform for BluezPlatform {
    async fn bonded_peripherals(&self) -> Result<Vec<BondedPeripheral>, PlatformError> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(|e| platform_error(&e))?;

        let mut bonded = Vec::new();
        for addr in addresses {
            let device = self.adapter.device(addr).map_err(|e| platform_error(&e))?;
            if device.is_paired().await.map_err(|e| platform_error(&e))? {
                bonded.push(BondedPeripheral {
                    name: device.name().await.ok().flatten(),
                    address: Address::new(addr.to_string()),
                });
            }
        }
        debug!("{} bonded device(s)", bonded.len());
        Ok(bonded)
    }

    async fn bonded_peripheral(
        &self,
        address: &Address,
        on_bonded: Option<OnBonded>,
    ) -> Result<Arc<dyn BleTransferPeripheral>, PlatformError> {
        let device = self
            .adapter
            .device(parse_address(address)?)
            .map_err(|e| platform_error(&e))?;
        if !device.is_paired().await.map_err(|e| platform_error(&e))? {
            return Err(PlatformError::Other(format!("{address} is not bonded")));
        }
        let name = device.name().await.ok().flatten();
        Ok(Arc::new(BluezPeripheral::new(device, name, on_bonded)))
    }

    async fn remove_bond(&self, address: &Address) -> Result<(), PlatformError> {
        info!("Removing bond for {}", address);
        self.adapter
            .remove_device(parse_address(address)?)
            .await
            .map_err(|e| platform_error(&e))
    }
}

// ============================================================================
// 扫描
// ============================================================================

pub struct BluezScanner {
    adapter: bluer::Adapter,
    state: Arc<watch::Sender<ScannerState>>,
    peripherals: Arc<watch::Sender<Vec<Peripheral>>>,
    last_error: Arc<Mutex<Option<ScanError>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezScanner {
    pub fn new(adapter: bluer::Adapter) -> Self {
        let (state, _) = watch::channel(ScannerState::Idle);
        let (peripherals, _) = watch::channel(Vec::new());
        Self {
            adapter,
            state: Arc::new(state),
            peripherals: Arc::new(peripherals),
            last_error: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }
}

impl PeripheralScanner for BluezScanner {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        self.peripherals.send_replace(Vec::new());
        self.state.send_replace(ScannerState::Scanning);

        let adapter = self.adapter.clone();
        let state = Arc::clone(&self.state);
        let peripherals = Arc::clone(&self.peripherals);
        let last_error = Arc::clone(&self.last_error);
        *task = Some(tokio::spawn(async move {
            if let Err(e) = discover(&adapter, &peripherals).await {
                warn!("BLE scan failed: {}", e);
                let error = ScanError::Failed(e.to_string());
                *last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
                state.send_replace(ScannerState::Error(error));
            } else {
                state.send_replace(ScannerState::Idle);
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.state.send_if_modified(|state| {
            if *state == ScannerState::Scanning {
                *state = ScannerState::Idle;
                true
            } else {
                false
            }
        });
    }

    fn state(&self) -> watch::Receiver<ScannerState> {
        self.state.subscribe()
    }

    fn peripherals(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.peripherals.subscribe()
    }

    fn last_error(&self) -> Option<ScanError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_last_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

async fn discover(
    adapter: &bluer::Adapter,
    peripherals: &watch::Sender<Vec<Peripheral>>,
) -> bluer::Result<()> {
    let mut events = Box::pin(adapter.discover_devices().await?);
    info!("BLE scan started on '{}'", adapter.name());

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(addr) => {
                let properties = device_properties(adapter, addr).await;
                record_discovery(peripherals, addr, properties);
            }
            AdapterEvent::DeviceRemoved(addr) => {
                let address = Address::new(addr.to_string());
                peripherals.send_if_modified(|list| {
                    let before = list.len();
                    list.retain(|p| p.address != address);
                    list.len() != before
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// 读取单个设备的服务 UUID 和名称
async fn device_properties(
    adapter: &bluer::Adapter,
    addr: bluer::Address,
) -> bluer::Result<(HashSet<Uuid>, Option<String>)> {
    let device = adapter.device(addr)?;
    let uuids = device.uuids().await?.unwrap_or_default();
    let name = device.name().await?;
    Ok((uuids, name))
}

/// 把新发现的设备并入列表；读取属性失败的设备只跳过，不结束扫描
fn record_discovery<E: std::fmt::Display>(
    peripherals: &watch::Sender<Vec<Peripheral>>,
    addr: bluer::Address,
    properties: Result<(HashSet<Uuid>, Option<String>), E>,
) -> bool {
    let (uuids, name) = match properties {
        Ok(properties) => properties,
        Err(e) => {
            debug!("Skipping {}: {}", addr, e);
            return false;
        }
    };
    if !has_file_transfer_service(&uuids) {
        return false;
    }
    debug!("Discovered {} ({:?})", addr, name);

    let found = Peripheral::ble(addr.to_string(), name);
    peripherals.send_if_modified(|list| {
        match list.iter_mut().find(|p| p.address == found.address) {
            Some(existing) if existing.name == found.name => false,
            Some(existing) => {
                existing.name = found.name;
                true
            }
            None => {
                list.push(found);
                true
            }
        }
    })
}
