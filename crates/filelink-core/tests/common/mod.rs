//! 测试用的模拟传输
//!
//! - [`MockPeripheral`]: 由测试脚本控制连接结果和链路事件的外设
//! - [`MockFactory`]: 只认识预先登记的地址
//! - [`MockPlatform`]: 可脚本化的配对存储

#![allow(dead_code)]

use async_trait::async_trait;
use filelink_core::{
    Address, BleTransferPeripheral, BondedPeripheral, BondedPlatform, ConnectError,
    ConnectionCoordinator, ConnectionState, CoordinatorConfig, OnBonded, Peripheral,
    PeripheralFactory, PlatformError, Scanner, TransferPeripheral, TransportPeripheral,
    WifiTransferPeripheral,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};

pub const A: &str = "AA:AA:AA:AA:AA:01";
pub const B: &str = "BB:BB:BB:BB:BB:02";
pub const C: &str = "CC:CC:CC:CC:CC:03";
pub const WIFI: &str = "192.168.1.20:80";

/// 连接脚本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ready,
    Fail,
    /// 等到 [`MockPeripheral::release`] 后成功
    Hang,
}

pub struct MockPeripheral {
    peripheral: Peripheral,
    state: watch::Sender<ConnectionState>,
    behavior: Mutex<Behavior>,
    release: Notify,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    password: Mutex<Option<String>>,
}

impl MockPeripheral {
    fn new(peripheral: Peripheral, behavior: Behavior) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::default());
        Arc::new(Self {
            peripheral,
            state,
            behavior: Mutex::new(behavior),
            release: Notify::new(),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            password: Mutex::new(None),
        })
    }

    pub fn ble(address: &str, behavior: Behavior) -> Arc<Self> {
        Self::new(Peripheral::ble(address, Some(format!("ble-{address}"))), behavior)
    }

    pub fn wifi(address: &str, behavior: Behavior) -> Arc<Self> {
        Self::new(Peripheral::wifi(address, Some("cpy-wifi".to_string())), behavior)
    }

    pub fn info(&self) -> Peripheral {
        self.peripheral.clone()
    }

    pub fn address(&self) -> Address {
        self.peripheral.address.clone()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    /// 模拟链路事件
    pub fn emit(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferPeripheral for MockPeripheral {
    fn peripheral(&self) -> Peripheral {
        self.peripheral.clone()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect_and_setup(&self) -> Result<(), ConnectError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connecting);

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Ready => {}
            Behavior::Fail => {
                self.state
                    .send_replace(ConnectionState::Disconnected(Some("refused".to_string())));
                return Err(ConnectError::Failed("refused".to_string()));
            }
            Behavior::Hang => self.release.notified().await,
        }

        self.state.send_replace(ConnectionState::Enabled);
        Ok(())
    }

    async fn disconnect(&self, cause: Option<String>) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Disconnected(cause));
    }
}

impl BleTransferPeripheral for MockPeripheral {}

impl WifiTransferPeripheral for MockPeripheral {
    fn password(&self) -> Option<String> {
        self.password.lock().unwrap().clone()
    }

    fn set_password(&self, password: String) {
        *self.password.lock().unwrap() = Some(password);
    }
}

#[derive(Default)]
pub struct MockFactory {
    known: Mutex<HashMap<Address, TransportPeripheral>>,
}

impl MockFactory {
    pub fn add_ble(&self, peripheral: &Arc<MockPeripheral>) {
        self.known.lock().unwrap().insert(
            peripheral.address(),
            TransportPeripheral::Ble(peripheral.clone()),
        );
    }

    pub fn add_wifi(&self, peripheral: &Arc<MockPeripheral>) {
        self.known.lock().unwrap().insert(
            peripheral.address(),
            TransportPeripheral::Wifi(peripheral.clone()),
        );
    }
}

impl PeripheralFactory for MockFactory {
    fn create(&self, peripheral: &Peripheral) -> Option<TransportPeripheral> {
        self.known.lock().unwrap().get(&peripheral.address).cloned()
    }
}

#[derive(Default)]
pub struct MockPlatform {
    bonded: Mutex<BTreeMap<Address, Arc<MockPeripheral>>>,
    permission_denied: AtomicBool,
    reconnect_calls: Mutex<Vec<Address>>,
    removed: Mutex<Vec<Address>>,
}

impl MockPlatform {
    pub fn bond(&self, peripheral: &Arc<MockPeripheral>) {
        self.bonded
            .lock()
            .unwrap()
            .insert(peripheral.address(), peripheral.clone());
    }

    pub fn deny_permission(&self) {
        self.permission_denied.store(true, Ordering::SeqCst);
    }

    /// 通过平台发起的重连（按调用顺序）
    pub fn reconnect_calls(&self) -> Vec<Address> {
        self.reconnect_calls.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<Address> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BondedPlatform for MockPlatform {
    async fn bonded_peripherals(&self) -> Result<Vec<BondedPeripheral>, PlatformError> {
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(PlatformError::PermissionDenied("BLUETOOTH_CONNECT".to_string()));
        }
        Ok(self
            .bonded
            .lock()
            .unwrap()
            .values()
            .map(|p| BondedPeripheral {
                name: p.info().name,
                address: p.address(),
            })
            .collect())
    }

    async fn bonded_peripheral(
        &self,
        address: &Address,
        _on_bonded: Option<OnBonded>,
    ) -> Result<Arc<dyn BleTransferPeripheral>, PlatformError> {
        self.reconnect_calls.lock().unwrap().push(address.clone());
        let peripheral = self.bonded.lock().unwrap().get(address).cloned();
        match peripheral {
            Some(peripheral) => Ok(peripheral),
            None => Err(PlatformError::Other(format!("{address} is not bonded"))),
        }
    }

    async fn remove_bond(&self, address: &Address) -> Result<(), PlatformError> {
        self.removed.lock().unwrap().push(address.clone());
        match self.bonded.lock().unwrap().remove(address) {
            Some(_) => Ok(()),
            None => Err(PlatformError::Other(format!("{address} is not bonded"))),
        }
    }
}

pub struct Harness {
    pub coordinator: ConnectionCoordinator,
    pub factory: Arc<MockFactory>,
    pub platform: Arc<MockPlatform>,
}

pub fn harness() -> Harness {
    let factory = Arc::new(MockFactory::default());
    let platform = Arc::new(MockPlatform::default());
    let coordinator = ConnectionCoordinator::new(
        CoordinatorConfig::default(),
        factory.clone(),
        platform.clone(),
        Scanner::new(Vec::new()),
        None,
    );
    Harness {
        coordinator,
        factory,
        platform,
    }
}

/// 等待 watch 值满足条件
pub async fn wait_for<T>(rx: &mut watch::Receiver<T>, f: impl FnMut(&T) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
        .await
        .expect("condition not reached in time")
        .expect("watch sender dropped");
}

/// 轮询直到条件成立
pub async fn eventually(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// 让协调器处理完已排队的事件
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn selected_address(coordinator: &ConnectionCoordinator) -> Option<Address> {
    coordinator.current_client().map(|c| c.address())
}

pub fn address(s: &str) -> Address {
    Address::new(s)
}
