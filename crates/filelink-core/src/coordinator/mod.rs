//! 连接协调器
//!
//! 把各传输的发现/连接/断开原语整合成一致的视图：哪些外设已连接、
//! 当前选中的是哪一个，并在连接意外丢失时自动有界重连。
//!
//! # 并发模型
//!
//! - 协调器是一个独立的 actor 任务，独占所有状态（注册表、正在建立的地址、
//!   选择、标志位），是唯一的写者
//! - [`ConnectionCoordinator`] 是可克隆的句柄，通过 inbox 发送命令并等待 oneshot 回复
//! - 传输层操作（连接、重连）在单独的任务中执行，完成后经 loopback 通道回到 actor
//! - 每个受管理的 BLE 外设有一个监督任务（见 `supervisor`）
//! - 外部只能通过 watch 快照读取状态
//!
//! # 过期结果
//!
//! 每次连接/重连尝试都有一个尝试 ID，记录在 `in_flight` 中。`disconnect`
//! 会移除该记录，之后到达的完成结果因 ID 不匹配而被丢弃，不会让已删除的
//! 条目复活。

mod registry;
mod supervisor;

use crate::bonded::{BondedPlatform, bonded_addresses, reconnect_to_peripherals};
use crate::client::TransferClient;
use crate::error::{ConnectError, CoordinatorError, ScanError};
use crate::peripheral::{
    Address, BleTransferPeripheral, ConnectionState, OnBonded, Peripheral, PeripheralFactory,
    TransportKind, TransportPeripheral,
};
use crate::scanner::{Scanner, ScanningState};
use log::{debug, error, info, warn};
use registry::Registry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use supervisor::{ManagedEntry, SupervisorEvent};
use tokio::sync::{mpsc, oneshot, watch};

/// 每次重连尝试的时间上限
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

const INBOX_CAPACITY: usize = 64;

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 单次重连（含批量重连中的每个地址）的超时
    pub reconnect_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: RECONNECT_TIMEOUT,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type ConnectReply = Reply<Result<TransferClient, CoordinatorError>>;

enum Command {
    Connect {
        peripheral: TransportPeripheral,
        select: bool,
        reply: ConnectReply,
    },
    Select {
        peripheral: Peripheral,
        reply: ConnectReply,
    },
    ReconnectBonded {
        addresses: BTreeSet<Address>,
        reply: Reply<bool>,
    },
    Disconnect {
        address: Address,
        cause: Option<String>,
        reply: Reply<()>,
    },
    UpdateWifiPassword {
        address: Address,
        password: String,
        reply: Reply<bool>,
    },
    ClearConnectionError,
    Client {
        address: Address,
        reply: Reply<Option<TransferClient>>,
    },
    Clean {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// actor 自己派发出去的任务的完成通知
pub(crate) enum Loopback {
    ConnectFinished {
        peripheral: TransportPeripheral,
        attempt: u64,
        select: bool,
        result: Result<(), ConnectError>,
        reply: ConnectReply,
    },
    BondedReconnectFinished {
        addresses: Vec<Address>,
        attempt: u64,
        ready: Vec<Arc<dyn BleTransferPeripheral>>,
        reply: Reply<bool>,
    },
    RecoveryFinished {
        address: Address,
        attempt: u64,
        affects_flag: bool,
        ready: Vec<Arc<dyn BleTransferPeripheral>>,
    },
    Supervisor(SupervisorEvent),
}

/// 连接协调器句柄
#[derive(Clone)]
pub struct ConnectionCoordinator {
    inbox: mpsc::Sender<Command>,
    factory: Arc<dyn PeripheralFactory>,
    platform: Arc<dyn BondedPlatform>,
    scanner: Arc<Scanner>,
    selected: watch::Receiver<Option<TransferClient>>,
    reconnecting_to_bonded: watch::Receiver<bool>,
    being_setup: watch::Receiver<Vec<Address>>,
    connected: watch::Receiver<Vec<Address>>,
    last_error: watch::Receiver<Option<CoordinatorError>>,
}

impl ConnectionCoordinator {
    /// 创建协调器并启动 actor 任务（必须在 tokio 运行时中调用）
    pub fn new(
        config: CoordinatorConfig,
        factory: Arc<dyn PeripheralFactory>,
        platform: Arc<dyn BondedPlatform>,
        scanner: Scanner,
        on_bonded: Option<OnBonded>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();

        let (selected_tx, selected) = watch::channel(None);
        let (reconnecting_tx, reconnecting_to_bonded) = watch::channel(false);
        let (being_setup_tx, being_setup) = watch::channel(Vec::new());
        let (connected_tx, connected) = watch::channel(Vec::new());
        let (last_error_tx, last_error) = watch::channel(None);

        let actor = CoordinatorActor {
            config,
            factory: Arc::clone(&factory),
            platform: Arc::clone(&platform),
            on_bonded,
            inbox: inbox_rx,
            loopback_tx,
            loopback_rx,
            signals: Signals {
                selected: selected_tx,
                reconnecting_to_bonded: reconnecting_tx,
                being_setup: being_setup_tx,
                connected: connected_tx,
                last_error: last_error_tx,
            },
            registry: Registry::default(),
            in_flight: BTreeMap::new(),
            reconnecting: HashSet::new(),
            managed: HashMap::new(),
            user_selection: None,
            next_id: 0,
        };
        tokio::spawn(actor.run());

        Self {
            inbox: inbox_tx,
            factory,
            platform,
            scanner: Arc::new(scanner),
            selected,
            reconnecting_to_bonded,
            being_setup,
            connected,
            last_error,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(command(tx))
            .await
            .map_err(|_| CoordinatorError::Shutdown)?;
        rx.await.map_err(|_| CoordinatorError::Shutdown)
    }

    // === 扫描 ===

    pub fn start_scan(&self) {
        self.scanner.start();
    }

    pub fn stop_scan(&self) {
        self.scanner.stop();
    }

    pub fn scanning_state(&self) -> watch::Receiver<ScanningState> {
        self.scanner.state()
    }

    /// 发现的外设列表
    pub fn peripherals(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.scanner.peripherals()
    }

    pub fn discovered_peripheral(&self, address: &Address) -> Option<Peripheral> {
        self.scanner
            .peripherals()
            .borrow()
            .iter()
            .find(|p| &p.address == address)
            .cloned()
    }

    pub fn scan_last_error(&self, kind: TransportKind) -> Option<ScanError> {
        self.scanner.last_error(kind)
    }

    pub fn clear_scan_last_error(&self, kind: TransportKind) {
        self.scanner.clear_last_error(kind);
    }

    // === 连接 ===

    /// 连接到发现的外设（单次尝试，不重试）
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<TransferClient, CoordinatorError> {
        let Some(transport) = self.factory.create(peripheral) else {
            error!(
                "Can't connect to unknown peripheral type: {}",
                peripheral.name_or_address()
            );
            return Err(CoordinatorError::UnknownPeripheralType(
                peripheral.address.clone(),
            ));
        };
        self.connect_peripheral(transport).await
    }

    /// 连接到已构造好的外设对象
    pub async fn connect_peripheral(
        &self,
        peripheral: TransportPeripheral,
    ) -> Result<TransferClient, CoordinatorError> {
        self.request(|reply| Command::Connect {
            peripheral,
            select: false,
            reply,
        })
        .await?
    }

    /// 选中外设；未连接时先连接
    ///
    /// 已连接的地址直接选中，不产生任何网络操作。连接失败时选择保持不变。
    pub async fn set_selected_peripheral(
        &self,
        peripheral: &Peripheral,
    ) -> Result<TransferClient, CoordinatorError> {
        let peripheral = peripheral.clone();
        self.request(|reply| Command::Select { peripheral, reply })
            .await?
    }

    /// 重连已配对的外设
    ///
    /// 未配对的地址被静默忽略；没有可重连的地址时返回 `false` 且不改变状态。
    /// 至少一个外设就绪时返回 `true`，并选中第一个就绪的外设。
    pub async fn reconnect_to_bonded_peripherals(
        &self,
        known_addresses: impl IntoIterator<Item = Address>,
    ) -> bool {
        let known: BTreeSet<Address> = known_addresses.into_iter().collect();
        let bonded = bonded_addresses(self.platform.as_ref()).await;
        let addresses: BTreeSet<Address> = known.intersection(&bonded).cloned().collect();

        if addresses.is_empty() {
            debug!("No bonded peripherals among {} known address(es)", known.len());
            return false;
        }

        self.request(|reply| Command::ReconnectBonded { addresses, reply })
            .await
            .unwrap_or(false)
    }

    /// 断开并停止管理该地址
    pub async fn disconnect(&self, address: &Address, cause: Option<String>) {
        let address = address.clone();
        if self
            .request(|reply| Command::Disconnect {
                address,
                cause,
                reply,
            })
            .await
            .is_err()
        {
            warn!("Disconnect requested after coordinator shutdown");
        }
    }

    /// 修改已注册 WiFi 外设的密码，不会触发重连
    pub async fn update_wifi_password(&self, address: &Address, password: String) -> bool {
        let address = address.clone();
        self.request(|reply| Command::UpdateWifiPassword {
            address,
            password,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn client(&self, address: &Address) -> Option<TransferClient> {
        let address = address.clone();
        self.request(|reply| Command::Client { address, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn clear_connection_last_error(&self) {
        let _ = self.inbox.send(Command::ClearConnectionError).await;
    }

    /// 取消所有监督任务和正在进行的自动恢复
    pub async fn clean(&self) {
        let _ = self.request(|reply| Command::Clean { reply }).await;
    }

    /// 停止扫描、取消所有监督任务并结束 actor
    pub async fn shutdown(&self) {
        self.scanner.stop();
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    // === 状态快照 ===

    pub fn selected_client(&self) -> watch::Receiver<Option<TransferClient>> {
        self.selected.clone()
    }

    pub fn current_client(&self) -> Option<TransferClient> {
        self.selected.borrow().clone()
    }

    pub fn is_reconnecting_to_bonded_peripherals(&self) -> watch::Receiver<bool> {
        self.reconnecting_to_bonded.clone()
    }

    pub fn addresses_being_setup(&self) -> watch::Receiver<Vec<Address>> {
        self.being_setup.clone()
    }

    /// 已注册客户端的地址（按连接先后）
    pub fn connected_addresses(&self) -> watch::Receiver<Vec<Address>> {
        self.connected.clone()
    }

    pub fn connection_last_error(&self) -> watch::Receiver<Option<CoordinatorError>> {
        self.last_error.clone()
    }
}

struct Signals {
    selected: watch::Sender<Option<TransferClient>>,
    reconnecting_to_bonded: watch::Sender<bool>,
    being_setup: watch::Sender<Vec<Address>>,
    connected: watch::Sender<Vec<Address>>,
    last_error: watch::Sender<Option<CoordinatorError>>,
}

/// 正在进行的连接/重连
struct InFlight {
    attempt: u64,
    /// 首次连接时的外设对象，断开时需要通知它
    peripheral: Option<TransportPeripheral>,
    /// 恢复选中外设时设置了重连标志，取消时需要复位
    affects_flag: bool,
}

struct CoordinatorActor {
    config: CoordinatorConfig,
    factory: Arc<dyn PeripheralFactory>,
    platform: Arc<dyn BondedPlatform>,
    on_bonded: Option<OnBonded>,
    inbox: mpsc::Receiver<Command>,
    loopback_tx: mpsc::UnboundedSender<Loopback>,
    loopback_rx: mpsc::UnboundedReceiver<Loopback>,
    signals: Signals,

    registry: Registry,
    in_flight: BTreeMap<Address, InFlight>,
    /// 监督任务发起重连、尚未恢复的地址
    reconnecting: HashSet<Address>,
    managed: HashMap<Address, ManagedEntry>,
    user_selection: Option<Address>,
    next_id: u64,
}

impl CoordinatorActor {
    async fn run(mut self) {
        info!("Connection coordinator started");

        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = self.loopback_rx.recv() => {
                    self.handle_loopback(event);
                }
            }
        }

        self.clean(Some("coordinator stopped"));
        info!("Connection coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect {
                peripheral,
                select,
                reply,
            } => self.start_connect(peripheral, select, reply),
            Command::Select { peripheral, reply } => self.select(&peripheral, reply),
            Command::ReconnectBonded { addresses, reply } => {
                self.start_bonded_reconnect(addresses, reply);
            }
            Command::Disconnect {
                address,
                cause,
                reply,
            } => {
                self.disconnect(&address, cause);
                let _ = reply.send(());
            }
            Command::UpdateWifiPassword {
                address,
                password,
                reply,
            } => {
                let _ = reply.send(self.update_wifi_password(&address, password));
            }
            Command::ClearConnectionError => {
                self.signals.last_error.send_replace(None);
            }
            Command::Client { address, reply } => {
                let _ = reply.send(self.registry.get(&address).cloned());
            }
            Command::Clean { reply } => {
                self.clean(None);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_loopback(&mut self, event: Loopback) {
        match event {
            Loopback::ConnectFinished {
                peripheral,
                attempt,
                select,
                result,
                reply,
            } => self.on_connect_finished(peripheral, attempt, select, result, reply),
            Loopback::BondedReconnectFinished {
                addresses,
                attempt,
                ready,
                reply,
            } => self.on_bonded_reconnect_finished(&addresses, attempt, ready, reply),
            Loopback::RecoveryFinished {
                address,
                attempt,
                affects_flag,
                ready,
            } => self.on_recovery_finished(&address, attempt, affects_flag, ready),
            Loopback::Supervisor(event) => self.on_supervisor_event(event),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // === 正在建立的连接 ===

    fn begin_setup(
        &mut self,
        address: &Address,
        attempt: u64,
        peripheral: Option<TransportPeripheral>,
        affects_flag: bool,
    ) {
        self.in_flight.insert(
            address.clone(),
            InFlight {
                attempt,
                peripheral,
                affects_flag,
            },
        );
        self.publish_being_setup();
    }

    /// 结束一次尝试；返回该尝试是否仍然有效
    fn finish_setup(&mut self, address: &Address, attempt: u64) -> bool {
        match self.in_flight.get(address) {
            Some(in_flight) if in_flight.attempt == attempt => {
                self.in_flight.remove(address);
                self.publish_being_setup();
                true
            }
            _ => false,
        }
    }

    fn publish_being_setup(&self) {
        let addresses: Vec<Address> = self.in_flight.keys().cloned().collect();
        self.signals.being_setup.send_if_modified(|current| {
            if *current == addresses {
                false
            } else {
                *current = addresses;
                true
            }
        });
    }

    // === 选择 ===

    fn selected_address(&self) -> Option<Address> {
        self.signals
            .selected
            .borrow()
            .as_ref()
            .map(TransferClient::address)
    }

    fn is_selected(&self, address: &Address) -> bool {
        self.selected_address().as_ref() == Some(address)
    }

    /// 注册表变化后重新计算选择并发布快照
    fn update_selection(&mut self) {
        let previous = self.selected_address();
        let selected = self.registry.select(self.user_selection.as_ref());
        let current = selected.as_ref().map(TransferClient::address);

        if previous != current {
            info!(
                "Selected peripheral ({} connected): {}",
                self.registry.len(),
                selected
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |c| c.info().name_or_address())
            );
        }
        self.signals.selected.send_replace(selected);

        let connected = self.registry.addresses();
        self.signals.connected.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    fn remove_client(&mut self, address: &Address) {
        if self.registry.remove(address).is_some() {
            info!("Removed client for {}", address);
        }
        if self.user_selection.as_ref() == Some(address) {
            self.user_selection = None;
        }
    }

    // === 连接 ===

    fn select(&mut self, peripheral: &Peripheral, reply: ConnectReply) {
        if let Some(client) = self.registry.get(&peripheral.address).cloned() {
            self.user_selection = Some(peripheral.address.clone());
            self.update_selection();
            let _ = reply.send(Ok(client));
            return;
        }

        match self.factory.create(peripheral) {
            Some(transport) => self.start_connect(transport, true, reply),
            None => {
                error!(
                    "Can't connect to unknown peripheral type: {}",
                    peripheral.name_or_address()
                );
                let _ = reply.send(Err(CoordinatorError::UnknownPeripheralType(
                    peripheral.address.clone(),
                )));
            }
        }
    }

    fn start_connect(&mut self, peripheral: TransportPeripheral, select: bool, reply: ConnectReply) {
        let address = peripheral.address();

        if let Some(client) = self.registry.get(&address).cloned() {
            debug!("{} is already connected", address);
            if select {
                self.user_selection = Some(address);
                self.update_selection();
            }
            let _ = reply.send(Ok(client));
            return;
        }

        if self.in_flight.contains_key(&address) || self.reconnecting.contains(&address) {
            warn!("Ignoring connect to {}: already being set up", address);
            let _ = reply.send(Err(CoordinatorError::SetupInProgress(address)));
            return;
        }

        let attempt = self.next_id();
        self.begin_setup(&address, attempt, Some(peripheral.clone()), false);
        info!(
            "Connecting to {} via {}",
            peripheral.peripheral().name_or_address(),
            peripheral.kind()
        );

        let loopback = self.loopback_tx.clone();
        tokio::spawn(async move {
            let result = peripheral.connect_and_setup().await;
            let _ = loopback.send(Loopback::ConnectFinished {
                peripheral,
                attempt,
                select,
                result,
                reply,
            });
        });
    }

    fn on_connect_finished(
        &mut self,
        peripheral: TransportPeripheral,
        attempt: u64,
        select: bool,
        result: Result<(), ConnectError>,
        reply: ConnectReply,
    ) {
        let address = peripheral.address();
        let name = peripheral.peripheral().name_or_address();

        if !self.finish_setup(&address, attempt) {
            debug!("Discarding superseded connect result for {}", name);
            if result.is_ok() {
                spawn_disconnect(peripheral, Some("connect cancelled".to_string()));
            }
            let _ = reply.send(Err(CoordinatorError::Cancelled(address)));
            return;
        }

        info!("Connect to {} finished: success={}", name, result.is_ok());

        match result {
            Ok(()) => {
                let client = self.registry.upsert(peripheral.clone());
                if select {
                    self.user_selection = Some(address);
                }
                self.update_selection();

                if let TransportPeripheral::Ble(ble) = peripheral {
                    self.supervise(ble);
                }
                let _ = reply.send(Ok(client));
            }
            Err(source) => {
                warn!("Can't connect to {}: {}", name, source);
                let error = CoordinatorError::Connect { name, source };
                self.signals.last_error.send_replace(Some(error.clone()));
                let _ = reply.send(Err(error));
            }
        }
    }

    fn start_bonded_reconnect(&mut self, addresses: BTreeSet<Address>, reply: Reply<bool>) {
        // 已在连接或已受管理的地址不重复发起
        let addresses: Vec<Address> = addresses
            .into_iter()
            .filter(|address| {
                let busy = self.in_flight.contains_key(address) || self.managed.contains_key(address);
                if busy {
                    debug!("Skipping bonded reconnect of {}: already managed", address);
                }
                !busy
            })
            .collect();

        if addresses.is_empty() {
            let _ = reply.send(false);
            return;
        }

        info!("Reconnecting to {} bonded peripheral(s)", addresses.len());
        self.signals.reconnecting_to_bonded.send_replace(true);
        let attempt = self.next_id();
        for address in &addresses {
            self.in_flight.insert(
                address.clone(),
                InFlight {
                    attempt,
                    peripheral: None,
                    affects_flag: false,
                },
            );
        }
        self.publish_being_setup();

        let platform = Arc::clone(&self.platform);
        let timeout = self.config.reconnect_timeout;
        let on_bonded = self.on_bonded.clone();
        let loopback = self.loopback_tx.clone();
        tokio::spawn(async move {
            let ready = reconnect_to_peripherals(platform.as_ref(), &addresses, timeout, on_bonded).await;
            let _ = loopback.send(Loopback::BondedReconnectFinished {
                addresses,
                attempt,
                ready,
                reply,
            });
        });
    }

    fn on_bonded_reconnect_finished(
        &mut self,
        addresses: &[Address],
        attempt: u64,
        ready: Vec<Arc<dyn BleTransferPeripheral>>,
        reply: Reply<bool>,
    ) {
        self.signals.reconnecting_to_bonded.send_replace(false);

        let mut current = HashSet::new();
        for address in addresses {
            if self.finish_setup(address, attempt) {
                current.insert(address.clone());
            }
        }

        let mut ready_now = Vec::new();
        for peripheral in ready {
            if current.contains(&peripheral.peripheral().address) {
                ready_now.push(peripheral);
            } else {
                spawn_disconnect(
                    TransportPeripheral::Ble(peripheral),
                    Some("reconnect cancelled".to_string()),
                );
            }
        }

        let Some(first) = ready_now.first().map(|p| p.peripheral()) else {
            info!("No bonded peripheral reconnected");
            let _ = reply.send(false);
            return;
        };
        info!("Reconnected to bonded {}", first.name_or_address());

        for peripheral in ready_now {
            self.registry
                .upsert(TransportPeripheral::Ble(Arc::clone(&peripheral)));
            self.supervise(peripheral);
        }
        self.user_selection = Some(first.address);
        self.update_selection();
        let _ = reply.send(true);
    }

    fn disconnect(&mut self, address: &Address, cause: Option<String>) {
        info!("Disconnecting {}", address);
        self.detach(address, cause.as_deref());
        self.reconnecting.remove(address);

        let mut targets = Vec::new();
        if let Some(in_flight) = self.in_flight.remove(address) {
            self.publish_being_setup();
            if in_flight.affects_flag {
                self.signals.reconnecting_to_bonded.send_replace(false);
            }
            targets.extend(in_flight.peripheral);
        }

        let was_selected = self.is_selected(address);
        if let Some(client) = self.registry.remove(address) {
            targets.push(client.transport().clone());
        }
        for peripheral in targets {
            spawn_disconnect(peripheral, cause.clone());
        }

        if was_selected || self.user_selection.as_ref() == Some(address) {
            self.user_selection = None;
        }
        self.update_selection();
    }

    fn update_wifi_password(&mut self, address: &Address, password: String) -> bool {
        match self
            .registry
            .get(address)
            .and_then(|client| client.transport().as_wifi())
        {
            Some(wifi) => {
                wifi.set_password(password);
                true
            }
            None => false,
        }
    }

    // === 受管理的 BLE 外设 ===

    /// 开始监督；同一地址已有监督任务时替换之
    fn supervise(&mut self, peripheral: Arc<dyn BleTransferPeripheral>) {
        let address = peripheral.peripheral().address;
        self.detach(&address, Some("replaced"));
        let generation = self.next_id();
        let entry = ManagedEntry::spawn(peripheral, generation, self.loopback_tx.clone());
        self.managed.insert(address, entry);
    }

    fn detach(&mut self, address: &Address, cause: Option<&str>) {
        if let Some(entry) = self.managed.remove(address) {
            entry.cancel(cause);
        }
    }

    /// 取消所有监督任务和正在进行的恢复；迟到的恢复结果会因尝试 ID 失效而被丢弃
    fn clean(&mut self, cause: Option<&str>) {
        for (_, entry) in self.managed.drain() {
            entry.cancel(cause);
        }

        let mut affects_flag = false;
        for address in self.reconnecting.drain() {
            if let Some(in_flight) = self.in_flight.remove(&address) {
                affects_flag |= in_flight.affects_flag;
            }
        }
        if affects_flag {
            self.signals.reconnecting_to_bonded.send_replace(false);
        }
        self.publish_being_setup();
    }

    fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        let peripheral = self
            .managed
            .get(&event.address)
            .filter(|entry| entry.generation == event.generation)
            .map(|entry| Arc::clone(&entry.peripheral));
        let Some(peripheral) = peripheral else {
            debug!("Ignoring stale state {:?} of {}", event.state, event.address);
            return;
        };

        match event.state {
            ConnectionState::Connecting => {}
            ConnectionState::Enabled => self.on_enabled(peripheral),
            ConnectionState::Disconnected(reason) => {
                debug!(
                    "{} disconnected: {}",
                    event.address,
                    reason.as_deref().unwrap_or("unknown reason")
                );
                self.on_disconnected(&event.address);
            }
            ConnectionState::Error(cause) => {
                warn!("{} reported error: {}", event.address, cause);
                self.reconnection_failed(&event.address);
            }
        }
    }

    fn on_enabled(&mut self, peripheral: Arc<dyn BleTransferPeripheral>) {
        let address = peripheral.peripheral().address;
        self.reconnecting.remove(&address);
        self.registry.upsert(TransportPeripheral::Ble(peripheral));

        // 选中的外设恢复了（例如写文件系统时的短暂断开）
        if self.is_selected(&address) {
            self.signals.reconnecting_to_bonded.send_replace(false);
        }
        self.update_selection();
    }

    fn on_disconnected(&mut self, address: &Address) {
        if self.reconnecting.contains(address) {
            info!("Recover failed for {}", address);
            self.reconnection_failed(address);
        } else if self.is_selected(address) {
            // 等待恢复之后再考虑切换到其他外设
            info!("Try to recover disconnected peripheral: {}", address);
            self.signals.reconnecting_to_bonded.send_replace(true);
            self.start_recovery(address.clone(), true);
        } else {
            info!("Try to recover disconnected background peripheral: {}", address);
            self.start_recovery(address.clone(), false);
        }
    }

    fn reconnection_failed(&mut self, address: &Address) {
        self.reconnecting.remove(address);
        if self.is_selected(address) {
            self.signals.reconnecting_to_bonded.send_replace(false);
        }
        self.remove_client(address);
        self.update_selection();
    }

    fn start_recovery(&mut self, address: Address, affects_flag: bool) {
        self.detach(&address, Some("recovering"));
        self.reconnecting.insert(address.clone());
        let attempt = self.next_id();
        self.begin_setup(&address, attempt, None, affects_flag);

        let platform = Arc::clone(&self.platform);
        let timeout = self.config.reconnect_timeout;
        let on_bonded = self.on_bonded.clone();
        let loopback = self.loopback_tx.clone();
        tokio::spawn(async move {
            let ready = reconnect_to_peripherals(
                platform.as_ref(),
                std::slice::from_ref(&address),
                timeout,
                on_bonded,
            )
            .await;
            let _ = loopback.send(Loopback::RecoveryFinished {
                address,
                attempt,
                affects_flag,
                ready,
            });
        });
    }

    fn on_recovery_finished(
        &mut self,
        address: &Address,
        attempt: u64,
        affects_flag: bool,
        ready: Vec<Arc<dyn BleTransferPeripheral>>,
    ) {
        if !self.finish_setup(address, attempt) {
            debug!("Discarding superseded reconnection of {}", address);
            for peripheral in ready {
                spawn_disconnect(
                    TransportPeripheral::Ble(peripheral),
                    Some("reconnect cancelled".to_string()),
                );
            }
            return;
        }

        if ready.is_empty() {
            info!("Recover failed for {}. Auto-select another peripheral", address);
            self.reconnecting.remove(address);
            self.remove_client(address);
            self.update_selection();
            if affects_flag {
                self.signals.reconnecting_to_bonded.send_replace(false);
            }
            return;
        }

        // 重新监督；收到 Enabled 时才清除重连标记
        for peripheral in ready {
            self.supervise(peripheral);
        }
    }
}

fn spawn_disconnect(peripheral: TransportPeripheral, cause: Option<String>) {
    tokio::spawn(async move {
        peripheral.disconnect(cause).await;
    });
}
