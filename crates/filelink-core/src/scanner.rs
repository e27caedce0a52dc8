//! 扫描聚合
//!
//! 每种传输各有一个扫描器（BLE 由 BlueZ 提供，WiFi 一般来自 mDNS 或配置），
//! [`Scanner`] 把它们合并成一个发现列表和一个整体扫描状态。
//!
//! # 合并规则
//!
//! - 外设按地址去重，后出现的非空名称会刷新已有条目
//! - 任一扫描器在扫描 → `Scanning`
//! - 没有扫描器在扫描且有扫描器出错 → `Error`
//! - 其他情况 → `Idle`

use crate::error::ScanError;
use crate::peripheral::{Peripheral, TransportKind};
use futures_util::StreamExt;
use futures_util::stream::select_all;
use log::{debug, info};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

/// 单个扫描器的状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScannerState {
    #[default]
    Idle,
    Scanning,
    Error(ScanError),
}

/// 聚合后的扫描状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanningState {
    #[default]
    Idle,
    Scanning { peripherals: Vec<Peripheral> },
    Error(ScanError),
}

impl ScanningState {
    pub fn is_scanning(&self) -> bool {
        matches!(self, ScanningState::Scanning { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScanningState::Idle => "idle",
            ScanningState::Scanning { .. } => "scanning",
            ScanningState::Error(_) => "error",
        }
    }
}

/// 单一传输的扫描器
pub trait PeripheralScanner: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn start(&self);

    fn stop(&self);

    fn state(&self) -> watch::Receiver<ScannerState>;

    /// 当前已发现的外设
    fn peripherals(&self) -> watch::Receiver<Vec<Peripheral>>;

    fn last_error(&self) -> Option<ScanError>;

    fn clear_last_error(&self);
}

struct ScanTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 多个扫描器的聚合
pub struct Scanner {
    scanners: Vec<Arc<dyn PeripheralScanner>>,
    state: Arc<watch::Sender<ScanningState>>,
    peripherals: Arc<watch::Sender<Vec<Peripheral>>>,
    task: Mutex<Option<ScanTask>>,
}

impl Scanner {
    pub fn new(scanners: Vec<Arc<dyn PeripheralScanner>>) -> Self {
        let (state, _) = watch::channel(ScanningState::Idle);
        let (peripherals, _) = watch::channel(Vec::new());
        Self {
            scanners,
            state: Arc::new(state),
            peripherals: Arc::new(peripherals),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<ScanningState> {
        self.state.subscribe()
    }

    pub fn peripherals(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.peripherals.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 启动所有扫描器并开始合并结果（重复调用无效果）
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        info!("Starting scan on {} scanner(s)", self.scanners.len());
        for scanner in &self.scanners {
            scanner.start();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(merge_loop(
            self.scanners.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.peripherals),
            token.clone(),
        ));
        *task = Some(ScanTask { token, handle });
    }

    pub fn stop(&self) {
        let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        task.token.cancel();
        task.handle.abort();
        for scanner in &self.scanners {
            scanner.stop();
        }
        self.state.send_replace(ScanningState::Idle);
        info!("Scan stopped");
    }

    pub fn last_error(&self, kind: TransportKind) -> Option<ScanError> {
        self.scanners
            .iter()
            .filter(|s| s.kind() == kind)
            .find_map(|s| s.last_error())
    }

    pub fn clear_last_error(&self, kind: TransportKind) {
        for scanner in self.scanners.iter().filter(|s| s.kind() == kind) {
            scanner.clear_last_error();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.token.cancel();
            task.handle.abort();
        }
    }
}

async fn merge_loop(
    scanners: Vec<Arc<dyn PeripheralScanner>>,
    state: Arc<watch::Sender<ScanningState>>,
    peripherals: Arc<watch::Sender<Vec<Peripheral>>>,
    token: CancellationToken,
) {
    let state_rxs: Vec<_> = scanners.iter().map(|s| s.state()).collect();
    let peripheral_rxs: Vec<_> = scanners.iter().map(|s| s.peripherals()).collect();

    // 任一扫描器的状态或外设列表变化都触发重新合并
    let mut changes = select_all(
        state_rxs
            .iter()
            .cloned()
            .map(|rx| WatchStream::new(rx).map(|_| ()).boxed())
            .chain(
                peripheral_rxs
                    .iter()
                    .cloned()
                    .map(|rx| WatchStream::new(rx).map(|_| ()).boxed()),
            ),
    );

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            change = changes.next() => {
                if change.is_none() {
                    break;
                }
            }
        }

        let states: Vec<ScannerState> = state_rxs.iter().map(|rx| rx.borrow().clone()).collect();
        let lists: Vec<Vec<Peripheral>> =
            peripheral_rxs.iter().map(|rx| rx.borrow().clone()).collect();
        let merged = merge_peripherals(lists);
        let aggregated = aggregate_state(&states, &merged);

        if aggregated.is_scanning() {
            peripherals.send_if_modified(|current| {
                if *current == merged {
                    false
                } else {
                    debug!("Discovered peripherals: {}", merged.len());
                    *current = merged.clone();
                    true
                }
            });
        }
        state.send_if_modified(|current| {
            if *current == aggregated {
                false
            } else {
                *current = aggregated;
                true
            }
        });
    }
}

/// 按地址去重合并，保留首次出现的位置
pub(crate) fn merge_peripherals(lists: Vec<Vec<Peripheral>>) -> Vec<Peripheral> {
    let mut merged: Vec<Peripheral> = Vec::new();
    for peripheral in lists.into_iter().flatten() {
        match merged.iter_mut().find(|p| p.address == peripheral.address) {
            Some(existing) => {
                if peripheral.name.is_some() {
                    existing.name = peripheral.name;
                }
            }
            None => merged.push(peripheral),
        }
    }
    merged
}

pub(crate) fn aggregate_state(states: &[ScannerState], peripherals: &[Peripheral]) -> ScanningState {
    if states.iter().any(|s| *s == ScannerState::Scanning) {
        return ScanningState::Scanning {
            peripherals: peripherals.to_vec(),
        };
    }
    states
        .iter()
        .find_map(|s| match s {
            ScannerState::Error(e) => Some(ScanningState::Error(e.clone())),
            _ => None,
        })
        .unwrap_or(ScanningState::Idle)
}

/// 发布固定外设列表的扫描器（例如配置文件中的 WiFi 设备）
pub struct StaticScanner {
    kind: TransportKind,
    known: Vec<Peripheral>,
    state: watch::Sender<ScannerState>,
    peripherals: watch::Sender<Vec<Peripheral>>,
}

impl StaticScanner {
    pub fn new(kind: TransportKind, known: Vec<Peripheral>) -> Self {
        let (state, _) = watch::channel(ScannerState::Idle);
        let (peripherals, _) = watch::channel(Vec::new());
        Self {
            kind,
            known,
            state,
            peripherals,
        }
    }
}

impl PeripheralScanner for StaticScanner {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn start(&self) {
        self.peripherals.send_replace(self.known.clone());
        self.state.send_replace(ScannerState::Scanning);
    }

    fn stop(&self) {
        self.state.send_replace(ScannerState::Idle);
    }

    fn state(&self) -> watch::Receiver<ScannerState> {
        self.state.subscribe()
    }

    fn peripherals(&self) -> watch::Receiver<Vec<Peripheral>> {
        self.peripherals.subscribe()
    }

    fn last_error(&self) -> Option<ScanError> {
        None
    }

    fn clear_last_error(&self) {}
}
