//! Core Service - 组装传输、扫描器和连接协调器

use filelink_core::{
    AppSettings, BondedPeripherals, BondedPlatform, ConnectionCoordinator, HttpFileTransferPeripheral,
    NoBondedPlatform, OnBonded, Peripheral, PeripheralFactory, PeripheralScanner, Scanner,
    StaticScanner, TransportKind, TransportPeripheral,
};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "bluez")]
use filelink_core::ble::bluez::{BluezPlatform, BluezScanner};

pub type SharedSettings = Arc<Mutex<AppSettings>>;

pub fn lock(settings: &SharedSettings) -> std::sync::MutexGuard<'_, AppSettings> {
    settings.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 守护进程使用的外设工厂
struct DaemonTransports {
    settings: SharedSettings,
    #[cfg(feature = "bluez")]
    on_bonded: OnBonded,
    #[cfg(feature = "bluez")]
    bluez: Option<Arc<BluezPlatform>>,
}

impl PeripheralFactory for DaemonTransports {
    fn create(&self, peripheral: &Peripheral) -> Option<TransportPeripheral> {
        match peripheral.kind {
            TransportKind::Wifi => {
                let lookup = AppSettings::password_lookup(&self.settings);
                match HttpFileTransferPeripheral::new(peripheral.clone(), None, Some(lookup)) {
                    Ok(wifi) => Some(TransportPeripheral::Wifi(Arc::new(wifi))),
                    Err(e) => {
                        tracing::warn!("Can't create WiFi peripheral {}: {}", peripheral.address, e);
                        None
                    }
                }
            }
            #[cfg(feature = "bluez")]
            TransportKind::Ble => {
                let bluez = self.bluez.as_ref()?;
                match bluez.peripheral(peripheral, Some(Arc::clone(&self.on_bonded))) {
                    Ok(ble) => Some(TransportPeripheral::Ble(Arc::new(ble))),
                    Err(e) => {
                        tracing::warn!("Can't create BLE peripheral {}: {}", peripheral.address, e);
                        None
                    }
                }
            }
            #[cfg(not(feature = "bluez"))]
            TransportKind::Ble => None,
        }
    }
}

/// 守护进程的共享状态
pub struct Service {
    pub coordinator: ConnectionCoordinator,
    pub bonded: Arc<BondedPeripherals>,
    pub settings: SharedSettings,
}

impl Service {
    pub async fn new(settings: AppSettings) -> Self {
        let config = settings.coordinator_config();
        let wifi_known = settings.wifi_scanner_peripherals();
        let adapter = settings.adapter.clone();
        let settings: SharedSettings = Arc::new(Mutex::new(settings));

        #[cfg_attr(not(feature = "bluez"), allow(unused_mut))]
        let mut scanners: Vec<Arc<dyn PeripheralScanner>> =
            vec![Arc::new(StaticScanner::new(TransportKind::Wifi, wifi_known))];

        #[cfg(feature = "bluez")]
        let bluez = match BluezPlatform::new(adapter.as_deref()).await {
            Ok(platform) => {
                scanners.push(Arc::new(BluezScanner::new(platform.adapter().clone())));
                Some(Arc::new(platform))
            }
            Err(e) => {
                tracing::warn!("BLE unavailable: {}", e);
                None
            }
        };
        #[cfg(feature = "bluez")]
        let platform: Arc<dyn BondedPlatform> = match &bluez {
            Some(bluez) => bluez.clone(),
            None => Arc::new(NoBondedPlatform),
        };

        #[cfg(not(feature = "bluez"))]
        let platform: Arc<dyn BondedPlatform> = {
            if let Some(adapter) = adapter {
                tracing::info!("Built without BlueZ support, ignoring adapter '{}'", adapter);
            }
            Arc::new(NoBondedPlatform)
        };

        let bonded = Arc::new(BondedPeripherals::new(Arc::clone(&platform)).await);
        let records = Arc::clone(&bonded);
        let on_bonded: OnBonded = Arc::new(move |name, address| {
            tracing::info!("Bonded with {}", address);
            records.add(name, address);
        });

        let factory = Arc::new(DaemonTransports {
            settings: Arc::clone(&settings),
            #[cfg(feature = "bluez")]
            on_bonded: Arc::clone(&on_bonded),
            #[cfg(feature = "bluez")]
            bluez,
        });

        let coordinator = ConnectionCoordinator::new(
            config,
            factory,
            platform,
            Scanner::new(scanners),
            Some(on_bonded),
        );

        Self {
            coordinator,
            bonded,
            settings,
        }
    }

    /// 按地址查找外设：先查扫描结果，再查配置中的 WiFi 设备和已配对记录
    pub fn find_peripheral(&self, address: &filelink_core::Address) -> Option<Peripheral> {
        if let Some(peripheral) = self.coordinator.discovered_peripheral(address) {
            return Some(peripheral);
        }
        if let Some(peripheral) = lock(&self.settings)
            .wifi_scanner_peripherals()
            .into_iter()
            .find(|p| &p.address == address)
        {
            return Some(peripheral);
        }
        self.bonded
            .snapshot()
            .into_iter()
            .find(|r| &r.address == address)
            .map(|r| Peripheral::ble(r.address, r.name))
    }

    /// 启动时重连配置中的地址，失败则开始扫描
    pub async fn auto_reconnect(&self) {
        let addresses = lock(&self.settings).auto_reconnect.clone();
        if addresses.is_empty() {
            return;
        }

        tracing::info!("Reconnecting to {} known peripheral(s)", addresses.len());
        if !self.coordinator.reconnect_to_bonded_peripherals(addresses).await {
            tracing::info!("No known peripheral reconnected, starting scan");
            self.coordinator.start_scan();
        }
    }
}
