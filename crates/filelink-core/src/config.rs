//! 应用配置和持久化
//!
//! 提供重连超时、已知 WiFi 设备及其密码、自动重连地址等设置的存储和读取。

use crate::coordinator::CoordinatorConfig;
use crate::peripheral::{Address, PasswordLookup, Peripheral};
use crate::wifi::DEFAULT_PORT;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// 已知的 WiFi 设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiPeripheralConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl WifiPeripheralConfig {
    pub fn address(&self) -> Address {
        Address::new(format!("{}:{}", self.host, self.port))
    }

    fn matches(&self, name: &str, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host) || (!name.is_empty() && self.name == name)
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 单次重连超时（毫秒）
    pub reconnect_timeout_ms: u64,
    /// 蓝牙适配器名称（为空时使用默认适配器）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    /// 启动时尝试重连的已配对 BLE 地址
    pub auto_reconnect: Vec<Address>,
    /// 详细日志模式
    pub verbose: bool,
    /// 已知的 WiFi 设备（表数组须位于最后）
    pub wifi_peripherals: Vec<WifiPeripheralConfig>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            reconnect_timeout_ms: 5000,
            adapter: None,
            auto_reconnect: Vec::new(),
            verbose: false,
            wifi_peripherals: Vec::new(),
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filelink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    warn!("Failed to parse settings: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read settings file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
        }
    }

    /// 按设备名或主机名查找已保存的密码
    pub fn password_for(&self, name: &str, host: &str) -> Option<String> {
        self.wifi_peripherals
            .iter()
            .find(|p| p.matches(name, host))
            .and_then(|p| p.password.clone())
    }

    /// 密码查询回调，每次查询都读取共享设置的当前值
    pub fn password_lookup(settings: &Arc<Mutex<AppSettings>>) -> PasswordLookup {
        let settings = Arc::clone(settings);
        Arc::new(move |name: &str, host: &str| {
            settings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .password_for(name, host)
        })
    }

    /// 更新已知 WiFi 设备的密码；未知地址返回 `false`
    pub fn set_wifi_password(&mut self, address: &Address, password: &str) -> bool {
        match self
            .wifi_peripherals
            .iter_mut()
            .find(|p| &p.address() == address)
        {
            Some(peripheral) => {
                peripheral.password = Some(password.to_string());
                true
            }
            None => false,
        }
    }

    /// 配置中的 WiFi 设备，作为静态扫描结果
    pub fn wifi_scanner_peripherals(&self) -> Vec<Peripheral> {
        self.wifi_peripherals
            .iter()
            .map(|p| Peripheral::wifi(p.address(), Some(p.name.clone())))
            .collect()
    }
}
