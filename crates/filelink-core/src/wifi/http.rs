//! HTTP 文件传输外设
//!
//! 连接即一次带认证的 `GET /cp/version.json`：
//!
//! - 2xx → `Enabled`，记录设备版本信息，认证成功的密码会被保存
//! - 401/403 → `Error`，返回 [`ConnectError::Unauthorized`]
//! - 其他状态码 → `Error`
//! - 网络错误 → `Disconnected`
//!
//! 密码优先使用已保存的值，否则通过 [`PasswordLookup`] 按 `(name, host)` 查询。

use super::{DeviceVersion, split_host_port};
use crate::error::{ConnectError, PlatformError};
use crate::peripheral::{
    ConnectionState, PasswordLookup, Peripheral, TransferPeripheral, WifiTransferPeripheral,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_PATH: &str = "/cp/version.json";

pub struct HttpFileTransferPeripheral {
    peripheral: Mutex<Peripheral>,
    host: String,
    port: u16,
    password: Mutex<Option<String>>,
    lookup: Option<PasswordLookup>,
    version: Mutex<Option<DeviceVersion>>,
    client: reqwest::Client,
    state: watch::Sender<ConnectionState>,
}

impl HttpFileTransferPeripheral {
    pub fn new(
        peripheral: Peripheral,
        password: Option<String>,
        lookup: Option<PasswordLookup>,
    ) -> Result<Self, PlatformError> {
        let (host, port) = split_host_port(peripheral.address.as_str())?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Other(e.to_string()))?;
        let (state, _) = watch::channel(ConnectionState::default());

        Ok(Self {
            peripheral: Mutex::new(peripheral),
            host,
            port,
            password: Mutex::new(password),
            lookup,
            version: Mutex::new(None),
            client,
            state,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 最近一次成功连接时读取的版本信息
    pub fn device_version(&self) -> Option<DeviceVersion> {
        self.version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resolve_password(&self) -> Option<String> {
        if let Some(password) = self.password() {
            return Some(password);
        }
        let lookup = self.lookup.as_ref()?;
        let name = self.peripheral().name.unwrap_or_default();
        lookup(&name, &self.host)
    }

    fn version_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, VERSION_PATH)
    }

    fn fail(&self, state: ConnectionState, error: ConnectError) -> Result<(), ConnectError> {
        warn!("Connect to {}:{} failed: {}", self.host, self.port, error);
        self.state.send_replace(state);
        Err(error)
    }
}

#[async_trait]
impl TransferPeripheral for HttpFileTransferPeripheral {
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

        let password = self.resolve_password();
        let url = self.version_url();
        debug!("GET {} (password: {})", url, password.is_some());

        let mut request = self.client.get(&url);
        if let Some(password) = &password {
            request = request.basic_auth("", Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let cause = e.to_string();
                return self.fail(
                    ConnectionState::Disconnected(Some(cause.clone())),
                    ConnectError::Failed(cause),
                );
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return self.fail(
                ConnectionState::Error("Unauthorized".to_string()),
                ConnectError::Unauthorized,
            );
        }
        if !status.is_success() {
            let cause = format!("Unexpected status {status}");
            return self.fail(
                ConnectionState::Error(cause.clone()),
                ConnectError::Setup(cause),
            );
        }

        // 旧固件可能返回非 JSON 内容，此时只是没有版本信息
        match response.json::<DeviceVersion>().await {
            Ok(version) => {
                if let Some(board) = &version.board_name {
                    info!("Connected to {} ({})", self.host, board);
                }
                let mut peripheral = self.peripheral.lock().unwrap_or_else(PoisonError::into_inner);
                if peripheral.name.is_none() {
                    peripheral.name.clone_from(&version.hostname);
                }
                drop(peripheral);
                *self.version.lock().unwrap_or_else(PoisonError::into_inner) = Some(version);
            }
            Err(e) => debug!("Ignoring unreadable version info from {}: {}", self.host, e),
        }

        if let Some(password) = password {
            self.set_password(password);
        }
        self.state.send_replace(ConnectionState::Enabled);
        Ok(())
    }

    async fn disconnect(&self, cause: Option<String>) {
        debug!(
            "Disconnect {}:{}: {}",
            self.host,
            self.port,
            cause.as_deref().unwrap_or("requested")
        );
        self.state.send_replace(ConnectionState::Disconnected(cause));
    }
}

impl WifiTransferPeripheral for HttpFileTransferPeripheral {
    fn password(&self) -> Option<String> {
        self.password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_password(&self, password: String) {
        *self.password.lock().unwrap_or_else(PoisonError::into_inner) = Some(password);
    }
}
