//! WiFi 文件传输外设
//!
//! 设备在局域网中提供 HTTP 文件服务。`/cp/version.json` 用于探测设备并校验密码
//! （HTTP Basic 认证，用户名为空）。

pub mod http;

pub use http::HttpFileTransferPeripheral;

use crate::error::PlatformError;

/// 未指定端口时使用的 HTTP 端口
pub const DEFAULT_PORT: u16 = 80;

/// 设备版本信息 - `/cp/version.json` 的响应体
///
/// 不同固件版本返回的字段不完全相同，所以全部可选。
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceVersion {
    pub web_api_version: Option<u32>,
    pub version: Option<String>,
    pub board_name: Option<String>,
    pub board_id: Option<String>,
    pub mcu_name: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

/// 把 `host[:port]` 形式的地址拆成主机和端口
pub fn split_host_port(address: &str) -> Result<(String, u16), PlatformError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(PlatformError::InvalidAddress(address.to_string()));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| PlatformError::InvalidAddress(address.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(PlatformError::InvalidAddress(address.to_string())),
        None => Ok((address.to_string(), DEFAULT_PORT)),
    }
}
