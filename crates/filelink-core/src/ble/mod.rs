//! BLE 文件传输
//!
//! 设备广播文件传输服务 UUID (0xFEBB)。BlueZ 后端位于 [`bluez`]，
//! 需要启用 `bluez` feature。

#[cfg(feature = "bluez")]
pub mod bluez;

use uuid::Uuid;

/// 文件传输服务 UUID
pub const FILE_TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000febb_0000_1000_8000_00805f9b34fb);

/// 判断服务 UUID 列表是否包含文件传输服务
pub fn has_file_transfer_service<'a>(uuids: impl IntoIterator<Item = &'a Uuid>) -> bool {
    uuids.into_iter().any(|u| *u == FILE_TRANSFER_SERVICE_UUID)
}
