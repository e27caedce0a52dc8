//! 集成测试 - 连接协调器
//!
//! 通过模拟传输驱动协调器，验证注册表、选择策略和自动重连行为。

mod common;

use common::*;
use filelink_core::{ConnectionState, CoordinatorError, Peripheral};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// 已配对外设批量重连
// ============================================================================

/// 只有已配对的地址会被重连，第一个就绪的外设被选中
#[tokio::test]
async fn test_reconnect_to_bonded_filters_unbonded() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.platform.bond(&a);

    let ok = h
        .coordinator
        .reconnect_to_bonded_peripherals([address(A), address(B)])
        .await;

    assert!(ok);
    assert_eq!(h.platform.reconnect_calls(), vec![address(A)]);
    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
    assert_eq!(*h.coordinator.connected_addresses().borrow(), vec![address(A)]);
}

/// 批量重连成功的外设受监督：之后的链路断开会触发恢复
#[tokio::test]
async fn test_bonded_reconnect_supervises_ready_peripherals() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.platform.bond(&a);
    assert!(h.coordinator.reconnect_to_bonded_peripherals([address(A)]).await);

    a.emit(ConnectionState::Disconnected(Some("link lost".to_string())));

    eventually(|| h.platform.reconnect_calls().len() == 2).await;
    let mut flag = h.coordinator.is_reconnecting_to_bonded_peripherals();
    wait_for(&mut flag, |f| !f).await;
    let mut being_setup = h.coordinator.addresses_being_setup();
    wait_for(&mut being_setup, Vec::is_empty).await;
    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
}

#[tokio::test]
async fn test_reconnect_without_bonded_candidates_is_noop() {
    let h = harness();
    let mut flag = h.coordinator.is_reconnecting_to_bonded_peripherals();
    flag.borrow_and_update();

    let ok = h
        .coordinator
        .reconnect_to_bonded_peripherals([address(A), address(B)])
        .await;

    assert!(!ok);
    assert!(h.platform.reconnect_calls().is_empty());
    assert!(!flag.has_changed().unwrap());
    assert!(h.coordinator.current_client().is_none());
}

#[tokio::test]
async fn test_reconnect_with_permission_denied_returns_false() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.platform.bond(&a);
    h.platform.deny_permission();

    assert!(!h.coordinator.reconnect_to_bonded_peripherals([address(A)]).await);
    assert!(h.platform.reconnect_calls().is_empty());
}

#[tokio::test]
async fn test_reconnect_all_fail_returns_false() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Fail);
    h.platform.bond(&a);

    assert!(!h.coordinator.reconnect_to_bonded_peripherals([address(A)]).await);
    assert!(h.coordinator.current_client().is_none());
    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
}

/// 传输层永不返回时，每次尝试在超时后失败
#[tokio::test(start_paused = true)]
async fn test_reconnect_attempt_is_bounded_by_timeout() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Hang);
    h.platform.bond(&a);

    let start = Instant::now();
    let ok = h.coordinator.reconnect_to_bonded_peripherals([address(A)]).await;
    let elapsed = start.elapsed();

    assert!(!ok);
    assert!(elapsed >= Duration::from_millis(5000), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "elapsed: {elapsed:?}");
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
    assert_eq!(a.disconnect_calls(), 1);
}

/// 批量重连并行执行，总耗时不随地址数量累加
#[tokio::test(start_paused = true)]
async fn test_batch_reconnect_runs_in_parallel() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Hang);
    let b = MockPeripheral::ble(B, Behavior::Hang);
    let c = MockPeripheral::ble(C, Behavior::Ready);
    h.platform.bond(&a);
    h.platform.bond(&b);
    h.platform.bond(&c);

    let start = Instant::now();
    let ok = h
        .coordinator
        .reconnect_to_bonded_peripherals([address(A), address(B), address(C)])
        .await;

    assert!(ok);
    assert!(start.elapsed() < Duration::from_secs(6));
    assert_eq!(selected_address(&h.coordinator), Some(address(C)));
    assert_eq!(*h.coordinator.connected_addresses().borrow(), vec![address(C)]);
}

// ============================================================================
// 连接与选择
// ============================================================================

#[tokio::test]
async fn test_first_connected_is_selected_by_default() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::wifi(WIFI, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_wifi(&b);

    let client = h.coordinator.connect(&a.info()).await.unwrap();
    assert_eq!(client.address(), address(A));
    h.coordinator.connect(&b.info()).await.unwrap();

    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
    assert_eq!(
        *h.coordinator.connected_addresses().borrow(),
        vec![address(A), address(WIFI)]
    );
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
}

/// 用户选择不会被之后的连接覆盖
#[tokio::test]
async fn test_explicit_selection_survives_later_connect() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    let c = MockPeripheral::ble(C, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.factory.add_ble(&c);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();
    h.coordinator.set_selected_peripheral(&b.info()).await.unwrap();

    h.coordinator.connect(&c.info()).await.unwrap();

    assert_eq!(selected_address(&h.coordinator), Some(address(B)));
    assert_eq!(
        *h.coordinator.connected_addresses().borrow(),
        vec![address(A), address(B), address(C)]
    );
}

/// 选中已连接的外设不会产生新的连接
#[tokio::test]
async fn test_select_connected_peripheral_is_idempotent() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    let client = h.coordinator.set_selected_peripheral(&b.info()).await.unwrap();
    h.coordinator.set_selected_peripheral(&b.info()).await.unwrap();

    assert_eq!(client.address(), address(B));
    assert_eq!(selected_address(&h.coordinator), Some(address(B)));
    assert_eq!(b.connect_calls(), 1);
}

#[tokio::test]
async fn test_select_unconnected_peripheral_connects_and_selects() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.coordinator.connect(&a.info()).await.unwrap();

    h.coordinator.set_selected_peripheral(&b.info()).await.unwrap();

    assert_eq!(selected_address(&h.coordinator), Some(address(B)));
    assert_eq!(b.connect_calls(), 1);
}

#[tokio::test]
async fn test_select_failure_keeps_selection() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Fail);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.coordinator.connect(&a.info()).await.unwrap();

    let result = h.coordinator.set_selected_peripheral(&b.info()).await;

    assert!(matches!(result, Err(CoordinatorError::Connect { .. })));
    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
}

#[tokio::test]
async fn test_connect_failure_records_last_error() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Fail);
    h.factory.add_ble(&a);

    let result = h.coordinator.connect(&a.info()).await;

    assert!(matches!(result, Err(CoordinatorError::Connect { .. })));
    assert_eq!(a.connect_calls(), 1);
    assert!(h.coordinator.connection_last_error().borrow().is_some());
    assert!(h.coordinator.connected_addresses().borrow().is_empty());
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());

    h.coordinator.clear_connection_last_error().await;
    let mut last_error = h.coordinator.connection_last_error();
    wait_for(&mut last_error, Option::is_none).await;
}

#[tokio::test]
async fn test_connect_unknown_peripheral_type() {
    let h = harness();
    let unknown = Peripheral::ble(C, None);

    let result = h.coordinator.connect(&unknown).await;
    assert_eq!(
        result.unwrap_err(),
        CoordinatorError::UnknownPeripheralType(address(C))
    );

    let result = h.coordinator.set_selected_peripheral(&unknown).await;
    assert_eq!(
        result.unwrap_err(),
        CoordinatorError::UnknownPeripheralType(address(C))
    );
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
    assert!(h.coordinator.current_client().is_none());
}

#[tokio::test]
async fn test_connect_already_registered_returns_existing_client() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);
    h.coordinator.connect(&a.info()).await.unwrap();

    let client = h.coordinator.connect(&a.info()).await.unwrap();

    assert_eq!(client.address(), address(A));
    assert_eq!(a.connect_calls(), 1);
    assert_eq!(h.coordinator.connected_addresses().borrow().len(), 1);
}

/// 同一地址的第二次连接在第一次完成前被拒绝；断开后迟到的结果不会复活条目
#[tokio::test]
async fn test_concurrent_connect_and_cancel() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Hang);
    h.factory.add_ble(&a);

    let coordinator = h.coordinator.clone();
    let info = a.info();
    let first = tokio::spawn(async move { coordinator.connect(&info).await });

    let mut being_setup = h.coordinator.addresses_being_setup();
    wait_for(&mut being_setup, |s| s.contains(&address(A))).await;

    let second = h.coordinator.connect(&a.info()).await;
    assert_eq!(second.unwrap_err(), CoordinatorError::SetupInProgress(address(A)));

    h.coordinator.disconnect(&address(A), Some("user".to_string())).await;
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());

    a.release();
    let first = first.await.unwrap();
    assert_eq!(first.unwrap_err(), CoordinatorError::Cancelled(address(A)));

    eventually(|| a.current_state() != ConnectionState::Enabled).await;
    assert!(h.coordinator.connected_addresses().borrow().is_empty());
    assert!(h.coordinator.current_client().is_none());
}

// ============================================================================
// 断开与 WiFi 密码
// ============================================================================

#[tokio::test]
async fn test_disconnect_tears_down_without_reconnect() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();
    h.coordinator.set_selected_peripheral(&a.info()).await.unwrap();

    h.coordinator.disconnect(&address(A), Some("user".to_string())).await;

    assert_eq!(selected_address(&h.coordinator), Some(address(B)));
    assert_eq!(*h.coordinator.connected_addresses().borrow(), vec![address(B)]);
    eventually(|| a.disconnect_calls() == 1).await;

    // 监督任务已取消，之后的链路事件不会触发重连
    a.emit(ConnectionState::Disconnected(Some("link lost".to_string())));
    settle().await;
    assert!(h.platform.reconnect_calls().is_empty());
}

#[tokio::test]
async fn test_disconnect_unknown_address_is_noop() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);
    h.coordinator.connect(&a.info()).await.unwrap();

    h.coordinator.disconnect(&address(C), None).await;

    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
}

#[tokio::test]
async fn test_update_wifi_password() {
    let h = harness();
    let wifi = MockPeripheral::wifi(WIFI, Behavior::Ready);
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_wifi(&wifi);
    h.factory.add_ble(&a);
    h.coordinator.connect(&wifi.info()).await.unwrap();
    h.coordinator.connect(&a.info()).await.unwrap();

    assert!(
        h.coordinator
            .update_wifi_password(&address(WIFI), "hunter2".to_string())
            .await
    );
    assert_eq!(
        filelink_core::WifiTransferPeripheral::password(wifi.as_ref()).as_deref(),
        Some("hunter2")
    );
    assert_eq!(wifi.connect_calls(), 1);

    assert!(
        !h.coordinator
            .update_wifi_password(&address(A), "x".to_string())
            .await
    );
    assert!(
        !h.coordinator
            .update_wifi_password(&address("10.0.0.9:80"), "x".to_string())
            .await
    );
}

/// WiFi 外设不受监督，链路事件不会触发重连
#[tokio::test]
async fn test_wifi_peripheral_is_not_supervised() {
    let h = harness();
    let wifi = MockPeripheral::wifi(WIFI, Behavior::Ready);
    h.factory.add_wifi(&wifi);
    h.coordinator.connect(&wifi.info()).await.unwrap();

    wifi.emit(ConnectionState::Disconnected(None));
    settle().await;

    assert!(h.platform.reconnect_calls().is_empty());
    assert_eq!(selected_address(&h.coordinator), Some(address(WIFI)));
}

// ============================================================================
// 监督与自动恢复
// ============================================================================

/// 选中的外设断开且恢复失败：回退到另一个已连接外设
#[tokio::test]
async fn test_selected_recovery_failure_falls_back() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.platform.bond(&a);
    h.coordinator.set_selected_peripheral(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    a.set_behavior(Behavior::Fail);
    a.emit(ConnectionState::Disconnected(Some("link lost".to_string())));

    let mut selected = h.coordinator.selected_client();
    wait_for(&mut selected, |c| {
        c.as_ref().map(|c| c.address()) == Some(address(B))
    })
    .await;

    assert_eq!(h.platform.reconnect_calls(), vec![address(A)]);
    assert_eq!(*h.coordinator.connected_addresses().borrow(), vec![address(B)]);
    let mut flag = h.coordinator.is_reconnecting_to_bonded_peripherals();
    wait_for(&mut flag, |f| !f).await;
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
}

/// 选中的外设短暂断开后恢复：保持选中，标志位复位
#[tokio::test]
async fn test_selected_recovery_success_keeps_selection() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    a.emit(ConnectionState::Disconnected(Some("filesystem write".to_string())));
    eventually(|| a.connect_calls() == 2).await;

    let mut flag = h.coordinator.is_reconnecting_to_bonded_peripherals();
    wait_for(&mut flag, |f| !f).await;
    let mut being_setup = h.coordinator.addresses_being_setup();
    wait_for(&mut being_setup, Vec::is_empty).await;

    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
    assert_eq!(
        *h.coordinator.connected_addresses().borrow(),
        vec![address(A), address(B)]
    );
}

/// 未选中的外设断开不影响重连标志
#[tokio::test]
async fn test_background_recovery_does_not_touch_flag() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.platform.bond(&b);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    let mut flag = h.coordinator.is_reconnecting_to_bonded_peripherals();
    flag.borrow_and_update();

    b.set_behavior(Behavior::Fail);
    b.emit(ConnectionState::Disconnected(None));

    let mut connected = h.coordinator.connected_addresses();
    wait_for(&mut connected, |c| *c == vec![address(A)]).await;

    assert!(!flag.has_changed().unwrap());
    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
    assert_eq!(h.platform.reconnect_calls(), vec![address(B)]);
}

/// 错误状态：移除客户端并重新选择
#[tokio::test]
async fn test_error_state_removes_client() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    a.emit(ConnectionState::Error("gatt failure".to_string()));

    let mut selected = h.coordinator.selected_client();
    wait_for(&mut selected, |c| {
        c.as_ref().map(|c| c.address()) == Some(address(B))
    })
    .await;
    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
    assert!(h.platform.reconnect_calls().is_empty());
}

/// 恢复尝试超时：移除客户端
#[tokio::test(start_paused = true)]
async fn test_recovery_attempt_times_out() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();

    a.set_behavior(Behavior::Hang);
    a.emit(ConnectionState::Disconnected(None));

    let start = Instant::now();
    let mut selected = h.coordinator.selected_client();
    tokio::time::timeout(Duration::from_secs(10), selected.wait_for(Option::is_none))
        .await
        .unwrap()
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(5000));
    assert!(h.coordinator.connected_addresses().borrow().is_empty());
    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
}

// ============================================================================
// 生命周期
// ============================================================================

#[tokio::test]
async fn test_clean_detaches_supervisors() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();

    h.coordinator.clean().await;
    a.emit(ConnectionState::Disconnected(None));
    settle().await;

    assert!(h.platform.reconnect_calls().is_empty());
    // 注册表不受影响
    assert_eq!(selected_address(&h.coordinator), Some(address(A)));
}

/// 恢复进行中断开：重连标志复位，迟到的恢复结果不会复活条目
#[tokio::test]
async fn test_disconnect_during_selected_recovery_resets_flag() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    let b = MockPeripheral::ble(B, Behavior::Ready);
    h.factory.add_ble(&a);
    h.factory.add_ble(&b);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();
    h.coordinator.connect(&b.info()).await.unwrap();

    a.set_behavior(Behavior::Hang);
    a.emit(ConnectionState::Disconnected(Some("link lost".to_string())));
    let mut being_setup = h.coordinator.addresses_being_setup();
    wait_for(&mut being_setup, |s| s.contains(&address(A))).await;
    assert!(*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());

    h.coordinator.disconnect(&address(A), Some("user".to_string())).await;

    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());

    a.release();
    eventually(|| a.disconnect_calls() == 2).await;
    settle().await;

    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());
    assert_eq!(selected_address(&h.coordinator), Some(address(B)));
    assert_eq!(*h.coordinator.connected_addresses().borrow(), vec![address(B)]);
}

/// clean 同时取消正在进行的恢复，迟到的结果不会重新挂上监督任务
#[tokio::test]
async fn test_clean_cancels_pending_recovery() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);
    h.platform.bond(&a);
    h.coordinator.connect(&a.info()).await.unwrap();

    a.set_behavior(Behavior::Hang);
    a.emit(ConnectionState::Disconnected(None));
    let mut being_setup = h.coordinator.addresses_being_setup();
    wait_for(&mut being_setup, |s| s.contains(&address(A))).await;

    h.coordinator.clean().await;

    assert!(h.coordinator.addresses_being_setup().borrow().is_empty());
    assert!(!*h.coordinator.is_reconnecting_to_bonded_peripherals().borrow());

    a.release();
    eventually(|| a.disconnect_calls() == 1).await;

    a.emit(ConnectionState::Disconnected(Some("link lost".to_string())));
    settle().await;
    assert_eq!(h.platform.reconnect_calls(), vec![address(A)]);
}

#[tokio::test]
async fn test_shutdown_rejects_further_requests() {
    let h = harness();
    let a = MockPeripheral::ble(A, Behavior::Ready);
    h.factory.add_ble(&a);

    h.coordinator.shutdown().await;

    assert_eq!(
        h.coordinator.connect(&a.info()).await.unwrap_err(),
        CoordinatorError::Shutdown
    );
    assert!(h.coordinator.client(&address(A)).await.is_none());
}
