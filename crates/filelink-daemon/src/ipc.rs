//! IPC Server - Unix Domain Socket 通信

use crate::service::{Service, lock};
use anyhow::Result;
use filelink_core::TransportKind;
use filelink_core::ipc::{IpcRequest, IpcResponse, PeripheralInfo, StatusInfo, socket_path};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub async fn run_ipc_server(service: Arc<Service>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC server listening on {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, service).await {
                        tracing::debug!("IPC client error: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept IPC connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, service: Arc<Service>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("IPC request: {:?}", request);
                handle_request(&service, request).await
            }
            Err(e) => IpcResponse::error(format!("Invalid request: {}", e)),
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    Ok(())
}

async fn handle_request(service: &Service, request: IpcRequest) -> IpcResponse {
    let coordinator = &service.coordinator;

    match request {
        IpcRequest::Status => IpcResponse::Status(status(service)),

        IpcRequest::Scan { timeout_secs } => {
            tracing::info!("Scanning for {}s", timeout_secs);
            coordinator.start_scan();
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            coordinator.stop_scan();
            discovered(service)
        }

        IpcRequest::Peripherals => discovered(service),

        IpcRequest::Connect { address } => {
            let Some(peripheral) = service.find_peripheral(&address) else {
                return IpcResponse::error(format!("Unknown peripheral {}, scan first", address));
            };
            match coordinator.connect(&peripheral).await {
                Ok(client) => IpcResponse::Connected {
                    peripheral: (&client).into(),
                },
                Err(e) => IpcResponse::error(e),
            }
        }

        IpcRequest::Select { address } => {
            let Some(peripheral) = service.find_peripheral(&address) else {
                return IpcResponse::error(format!("Unknown peripheral {}, scan first", address));
            };
            match coordinator.set_selected_peripheral(&peripheral).await {
                Ok(client) => IpcResponse::Connected {
                    peripheral: (&client).into(),
                },
                Err(e) => IpcResponse::error(e),
            }
        }

        IpcRequest::Disconnect { address } => {
            coordinator
                .disconnect(&address, Some("user request".to_string()))
                .await;
            IpcResponse::ok(format!("Disconnected {}", address))
        }

        IpcRequest::Reconnect { addresses } => {
            let addresses = if !addresses.is_empty() {
                addresses
            } else {
                let configured = lock(&service.settings).auto_reconnect.clone();
                if configured.is_empty() {
                    service
                        .bonded
                        .snapshot()
                        .into_iter()
                        .map(|r| r.address)
                        .collect()
                } else {
                    configured
                }
            };

            if coordinator.reconnect_to_bonded_peripherals(addresses).await {
                IpcResponse::ok("Reconnected")
            } else {
                IpcResponse::error("No bonded peripheral reconnected")
            }
        }

        IpcRequest::Password { address, password } => {
            let updated = coordinator
                .update_wifi_password(&address, password.clone())
                .await;

            let saved = {
                let mut settings = lock(&service.settings);
                if settings.set_wifi_password(&address, &password) {
                    if let Err(e) = settings.save() {
                        tracing::warn!("Failed to save settings: {}", e);
                    }
                    true
                } else {
                    false
                }
            };

            if updated || saved {
                IpcResponse::ok(format!("Password updated for {}", address))
            } else {
                IpcResponse::error(format!("{} is not a known WiFi peripheral", address))
            }
        }

        IpcRequest::ClearError => {
            coordinator.clear_connection_last_error().await;
            coordinator.clear_scan_last_error(TransportKind::Ble);
            coordinator.clear_scan_last_error(TransportKind::Wifi);
            IpcResponse::ok("Errors cleared")
        }

        IpcRequest::Bonded => {
            service.bonded.refresh().await;
            IpcResponse::Bonded {
                peripherals: service.bonded.snapshot(),
            }
        }

        IpcRequest::RemoveBond { address } => {
            service.bonded.remove(&address).await;
            IpcResponse::ok(format!("Removed bond {}", address))
        }
    }
}

fn status(service: &Service) -> StatusInfo {
    let coordinator = &service.coordinator;

    let scanning = coordinator.scanning_state().borrow().label().to_string();
    let last_error = coordinator
        .connection_last_error()
        .borrow()
        .as_ref()
        .map(ToString::to_string)
        .or_else(|| {
            [TransportKind::Ble, TransportKind::Wifi]
                .into_iter()
                .find_map(|kind| coordinator.scan_last_error(kind))
                .map(|e| e.to_string())
        });

    StatusInfo {
        selected: coordinator.current_client().as_ref().map(Into::into),
        connected: coordinator.connected_addresses().borrow().clone(),
        being_setup: coordinator.addresses_being_setup().borrow().clone(),
        reconnecting: *coordinator.is_reconnecting_to_bonded_peripherals().borrow(),
        scanning,
        last_error,
    }
}

fn discovered(service: &Service) -> IpcResponse {
    let peripherals = service
        .coordinator
        .peripherals()
        .borrow()
        .iter()
        .cloned()
        .map(PeripheralInfo::from)
        .collect();
    IpcResponse::Peripherals { peripherals }
}
