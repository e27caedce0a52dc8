//! Filelink Daemon
//!
//! 后台守护进程，负责：
//! - 持有连接协调器，维持与文件传输外设的连接
//! - 启动时重连已配对的外设
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use filelink_core::AppSettings;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AppSettings::load();

    // 桥接 log crate（filelink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if settings.verbose {
        "debug"
    } else {
        "info,filelink_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::info!("Filelink Daemon starting...");

    let service = Arc::new(service::Service::new(settings).await);

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(Arc::clone(&service)));

    // 重连上次的外设
    let reconnect = Arc::clone(&service);
    tokio::spawn(async move { reconnect.auto_reconnect().await });

    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    service.coordinator.shutdown().await;
    let _ = std::fs::remove_file(filelink_core::ipc::socket_path());

    Ok(())
}
