//! Filelink CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use filelink_core::Address;
use filelink_core::ipc::{IpcRequest, IpcResponse, PeripheralInfo};

#[derive(Parser)]
#[command(name = "filelink", version, about = "BLE / WiFi 文件传输外设连接管理")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看连接状态
    Status,
    /// 扫描附近的外设
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 列出最近一次扫描发现的外设
    Peripherals,
    /// 连接外设
    Connect {
        /// 外设地址 (BLE MAC 或 host:port)
        address: String,
    },
    /// 选中外设，未连接时先连接
    Select { address: String },
    /// 断开外设
    Disconnect { address: String },
    /// 重连已配对的外设 (不指定则使用配置中的列表)
    Reconnect { addresses: Vec<String> },
    /// 修改 WiFi 外设的密码
    Password { address: String, password: String },
    /// 清除上次的连接错误
    ClearError,
    /// 查看已配对的 BLE 外设
    Bonded {
        /// 删除指定地址的配对
        #[arg(long, value_name = "ADDRESS")]
        remove: Option<String>,
    },
}

fn print_peripheral(index: usize, peripheral: &PeripheralInfo) {
    println!(
        "   [{}] {} ({}, {})",
        index,
        peripheral.name.as_deref().unwrap_or("<unknown>"),
        peripheral.address,
        peripheral.kind
    );
}

fn print_peripherals(response: IpcResponse) {
    if let IpcResponse::Peripherals { peripherals } = response {
        if peripherals.is_empty() {
            println!("   未发现外设");
        } else {
            for (i, peripheral) in peripherals.iter().enumerate() {
                print_peripheral(i, peripheral);
            }
        }
    }
}

fn print_connected(response: IpcResponse) {
    if let IpcResponse::Connected { peripheral } = response {
        println!(
            "🔗 已连接: {} ({})",
            peripheral.name.as_deref().unwrap_or("<unknown>"),
            peripheral.address
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status(status) = resp {
                match &status.selected {
                    Some(p) => println!(
                        "选中: {} ({})",
                        p.name.as_deref().unwrap_or("<unknown>"),
                        p.address
                    ),
                    None => println!("选中: -"),
                }
                println!("已连接: {}", join(&status.connected));
                if !status.being_setup.is_empty() {
                    println!("连接中: {}", join(&status.being_setup));
                }
                if status.reconnecting {
                    println!("正在重连...");
                }
                println!("扫描: {}", status.scanning);
                if let Some(error) = status.last_error {
                    println!("错误: {}", error);
                }
            }
        }
        Commands::Scan { timeout } => {
            println!("🔍 扫描外设 ({}s)...", timeout);
            let resp = client::send_request(IpcRequest::Scan {
                timeout_secs: timeout,
            })
            .await?;
            print_peripherals(resp);
        }
        Commands::Peripherals => {
            print_peripherals(client::send_request(IpcRequest::Peripherals).await?);
        }
        Commands::Connect { address } => {
            let resp = client::send_request(IpcRequest::Connect {
                address: Address::new(address),
            })
            .await?;
            print_connected(resp);
        }
        Commands::Select { address } => {
            let resp = client::send_request(IpcRequest::Select {
                address: Address::new(address),
            })
            .await?;
            print_connected(resp);
        }
        Commands::Disconnect { address } => {
            client::send_request(IpcRequest::Disconnect {
                address: Address::new(address),
            })
            .await?;
        }
        Commands::Reconnect { addresses } => {
            println!("🔄 重连已配对的外设...");
            client::send_request(IpcRequest::Reconnect {
                addresses: addresses.into_iter().map(Address::new).collect(),
            })
            .await?;
        }
        Commands::Password { address, password } => {
            client::send_request(IpcRequest::Password {
                address: Address::new(address),
                password,
            })
            .await?;
        }
        Commands::ClearError => {
            client::send_request(IpcRequest::ClearError).await?;
        }
        Commands::Bonded { remove: Some(address) } => {
            client::send_request(IpcRequest::RemoveBond {
                address: Address::new(address),
            })
            .await?;
        }
        Commands::Bonded { remove: None } => {
            let resp = client::send_request(IpcRequest::Bonded).await?;
            if let IpcResponse::Bonded { peripherals } = resp {
                if peripherals.is_empty() {
                    println!("   没有已配对的外设");
                }
                for (i, record) in peripherals.iter().enumerate() {
                    println!(
                        "   [{}] {} ({})",
                        i,
                        record.name.as_deref().unwrap_or("<unknown>"),
                        record.address
                    );
                }
            }
        }
    }

    Ok(())
}

fn join(addresses: &[Address]) -> String {
    if addresses.is_empty() {
        return "-".to_string();
    }
    addresses
        .iter()
        .map(Address::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
