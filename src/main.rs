//! or3-syncd: workspace synchronization server
//!
//! Accepts device connections over a line-delimited JSON protocol and
//! replicates pushed changes to every other device in the workspace,
//! resolving conflicts last-writer-wins by hybrid logical clock.
//!
//! Architecture:
//!
//! ```text
//! devices --(frames)--> protocol::ConnectionHandler --> engine::SyncEngine
//!                                                            |
//!                                               store (RwLock per workspace)
//!                                                            |
//!                                                persistence (on-disk snapshot)
//! ```

use std::path::PathBuf;

use log::info;

use or3_sync::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    let ip = config.bind_addr.ip();
                    config.bind_addr = std::net::SocketAddr::new(ip, port);
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--database-name" => {
                if i + 1 < args.len() {
                    config.database_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--retention-days" => {
                if i + 1 < args.len() {
                    let days: u64 = args[i + 1].parse()?;
                    config.retention_secs = days * 24 * 3600;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("or3-syncd - workspace synchronization server");
                println!();
                println!("Usage: or3-syncd [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port PORT          Port to listen on (default: 7420)");
                println!("  -d, --data-dir DIR       Snapshot directory (default: ./data)");
                println!("      --database-name NAME Database name embedded in snapshots");
                println!("      --retention-days N   Change-log/tombstone retention (default: 30)");
                println!("  -h, --help               Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("starting or3-syncd...");

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
