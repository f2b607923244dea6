//! Example: run a TransactionMonitor against a remote platform bridge and accounting endpoint.
//!
//! Usage:
//!
//!   cargo run -p paysync --example monitor -- --http-url URL --ws-url WS_URL \
//!       --signer-key HEX --reporter-url URL --developer-key KEY --user USER_ID [--data-dir DIR]
//!
//! Options:
//!   --poll-ms <N>    Snapshot poll period in milliseconds. Default: 1000.
//!   --data-dir <D>   Directory for dedup records and the user identifier. Default: ./paysync-data.
//!
//! Runs until Ctrl-C.

use paysync::{
    DedupStore, FileStorage, HttpReporter, IdentityStore, MonitorConfig, RemoteEventSource,
    ReporterConfig, SourceConfig, TransactionMonitor,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paysync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut ws_url = String::new();
    let mut signer_key = String::new();
    let mut reporter_url = String::new();
    let mut developer_key = String::new();
    let mut user = String::new();
    let mut data_dir = "paysync-data".to_string();
    let mut poll_ms: u64 = 1000;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--signer-key" => {
                i += 1;
                signer_key = args.get(i).cloned().unwrap_or_default();
            }
            "--reporter-url" => {
                i += 1;
                reporter_url = args.get(i).cloned().unwrap_or_default();
            }
            "--developer-key" => {
                i += 1;
                developer_key = args.get(i).cloned().unwrap_or_default();
            }
            "--user" => {
                i += 1;
                user = args.get(i).cloned().unwrap_or_default();
            }
            "--data-dir" => {
                i += 1;
                if let Some(d) = args.get(i) {
                    data_dir = d.clone();
                }
            }
            "--poll-ms" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    poll_ms = s.parse().unwrap_or(1000);
                }
            }
            _ => {}
        }
        i += 1;
    }
    if http_url.is_empty()
        || ws_url.is_empty()
        || signer_key.is_empty()
        || reporter_url.is_empty()
        || developer_key.is_empty()
    {
        eprintln!(
            "Usage: monitor --http-url URL --ws-url WS_URL --signer-key HEX --reporter-url URL \
             --developer-key KEY [--user USER_ID] [--data-dir DIR] [--poll-ms N]"
        );
        std::process::exit(1);
    }

    let storage = Arc::new(FileStorage::open(&data_dir)?);
    let identity = IdentityStore::new(storage.clone());
    if !user.is_empty() {
        identity.set(&user)?;
    }
    let store = Arc::new(DedupStore::new(storage));
    let source = Arc::new(RemoteEventSource::new(SourceConfig {
        http_url,
        ws_url,
        signer_public_key: signer_key,
        request_timeout_secs: 10,
        reconnection: Default::default(),
    })?);
    let reporter = HttpReporter::from_config(
        &ReporterConfig {
            base_url: reporter_url,
            developer_key,
            request_timeout_secs: 10,
        },
        identity.clone(),
    )?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let feed = tokio::spawn(Arc::clone(&source).run());
        let monitor = TransactionMonitor::new(
            source,
            Arc::new(reporter),
            store,
            move || identity.is_registered(),
            MonitorConfig {
                poll_interval_ms: poll_ms,
                ..MonitorConfig::default()
            },
        );
        monitor.start();
        let _ = tokio::signal::ctrl_c().await;
        monitor.stop().await;
        feed.abort();
    });
    Ok(())
}
