//! Interactive kadmesh peer.
//!
//! Starts a node listening on TCP, bootstraps it from known peer addresses,
//! and sends the lines typed on stdin as messages.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- --listen 127.0.0.1:8001
//! cargo run -- --listen 127.0.0.1:8002 --bootstrap 127.0.0.1:8001
//! ```
//!
//! Stdin commands:
//!
//! - `<addr> <text>` sends `<text>` to the peer listening on `<addr>`
//! - `/peers` lists the routing table
//! - `/inbox` lists received messages
//! - `/stats` prints a telemetry snapshot

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kadmesh::{derive_node_id, id_hex, serve, Contact, DhtConfig, DhtNode, TcpNetwork};

/// CLI arguments for a kadmesh peer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to accept peer connections on
    #[arg(long, default_value = "127.0.0.1:8001")]
    listen: String,
    /// Address of a peer to bootstrap from (repeatable)
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bucket capacity, overrides the configuration file
    #[arg(long)]
    k: Option<usize>,
    /// Lookup parallelism, overrides the configuration file
    #[arg(long)]
    alpha: Option<usize>,
    /// Identifier width in bits, overrides the configuration file
    #[arg(long)]
    id_bits: Option<usize>,
}

impl Args {
    fn dht_config(&self) -> Result<DhtConfig> {
        let mut config = match &self.config {
            Some(path) => DhtConfig::load(path)?,
            None => DhtConfig::default(),
        };
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(id_bits) = self.id_bits {
            config.id_bits = id_bits;
        }
        config.validate()?;
        Ok(config)
    }
}

/// The contact for a peer known only by address; its id is derived from it.
fn contact_for(addr: &str, id_bits: usize) -> Contact {
    Contact::new(derive_node_id(addr.as_bytes(), id_bits), addr)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.dht_config()?;

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    let addr = listener.local_addr()?.to_string();
    let self_contact = contact_for(&addr, config.id_bits);

    info!(
        id = %id_hex(&self_contact.id),
        %addr,
        k = config.k,
        alpha = config.alpha,
        id_bits = config.id_bits,
        "node started"
    );

    let network = TcpNetwork::new(self_contact.clone(), config.connect_timeout());
    let id_bits = config.id_bits;
    let node = Arc::new(DhtNode::new(self_contact, network, config)?);

    let server_node = node.clone();
    tokio::spawn(async move {
        if let Err(err) = serve(server_node, listener).await {
            error!("server stopped: {err:?}");
        }
    });

    if !args.bootstrap.is_empty() {
        let seeds = args
            .bootstrap
            .iter()
            .map(|addr| contact_for(addr, id_bits))
            .collect();
        node.bootstrap(seeds).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/peers" => {
                for contact in node.contacts().await {
                    println!("{}  {}", id_hex(&contact.id), contact.addr);
                }
            }
            "/inbox" => {
                for message in node.messages().await {
                    println!("[{}] {}", id_hex(&message.sender), message.content);
                }
            }
            "/stats" => {
                let snapshot = node.telemetry_snapshot().await;
                println!(
                    "contacts={}, buckets={}, k={}, alpha={}, id_bits={}, messages={}",
                    snapshot.contacts,
                    snapshot.non_empty_buckets,
                    snapshot.bucket_capacity,
                    snapshot.concurrency,
                    snapshot.id_bits,
                    snapshot.messages,
                );
            }
            _ => {
                let Some((peer, text)) = line.split_once(char::is_whitespace) else {
                    warn!("expected `<addr> <text>`");
                    continue;
                };
                let target = derive_node_id(peer.as_bytes(), id_bits);
                match node.send_message(text.trim(), target).await {
                    Ok(message) => info!(to = %peer, id = %message.id, "sent"),
                    Err(err) => warn!(to = %peer, "send failed: {err}"),
                }
            }
        }
    }
    Ok(())
}
