use anyhow::{Context, Result};
use clap::Parser;
use kvstore::{decode, BROADCAST};
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// The shared cluster endpoint: owns the well-known port, learns which
/// socket address each replica or client id lives at, and routes every
/// datagram by its `dst` field. `FFFF` fans out to every other known party.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// UDP port to listen on
    port: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let socket = UdpSocket::bind(("127.0.0.1", cli.port))
        .await
        .context("binding hub port")?;
    info!("hub listening on {}", socket.local_addr()?);

    let mut parties: HashMap<String, SocketAddr> = HashMap::new();
    let mut buf = vec![0u8; kvstore::net::RECV_BUFFER];

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let msg = match decode(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping undecodable datagram from {}: {}", from, e);
                continue;
            }
        };

        if parties.insert(msg.src.clone(), from) != Some(from) {
            info!("{} is at {}", msg.src, from);
        }

        if msg.dst == BROADCAST {
            for (id, addr) in &parties {
                if *addr != from {
                    debug!("broadcast {} -> {}", msg.src, id);
                    let _ = socket.send_to(&buf[..n], addr).await;
                }
            }
        } else if let Some(addr) = parties.get(&msg.dst) {
            debug!("route {} -> {}", msg.src, msg.dst);
            let _ = socket.send_to(&buf[..n], addr).await;
        } else {
            debug!("no route for {} -> {}, dropping", msg.src, msg.dst);
        }
    }
}
