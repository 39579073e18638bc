use anyhow::Result;
use clap::Parser;
use kvstore::net::Transport;
use kvstore::raft::{Replica, ReplicaConfig};
use log::info;
use std::time::{Duration, Instant};

/// One replica of the key-value store.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// UDP port of the shared cluster endpoint
    port: u16,
    /// Id of this replica
    id: String,
    /// Ids of the other replicas in the cluster
    #[arg(required = true)]
    others: Vec<String>,
}

const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut transport = Transport::bind(cli.port)?;
    let mut replica = Replica::new(ReplicaConfig::new(cli.id, cli.others), Instant::now());

    info!(
        "[{}] replica started, endpoint port {}, local {}",
        replica.config.id,
        cli.port,
        transport.local_addr()?
    );
    transport.send(&replica.hello());

    loop {
        let now = Instant::now();
        for msg in replica.take_client_replies() {
            transport.send(&msg);
        }
        for msg in replica.take_peer_messages() {
            transport.send(&msg);
        }
        replica.pulse(now);
        for msg in transport.recv_ready() {
            replica.receive(msg);
        }
        replica.dispatch(now);
        replica.check_election(now);
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
