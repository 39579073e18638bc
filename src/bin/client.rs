use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kvstore::{decode, encode, Body, Message, BROADCAST};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
const REDIRECT_PAUSE: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS: u32 = 20;

/// Issue a single get or put against the cluster, following redirects to
/// whichever replica currently leads.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// UDP port of the cluster hub
    port: u16,

    /// Replica id to contact first
    replica: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the current value of a key
    Get { key: String },
    /// Write a value under a key
    Put { key: String, value: String },
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let socket = UdpSocket::bind("127.0.0.1:0")?;
    socket.set_read_timeout(Some(REPLY_TIMEOUT))?;
    socket.connect(("127.0.0.1", cli.port))?;

    let src = format!("client-{}", random_id(4));
    let mid = random_id(16);
    let body = match &cli.command {
        Commands::Get { key } => Body::Get {
            mid: mid.clone(),
            key: key.clone(),
        },
        Commands::Put { key, value } => Body::Put {
            mid: mid.clone(),
            key: key.clone(),
            value: value.clone(),
        },
    };

    let mut dst = cli.replica.clone();
    let mut buf = vec![0u8; kvstore::net::RECV_BUFFER];
    for _ in 0..MAX_ATTEMPTS {
        let request = Message {
            src: src.clone(),
            dst: dst.clone(),
            leader: BROADCAST.to_string(),
            body: body.clone(),
        };
        socket.send(&encode(&request)?)?;

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let reply = match decode(&buf[..n]) {
            Ok(r) => r,
            Err(_) => continue,
        };

        match &reply.body {
            Body::Ok {
                mid: reply_mid,
                value,
            } if *reply_mid == mid => {
                match value {
                    Some(v) => println!("{}", v),
                    None => println!("ok"),
                }
                return Ok(());
            }
            Body::Redirect { mid: reply_mid } if *reply_mid == mid => {
                // Re-aim at whoever the replying replica believes leads.
                if reply.leader != BROADCAST {
                    dst = reply.leader.clone();
                }
                thread::sleep(REDIRECT_PAUSE);
            }
            _ => {}
        }
    }

    bail!("no ack from the cluster after {} attempts", MAX_ATTEMPTS);
}
