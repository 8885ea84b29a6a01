//! Run a node on UDP, printing its status until Ctrl-C.
//!
//! cargo run --example node -- alice --port 4660
//! cargo run --example node -- bob --port 4661 --bootstrap alice=4@127.0.0.1@4660@u

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use meshdht::{Dht, Endpoint, PeerInfo};
use tracing::Level;

#[derive(Parser)]
struct Cli {
    /// Peerid of this node
    peerid: String,
    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Application id
    #[arg(short, long, default_value_t = 0)]
    appid: u32,
    /// Bootstrap peers as `<peerid>=<endpoint>`, endpoints look like `4@127.0.0.1@4660@u`
    #[arg(short, long)]
    bootstrap: Vec<String>,
    /// Log every package
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .init();

    let bootstrap: Vec<PeerInfo> = cli
        .bootstrap
        .iter()
        .filter_map(|entry| {
            let (peerid, endpoint) = entry.split_once('=')?;
            let endpoint: Endpoint = endpoint.parse().ok()?;
            Some(PeerInfo::new(peerid).with_endpoint(endpoint))
        })
        .collect();

    let mut builder = Dht::builder(cli.peerid)
        .appid(cli.appid)
        .bootstrap(&bootstrap);
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }
    let dht = builder.build().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)).unwrap();

    let mut ticks = 0;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));

        ticks += 1;
        if ticks % 100 != 1 {
            continue;
        }

        let info = dht.info().unwrap();
        println!("=== {} ===", info.peerid());
        println!("NAT type:   {:?}", info.nat_type());
        println!("Endpoints:  {:?}", info.eplist());
        println!("Peers:      {}", info.peer_count());
        println!("Tasks:      {}", info.task_count());
        println!("Values:     {}", info.value_count());
        println!();
    }

    dht.stop();
}
