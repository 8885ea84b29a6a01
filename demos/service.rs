//! Three nodes on an in-memory network, one serving a chat service the others
//! find and broadcast to.
//!
//! cargo run --example service

use std::time::Duration;

use meshdht::{Config, Testnet};
use tracing::Level;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let testnet = Testnet::with_config(
        3,
        Config {
            fast_tick: Duration::from_millis(10),
            slow_tick: Duration::from_millis(50),
            ..Config::default()
        },
    )
    .unwrap();

    let server = testnet.nodes[1].service("chat");
    let visitor = testnet.nodes[2].service("chat");

    server.signin_server().unwrap();
    visitor.signin_visitor().unwrap();

    // Let the server announce itself.
    testnet.nodes[1]
        .ping(testnet.bootstrap[0].clone())
        .unwrap();
    testnet.nodes[2]
        .ping(testnet.bootstrap[0].clone())
        .unwrap();

    let found = visitor.find_peer("testnet-1").unwrap();
    println!("find server: {:?} {:?}", found.result, found.peers);

    let events = testnet.nodes[1].broadcast_events().unwrap();

    let emitted = visitor.emit_broadcast_event(b"hello chat").unwrap();
    println!("broadcast: {:?}, reached {:?}", emitted.result, emitted.reached);

    if let Ok(event) = events.recv_timeout(Duration::from_secs(1)) {
        println!(
            "server got {:?} from {} in {:?}",
            String::from_utf8_lossy(&event.data),
            event.source,
            event.service
        );
    }

    visitor.save_value("rooms", "lobby", "testnet-1").unwrap();
    let rooms = server.get_value("rooms", "*").unwrap();
    println!("rooms: {:?}", rooms.values);

    for node in &testnet.nodes {
        node.stop();
    }
}
