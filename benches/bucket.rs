//! Micro-benchmarks for Bucket operations: insert, closest and random samples
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench bucket`

use std::net::SocketAddr;
use std::time::Instant;

use meshdht::common::{ActiveFlags, Bucket, BucketSettings, PeerFilter};
use meshdht::{Endpoint, Hash, PeerInfo};

fn main() {
    println!("bucket\n");

    bench_insert();
    bench_closest();
    bench_random();
}

fn info(i: usize) -> PeerInfo {
    let address = SocketAddr::from(([10, (i >> 16) as u8, (i >> 8) as u8, i as u8], 4660));
    PeerInfo::new(format!("peer-{i}")).with_endpoint(Endpoint::udp(address))
}

fn filled(size: usize) -> Bucket {
    let now = Instant::now();
    let mut bucket = Bucket::new("local", BucketSettings::default());
    for i in 0..size {
        bucket.active_peer(&info(i), None, ActiveFlags::received(), now);
    }
    bucket
}

fn bench_insert() {
    println!("insert");

    // Pre-generate peers outside the timed section
    let infos: Vec<_> = (0..10_000).map(info).collect();

    for prefill in [0, 1_000] {
        let mut bucket = filled(prefill);
        let now = Instant::now();

        let start = Instant::now();
        for info in &infos {
            bucket.active_peer(info, None, ActiveFlags::received(), now);
        }
        let per_op = start.elapsed().as_nanos() / infos.len() as u128;
        println!(
            "{prefill:>5} prefilled: {per_op}ns/op (final size: {})",
            bucket.peer_count()
        );
    }

    println!();
}

fn bench_closest() {
    println!("closest");

    let targets: Vec<_> = (0..1000).map(|i| Hash::of(format!("target-{i}"))).collect();

    for size in [50, 100, 200, 1000] {
        let bucket = filled(size);

        let start = Instant::now();
        for target in &targets {
            let _ = bucket.find_closest_peers(target, &PeerFilter::count(8));
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>4} peers: {per_op}ns/op ({} kept)", bucket.peer_count());
    }

    println!();
}

fn bench_random() {
    println!("random");

    let bucket = filled(1000);
    let n = 1000;

    let start = Instant::now();
    for _ in 0..n {
        let _ = bucket.random_peers(&PeerFilter::count(32));
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({} peers)", bucket.peer_count());
    println!();
}
