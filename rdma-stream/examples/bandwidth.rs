//! Streams random bytes one way and reports the throughput.
//!
//! ```text
//! cargo run --release --example bandwidth -- --megabytes 512 --ring-mb 4
//! ```

use std::io::{Read, Write};
use std::thread;
use std::time::Instant;

use anyhow::{ensure, Context};
use clap::Parser;
use rand::RngCore;
use rdma_stream::{Config, Fabric, RdmaListener, RdmaStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Measure one-way RDMA stream throughput")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:7472")]
    addr: String,
    /// Bytes to transfer, in MiB.
    #[arg(short, long, default_value_t = 256)]
    megabytes: usize,
    /// Size of each write call, in KiB.
    #[arg(short, long, default_value_t = 64)]
    chunk_kb: usize,
    /// Ring buffer size, in MiB.
    #[arg(long)]
    ring_mb: Option<u32>,
    /// Send queue depth proposed to the receiver.
    #[arg(long)]
    depth: Option<u32>,
}

fn config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(mb) = args.ring_mb {
        config = config.with_ring_buffer_size_mb(mb);
    }
    if let Some(depth) = args.depth {
        config = config.with_send_queue_depth(depth);
    }
    Ok(config)
}

fn receive<F: Fabric>(listener: RdmaListener<F>, total: usize) -> anyhow::Result<u64> {
    let (mut stream, peer) = listener.accept().context("accept failed")?;
    info!("receiving from {peer}");
    let mut buf = vec![0u8; 1 << 20];
    let mut received = 0;
    let mut checksum = 0u64;
    while received < total {
        let n = stream.read(&mut buf)?;
        ensure!(n > 0, "sender hung up after {received} bytes");
        checksum = buf[..n]
            .iter()
            .fold(checksum, |sum, b| sum.wrapping_add(*b as u64));
        received += n;
    }
    info!("receiver {}", stream.stats());
    Ok(checksum)
}

fn send<F: Fabric>(fabric: F, args: &Args, total: usize) -> anyhow::Result<u64> {
    let mut stream = RdmaStream::connect_with_config(fabric, args.addr.as_str(), config(args)?)
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let mut chunk = vec![0u8; args.chunk_kb << 10];
    rand::thread_rng().fill_bytes(&mut chunk);
    let chunk_sum = chunk.iter().fold(0u64, |sum, b| sum.wrapping_add(*b as u64));

    let start = Instant::now();
    let mut sent = 0;
    let mut checksum = 0u64;
    while sent < total {
        let len = chunk.len().min(total - sent);
        stream.write_all(&chunk[..len])?;
        checksum = if len == chunk.len() {
            checksum.wrapping_add(chunk_sum)
        } else {
            chunk[..len]
                .iter()
                .fold(checksum, |sum, b| sum.wrapping_add(*b as u64))
        };
        sent += len;
    }
    let elapsed = start.elapsed();
    info!(
        "sent {} MiB in {:.3}s, {:.1} MiB/s",
        total >> 20,
        elapsed.as_secs_f64(),
        (total as f64 / (1 << 20) as f64) / elapsed.as_secs_f64()
    );
    info!("sender {}", stream.stats());
    Ok(checksum)
}

fn run<F: Fabric>(fabric: F, args: &Args) -> anyhow::Result<()> {
    ensure!(args.chunk_kb > 0, "chunk size must be positive");
    let total = args.megabytes << 20;
    let listener =
        RdmaListener::bind_with_config(fabric.clone(), args.addr.as_str(), config(args)?)?;
    let receiver = thread::spawn(move || receive(listener, total));
    let sent = send(fabric, args, total)?;
    let received = receiver
        .join()
        .map_err(|_| anyhow::anyhow!("receiver panicked"))??;
    ensure!(
        sent == received,
        "checksum mismatch, sent {sent:#x}, received {received:#x}"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();
    let args = Args::parse();

    #[cfg(feature = "verbs")]
    let fabric = rdma_stream::Verbs;
    #[cfg(not(feature = "verbs"))]
    let fabric = rdma_stream::Loopback::new();
    run(fabric, &args)
}
