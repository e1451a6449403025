use std::io::{BufRead, BufReader, Read, Write};
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use rdma_stream::{Fabric, RdmaListener, RdmaStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{Cli, Role};

fn serve<F: Fabric>(listener: RdmaListener<F>) -> anyhow::Result<()> {
    info!("echo server on {}", listener.local_addr());
    for stream in listener.incoming() {
        let stream = stream.context("accept failed")?;
        thread::spawn(move || {
            let peer = stream.peer_addr();
            let mut buf = [0u8; 4096];
            let mut echoed = 0;
            loop {
                match (&stream).read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = (&stream).write_all(&buf[..n]) {
                            warn!("echo to {peer} failed, {err}");
                            break;
                        }
                        echoed += n;
                    }
                    Err(err) => {
                        warn!("read from {peer} failed, {err}");
                        break;
                    }
                }
            }
            info!("{peer} left after {echoed} bytes, {}", stream.stats());
        });
    }
    Ok(())
}

fn chat<F: Fabric>(fabric: F, addr: &str, count: usize) -> anyhow::Result<()> {
    let stream = RdmaStream::connect(fabric, addr)
        .with_context(|| format!("failed to connect to {addr}"))?;
    let mut lines = BufReader::new(&stream);
    for i in 0..count {
        let sent = format!("line {i} from {}\n", stream.local_addr());
        (&stream).write_all(sent.as_bytes())?;
        let mut echoed = String::new();
        lines.read_line(&mut echoed)?;
        if echoed != sent {
            bail!("echo mismatch, sent {sent:?}, got {echoed:?}");
        }
        info!("echoed {:?}", echoed.trim_end());
    }
    stream.shutdown();
    Ok(())
}

fn run<F: Fabric>(fabric: F, cli: &Cli) -> anyhow::Result<()> {
    match cli.role {
        Role::Server => serve(RdmaListener::bind(fabric, cli.addr.as_str())?),
        Role::Client => chat(fabric, &cli.addr, cli.count),
        Role::Both => {
            let listener = RdmaListener::bind(fabric.clone(), cli.addr.as_str())?;
            thread::spawn(move || {
                if let Err(err) = serve(listener) {
                    warn!("server stopped, {err:#}");
                }
            });
            chat(fabric, &cli.addr, cli.count)
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .init();
    let cli = Cli::parse();

    #[cfg(feature = "verbs")]
    let fabric = rdma_stream::Verbs;
    #[cfg(not(feature = "verbs"))]
    let fabric = {
        if cli.role != Role::Both {
            warn!("the loopback fabric only reaches peers in this process");
        }
        rdma_stream::Loopback::new()
    };
    run(fabric, &cli)
}
