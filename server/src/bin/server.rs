//! shardcache server binary.

use std::sync::Arc;

use clap::Parser;
use io_reactor::Mesh;
use server::config::format_size;
use server::{Args, Config, logging, signal, worker};

fn main() {
    let args = Args::parse();
    logging::init();

    let config = match Config::resolve(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shardcache-server: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.io_backend,
        threads = config.threads,
        "starting"
    );
    tracing::info!(
        address = %config.tcp_addr(),
        udp = config.udp_port,
        backlog = config.backlog,
        "listening"
    );
    tracing::info!(
        memory = %format_size(config.memory_limit),
        segment = %format_size(config.segment_size),
        per_shard = %format_size(config.shard_region_size()),
        "cache geometry"
    );

    let mesh = match Mesh::new(config.threads) {
        Ok(mesh) => Arc::new(mesh),
        Err(e) => {
            eprintln!("shardcache-server: failed to create message mesh: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = signal::install(mesh.clone());
    let handles = worker::spawn(&config, mesh, shutdown);
    for handle in handles {
        let _ = handle.join();
    }

    tracing::info!("shutdown complete");
}
