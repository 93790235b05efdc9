//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use io_reactor::Mesh;

/// Install SIGINT/SIGTERM handlers.
///
/// The returned flag flips to `true` on the first signal; every shard is
/// then woken through the mesh so reactors blocked in their poller observe
/// it. A second signal forces immediate exit.
pub fn install<T: Send + 'static>(mesh: Arc<Mesh<T>>) -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, draining shards");
        mesh.wake_all();
    })
    .expect("failed to set signal handler");

    shutdown
}
