//! Store metrics.

use metriken::{Counter, metric};

#[metric(
    name = "log_reclaimed_bytes",
    description = "Total bytes reclaimed by draining segments"
)]
pub static RECLAIMED_BYTES: Counter = Counter::new();
