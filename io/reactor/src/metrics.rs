//! Reactor metrics.

use metriken::{Counter, metric};

#[metric(
    name = "reactor_wakeups",
    description = "Cross-thread wakeups fired through an eventfd"
)]
pub static WAKEUPS: Counter = Counter::new();
