//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "cache_gets", description = "Total GET operations")]
pub static GETS: Counter = Counter::new();

#[metric(name = "cache_sets", description = "Total SET operations")]
pub static SETS: Counter = Counter::new();

#[metric(name = "cache_hits", description = "Total cache hits")]
pub static HITS: Counter = Counter::new();

#[metric(name = "cache_misses", description = "Total cache misses")]
pub static MISSES: Counter = Counter::new();

#[metric(
    name = "cache_set_errors",
    description = "Total SET failures (out of memory or oversized)"
)]
pub static SET_ERRORS: Counter = Counter::new();

#[metric(name = "protocol_errors", description = "Total protocol parse errors")]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "shard_messages_sent",
    description = "Envelopes forwarded to other shards"
)]
pub static SHARD_MESSAGES_SENT: Counter = Counter::new();

#[metric(
    name = "shard_messages_received",
    description = "Envelopes received from other shards"
)]
pub static SHARD_MESSAGES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "shard_messages_dropped",
    description = "Envelopes dropped because a shard queue was full"
)]
pub static SHARD_MESSAGES_DROPPED: Counter = Counter::new();
