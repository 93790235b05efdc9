//! Server configuration: command-line flags and optional TOML file.
//!
//! Explicit command-line flags override file values; file values override
//! the built-in defaults. Sizes on the command line are in megabytes; the
//! file accepts size strings like `"64MB"`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use io_reactor::Backend;
use serde::Deserialize;

const MB: usize = 1024 * 1024;

const DEFAULT_TCP_PORT: u16 = 11211;
const DEFAULT_UDP_PORT: u16 = 0; // disabled
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";
const DEFAULT_MEMORY_LIMIT: usize = 64 * MB;
const DEFAULT_SEGMENT_SIZE: usize = 2 * MB;
const DEFAULT_LISTEN_BACKLOG: u32 = 1024;
const DEFAULT_NR_THREADS: usize = 4;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "shardcache-server")]
#[command(about = "Sharded, memcache-compatible in-memory cache server")]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// UDP port to listen on (0 = disabled)
    #[arg(short = 'U', long)]
    pub udp_port: Option<u16>,

    /// Interface address to listen on
    #[arg(short = 'l', long)]
    pub listen: Option<IpAddr>,

    /// Memory limit in MB, partitioned evenly across threads
    #[arg(short = 'm', long)]
    pub memory_limit: Option<usize>,

    /// Segment size in MB
    #[arg(short = 's', long)]
    pub segment_size: Option<usize>,

    /// Listen backlog size
    #[arg(short = 'b', long)]
    pub listen_backlog: Option<u32>,

    /// Number of shard threads (0 = one per CPU)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// I/O backend name
    #[arg(short = 'I', long)]
    pub io_backend: Option<String>,

    /// CPUs to skip when pinning shard threads (e.g. "0,2-3")
    #[arg(short = 'i', long)]
    pub isolate_cpus: Option<String>,

    /// Use the SCHED_FIFO scheduling policy for shard threads
    #[arg(short = 'S', long)]
    pub sched_fifo: bool,
}

/// TOML file configuration, all sections optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct FileConfig {
    listen: ListenSection,
    cache: CacheSection,
    workers: WorkersSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ListenSection {
    address: IpAddr,
    port: u16,
    udp_port: u16,
    backlog: u32,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            address: DEFAULT_LISTEN_ADDR.parse().unwrap(),
            port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct CacheSection {
    /// Total memory limit, e.g. "64MB".
    #[serde(deserialize_with = "deserialize_size")]
    memory_limit: usize,
    /// Segment size, e.g. "2MB".
    #[serde(deserialize_with = "deserialize_size")]
    segment_size: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct WorkersSection {
    threads: Option<usize>,
    isolate_cpus: Option<String>,
    sched_fifo: bool,
    io_backend: Option<String>,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    /// 0 disables the UDP listener.
    pub udp_port: u16,
    pub backlog: u32,
    /// Total bytes across all shards.
    pub memory_limit: usize,
    pub segment_size: usize,
    pub threads: usize,
    pub io_backend: Backend,
    /// CPUs excluded from shard pinning.
    pub isolate_cpus: Vec<usize>,
    pub sched_fifo: bool,
}

impl Config {
    /// Merge command-line arguments over the optional file and validate.
    pub fn resolve(args: &Args) -> Result<Self, Box<dyn std::error::Error>> {
        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };

        let io_backend = match args.io_backend.as_deref().or(file.workers.io_backend.as_deref()) {
            Some(name) => name.parse::<Backend>()?,
            None => Backend::default(),
        };

        let threads = match args.threads.or(file.workers.threads) {
            Some(0) => num_cpus::get(),
            Some(n) => n,
            None => DEFAULT_NR_THREADS,
        };

        let isolate_cpus = match args
            .isolate_cpus
            .as_deref()
            .or(file.workers.isolate_cpus.as_deref())
        {
            Some(list) => parse_cpu_list(list)?,
            None => Vec::new(),
        };

        let config = Config {
            address: args.listen.unwrap_or(file.listen.address),
            port: args.port.unwrap_or(file.listen.port),
            udp_port: args.udp_port.unwrap_or(file.listen.udp_port),
            backlog: args.listen_backlog.unwrap_or(file.listen.backlog),
            memory_limit: args
                .memory_limit
                .map(|mb| mb * MB)
                .unwrap_or(file.cache.memory_limit),
            segment_size: args
                .segment_size
                .map(|mb| mb * MB)
                .unwrap_or(file.cache.segment_size),
            threads,
            io_backend,
            isolate_cpus,
            sched_fifo: args.sched_fifo || file.workers.sched_fifo,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the geometry constraints required for partitioning.
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("at least one thread is required".to_string());
        }
        if self.memory_limit % self.threads != 0 {
            return Err(format!(
                "memory limit ({}) is not divisible by number of threads ({}), \
                 which is required for partitioning",
                format_size(self.memory_limit),
                self.threads
            ));
        }
        let per_shard = self.memory_limit / self.threads;
        if self.segment_size > per_shard {
            return Err(format!(
                "segment size ({}) exceeds the per-shard region ({})",
                format_size(self.segment_size),
                format_size(per_shard)
            ));
        }
        if per_shard % self.segment_size != 0 {
            return Err(format!(
                "per-shard region ({}) is not a multiple of segment size ({})",
                format_size(per_shard),
                format_size(self.segment_size)
            ));
        }
        Ok(())
    }

    /// Region bytes owned by each shard.
    pub fn shard_region_size(&self) -> usize {
        self.memory_limit / self.threads
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }
}

fn load_file(path: &Path) -> Result<FileConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Deserialize a size as a number of bytes or a string like "64MB".
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64MB" or "2048" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(at) => (&s[..at], s[at..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

/// Format a byte count for error messages.
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Parse a CPU list like "0,2-4,7" into sorted, deduplicated CPU ids.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start_str, end_str)) = part.split_once('-') {
            let start: usize = start_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid start of range: {}", start_str))?;
            let end: usize = end_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid end of range: {}", end_str))?;
            if start > end {
                return Err(format!("invalid range: start ({}) > end ({})", start, end));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|_| format!("invalid CPU number: {}", part))?;
            cpus.push(cpu);
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
