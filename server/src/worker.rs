//! Shard worker threads.
//!
//! One worker per shard. Each worker owns a log, a reactor with its own
//! TCP listener (and optional UDP socket, both SO_REUSEPORT), and serves
//! the reactor's events: local commands execute against the log, remote
//! ones travel as envelopes over the mesh.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use bytes::{Buf, BytesMut};
use io_reactor::{ConnId, Event, Mesh, Reactor, UdpId};
use logstore::{Log, LogConfig};
use protocol_memcache::{Command, FRAME_SIZE, FrameHeader, ParseError, response};

use crate::affinity::{CpuPicker, set_cpu_affinity, set_sched_fifo};
use crate::config::Config;
use crate::connection::Connection;
use crate::envelope::{Envelope, Opcode, ReplyTo};
use crate::metrics;
use crate::router;

/// Receive scratch buffer size.
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Spawn all shard threads. The returned handles join once `shutdown` is
/// observed (wake the mesh after setting it).
pub fn spawn(
    config: &Config,
    mesh: Arc<Mesh<Envelope>>,
    shutdown: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let mut picker = CpuPicker::new(&config.isolate_cpus);
    (0..config.threads)
        .map(|shard_id| {
            let cpu = picker.next_cpu();
            let config = config.clone();
            let mesh = mesh.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("shard-{shard_id}"))
                .spawn(move || run_shard(shard_id, cpu, config, mesh, shutdown))
                .expect("failed to spawn shard thread")
        })
        .collect()
}

fn run_shard(
    shard_id: usize,
    cpu: usize,
    config: Config,
    mesh: Arc<Mesh<Envelope>>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(e) = set_cpu_affinity(cpu) {
        tracing::warn!(shard = shard_id, cpu, "could not pin thread: {e}");
    }
    if config.sched_fifo {
        if let Err(e) = set_sched_fifo() {
            tracing::warn!(shard = shard_id, "could not enable SCHED_FIFO: {e}");
        }
    }

    if let Err(e) = serve(shard_id, &config, mesh, shutdown) {
        tracing::error!(shard = shard_id, error = %e, "shard failed");
        std::process::exit(1);
    }
}

fn serve(
    shard_id: usize,
    config: &Config,
    mesh: Arc<Mesh<Envelope>>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut reactor = Reactor::new(shard_id, mesh)?;
    reactor.listen(config.tcp_addr(), config.backlog)?;
    if config.udp_port != 0 {
        reactor.bind_udp(config.udp_addr())?;
    }

    let log = Log::new(LogConfig {
        region_size: config.shard_region_size(),
        segment_size: config.segment_size,
    })?;

    let mut shard = Shard {
        id: shard_id,
        nr_shards: config.threads,
        reactor,
        log,
        connections: Vec::with_capacity(1024),
        scratch: vec![0u8; RECV_BUFFER_SIZE],
        out: BytesMut::with_capacity(4096),
    };

    tracing::info!(shard = shard_id, "shard serving");
    loop {
        shard.reactor.poll()?;
        for event in shard.reactor.drain_events() {
            shard.handle(event);
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    tracing::info!(shard = shard_id, "shard stopped");
    Ok(())
}

/// One shard's single-threaded state.
struct Shard {
    id: usize,
    nr_shards: usize,
    reactor: Reactor<Envelope>,
    log: Log,
    /// Indexed by connection slot.
    connections: Vec<Option<Connection>>,
    scratch: Vec<u8>,
    /// Response assembly buffer, reused across replies.
    out: BytesMut,
}

impl Shard {
    fn handle(&mut self, event: Event<Envelope>) {
        match event {
            Event::Accepted { conn, .. } => self.on_accept(conn),
            Event::Readable { conn } => self.on_readable(conn),
            Event::Closed { conn } => self.close_connection(conn),
            Event::UdpReadable { socket } => self.on_udp_readable(socket),
            Event::Message(envelope) => self.on_message(envelope),
        }
    }

    fn on_accept(&mut self, conn: ConnId) {
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();

        let slot = conn.slot();
        if slot >= self.connections.len() {
            self.connections.resize_with(slot + 1, || None);
        }
        self.connections[slot] = Some(Connection::new());
    }

    fn on_readable(&mut self, conn: ConnId) {
        loop {
            let n = match self.reactor.recv(conn, &mut self.scratch) {
                Ok(0) => {
                    self.close_connection(conn);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.close_connection(conn);
                    return;
                }
            };
            match self.connections.get_mut(conn.slot()) {
                Some(Some(c)) => c.append(&self.scratch[..n]),
                _ => return,
            }
        }
        self.process_connection(conn);
    }

    /// Parse and execute every complete command accumulated on `conn`.
    fn process_connection(&mut self, conn: ConnId) {
        let mut rx = match self.connections.get_mut(conn.slot()) {
            Some(Some(c)) => c.take_rx(),
            _ => return,
        };

        let mut consumed = 0;
        loop {
            match Command::parse(&rx[consumed..]) {
                Ok((cmd, n)) => {
                    self.execute(&cmd, ReplyTo::Tcp { conn });
                    consumed += n;
                }
                Err(ParseError::Incomplete) => break,
                Err(ParseError::Malformed { consumed: n }) => {
                    metrics::PROTOCOL_ERRORS.increment();
                    let reply = ReplyTo::Tcp { conn };
                    self.begin_reply(&reply);
                    response::error(&mut self.out);
                    self.send_reply(reply);
                    consumed += n;
                }
            }
        }
        rx.advance(consumed);

        if let Some(Some(c)) = self.connections.get_mut(conn.slot()) {
            c.restore(rx);
        }
    }

    fn close_connection(&mut self, conn: ConnId) {
        if let Some(slot) = self.connections.get_mut(conn.slot()) {
            if slot.take().is_some() {
                metrics::CONNECTIONS_ACTIVE.decrement();
                self.reactor.close(conn);
            }
        }
    }

    fn on_udp_readable(&mut self, socket: UdpId) {
        let mut scratch = std::mem::take(&mut self.scratch);
        loop {
            let (n, peer) = match self.reactor.recv_from(socket, &mut scratch) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv failed");
                    break;
                }
            };
            self.on_datagram(socket, peer, &scratch[..n]);
        }
        self.scratch = scratch;
    }

    /// One request per datagram: an 8-byte frame, one command, nothing else.
    fn on_datagram(&mut self, socket: UdpId, peer: std::net::SocketAddr, datagram: &[u8]) {
        let Some(frame) = FrameHeader::parse(datagram) else {
            metrics::PROTOCOL_ERRORS.increment();
            return; // too short to even respond to
        };
        let payload = &datagram[FRAME_SIZE..];
        let reply = ReplyTo::Udp {
            socket,
            peer,
            frame,
        };

        match Command::parse(payload) {
            Ok((cmd, consumed)) if consumed == payload.len() => {
                self.execute(&cmd, reply);
            }
            _ => {
                // malformed, truncated, or residual bytes after one command
                metrics::PROTOCOL_ERRORS.increment();
                self.begin_reply(&reply);
                response::error(&mut self.out);
                self.send_reply(reply);
            }
        }
    }

    /// Run a parsed command: locally if the key routes here, otherwise as
    /// an envelope to the owning shard.
    fn execute(&mut self, cmd: &Command<'_>, reply: ReplyTo) {
        let target = router::target_shard(cmd.key(), self.nr_shards);
        if target == self.id {
            self.execute_local(cmd, reply);
        } else {
            self.forward(target, cmd, reply);
        }
    }

    fn execute_local(&mut self, cmd: &Command<'_>, reply: ReplyTo) {
        match *cmd {
            Command::Set { key, value, .. } => {
                metrics::SETS.increment();
                self.begin_reply(&reply);
                match self.log.append(key, value) {
                    Ok(()) => response::stored(&mut self.out),
                    Err(_) => {
                        metrics::SET_ERRORS.increment();
                        response::server_error_out_of_memory(&mut self.out);
                    }
                }
                self.send_reply(reply);
            }
            Command::Get { key } => {
                metrics::GETS.increment();
                self.begin_reply(&reply);
                match self.log.find(key) {
                    Some(blob) => {
                        metrics::HITS.increment();
                        response::value(&mut self.out, key, blob);
                    }
                    None => {
                        metrics::MISSES.increment();
                    }
                }
                response::end(&mut self.out);
                self.send_reply(reply);
            }
        }
    }

    fn forward(&mut self, target: usize, cmd: &Command<'_>, reply: ReplyTo) {
        let envelope = match *cmd {
            Command::Set { key, value, .. } => Envelope {
                op: Opcode::Set,
                key: Box::from(key),
                blob: Some(Box::from(value)),
                origin: self.id,
                reply,
            },
            Command::Get { key } => Envelope {
                op: Opcode::Get,
                key: Box::from(key),
                blob: None,
                origin: self.id,
                reply,
            },
        };

        if self.reactor.send_msg(target, envelope) {
            metrics::SHARD_MESSAGES_SENT.increment();
        } else {
            // never block the reactor on queue space
            metrics::SHARD_MESSAGES_DROPPED.increment();
            self.begin_reply(&reply);
            response::server_error(&mut self.out, "shard queue full");
            self.send_reply(reply);
        }
    }

    /// Execute or complete an envelope from a peer shard.
    fn on_message(&mut self, mut envelope: Envelope) {
        metrics::SHARD_MESSAGES_RECEIVED.increment();
        match envelope.op {
            Opcode::Set => {
                metrics::SETS.increment();
                let blob = envelope.blob.take().unwrap_or_default();
                envelope.op = match self.log.append(&envelope.key, &blob) {
                    Ok(()) => Opcode::SetOk,
                    Err(_) => {
                        metrics::SET_ERRORS.increment();
                        Opcode::SetErrorOutOfMemory
                    }
                };
                self.send_response_msg(envelope);
            }
            Opcode::Get => {
                metrics::GETS.increment();
                envelope.blob = match self.log.find(&envelope.key) {
                    Some(blob) => {
                        metrics::HITS.increment();
                        Some(Box::from(blob))
                    }
                    None => {
                        metrics::MISSES.increment();
                        None
                    }
                };
                envelope.op = Opcode::GetOk;
                self.send_response_msg(envelope);
            }
            Opcode::SetOk => {
                self.begin_reply(&envelope.reply);
                response::stored(&mut self.out);
                self.send_reply(envelope.reply);
            }
            Opcode::SetErrorOutOfMemory => {
                self.begin_reply(&envelope.reply);
                response::server_error_out_of_memory(&mut self.out);
                self.send_reply(envelope.reply);
            }
            Opcode::GetOk => {
                self.begin_reply(&envelope.reply);
                if let Some(blob) = envelope.blob.take() {
                    response::value(&mut self.out, &envelope.key, &blob);
                }
                response::end(&mut self.out);
                self.send_reply(envelope.reply);
            }
        }
    }

    /// Route an executed envelope back to its origin shard.
    fn send_response_msg(&mut self, envelope: Envelope) {
        let origin = envelope.origin;
        if !self.reactor.send_msg(origin, envelope) {
            metrics::SHARD_MESSAGES_DROPPED.increment();
            tracing::error!(origin, "reply queue full, dropping response");
        }
    }

    /// Start assembling a reply; UDP replies get the echoed frame first.
    fn begin_reply(&mut self, reply: &ReplyTo) {
        self.out.clear();
        if let ReplyTo::Udp { frame, .. } = reply {
            frame.response().encode(&mut self.out);
        }
    }

    /// Ship the assembled reply to its destination.
    fn send_reply(&mut self, reply: ReplyTo) {
        match reply {
            ReplyTo::Tcp { conn } => {
                if self.reactor.send(conn, &self.out).is_err() {
                    self.close_connection(conn);
                }
            }
            ReplyTo::Udp { socket, peer, .. } => {
                if let Err(e) = self.reactor.send_to(socket, &self.out, peer) {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::warn!(error = %e, "udp send failed");
                    }
                }
            }
        }
    }
}
