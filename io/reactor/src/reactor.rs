//! The per-thread event loop.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use slab::Slab;

use crate::error::Error;
use crate::mesh::Mesh;
use crate::metrics;
use crate::poller::{Interest, MioPoller, Poller, Readiness};

/// Token of the thread's own wakeup handle.
const WAKEUP_TOKEN: usize = 1 << 31;
/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;
/// Token offset for UDP sockets.
const UDP_TOKEN_OFFSET: usize = 1 << 29;

/// Opaque connection identifier.
///
/// Encodes a slab slot and a generation counter so that a stale id held
/// across a close (e.g. inside an in-flight cross-thread reply) cannot be
/// misattributed to a new connection reusing the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    #[inline]
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (slot as u64 & 0xffff_ffff))
    }

    /// The slot index, suitable for indexing caller-side state.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Opaque listener identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) usize);

/// Opaque UDP socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpId(pub(crate) usize);

/// Work surfaced by one reactor iteration, drained by the owning shard.
#[derive(Debug)]
pub enum Event<T> {
    /// A new connection was accepted and registered.
    Accepted { conn: ConnId, peer: SocketAddr },
    /// A connection has bytes to read; call `recv` until WouldBlock.
    Readable { conn: ConnId },
    /// The peer closed or errored; the shard should `close` the connection.
    Closed { conn: ConnId },
    /// A UDP socket has datagrams to read; call `recv_from` until WouldBlock.
    UdpReadable { socket: UdpId },
    /// A cross-thread message arrived from a peer shard.
    Message(T),
}

struct Connection {
    stream: TcpStream,
    /// Unsent response bytes, flushed on writable readiness.
    tx: BytesMut,
    writable_registered: bool,
    generation: u32,
}

/// Per-thread reactor: readiness polling, inbound queue polling, and the
/// sleep/wakeup protocol. Generic over the readiness backend.
pub struct Reactor<T, P: Poller = MioPoller> {
    shard: usize,
    mesh: Arc<Mesh<T>>,
    poller: P,
    connections: Slab<Connection>,
    listeners: Slab<TcpListener>,
    udp_sockets: Slab<UdpSocket>,
    events: Vec<Event<T>>,
    ready: Vec<Readiness>,
    /// Peers enqueued to during the current iteration; at most one wakeup
    /// per peer is issued when these are flushed.
    pending_wakeups: Vec<bool>,
    /// Per-slot generation counters, bumped on close.
    generations: Vec<u32>,
}

impl<T> Reactor<T, MioPoller> {
    /// Create a reactor for `shard` with the default (epoll) backend.
    pub fn new(shard: usize, mesh: Arc<Mesh<T>>) -> Result<Self, Error> {
        let poller = MioPoller::new()?;
        Self::with_poller(shard, mesh, poller)
    }
}

impl<T, P: Poller> Reactor<T, P> {
    /// Create a reactor for `shard` over an explicit backend.
    pub fn with_poller(shard: usize, mesh: Arc<Mesh<T>>, mut poller: P) -> Result<Self, Error> {
        poller.register(mesh.wakeup_fd(shard), WAKEUP_TOKEN, Interest::Readable)?;
        let nr_threads = mesh.nr_threads();
        Ok(Self {
            shard,
            mesh,
            poller,
            connections: Slab::with_capacity(1024),
            listeners: Slab::with_capacity(4),
            udp_sockets: Slab::with_capacity(4),
            events: Vec::with_capacity(256),
            ready: Vec::with_capacity(256),
            pending_wakeups: vec![false; nr_threads],
            generations: Vec::new(),
        })
    }

    /// This reactor's shard id.
    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Number of currently registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // === Listener and socket registration ===

    /// Bind and listen on `addr` with SO_REUSEADDR and SO_REUSEPORT, so
    /// every shard can bind its own listener on the same port.
    pub fn listen(&mut self, addr: SocketAddr, backlog: u32) -> io::Result<ListenerId> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        set_reuse_port(&socket);
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        let listener: TcpListener = socket.into();
        let entry = self.listeners.vacant_entry();
        let id = entry.key();
        self.poller.register(
            listener.as_raw_fd(),
            id + LISTENER_TOKEN_OFFSET,
            Interest::Readable,
        )?;
        entry.insert(listener);
        Ok(ListenerId(id))
    }

    /// The address a listener actually bound (useful with port 0).
    pub fn listener_addr(&self, id: ListenerId) -> io::Result<SocketAddr> {
        self.listeners[id.0].local_addr()
    }

    /// Bind a UDP socket on `addr` with SO_REUSEADDR and SO_REUSEPORT.
    pub fn bind_udp(&mut self, addr: SocketAddr) -> io::Result<UdpId> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        set_reuse_port(&socket);
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        let entry = self.udp_sockets.vacant_entry();
        let id = entry.key();
        self.poller.register(
            socket.as_raw_fd(),
            id + UDP_TOKEN_OFFSET,
            Interest::Readable,
        )?;
        entry.insert(socket);
        Ok(UdpId(id))
    }

    /// The address a UDP socket actually bound.
    pub fn udp_addr(&self, id: UdpId) -> io::Result<SocketAddr> {
        self.udp_sockets[id.0].local_addr()
    }

    // === Connection I/O ===

    /// Resolve a connection id, rejecting stale generations.
    fn conn_mut(&mut self, conn: ConnId) -> Option<&mut Connection> {
        let c = self.connections.get_mut(conn.slot())?;
        if c.generation == conn.generation() {
            Some(c)
        } else {
            None
        }
    }

    /// Read available bytes into `buf`. `Ok(0)` means EOF; the caller is
    /// expected to `close` the connection. Connection resets read as EOF.
    pub fn recv(&mut self, conn: ConnId, buf: &mut [u8]) -> io::Result<usize> {
        let c = self.conn_mut(conn).ok_or(Error::InvalidConnection)?;
        match c.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Send `data`, attempting an immediate nonblocking write.
    ///
    /// The unwritten tail is appended to the per-socket transmit buffer and
    /// the socket is registered for writable readiness; the buffer drains
    /// internally when writable fires. Connection-reset and broken-pipe are
    /// reported as success (the read side will observe the close).
    pub fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()> {
        let slot = conn.slot();
        let Some(c) = self.conn_mut(conn) else {
            // closed (or recycled) connection: a reset would also be silent
            return Ok(());
        };

        if !c.tx.is_empty() {
            // order behind what is already queued
            c.tx.extend_from_slice(data);
            return self.ensure_writable(slot);
        }

        let mut written = 0;
        loop {
            match c.stream.write(&data[written..]) {
                Ok(n) if written + n == data.len() => return Ok(()),
                Ok(n) => {
                    written += n;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        let Some(c) = self.connections.get_mut(slot) else {
            return Ok(());
        };
        c.tx.extend_from_slice(&data[written..]);
        self.ensure_writable(slot)
    }

    /// Bytes queued in a connection's transmit buffer.
    pub fn pending_tx(&self, conn: ConnId) -> usize {
        self.connections.get(conn.slot()).map_or(0, |c| c.tx.len())
    }

    /// Deregister and drop a connection. The slot's generation is bumped so
    /// stale ids cannot reach a future connection.
    pub fn close(&mut self, conn: ConnId) {
        let slot = conn.slot();
        if self.conn_mut(conn).is_none() {
            return;
        }
        if let Some(c) = self.connections.try_remove(slot) {
            let _ = self.poller.unregister(c.stream.as_raw_fd());
            self.generations[slot] = self.generations[slot].wrapping_add(1);
        }
    }

    // === UDP I/O ===

    /// Receive one datagram. `WouldBlock` when none is pending.
    pub fn recv_from(&mut self, socket: UdpId, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.udp_sockets[socket.0].recv_from(buf)
    }

    /// Send one datagram to `peer`.
    pub fn send_to(&mut self, socket: UdpId, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.udp_sockets[socket.0].send_to(data, peer)
    }

    // === Cross-thread messaging ===

    /// Enqueue `msg` for shard `to` and record it for a coalesced wakeup.
    ///
    /// Returns `false` when the queue is full; never blocks.
    pub fn send_msg(&mut self, to: usize, msg: T) -> bool {
        if self.mesh.send(self.shard, to, msg) {
            self.pending_wakeups[to] = true;
            true
        } else {
            false
        }
    }

    /// Issue at most one wakeup per peer enqueued to since the last flush.
    pub fn flush_wakeups(&mut self) -> Result<(), Error> {
        for peer in 0..self.pending_wakeups.len() {
            if self.pending_wakeups[peer] {
                self.pending_wakeups[peer] = false;
                if self.mesh.wake(peer)? {
                    metrics::WAKEUPS.increment();
                }
            }
        }
        Ok(())
    }

    // === The loop ===

    /// Run one reactor iteration.
    ///
    /// 1. Flush wakeups accumulated during the previous iteration.
    /// 2. Drain inbound queues once; drained messages become events.
    /// 3. If messages were drained, poll I/O with a zero timeout,
    ///    speculating that more messages are imminent.
    /// 4. Otherwise mark this thread sleeping (seq-cst), re-check the
    ///    queues (lost-wakeup prevention), and block in the poller.
    /// 5. Interrupted waits are ignored; other failures are fatal.
    /// 6. Translate readiness into events for the caller.
    pub fn poll(&mut self) -> Result<(), Error> {
        self.flush_wakeups()?;

        let drained = {
            let events = &mut self.events;
            self.mesh.drain(self.shard, |msg| events.push(Event::Message(msg)))
        };

        let timeout = if drained {
            Some(Duration::ZERO)
        } else {
            self.mesh.set_sleeping(self.shard, true);
            if self.mesh.has_inbound(self.shard) {
                // raced with a producer; restart the iteration
                self.mesh.set_sleeping(self.shard, false);
                return Ok(());
            }
            None
        };

        self.ready.clear();
        let wait = self.poller.wait(timeout, &mut self.ready);
        if timeout.is_none() {
            self.mesh.set_sleeping(self.shard, false);
        }
        match wait {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready = std::mem::take(&mut self.ready);
        for r in &ready {
            self.dispatch(r);
        }
        self.ready = ready;
        self.ready.clear();
        Ok(())
    }

    /// Take the events surfaced by `poll`.
    pub fn drain_events(&mut self) -> Vec<Event<T>> {
        std::mem::take(&mut self.events)
    }

    // === Internals ===

    fn dispatch(&mut self, r: &Readiness) {
        if r.token == WAKEUP_TOKEN {
            self.mesh.consume_wakeup(self.shard);
            return;
        }
        if r.token >= LISTENER_TOKEN_OFFSET {
            if r.readable {
                self.accept_ready(r.token - LISTENER_TOKEN_OFFSET);
            }
            return;
        }
        if r.token >= UDP_TOKEN_OFFSET {
            if r.readable {
                self.events.push(Event::UdpReadable {
                    socket: UdpId(r.token - UDP_TOKEN_OFFSET),
                });
            }
            return;
        }

        let slot = r.token;
        let Some(c) = self.connections.get(slot) else {
            return;
        };
        let conn = ConnId::new(slot, c.generation);
        if r.writable {
            self.flush_tx(slot);
        }
        if r.readable {
            self.events.push(Event::Readable { conn });
        } else if r.closed || r.error {
            self.events.push(Event::Closed { conn });
        }
    }

    fn accept_ready(&mut self, listener_slot: usize) {
        loop {
            let accepted = match self.listeners.get(listener_slot) {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);

                    let slot = self.connections.vacant_key();
                    if slot >= self.generations.len() {
                        self.generations.resize(slot + 1, 0);
                    }
                    let generation = self.generations[slot];
                    if self
                        .poller
                        .register(stream.as_raw_fd(), slot, Interest::Readable)
                        .is_err()
                    {
                        continue; // stream dropped, peer sees a reset
                    }
                    self.connections.insert(Connection {
                        stream,
                        tx: BytesMut::new(),
                        writable_registered: false,
                        generation,
                    });
                    self.events.push(Event::Accepted {
                        conn: ConnId::new(slot, generation),
                        peer,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Drain a connection's transmit buffer after writable readiness; once
    /// it empties, drop the writable registration.
    fn flush_tx(&mut self, slot: usize) {
        loop {
            let Some(c) = self.connections.get_mut(slot) else {
                return;
            };
            if c.tx.is_empty() {
                break;
            }
            match c.stream.write(&c.tx) {
                Ok(0) => break,
                Ok(n) => c.tx.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    // silent: the read side will observe the close
                    c.tx.clear();
                    break;
                }
            }
        }

        let Some(c) = self.connections.get_mut(slot) else {
            return;
        };
        if c.writable_registered && c.tx.is_empty() {
            let fd = c.stream.as_raw_fd();
            if self.poller.modify(fd, slot, Interest::Readable).is_ok() {
                self.connections[slot].writable_registered = false;
            }
        }
    }

    fn ensure_writable(&mut self, slot: usize) -> io::Result<()> {
        let Some(c) = self.connections.get(slot) else {
            return Ok(());
        };
        if c.writable_registered {
            return Ok(());
        }
        let fd = c.stream.as_raw_fd();
        self.poller.modify(fd, slot, Interest::ReadWrite)?;
        self.connections[slot].writable_registered = true;
        Ok(())
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

/// Enable SO_REUSEPORT so every shard can bind the same port and the
/// kernel load-balances connections across them.
#[cfg(unix)]
fn set_reuse_port(socket: &socket2::Socket) {
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
