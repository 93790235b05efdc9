//! Cross-thread message mesh: SPSC queues, wakeup handles, sleeping flags.
//!
//! For `n` threads the mesh holds an `n x n` matrix of SPSC queues (one per
//! ordered producer/consumer pair), one eventfd wakeup handle per thread,
//! and one sleeping flag per thread.
//!
//! The lost-wakeup race is avoided by ordering: a producer enqueues, then
//! reads the consumer's sleeping flag with seq-cst; the consumer sets its
//! sleeping flag with seq-cst, then re-checks its queues. Either the
//! producer observes the flag and fires the eventfd, or the consumer
//! observes the message before blocking. Weaker orderings are incorrect.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::spsc::Queue;

/// Capacity of each cross-thread queue, sized for connection fan-in.
pub const MSG_QUEUE_CAPACITY: usize = 4096;

/// Shared cross-thread coordination state for one group of shard threads.
///
/// Created once at startup and shared via `Arc`. The SPSC discipline is by
/// convention: queue `(consumer, producer)` is only pushed by thread
/// `producer` and only popped by thread `consumer`.
pub struct Mesh<T> {
    nr_threads: usize,
    /// `queues[consumer * nr_threads + producer]`.
    queues: Vec<Queue<T>>,
    /// One nonblocking eventfd per thread.
    wakeups: Vec<OwnedFd>,
    /// Seq-cst sleeping flags, one per thread.
    sleeping: Vec<AtomicBool>,
}

impl<T> Mesh<T> {
    /// Build the mesh for `nr_threads` threads.
    pub fn new(nr_threads: usize) -> io::Result<Self> {
        assert!(nr_threads >= 1);

        let queues = (0..nr_threads * nr_threads)
            .map(|_| Queue::with_capacity(MSG_QUEUE_CAPACITY))
            .collect();

        let mut wakeups = Vec::with_capacity(nr_threads);
        for _ in 0..nr_threads {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            wakeups.push(unsafe { OwnedFd::from_raw_fd(fd) });
        }

        let sleeping = (0..nr_threads).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            nr_threads,
            queues,
            wakeups,
            sleeping,
        })
    }

    /// Number of threads in the mesh.
    #[inline]
    pub fn nr_threads(&self) -> usize {
        self.nr_threads
    }

    #[inline]
    fn queue(&self, consumer: usize, producer: usize) -> &Queue<T> {
        &self.queues[consumer * self.nr_threads + producer]
    }

    /// Enqueue `msg` from thread `from` for thread `to`.
    ///
    /// Returns `false` when the queue is full. Never blocks. The caller is
    /// responsible for waking `to` (see [`Mesh::wake`]), typically coalesced
    /// to one wakeup per peer per reactor iteration.
    pub fn send(&self, from: usize, to: usize, msg: T) -> bool {
        debug_assert_ne!(from, to, "attempting to send message to self");
        self.queue(to, from).try_push(msg).is_ok()
    }

    /// Drain every inbound queue of thread `me`, invoking `f` per message.
    ///
    /// Returns `true` if at least one message was drained.
    pub fn drain<F: FnMut(T)>(&self, me: usize, mut f: F) -> bool {
        let mut any = false;
        for other in 0..self.nr_threads {
            if other == me {
                continue;
            }
            let queue = self.queue(me, other);
            while let Some(msg) = queue.pop() {
                any = true;
                f(msg);
            }
        }
        any
    }

    /// Whether any inbound queue of thread `me` holds a message.
    pub fn has_inbound(&self, me: usize) -> bool {
        (0..self.nr_threads).any(|other| other != me && !self.queue(me, other).is_empty())
    }

    /// Publish thread `me`'s sleep state. Seq-cst, see the module docs.
    pub fn set_sleeping(&self, me: usize, sleeping: bool) {
        self.sleeping[me].store(sleeping, Ordering::SeqCst);
    }

    /// Wake thread `to` if it is marked sleeping.
    ///
    /// Returns `true` when a wakeup was actually fired.
    pub fn wake(&self, to: usize) -> io::Result<bool> {
        if self.sleeping[to].load(Ordering::SeqCst) {
            self.sleeping[to].store(false, Ordering::SeqCst);
            self.fire(to)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Unconditionally fire every wakeup handle. Used at shutdown so that
    /// threads blocked in their poller observe the shutdown flag.
    pub fn wake_all(&self) {
        for to in 0..self.nr_threads {
            let _ = self.fire(to);
        }
    }

    fn fire(&self, to: usize) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wakeups[to].as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The wakeup handle for thread `me`, for poller registration.
    pub fn wakeup_fd(&self, me: usize) -> RawFd {
        self.wakeups[me].as_raw_fd()
    }

    /// Clear thread `me`'s wakeup handle after it became readable.
    pub fn consume_wakeup(&self, me: usize) {
        let mut value: u64 = 0;
        // EAGAIN just means the counter was already consumed.
        unsafe {
            libc::read(
                self.wakeups[me].as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_drain() {
        let mesh: Mesh<u32> = Mesh::new(3).unwrap();
        assert!(mesh.send(1, 0, 10));
        assert!(mesh.send(2, 0, 20));
        assert!(mesh.has_inbound(0));
        assert!(!mesh.has_inbound(1));

        let mut got = Vec::new();
        assert!(mesh.drain(0, |m| got.push(m)));
        got.sort_unstable();
        assert_eq!(got, vec![10, 20]);
        assert!(!mesh.has_inbound(0));
        assert!(!mesh.drain(0, |_| panic!("queue should be empty")));
    }

    #[test]
    fn queues_are_per_pair_fifo() {
        let mesh: Mesh<u32> = Mesh::new(2).unwrap();
        for i in 0..10 {
            assert!(mesh.send(1, 0, i));
        }
        let mut got = Vec::new();
        mesh.drain(0, |m| got.push(m));
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn wake_fires_only_when_sleeping() {
        let mesh: Mesh<u32> = Mesh::new(2).unwrap();

        // not sleeping: wake is a no-op, nothing to consume
        assert!(!mesh.wake(0).unwrap());

        mesh.set_sleeping(0, true);
        assert!(mesh.wake(0).unwrap());
        // the flag was cleared by the waker
        assert!(!mesh.sleeping[0].load(Ordering::SeqCst));
        mesh.consume_wakeup(0);
    }

    #[test]
    fn send_reports_full_queue() {
        let mesh: Mesh<u64> = Mesh::new(2).unwrap();
        for i in 0..MSG_QUEUE_CAPACITY as u64 {
            assert!(mesh.send(0, 1, i));
        }
        assert!(!mesh.send(0, 1, u64::MAX));
    }
}
