//! Per-connection receive state.

use bytes::BytesMut;

/// Receive-side state for one TCP connection.
///
/// Holds bytes that did not yet form a complete command. Response bytes are
/// buffered by the reactor, not here.
pub struct Connection {
    rx: BytesMut,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            rx: BytesMut::with_capacity(4096),
        }
    }

    /// Append freshly received bytes.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        // reclaim consumed capacity before growing
        let cap = self.rx.capacity();
        if cap > 0 && self.rx.len() * 2 < cap {
            self.rx.reserve(data.len());
        }
        self.rx.extend_from_slice(data);
    }

    /// Take the accumulated buffer for parsing; return it with
    /// [`Connection::restore`].
    #[inline]
    pub fn take_rx(&mut self) -> BytesMut {
        std::mem::take(&mut self.rx)
    }

    /// Put the (partially consumed) buffer back.
    #[inline]
    pub fn restore(&mut self, rx: BytesMut) {
        self.rx = rx;
    }

    #[inline]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
