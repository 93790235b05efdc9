//! UDP frame header.
//!
//! Every datagram starts with an 8-byte big-endian header. Requests carry a
//! client-chosen `request_id` and `sequence_num`; responses echo both and
//! always fit a single datagram.

use bytes::BytesMut;

/// Size of the frame header in bytes.
pub const FRAME_SIZE: usize = 8;

/// `{request_id, sequence_num, nr_datagrams, reserved}`, big-endian on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub request_id: u16,
    pub sequence_num: u16,
    pub nr_datagrams: u16,
    pub reserved: u16,
}

impl FrameHeader {
    /// Parse the header from the front of a datagram. `None` when the
    /// datagram is too short to carry one.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_SIZE {
            return None;
        }
        Some(FrameHeader {
            request_id: u16::from_be_bytes([buf[0], buf[1]]),
            sequence_num: u16::from_be_bytes([buf[2], buf[3]]),
            nr_datagrams: u16::from_be_bytes([buf[4], buf[5]]),
            reserved: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// The header for the response to this request: request_id and
    /// sequence_num echoed, one datagram, reserved zeroed.
    pub fn response(&self) -> FrameHeader {
        FrameHeader {
            request_id: self.request_id,
            sequence_num: self.sequence_num,
            nr_datagrams: 1,
            reserved: 0,
        }
    }

    /// Append the wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence_num.to_be_bytes());
        buf.extend_from_slice(&self.nr_datagrams.to_be_bytes());
        buf.extend_from_slice(&self.reserved.to_be_bytes());
    }
}
