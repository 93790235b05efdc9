//! Response encoding.
//!
//! Encoders append directly to the caller's write buffer; the caller is
//! responsible for any UDP frame prefix.

use bytes::BytesMut;

/// `STORED\r\n`
pub fn stored(buf: &mut BytesMut) {
    buf.extend_from_slice(b"STORED\r\n");
}

/// `ERROR\r\n`, sent when a command could not be parsed.
pub fn error(buf: &mut BytesMut) {
    buf.extend_from_slice(b"ERROR\r\n");
}

/// `SERVER_ERROR out of memory storing object\r\n`
pub fn server_error_out_of_memory(buf: &mut BytesMut) {
    buf.extend_from_slice(b"SERVER_ERROR out of memory storing object\r\n");
}

/// `SERVER_ERROR <reason>\r\n`
pub fn server_error(buf: &mut BytesMut, reason: &str) {
    buf.extend_from_slice(b"SERVER_ERROR ");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// `VALUE <key> 0 <bytes>\r\n<data>\r\n` for one hit; follow with [`end`].
pub fn value(buf: &mut BytesMut, key: &[u8], blob: &[u8]) {
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" 0 ");
    push_decimal(buf, blob.len());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(blob);
    buf.extend_from_slice(b"\r\n");
}

/// `END\r\n`, terminating every get response, hit or miss.
pub fn end(buf: &mut BytesMut) {
    buf.extend_from_slice(b"END\r\n");
}

fn push_decimal(buf: &mut BytesMut, value: usize) {
    let mut digits = [0u8; 20];
    let mut at = digits.len();
    let mut v = value;
    loop {
        at -= 1;
        digits[at] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[at..]);
}
