//! Command parsing.

use std::fmt;

/// Longest accepted command line, including the terminating CRLF.
///
/// Keys are capped at 250 bytes by the protocol, so any legitimate line
/// fits comfortably.
const MAX_LINE: usize = 4096;

/// A parsed command borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `get <key>\r\n`
    Get { key: &'a [u8] },
    /// `set <key> <flags> <exptime> <bytes>\r\n<data>\r\n`
    Set {
        key: &'a [u8],
        flags: u32,
        exptime: u32,
        value: &'a [u8],
    },
}

/// Why a buffer did not yield a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed; try again after the next read.
    Incomplete,
    /// The input is not a valid command. `consumed` bytes cover the
    /// offending line (and data block, if any), so pipelined traffic after
    /// it can still be served.
    Malformed { consumed: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete command"),
            ParseError::Malformed { .. } => write!(f, "malformed command"),
        }
    }
}

impl std::error::Error for ParseError {}

impl<'a> Command<'a> {
    /// Parse one command from the front of `buf`.
    ///
    /// Returns the command and the total number of bytes it consumed,
    /// including the data block and all CRLF terminators.
    pub fn parse(buf: &'a [u8]) -> Result<(Command<'a>, usize), ParseError> {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(at) => at,
            None if buf.len() >= MAX_LINE => {
                return Err(ParseError::Malformed { consumed: buf.len() });
            }
            None => return Err(ParseError::Incomplete),
        };
        let line_end = newline + 1;

        // the line must terminate with CRLF
        if newline == 0 || buf[newline - 1] != b'\r' {
            return Err(ParseError::Malformed { consumed: line_end });
        }
        let line = &buf[..newline - 1];

        let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
        match tokens.next() {
            Some(b"get") => {
                let key = tokens
                    .next()
                    .ok_or(ParseError::Malformed { consumed: line_end })?;
                if tokens.next().is_some() {
                    return Err(ParseError::Malformed { consumed: line_end });
                }
                Ok((Command::Get { key }, line_end))
            }
            Some(b"set") => {
                let key = tokens
                    .next()
                    .ok_or(ParseError::Malformed { consumed: line_end })?;
                let flags = tokens.next().and_then(parse_u32);
                let exptime = tokens.next().and_then(parse_u32);
                let bytes = tokens.next().and_then(parse_u32);
                let (Some(flags), Some(exptime), Some(bytes)) = (flags, exptime, bytes) else {
                    return Err(ParseError::Malformed { consumed: line_end });
                };
                if tokens.next().is_some() {
                    return Err(ParseError::Malformed { consumed: line_end });
                }

                // data block plus its own CRLF
                let total = line_end + bytes as usize + 2;
                if buf.len() < total {
                    return Err(ParseError::Incomplete);
                }
                if &buf[total - 2..total] != b"\r\n" {
                    return Err(ParseError::Malformed { consumed: total });
                }
                let value = &buf[line_end..line_end + bytes as usize];
                Ok((
                    Command::Set {
                        key,
                        flags,
                        exptime,
                        value,
                    },
                    total,
                ))
            }
            _ => Err(ParseError::Malformed { consumed: line_end }),
        }
    }

    /// The key this command addresses.
    pub fn key(&self) -> &'a [u8] {
        match self {
            Command::Get { key } => key,
            Command::Set { key, .. } => key,
        }
    }
}

fn parse_u32(token: &[u8]) -> Option<u32> {
    if token.is_empty() {
        return None;
    }
    let mut value: u32 = 0;
    for &b in token {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error() {
        let result = Command::parse(b"foo\r\n");
        assert_eq!(result, Err(ParseError::Malformed { consumed: 5 }));
    }

    #[test]
    fn parse_set() {
        let (cmd, consumed) = Command::parse(b"set foo 0 0 3\r\nbar\r\n").unwrap();
        assert_eq!(consumed, 20);
        assert_eq!(
            cmd,
            Command::Set {
                key: b"foo",
                flags: 0,
                exptime: 0,
                value: b"bar",
            }
        );
    }

    #[test]
    fn parse_get() {
        let (cmd, consumed) = Command::parse(b"get foo\r\n").unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(cmd, Command::Get { key: b"foo" });
    }

    #[test]
    fn parse_many() {
        let buf: &[u8] = b"set foo 0 0 3\r\nbar\r\nget foo\r\n";
        let (cmd, consumed) = Command::parse(buf).unwrap();
        assert!(matches!(cmd, Command::Set { value: b"bar", .. }));
        let (cmd, consumed2) = Command::parse(&buf[consumed..]).unwrap();
        assert_eq!(cmd, Command::Get { key: b"foo" });
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn parse_set_with_flags_and_exptime() {
        let (cmd, _) = Command::parse(b"set k 123 3600 5\r\nhello\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: b"k",
                flags: 123,
                exptime: 3600,
                value: b"hello",
            }
        );
    }

    #[test]
    fn parse_set_empty_value() {
        let (cmd, consumed) = Command::parse(b"set foo 0 0 0\r\n\r\n").unwrap();
        assert_eq!(consumed, 17);
        assert!(matches!(cmd, Command::Set { value: b"", .. }));
    }

    #[test]
    fn incomplete_inputs() {
        assert_eq!(Command::parse(b""), Err(ParseError::Incomplete));
        assert_eq!(Command::parse(b"get fo"), Err(ParseError::Incomplete));
        assert_eq!(Command::parse(b"set foo 0 0 3\r\n"), Err(ParseError::Incomplete));
        assert_eq!(
            Command::parse(b"set foo 0 0 3\r\nba"),
            Err(ParseError::Incomplete)
        );
        assert_eq!(
            Command::parse(b"set foo 0 0 3\r\nbar\r"),
            Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn malformed_inputs() {
        // bad byte count
        assert!(matches!(
            Command::parse(b"set foo 0 0 abc\r\nxyz\r\n"),
            Err(ParseError::Malformed { .. })
        ));
        // missing arguments
        assert!(matches!(
            Command::parse(b"set foo 0 0\r\n"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse(b"get\r\n"),
            Err(ParseError::Malformed { .. })
        ));
        // get takes exactly one key in this subset
        assert!(matches!(
            Command::parse(b"get a b\r\n"),
            Err(ParseError::Malformed { .. })
        ));
        // bare LF line ending
        assert!(matches!(
            Command::parse(b"get foo\n"),
            Err(ParseError::Malformed { consumed: 8 })
        ));
    }

    #[test]
    fn malformed_data_terminator_consumes_block() {
        let buf = b"set foo 0 0 3\r\nbarXXget foo\r\n";
        let err = Command::parse(buf).unwrap_err();
        let ParseError::Malformed { consumed } = err else {
            panic!("expected malformed");
        };
        assert_eq!(consumed, 20);
    }

    #[test]
    fn command_key_accessor() {
        let (cmd, _) = Command::parse(b"get foo\r\n").unwrap();
        assert_eq!(cmd.key(), b"foo");
        let (cmd, _) = Command::parse(b"set bar 0 0 1\r\nx\r\n").unwrap();
        assert_eq!(cmd.key(), b"bar");
    }

    #[test]
    fn binary_keys_and_values() {
        let mut buf = Vec::from(&b"set \xff\xfe 0 0 2\r\n"[..]);
        buf.extend_from_slice(&[0x00, 0x80]);
        buf.extend_from_slice(b"\r\n");
        let (cmd, _) = Command::parse(&buf).unwrap();
        let Command::Set { key, value, .. } = cmd else {
            panic!("expected set");
        };
        assert_eq!(key, &[0xff, 0xfe]);
        assert_eq!(value, &[0x00, 0x80]);
    }
}
