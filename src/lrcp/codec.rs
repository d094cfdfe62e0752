use bytes::Bytes;

use super::{MAX_NUMERIC, MAX_PACKET};

/// A single LRCP packet, payload held unescaped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// `/connect/<session>/`
    Connect { session: u32 },
    /// `/data/<session>/<pos>/<payload>/`
    Data {
        session: u32,
        pos: u64,
        payload: Bytes,
    },
    /// `/ack/<session>/<length>/`
    Ack { session: u32, length: u64 },
    /// `/close/<session>/`
    Close { session: u32 },
}

impl Packet {
    pub fn session(&self) -> u32 {
        match *self {
            Packet::Connect { session } => session,
            Packet::Data { session, .. } => session,
            Packet::Ack { session, .. } => session,
            Packet::Close { session } => session,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Longer than [MAX_PACKET] bytes.
    Oversize,
    /// Contained a byte outside ASCII.
    NotAscii,
    /// Missing the leading or trailing `/`.
    BadFraming,
    /// Unknown command name.
    BadCommand,
    /// Wrong number of fields for the command.
    FieldCount,
    /// A numeric field that is not a decimal integer below 2^31.
    BadNumber,
    /// A payload `\` escaping anything other than `\` or `/`.
    BadEscape,
}

/// Parses one datagram. Anything that fails here is silently dropped by
/// the server; the error only feeds trace logging and tests.
pub fn parse(datagram: &[u8]) -> Result<Packet, ParseError> {
    if datagram.len() > MAX_PACKET {
        return Err(ParseError::Oversize);
    }
    if !datagram.is_ascii() {
        return Err(ParseError::NotAscii);
    }

    let interior = datagram
        .strip_prefix(b"/")
        .and_then(|d| d.strip_suffix(b"/"))
        .ok_or(ParseError::BadFraming)?;

    let fields = split_fields(interior);

    match fields[0] {
        b"connect" => {
            let &[_, session] = &fields[..] else {
                return Err(ParseError::FieldCount);
            };
            Ok(Packet::Connect {
                session: session_id(session)?,
            })
        },
        b"close" => {
            let &[_, session] = &fields[..] else {
                return Err(ParseError::FieldCount);
            };
            Ok(Packet::Close {
                session: session_id(session)?,
            })
        },
        b"ack" => {
            let &[_, session, length] = &fields[..] else {
                return Err(ParseError::FieldCount);
            };
            Ok(Packet::Ack {
                session: session_id(session)?,
                length: number(length)?,
            })
        },
        b"data" => {
            let &[_, session, pos, payload] = &fields[..] else {
                return Err(ParseError::FieldCount);
            };
            Ok(Packet::Data {
                session: session_id(session)?,
                pos: number(pos)?,
                payload: unescape(payload)?,
            })
        },
        _ => Err(ParseError::BadCommand),
    }
}

/// Serialises a packet to its wire form. Data payloads are escaped here;
/// the session sizes chunks so the result stays within [MAX_PACKET].
pub fn serialise(packet: &Packet) -> Vec<u8> {
    let out = match packet {
        Packet::Connect { session } => {
            format!("/connect/{session}/").into_bytes()
        },
        Packet::Ack { session, length } => {
            format!("/ack/{session}/{length}/").into_bytes()
        },
        Packet::Close { session } => format!("/close/{session}/").into_bytes(),
        Packet::Data {
            session,
            pos,
            payload,
        } => {
            let mut out = format!("/data/{session}/{pos}/").into_bytes();
            for &b in payload.iter() {
                if b == b'/' || b == b'\\' {
                    out.push(b'\\');
                }
                out.push(b);
            }
            out.push(b'/');
            out
        },
    };

    debug_assert!(out.len() <= MAX_PACKET);
    out
}

/// Wire cost of one payload byte: the two reserved bytes escape to two
/// characters.
pub fn escaped_len(b: u8) -> usize {
    if b == b'/' || b == b'\\' {
        2
    } else {
        1
    }
}

/// Splits the interior of a packet on unescaped `/`. Escape pairs stay in
/// the field verbatim; only the payload field is unescaped later. Always
/// yields at least one (possibly empty) field.
fn split_fields(interior: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < interior.len() {
        match interior[i] {
            // The escape consumes the next byte, whatever it is; a
            // trailing lone backslash is caught during unescaping.
            b'\\' => i += if i + 1 < interior.len() { 2 } else { 1 },
            b'/' => {
                fields.push(&interior[start..i]);
                i += 1;
                start = i;
            },
            _ => i += 1,
        }
    }

    fields.push(&interior[start..]);
    fields
}

fn unescape(raw: &[u8]) -> Result<Bytes, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let b = raw[i];
        if b == b'\\' {
            match raw.get(i + 1) {
                Some(&b'\\') => out.push(b'\\'),
                Some(&b'/') => out.push(b'/'),
                _ => return Err(ParseError::BadEscape),
            }
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }

    Ok(out.into())
}

fn number(field: &[u8]) -> Result<u64, ParseError> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::BadNumber);
    }

    let n: u64 = std::str::from_utf8(field)
        .map_err(|_| ParseError::BadNumber)?
        .parse()
        .map_err(|_| ParseError::BadNumber)?;

    if n >= MAX_NUMERIC {
        return Err(ParseError::BadNumber);
    }
    Ok(n)
}

fn session_id(field: &[u8]) -> Result<u32, ParseError> {
    Ok(number(field)? as u32)
}
