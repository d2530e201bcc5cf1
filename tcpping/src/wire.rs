//! Binary layout of the handshake and the probe / echo frames.
//!
//! All integers are big-endian. A probe is `id:8 | host_a:8 | filler`, its
//! echo is `id:8 | host_a:8 | host_b:8 | filler`, both exactly as long as the
//! size announced in the handshake.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::PingError;

pub const HANDSHAKE_LEN: usize = 4;
pub const PROBE_HEADER_LEN: usize = 16;
pub const ECHO_HEADER_LEN: usize = 24;
pub const FILLER: u8 = 0xFF;

pub const MIN_PACKET_SIZE: usize = 50;
pub const MAX_PACKET_SIZE: usize = 3000;
pub const DEFAULT_PACKET_SIZE: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHeader {
    pub id: i64,
    pub host_a: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoHeader {
    pub id: i64,
    pub host_a: i64,
    pub host_b: i64,
}

/// Milliseconds since the unix epoch on the local clock.
pub fn now_millis() -> Result<i64, PingError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

pub fn encode_handshake(size: i32) -> [u8; HANDSHAKE_LEN] {
    size.to_be_bytes()
}

pub fn decode_handshake(mut buf: &[u8]) -> Result<i32, PingError> {
    if buf.len() < HANDSHAKE_LEN {
        return Err(PingError::MalformedHandshake(format!(
            "expected {} bytes, got {}",
            HANDSHAKE_LEN,
            buf.len()
        )));
    }
    Ok(buf.get_i32())
}

/// `total_size` must be at least [PROBE_HEADER_LEN].
pub fn encode_probe(id: i64, sent_at: i64, total_size: usize) -> BytesMut {
    debug_assert!(total_size >= PROBE_HEADER_LEN);
    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_i64(id);
    buf.put_i64(sent_at);
    buf.resize(total_size.max(PROBE_HEADER_LEN), FILLER);
    buf
}

pub fn decode_probe_header(mut buf: &[u8]) -> Result<ProbeHeader, PingError> {
    check_len(buf, PROBE_HEADER_LEN)?;
    Ok(ProbeHeader {
        id: buf.get_i64(),
        host_a: buf.get_i64(),
    })
}

/// `total_size` must be at least [ECHO_HEADER_LEN].
pub fn encode_echo(
    id: i64,
    host_a: i64,
    host_b: i64,
    total_size: usize,
) -> BytesMut {
    debug_assert!(total_size >= ECHO_HEADER_LEN);
    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_i64(id);
    buf.put_i64(host_a);
    buf.put_i64(host_b);
    buf.resize(total_size.max(ECHO_HEADER_LEN), FILLER);
    buf
}

pub fn decode_echo_header(mut buf: &[u8]) -> Result<EchoHeader, PingError> {
    check_len(buf, ECHO_HEADER_LEN)?;
    Ok(EchoHeader {
        id: buf.get_i64(),
        host_a: buf.get_i64(),
        host_b: buf.get_i64(),
    })
}

/// Turns a received probe frame into its echo in place: the id and host A
/// timestamp stay, `host_b` goes to offset 16 and the rest is filler again.
pub fn stamp_echo(frame: &mut [u8], host_b: i64) -> Result<ProbeHeader, PingError> {
    check_len(frame, ECHO_HEADER_LEN)?;
    let header = decode_probe_header(frame)?;

    let mut tail = &mut frame[PROBE_HEADER_LEN..];
    tail.put_i64(host_b);
    tail.fill(FILLER);

    Ok(header)
}

fn check_len(buf: &[u8], needed: usize) -> Result<(), PingError> {
    if buf.len() < needed {
        return Err(PingError::MalformedPacket {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}
