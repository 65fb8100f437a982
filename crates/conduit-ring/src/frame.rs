//! 12-byte control frame codec.
//!
//! The same three little-endian `u32`s at offsets 0/4/8 back two wire
//! formats: [`Frame`] as spoken on the Broker Socket (the socket itself
//! identifies the stream) and [`RingFrame`] as stored in a shared-memory
//! segment (the stream id travels in the frame). No alignment is assumed.

use crate::error::FrameError;

pub const FRAME_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Confirm = 0,
    Connect = 1,
    Write = 2,
    Disconnect = 3,
    Data = 4,
}

impl FrameKind {
    pub fn from_u32(v: u32) -> Result<Self, FrameError> {
        match v {
            0 => Ok(Self::Confirm),
            1 => Ok(Self::Connect),
            2 => Ok(Self::Write),
            3 => Ok(Self::Disconnect),
            4 => Ok(Self::Data),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[inline]
fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte slice"))
}

/// Control frame on a local socket. `arg1` carries a backend id for
/// `Connect` and a byte length for `Write`; `arg2` is reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub arg1: u32,
    pub arg2: u32,
}

impl Frame {
    pub const fn new(kind: FrameKind, arg1: u32, arg2: u32) -> Self {
        Self { kind, arg1, arg2 }
    }

    pub fn encode(&self, buf: &mut [u8; FRAME_LEN]) {
        put_u32(buf, 0, self.kind as u32);
        put_u32(buf, 4, self.arg1);
        put_u32(buf, 8, self.arg2);
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        Ok(Self {
            kind: FrameKind::from_u32(get_u32(buf, 0))?,
            arg1: get_u32(buf, 4),
            arg2: get_u32(buf, 8),
        })
    }
}

/// Frame as stored in a shared-memory segment. For `Data` frames `arg1` is
/// the payload length that follows the header in the same segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingFrame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub arg1: u32,
}

impl RingFrame {
    pub const fn new(stream_id: u32, kind: FrameKind, arg1: u32) -> Self {
        Self { stream_id, kind, arg1 }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.stream_id);
        put_u32(buf, 4, self.kind as u32);
        put_u32(buf, 8, self.arg1);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        Ok(Self {
            stream_id: get_u32(buf, 0),
            kind: FrameKind::from_u32(get_u32(buf, 4))?,
            arg1: get_u32(buf, 8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = [0u8; FRAME_LEN];
        for kind in
            [FrameKind::Confirm, FrameKind::Connect, FrameKind::Write, FrameKind::Disconnect] {
            let f = Frame::new(kind, 0xdead_beef, 7);
            f.encode(&mut buf);
            assert_eq!(Frame::decode(&buf), Ok(f));
        }
    }

    #[test]
    fn ring_frame_roundtrip() {
        let mut buf = [0u8; FRAME_LEN];
        let f = RingFrame::new(42, FrameKind::Data, 4084);
        f.encode(&mut buf);
        assert_eq!(RingFrame::decode(&buf), Ok(f));
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = [0u8; FRAME_LEN];
        RingFrame::new(0x0102_0304, FrameKind::Write, 0x0a0b_0c0d).encode(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1, 2, 0, 0, 0, 0x0d, 0x0c, 0x0b, 0x0a]);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = [0u8; FRAME_LEN];
        put_u32(&mut buf, 0, 9);
        assert_eq!(Frame::decode(&buf), Err(FrameError::UnknownKind(9)));
    }
}
