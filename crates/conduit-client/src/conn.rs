use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    os::unix::net::UnixStream,
};

use conduit_broker::{ResolvedBackend, broker_socket_path, connect_backend, get_backend};
use conduit_ring::{FRAME_LEN, Frame, FrameKind};
use conduit_utils::GrowBuf;
use tracing::debug;

use crate::error::ConnError;

/// Payloads below this are cheaper to ship raw than to squeeze.
pub const COMPRESSION_CUTOFF: usize = 250_000;

/// Direct-mode wire header: compression flag, compressed length,
/// uncompressed length.
const PREAMBLE_LEN: usize = 1 + 4 + 4;

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Straight TCP to the backend, preamble framing, optional LZ4.
    Direct,
    /// Through the broker, control-frame framing.
    Brokered,
}

pub struct Connection {
    stream: Stream,
    mode: Mode,
    compression: bool,
    compressed: GrowBuf,
    decompressed: GrowBuf,
    staging: GrowBuf,
}

impl Connection {
    fn from_stream(stream: Stream, mode: Mode, compression: bool) -> Self {
        Self {
            stream,
            mode,
            compression,
            compressed: GrowBuf::new(),
            decompressed: GrowBuf::new(),
            staging: GrowBuf::new(),
        }
    }

    /// Connect to backend `id`. Direct TCP when the backend wants it,
    /// otherwise through the Broker Socket: send `Connect(id)` and block
    /// until the broker confirms the far end is wired up.
    pub fn connect(id: u32) -> Result<Self, ConnError> {
        let backend = get_backend(id).ok_or(ConnError::UnknownBackend(id))?;
        if backend.use_tcp {
            let stream = connect_backend(&backend);
            return Ok(Self::from_stream(Stream::Tcp(stream), Mode::Direct, backend.compression));
        }

        let path = broker_socket_path();
        let stream = loop {
            match UnixStream::connect(&path) {
                Ok(stream) => break stream,
                Err(e) => debug!(?path, %e, "broker socket not up yet"),
            }
        };
        let mut conn =
            Self::from_stream(Stream::Unix(stream), Mode::Brokered, backend.compression);
        conn.write_frame(Frame::new(FrameKind::Connect, id, 0))?;
        let frame = conn.read_control()?;
        if frame.kind != FrameKind::Confirm {
            return Err(ConnError::UnexpectedFrame(frame.kind));
        }
        Ok(conn)
    }

    /// Receive one message, returning a slice into the connection-owned
    /// buffer; valid until the next call.
    pub fn read(&mut self) -> Result<&[u8], ConnError> {
        match self.mode {
            Mode::Direct => {
                let mut preamble = [0u8; PREAMBLE_LEN];
                self.stream.read_exact(&mut preamble)?;
                let compressed = preamble[0] != 0;
                let clen = u32::from_le_bytes(preamble[1..5].try_into().unwrap()) as usize;
                let ulen = u32::from_le_bytes(preamble[5..9].try_into().unwrap()) as usize;

                self.stream.read_exact(self.compressed.slice_mut(clen))?;
                if compressed {
                    let got = lz4_flex::block::decompress_into(
                        self.compressed.slice(clen),
                        self.decompressed.slice_mut(ulen),
                    )?;
                    if got != ulen {
                        return Err(ConnError::ShortDecompress { got, want: ulen });
                    }
                    Ok(self.decompressed.slice(ulen))
                } else {
                    Ok(self.compressed.slice(clen))
                }
            }
            Mode::Brokered => {
                let frame = self.read_control()?;
                if frame.kind != FrameKind::Write {
                    return Err(ConnError::UnexpectedFrame(frame.kind));
                }
                let len = frame.arg1 as usize;
                self.stream.read_exact(self.decompressed.slice_mut(len))?;
                Ok(self.decompressed.slice(len))
            }
        }
    }

    /// Send one message. Direct mode compresses iff the backend asked for it
    /// and the payload is at least [`COMPRESSION_CUTOFF`] bytes.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), ConnError> {
        match self.mode {
            Mode::Direct => {
                let mut preamble = [0u8; PREAMBLE_LEN];
                preamble[5..9].copy_from_slice(&(buf.len() as u32).to_le_bytes());
                if self.compression && buf.len() >= COMPRESSION_CUTOFF {
                    let max = lz4_flex::block::get_maximum_output_size(buf.len());
                    let clen =
                        lz4_flex::block::compress_into(buf, self.compressed.slice_mut(max))?;
                    preamble[0] = 1;
                    preamble[1..5].copy_from_slice(&(clen as u32).to_le_bytes());
                    self.stream.write_all(&preamble)?;
                    self.stream.write_all(self.compressed.slice(clen))?;
                } else {
                    preamble[1..5].copy_from_slice(&(buf.len() as u32).to_le_bytes());
                    self.stream.write_all(&preamble)?;
                    self.stream.write_all(buf)?;
                }
                Ok(())
            }
            Mode::Brokered => {
                self.write_frame(Frame::new(FrameKind::Write, buf.len() as u32, 0))?;
                self.stream.write_all(buf)?;
                Ok(())
            }
        }
    }

    /// Caller-fillable scratch buffer of at least `cap` bytes, reused across
    /// calls on this connection.
    pub fn staging(&mut self, cap: usize) -> &mut [u8] {
        self.staging.slice_mut(cap)
    }

    /// Send the first `len` bytes previously filled via [`Self::staging`].
    pub fn write_staged(&mut self, len: usize) -> Result<(), ConnError> {
        let staging = std::mem::take(&mut self.staging);
        let result = self.write(staging.slice(len));
        self.staging = staging;
        result
    }

    pub fn close(self) {}

    fn read_control(&mut self) -> Result<Frame, ConnError> {
        let mut buf = [0u8; FRAME_LEN];
        self.stream.read_exact(&mut buf)?;
        Ok(Frame::decode(&buf)?)
    }

    fn write_frame(&mut self, frame: Frame) -> Result<(), ConnError> {
        let mut buf = [0u8; FRAME_LEN];
        frame.encode(&mut buf);
        Ok(self.stream.write_all(&buf)?)
    }
}

/// Backend-side listener (`server_init`/`server_accept`). Always a TCP
/// listener at the backend's configured endpoint; accepted connections speak
/// whichever framing the backend's mode dictates, since the peer is either a
/// direct client or this host's broker.
pub struct Listener {
    inner: TcpListener,
    backend: ResolvedBackend,
}

impl Listener {
    pub fn bind(id: u32) -> Result<Self, ConnError> {
        let backend = get_backend(id).ok_or(ConnError::UnknownBackend(id))?;
        let inner = TcpListener::bind((backend.address.as_str(), backend.port))?;
        Ok(Self { inner, backend })
    }

    /// Blocking accept; `TCP_NODELAY` on the accepted stream.
    pub fn accept(&self) -> Result<Connection, ConnError> {
        let (stream, _addr) = self.inner.accept()?;
        stream.set_nodelay(true)?;
        let mode = if self.backend.use_tcp { Mode::Direct } else { Mode::Brokered };
        Ok(Connection::from_stream(Stream::Tcp(stream), mode, self.backend.compression))
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use rand::RngCore;

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn direct_roundtrip_raw() {
        let (a, b) = tcp_pair();
        let mut tx = Connection::from_stream(Stream::Tcp(a), Mode::Direct, false);
        let mut rx = Connection::from_stream(Stream::Tcp(b), Mode::Direct, false);

        tx.write(b"hello").unwrap();
        assert_eq!(rx.read().unwrap(), b"hello");
    }

    #[test]
    fn compression_only_past_cutoff() {
        let (a, b) = tcp_pair();
        let mut tx = Connection::from_stream(Stream::Tcp(a), Mode::Direct, true);
        let mut b = b;

        // Below the cutoff: flag stays 0 even with compression enabled.
        tx.write(&[0x41u8; 100]).unwrap();
        let mut preamble = [0u8; PREAMBLE_LEN];
        b.read_exact(&mut preamble).unwrap();
        assert_eq!(preamble[0], 0);
        let mut raw = vec![0u8; 100];
        b.read_exact(&mut raw).unwrap();

        // 300k of the same byte: flag set, wire size far below the input.
        let payload = vec![0x41u8; 300_000];
        let writer = thread::spawn(move || {
            tx.write(&payload).unwrap();
            tx
        });
        b.read_exact(&mut preamble).unwrap();
        assert_eq!(preamble[0], 1);
        let clen = u32::from_le_bytes(preamble[1..5].try_into().unwrap()) as usize;
        let ulen = u32::from_le_bytes(preamble[5..9].try_into().unwrap()) as usize;
        assert_eq!(ulen, 300_000);
        assert!(clen < 10_000, "{clen} bytes on the wire for a constant input");
        let mut wire = vec![0u8; clen];
        b.read_exact(&mut wire).unwrap();
        let decompressed = lz4_flex::block::decompress(&wire, ulen).unwrap();
        assert!(decompressed.iter().all(|&x| x == 0x41));
        writer.join().unwrap();
    }

    #[test]
    fn compressed_roundtrip_through_read() {
        let (a, b) = tcp_pair();
        let mut tx = Connection::from_stream(Stream::Tcp(a), Mode::Direct, true);
        let mut rx = Connection::from_stream(Stream::Tcp(b), Mode::Direct, true);

        let mut payload = vec![0u8; COMPRESSION_CUTOFF];
        rand::rng().fill_bytes(&mut payload[..1024]);
        let expect = payload.clone();
        let writer = thread::spawn(move || {
            tx.write(&payload).unwrap();
            tx
        });
        assert_eq!(rx.read().unwrap(), expect);
        writer.join().unwrap();
    }

    #[test]
    fn brokered_framing() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut conn = Connection::from_stream(Stream::Unix(a), Mode::Brokered, false);
        let mut raw = b;

        conn.write(b"payload").unwrap();
        let mut frame_buf = [0u8; FRAME_LEN];
        raw.read_exact(&mut frame_buf).unwrap();
        assert_eq!(Frame::decode(&frame_buf).unwrap(), Frame::new(FrameKind::Write, 7, 0));
        let mut payload = [0u8; 7];
        raw.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"payload");

        // And inbound: a Write frame plus bytes comes back out of read().
        Frame::new(FrameKind::Write, 4, 0).encode(&mut frame_buf);
        raw.write_all(&frame_buf).unwrap();
        raw.write_all(b"pong").unwrap();
        assert_eq!(conn.read().unwrap(), b"pong");
    }

    #[test]
    fn staged_write() {
        let (a, b) = tcp_pair();
        let mut tx = Connection::from_stream(Stream::Tcp(a), Mode::Direct, false);
        let mut rx = Connection::from_stream(Stream::Tcp(b), Mode::Direct, false);

        let buf = tx.staging(4);
        buf[..4].copy_from_slice(b"abcd");
        tx.write_staged(4).unwrap();
        assert_eq!(rx.read().unwrap(), b"abcd");
    }
}
