//! One type over the two kinds of per-stream local socket: the UNIX socket a
//! client opened to the Broker Socket, or the TCP socket this broker opened
//! to a registered backend. Both support concurrent reads and writes through
//! shared references, which the handler/pump split relies on.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::net::UnixStream,
};

use conduit_ring::{FRAME_LEN, Frame};

#[derive(Debug)]
pub enum LocalSocket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl LocalSocket {
    /// Half-agnostic shutdown; wakes any thread blocked in a read on the
    /// other side of the stream.
    pub fn shutdown(&self) {
        let _ = match self {
            Self::Unix(s) => s.shutdown(Shutdown::Both),
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut this = self;
        Read::read_exact(&mut this, buf)
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut this = self;
        Write::write_all(&mut this, buf)
    }

    pub fn read_frame(&self) -> io::Result<Frame> {
        let mut buf = [0u8; FRAME_LEN];
        self.read_exact(&mut buf)?;
        Frame::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn write_frame(&self, frame: Frame) -> io::Result<()> {
        let mut buf = [0u8; FRAME_LEN];
        frame.encode(&mut buf);
        self.write_all(&buf)
    }
}

impl Read for &LocalSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalSocket::Unix(s) => {
                let mut s: &UnixStream = s;
                s.read(buf)
            }
            LocalSocket::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.read(buf)
            }
        }
    }
}

impl Write for &LocalSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalSocket::Unix(s) => {
                let mut s: &UnixStream = s;
                s.write(buf)
            }
            LocalSocket::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.write(buf)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalSocket::Unix(s) => {
                let mut s: &UnixStream = s;
                s.flush()
            }
            LocalSocket::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.flush()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use conduit_ring::FrameKind;

    use super::*;

    #[test]
    fn frames_over_unix_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let (a, b) = (LocalSocket::Unix(a), LocalSocket::Unix(b));

        a.write_frame(Frame::new(FrameKind::Connect, 2, 0)).unwrap();
        assert_eq!(b.read_frame().unwrap(), Frame::new(FrameKind::Connect, 2, 0));

        b.write_all(b"payload").unwrap();
        let mut buf = [0u8; 7];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn shutdown_unblocks_reader() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = LocalSocket::Unix(a);
        let reader = std::thread::spawn(move || {
            let b = LocalSocket::Unix(b);
            b.read_frame()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        a.shutdown();
        assert!(reader.join().unwrap().is_err());
    }
}
