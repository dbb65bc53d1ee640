//! Byte transports for the guest channels.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::message::{read_raw_header, Message, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// A framed, request/response pipe to one guest.
///
/// Implementations deliver whole frames; they do not interpret them beyond
/// the common header.
pub trait Transport: Send {
    /// Send a request and wait for the answer frame.
    ///
    /// Returns `None` if the peer closed the channel before answering.
    fn transact(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Block until a frame arrives. Returns `None` once the channel is closed.
    fn receive_or_closed(&mut self) -> Result<Option<Vec<u8>>>;

    /// Answer the last received frame.
    fn send_result(&mut self, result: i32) -> Result<()>;

    /// Handle that closes the channel from another thread, unblocking a
    /// pending [`Transport::receive_or_closed`].
    fn closer(&self) -> Result<TransportCloser>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transact(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).transact(request)
    }

    fn receive_or_closed(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).receive_or_closed()
    }

    fn send_result(&mut self, result: i32) -> Result<()> {
        (**self).send_result(result)
    }

    fn closer(&self) -> Result<TransportCloser> {
        (**self).closer()
    }
}

/// Cloneable handle that closes a transport.
#[derive(Clone)]
pub struct TransportCloser(Arc<dyn Fn() + Send + Sync>);

impl TransportCloser {
    pub fn new(close: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(close))
    }

    pub fn close(&self) {
        (self.0)()
    }
}

impl fmt::Debug for TransportCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportCloser")
    }
}

/// Byte stream that can be shared with a closer.
pub trait DuplexStream: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;

    fn shutdown_stream(&self) -> io::Result<()>;

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl DuplexStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

#[cfg(unix)]
impl DuplexStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

/// [`Transport`] over a connected byte stream.
///
/// A failed exchange leaves the stream at an unknown frame position (a late
/// answer may still arrive), so the transport shuts the stream down and
/// fails every later call with [`io::ErrorKind::BrokenPipe`].
pub struct StreamTransport<S: DuplexStream> {
    stream: S,
    name: &'static str,
    broken: bool,
}

impl<S: DuplexStream> StreamTransport<S> {
    /// Wrap a connected stream. `name` only labels log output.
    pub fn new(stream: S, name: &'static str) -> Self {
        Self {
            stream,
            name,
            broken: false,
        }
    }

    /// Bound how long [`Transport::transact`] waits for the guest's answer.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Result<Self> {
        self.stream.set_receive_timeout(timeout)?;
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("channel {} is broken after a failed exchange", self.name),
            )));
        }
        Ok(())
    }

    /// Mark the stream unusable after `result` failed.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(channel = self.name, error = %e, "exchange failed, closing channel");
            self.broken = true;
            if let Err(e) = self.stream.shutdown_stream() {
                debug!(channel = self.name, error = %e, "shutdown on closed channel");
            }
        }
        result
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_SIZE];
        if !read_exact_or_eof(&mut self.stream, &mut header)? {
            return Ok(None);
        }

        let (message_type, size) = read_raw_header(&header)?;
        let size = size as usize;
        if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&size) {
            return Err(Error::MalformedMessage(format!(
                "frame size {} out of range on channel {}",
                size, self.name
            )));
        }

        let mut frame = vec![0u8; size];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        self.stream.read_exact(&mut frame[HEADER_SIZE..])?;
        trace!(channel = self.name, message_type, size, "received frame");

        Ok(Some(frame))
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        trace!(channel = self.name, size = frame.len(), "sent frame");
        Ok(())
    }
}

impl<S: DuplexStream> Transport for StreamTransport<S> {
    fn transact(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let result = self.write_frame(request).and_then(|()| self.read_frame());
        self.check(result)
    }

    fn receive_or_closed(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let result = self.read_frame();
        self.check(result)
    }

    fn send_result(&mut self, result: i32) -> Result<()> {
        self.ensure_usable()?;
        let frame = Message::Result(result).encode()?;
        let result = self.write_frame(&frame);
        self.check(result)
    }

    fn closer(&self) -> Result<TransportCloser> {
        let stream = self.stream.try_clone_stream()?;
        let name = self.name;
        Ok(TransportCloser::new(move || {
            // The peer may already be gone.
            if let Err(e) = stream.shutdown_stream() {
                debug!(channel = name, error = %e, "shutdown on closed channel");
            }
        }))
    }
}

/// Fill `buf` completely. Returns `false` on a clean EOF before any byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "channel closed mid-frame"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
