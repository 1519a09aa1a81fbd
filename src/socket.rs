//! Buffered socket helper (ambient, §4.12): a thin byte-buffer pair over a
//! sink-backed `TcpStream`. It defers all readiness handling to the owning
//! sink and contains no parsing logic of its own — a convenience wrapper,
//! not a protocol implementation.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::event::sink::{IoProgress, IoTasks, SinkId};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// A non-blocking `TcpStream` fronted by an event sink, with an input and
/// an output byte buffer. Fiber code calls `read_some`/`write_some`;
/// actual syscalls happen on the sink's I/O tasks (§4.3), driven by the
/// owning context's event loop.
pub struct BufferedStream {
    stream: TcpStream,
    sink: SinkId,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl BufferedStream {
    /// Registers `stream` as a sink on `ctx` and wraps it. `stream` must
    /// already be in non-blocking mode.
    pub fn register(ctx: &mut Context, stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let sink = ctx.sink_prepare_fd(fd, false, false, stub_io_tasks(), Box::new(|| {}));
        ctx.sink_register_fd(sink)?;
        Ok(Self {
            stream,
            sink,
            input: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            output: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
        })
    }

    /// Reads whatever is immediately available into the input buffer and
    /// drains up to `max` bytes from its front. Returns the bytes read;
    /// empty means "no data right now", not EOF — callers distinguish EOF
    /// via a closed sink (`Error::SinkClosed` from a later call).
    pub fn read_some(&mut self, ctx: &mut Context, max: usize) -> Result<Vec<u8>> {
        self.fill_input()?;
        let n = max.min(self.input.len());
        let drained: Vec<u8> = self.input.drain(..n).collect();
        if self.input.is_empty() {
            ctx.submit_input(self.sink);
        }
        Ok(drained)
    }

    /// Queues `bytes` for output and attempts an immediate non-blocking
    /// write of whatever the socket will currently accept.
    pub fn write_some(&mut self, ctx: &mut Context, bytes: &[u8]) -> Result<()> {
        self.output.extend_from_slice(bytes);
        self.flush(ctx)
    }

    /// Drains as much of the output buffer as the socket accepts right
    /// now without blocking.
    pub fn flush(&mut self, ctx: &mut Context) -> Result<()> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return Err(Error::SinkClosed),
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    ctx.submit_output(self.sink);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn fill_input(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(Error::SinkClosed),
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn sink(&self) -> SinkId {
        self.sink
    }

    pub fn close(&mut self, ctx: &mut Context) {
        ctx.close_fd(self.sink);
    }
}

/// Builds the input/output execute closures for a [`BufferedStream`]-style
/// sink: each just reports progress, since the actual buffer-filling
/// happens synchronously on `read_some`/`write_some`/`flush` above rather
/// than inside the I/O task itself (a deliberate simplification; the task
/// pair exists to give the sink state machine something to drive, not to
/// duplicate the buffering logic).
pub fn stub_io_tasks() -> IoTasks {
    IoTasks::new(
        Box::new(|_ctx, _sink| IoProgress::Progress),
        Box::new(|_ctx, _sink| IoProgress::Progress),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn register_wraps_a_nonblocking_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut ctx = Context::for_test();
        let stream = BufferedStream::register(&mut ctx, client).unwrap();
        assert!(stream.stream.set_nonblocking(true).is_ok());
    }

    #[test]
    fn read_some_returns_empty_without_blocking_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut ctx = Context::for_test();
        let mut stream = BufferedStream::register(&mut ctx, client).unwrap();
        let data = stream.read_some(&mut ctx, 1024).unwrap();
        assert!(data.is_empty());
    }
}
