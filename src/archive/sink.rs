use bytes::{Bytes, BytesMut};
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Blocking [`Write`] adapter that forwards buffered chunks to an async
/// response body over a bounded channel.
///
/// The channel bound provides back-pressure. Once the receiving side is gone
/// or the token is cancelled every write fails with `BrokenPipe`, which stops
/// the producer.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    buffer: BytesMut,
    cancel: CancellationToken,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
            cancel,
        }
    }

    fn disconnected() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        // Must only be called off the async runtime, i.e. from `spawn_blocking`.
        self.tx.blocking_send(chunk).map_err(|_| {
            self.cancel.cancel();
            Self::disconnected()
        })
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Self::disconnected());
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= CHUNK_SIZE {
            self.send()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Self::disconnected());
        }
        self.send()
    }
}
