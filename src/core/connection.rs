use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Byte stream a node connection runs over (TCP, TLS, in-memory).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport returned by a [`Connector`](crate::Connector).
pub type BoxedStream = Box<dyn AsyncStream>;

/// A RESP connection to one node.
///
/// Wraps an underlying stream and handles frame encoding and decoding.
/// Frames written together are flushed with a single write.
pub struct Connection<S> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection with the given stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Writes a frame to the connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_frames(std::slice::from_ref(frame)).await
    }

    /// Encodes several frames and writes them back to back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing fails
    pub async fn write_frames(&mut self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.encoder.encode(frame);
        }
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads a frame from the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the peer closed the stream and
    /// [`Error::Protocol`] on malformed input
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }

    /// Splits the connection into independently owned read and write halves.
    pub fn split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ConnectionReader {
                stream: read,
                decoder: self.decoder,
            },
            ConnectionWriter {
                stream: write,
                encoder: self.encoder,
            },
        )
    }
}

async fn read_frame<R>(stream: &mut R, decoder: &mut Decoder) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        decoder.append(&buf[..n]);
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("decoder", &self.decoder)
            .finish_non_exhaustive()
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader<S> {
    stream: ReadHalf<S>,
    decoder: Decoder,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the next frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &mut self.decoder).await
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter<S> {
    stream: WriteHalf<S>,
    encoder: Encoder,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Encodes and writes frames back to back.
    pub async fn write_frames(&mut self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            self.encoder.encode(frame);
        }
        let data = self.encoder.take();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
