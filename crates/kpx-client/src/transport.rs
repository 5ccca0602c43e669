//! Byte-stream transport to the proxy.
//!
//! The proxy writes JSON objects back to back with no delimiter or length
//! prefix, so frames are recovered by parsing: [`MessageStream`] buffers bytes
//! and cuts one complete JSON value at a time. A read may carry several
//! messages, or only part of one.

use bytes::BytesMut;
use kpx_common::{Error, Result};
use serde::de::IgnoredAny;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Upper bound on a single buffered message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

#[cfg(unix)]
pub type ProxyStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ProxyStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Open the platform endpoint at `path`.
#[cfg(unix)]
pub async fn connect(path: &Path) -> Result<ProxyStream> {
    debug!("connecting to proxy at {}", path.display());
    Ok(tokio::net::UnixStream::connect(path).await?)
}

/// Open the platform endpoint at `path`.
#[cfg(windows)]
pub async fn connect(path: &Path) -> Result<ProxyStream> {
    use tokio::net::windows::named_pipe::ClientOptions;

    debug!("connecting to proxy at {}", path.display());
    Ok(ClientOptions::new().open(path.as_os_str())?)
}

/// JSON message framing over any ordered byte stream.
pub struct MessageStream<S> {
    io: S,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Write one message and flush it.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        trace!(bytes = text.len(), "send");
        self.io.write_all(text.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read the next complete message.
    ///
    /// Returns `Disconnected` when the peer closes the stream, including in
    /// the middle of a message.
    pub async fn recv(&mut self) -> Result<String> {
        loop {
            if let Some(text) = self.try_split()? {
                trace!(bytes = text.len(), "recv");
                return Ok(text);
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    debug!(pending = self.buf.len(), "stream closed mid-message");
                }
                return Err(Error::Disconnected);
            }
        }
    }

    /// Bytes received but not yet returned as a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    fn try_split(&mut self) -> Result<Option<String>> {
        let mut values =
            serde_json::Deserializer::from_slice(&self.buf).into_iter::<IgnoredAny>();

        match values.next() {
            Some(Ok(_)) => {
                let end = values.byte_offset();
                let frame = self.buf.split_to(end);
                let text = std::str::from_utf8(&frame)
                    .map_err(|e| Error::malformed(format!("message is not UTF-8: {}", e)))?;
                Ok(Some(text.trim_start().to_string()))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > MAX_MESSAGE_SIZE {
                    self.buf.clear();
                    return Err(Error::malformed(format!(
                        "message exceeds {} bytes",
                        MAX_MESSAGE_SIZE
                    )));
                }
                Ok(None)
            }
            Some(Err(e)) => {
                self.buf.clear();
                Err(Error::malformed(format!("unparsable data on stream: {}", e)))
            }
            None => {
                // Only whitespace buffered.
                self.buf.clear();
                Ok(None)
            }
        }
    }
}
