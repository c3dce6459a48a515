//! Line-delimited JSON framing over async byte streams
//!
//! Each message travels as one [`MessageEnvelope`] serialized on a single
//! line. Readers and writers are split so a coordinator can keep a reader
//! task running while other tasks write jobs to the same worker.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Receives envelopes from a byte stream.
///
/// The buffered reader lives as long as the `MessageReader`, so bytes read
/// past the end of one line are kept for the next `receive`.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Receive the next message. Blank lines are skipped; end of stream is
    /// reported as [`IpcError::ConnectionClosed`].
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

            if envelope.protocol_version != IPC_PROTOCOL_VERSION {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(envelope);
        }
    }
}

impl MessageReader<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

/// Sends envelopes over a byte stream, one flushed line per message
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Wrap `message` in an envelope and write it
    pub async fn send<T: Serialize>(&mut self, message: T) -> Result<(), IpcError> {
        self.send_envelope(&MessageEnvelope::new(message)).await
    }

    pub async fn send_envelope<T: Serialize>(
        &mut self,
        envelope: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(envelope)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl MessageWriter<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}
