//! Chat transport seam.
//!
//! The service only needs two things from a chat system: a way to post text
//! into a conversation and a stream of inbound messages. The binary speaks a
//! line-delimited JSON protocol on stdio so any chat adapter process can sit
//! on the other end of a pipe:
//!
//! * stdin, one event per line: `{"conversation_id":"…","sender":"…","body":"…"}`
//! * stdout, one action per line: `{"type":"send",…}` or `{"type":"advertise",…}`

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, Stdout};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::{Advertisement, InboundMessage};

#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Posts `text` into a conversation. Returns once the transport has
    /// accepted the message.
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// Publishes the bot's command list.
    async fn advertise(&self, advertisement: &Advertisement) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Send {
        conversation_id: &'a str,
        body: &'a str,
    },
    Advertise {
        advertisement: &'a Advertisement,
    },
}

pub struct StdioChat {
    stdout: Mutex<Stdout>,
}

impl StdioChat {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    async fn write(&self, action: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(action)?;
        line.push(b'\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ChatSender for StdioChat {
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.write(&Outbound::Send {
            conversation_id,
            body: text,
        })
        .await
    }

    async fn advertise(&self, advertisement: &Advertisement) -> Result<()> {
        self.write(&Outbound::Advertise { advertisement }).await
    }
}

/// Longest inbound event line accepted; longer lines are skipped.
const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Forwards inbound chat events from `reader` into `tx` until cancelled.
/// End of input means the chat side went away, which is an error.
pub async fn pump_events<R>(
    mut reader: R,
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut codec = LinesCodec::new_with_max_length(MAX_EVENT_BYTES);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let decoded = match codec.decode(&mut buf) {
            Ok(None) => {
                let read = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    read = reader.read_buf(&mut buf) => read?,
                };
                if read > 0 {
                    continue;
                }
                codec.decode_eof(&mut buf)
            }
            other => other,
        };
        let line = match decoded {
            Ok(Some(line)) => line,
            Ok(None) => bail!("chat transport closed its event stream"),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("Skipping chat event longer than {MAX_EVENT_BYTES} bytes");
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundMessage>(&line) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    // Listener is gone; the group is already shutting down.
                    return Ok(());
                }
            }
            Err(e) => warn!("Ignoring malformed chat event: {e}"),
        }
    }
}
