//! Stream bridge
//!
//! Drains a process's output channel into its session: every chunk is
//! decoded, appended to the buffer and pushed to the live consumer from the
//! same loop. Ordering is preserved within each stream; stdout and stderr
//! interleave in whatever order their readers delivered them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::Session;
use crate::process::{OutputChunk, ProcessExit, Signal, StreamKind};

const STDERR_START: &str = "\x1b[31m";
const STDERR_END: &str = "\x1b[0m";

/// Incremental UTF-8 decoder that carries split code points between chunks
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much as possible; an incomplete trailing sequence is held
    /// back, invalid bytes become U+FFFD.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still pending at end of stream
    pub(crate) fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Per-session output pump
pub(crate) struct StreamBridge {
    session: Arc<Session>,
    output: mpsc::Receiver<OutputChunk>,
    exit: oneshot::Receiver<ProcessExit>,
    drain_timeout: Duration,
}

impl StreamBridge {
    pub(crate) fn new(
        session: Arc<Session>,
        output: mpsc::Receiver<OutputChunk>,
        exit: oneshot::Receiver<ProcessExit>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            session,
            output,
            exit,
            drain_timeout,
        }
    }

    /// Pump output until the process exits and its streams are drained.
    ///
    /// Enforces the session's wall-clock ceiling, if any, by killing the
    /// process group. Returns the OS exit status; the trailer is left to
    /// the reaper.
    pub(crate) async fn run(self) -> ProcessExit {
        let StreamBridge {
            session,
            mut output,
            mut exit,
            drain_timeout,
        } = self;

        let mut stdout = Utf8Decoder::default();
        let mut stderr = Utf8Decoder::default();
        let mut output_open = true;
        let mut ceiling_hit = false;

        let ceiling = ceiling(session.timeout());
        tokio::pin!(ceiling);

        let status = loop {
            tokio::select! {
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => forward(&session, chunk, &mut stdout, &mut stderr).await,
                    None => output_open = false,
                },
                status = &mut exit => {
                    break status.unwrap_or_default();
                }
                _ = &mut ceiling, if !ceiling_hit => {
                    ceiling_hit = true;
                    warn!(
                        "Session {} exceeded its {:?} ceiling, killing",
                        session.id(),
                        session.timeout()
                    );
                    session.mark_timed_out();
                    session.signal(Signal::Kill).await;
                }
            }
        };

        if output_open {
            let deadline = tokio::time::sleep(drain_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    chunk = output.recv() => match chunk {
                        Some(chunk) => forward(&session, chunk, &mut stdout, &mut stderr).await,
                        None => break,
                    },
                    _ = &mut deadline => {
                        debug!(
                            "Session {} output still open {:?} after exit, closing",
                            session.id(),
                            drain_timeout
                        );
                        break;
                    }
                }
            }
        }

        let tail = stdout.finish();
        if !tail.is_empty() {
            session.emit(&tail).await;
        }
        let tail = stderr.finish();
        if !tail.is_empty() {
            session.emit(&mark_stderr(&tail)).await;
        }

        status
    }
}

async fn ceiling(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

async fn forward(
    session: &Session,
    chunk: OutputChunk,
    stdout: &mut Utf8Decoder,
    stderr: &mut Utf8Decoder,
) {
    let text = match chunk.stream {
        StreamKind::Stdout => stdout.decode(&chunk.data),
        StreamKind::Stderr => {
            let text = stderr.decode(&chunk.data);
            if text.is_empty() {
                text
            } else {
                mark_stderr(&text)
            }
        }
    };

    if !text.is_empty() {
        session.emit(&text).await;
    }
}

fn mark_stderr(text: &str) -> String {
    format!("{}{}{}", STDERR_START, text, STDERR_END)
}
