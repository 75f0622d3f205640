//! Offset-based replay for independent observers
//!
//! A [`Tail`] remembers how much of a session's buffer it has delivered and
//! yields only what is new. It sleeps on the buffer's length watch with the
//! poll interval as an upper bound, so appends wake it immediately while the
//! interval still drives the liveness probe.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use super::buffer::ReplayChunk;
use super::{ExitRecord, Session, SessionId};
use crate::process::pid_alive;

/// What a tail delivers next
#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    /// New text since the last delivered offset
    Output(ReplayChunk),
    /// Buffer sealed and fully delivered
    Ended { exit: Option<ExitRecord> },
    /// Session evicted, or its process vanished without a trailer
    Gone { message: String },
}

/// Cursor over one session's output
pub struct Tail {
    session: Arc<Session>,
    offset: usize,
    len_rx: watch::Receiver<usize>,
    poll_interval: Duration,
    drain_timeout: Duration,
    /// Pid to probe each tick, for tails addressed by pid
    probe_pid: Option<u32>,
    gone_since: Option<Instant>,
    finished: bool,
}

impl Tail {
    pub(crate) fn new(
        session: Arc<Session>,
        offset: usize,
        probe_pid: Option<u32>,
        poll_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        let len_rx = session.buffer().subscribe();
        Self {
            session,
            offset,
            len_rx,
            poll_interval,
            drain_timeout,
            probe_pid,
            gone_since: None,
            finished: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Offset the next read starts from
    #[cfg(test)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Wait for the next event; `None` after the terminal event was returned
    pub async fn next(&mut self) -> Option<TailEvent> {
        if self.finished {
            return None;
        }

        loop {
            // Sealed state is sampled before reading so a trailer appended in
            // between is still delivered before `Ended`.
            let sealed = self.session.buffer().is_sealed().await;
            let chunk = match self.session.buffer().read_from(self.offset).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    self.finished = true;
                    return Some(TailEvent::Gone {
                        message: format!("Session {} was evicted", self.session.id()),
                    });
                }
            };

            if chunk.reset || !chunk.output.is_empty() {
                if chunk.reset {
                    debug!(
                        "Tail on {} reset from offset {} to 0",
                        self.session.id(),
                        self.offset
                    );
                }
                self.offset = chunk.offset;
                return Some(TailEvent::Output(chunk));
            }

            if sealed {
                self.finished = true;
                return Some(TailEvent::Ended {
                    exit: self.session.exit_record().await,
                });
            }

            if let Some(message) = self.probe() {
                self.finished = true;
                return Some(TailEvent::Gone { message });
            }

            let _ = tokio::time::timeout(self.poll_interval, self.len_rx.changed()).await;
        }
    }

    fn probe(&mut self) -> Option<String> {
        let pid = self.probe_pid?;
        if pid_alive(pid) {
            self.gone_since = None;
            return None;
        }

        let since = *self.gone_since.get_or_insert_with(Instant::now);
        (since.elapsed() >= self.drain_timeout)
            .then(|| format!("Process {} is no longer running", pid))
    }
}
