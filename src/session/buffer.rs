//! Replayable output buffer
//!
//! Append-only text record of everything a session emitted. Length never
//! shrinks until eviction; after eviction every read reports
//! [`BufferError::Evicted`] instead of an empty result, so callers can tell
//! "nothing new yet" apart from "this session is gone".
//!
//! A `watch` channel carries the current length so readers can sleep until
//! something is appended.

use thiserror::Error;
use tokio::sync::{watch, RwLock};

/// Errors from buffer access
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Output buffer was evicted")]
    Evicted,

    #[error("Output buffer is sealed")]
    Sealed,
}

/// Result type for buffer operations
pub type BufferResult<T> = Result<T, BufferError>;

/// Content read from a caller-held offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayChunk {
    /// Text from the effective offset to the end of the buffer
    pub output: String,
    /// Offset to remember for the next read
    pub offset: usize,
    /// True when the caller's offset was stale and the read restarted at 0
    pub reset: bool,
}

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    sealed: bool,
    evicted: bool,
}

/// Growable, offset-addressable session output
#[derive(Debug)]
pub struct OutputBuffer {
    state: RwLock<BufferState>,
    len_tx: watch::Sender<usize>,
}

impl OutputBuffer {
    /// Create a buffer seeded with `banner`
    pub fn with_banner(banner: &str) -> Self {
        let (len_tx, _) = watch::channel(banner.len());
        Self {
            state: RwLock::new(BufferState {
                text: banner.to_string(),
                ..Default::default()
            }),
            len_tx,
        }
    }

    /// Append output; returns the new length
    pub async fn append(&self, text: &str) -> BufferResult<usize> {
        let mut state = self.state.write().await;
        if state.evicted {
            return Err(BufferError::Evicted);
        }
        if state.sealed {
            return Err(BufferError::Sealed);
        }
        if text.is_empty() {
            return Ok(state.text.len());
        }

        state.text.push_str(text);
        let len = state.text.len();
        self.len_tx.send_replace(len);
        Ok(len)
    }

    /// Append the final trailer and refuse all later appends
    pub async fn seal(&self, trailer: &str) -> BufferResult<usize> {
        let mut state = self.state.write().await;
        if state.evicted {
            return Err(BufferError::Evicted);
        }
        if state.sealed {
            return Err(BufferError::Sealed);
        }

        state.text.push_str(trailer);
        state.sealed = true;
        let len = state.text.len();
        self.len_tx.send_replace(len);
        Ok(len)
    }

    /// Read everything after `offset`.
    ///
    /// An offset past the end, or one that splits a UTF-8 sequence, is
    /// treated as stale: the read restarts at 0 and `reset` is set.
    pub async fn read_from(&self, offset: usize) -> BufferResult<ReplayChunk> {
        let state = self.state.read().await;
        if state.evicted {
            return Err(BufferError::Evicted);
        }

        let len = state.text.len();
        let (start, reset) = if offset > len || !state.text.is_char_boundary(offset) {
            (0, true)
        } else {
            (offset, false)
        };

        Ok(ReplayChunk {
            output: state.text[start..].to_string(),
            offset: len,
            reset,
        })
    }

    /// Current length, or `None` once evicted
    pub async fn len(&self) -> Option<usize> {
        let state = self.state.read().await;
        (!state.evicted).then_some(state.text.len())
    }

    /// Full contents, or `None` once evicted
    pub async fn snapshot(&self) -> Option<String> {
        let state = self.state.read().await;
        (!state.evicted).then(|| state.text.clone())
    }

    pub async fn is_sealed(&self) -> bool {
        self.state.read().await.sealed
    }

    /// Watch the buffer length; fires on every append, seal and eviction
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }

    /// Free the contents. Irreversible.
    pub async fn evict(&self) {
        let mut state = self.state.write().await;
        if state.evicted {
            return;
        }
        state.evicted = true;
        state.text = String::new();
        self.len_tx.send_replace(0);
    }
}
