//! Lifecycle reaper
//!
//! The only component allowed to evict. Finalizes exited sessions (trailer,
//! input route closed) and removes them from the table after the grace delay
//! for their kind, or right away when a purge was requested.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::registry::SessionTable;
use super::{ExitRecord, Session};
use crate::config::SessionSettings;

#[derive(Clone)]
pub(crate) struct Reaper {
    table: Arc<RwLock<SessionTable>>,
    settings: SessionSettings,
}

impl Reaper {
    pub(crate) fn new(table: Arc<RwLock<SessionTable>>, settings: SessionSettings) -> Self {
        Self { table, settings }
    }

    /// Record the exit and schedule eviction. No-op (returns false) if the
    /// session had already exited.
    pub(crate) async fn finalize(&self, session: &Arc<Session>, record: ExitRecord) -> bool {
        if !session.finish(record.clone()).await {
            return false;
        }

        info!(
            "Session {} exited ({:?}, code {:?}, signal {:?})",
            session.id(),
            record.reason,
            record.code,
            record.signal
        );
        self.schedule_eviction(session);
        true
    }

    fn schedule_eviction(&self, session: &Arc<Session>) {
        let delay = if session.purge_on_exit() {
            Duration::ZERO
        } else {
            self.settings.grace_for(session.kind())
        };

        let reaper = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reaper.evict(&session).await;
        });
    }

    /// Remove the session from the table and free its buffer
    pub(crate) async fn evict(&self, session: &Session) {
        let removed = self.table.write().await.remove(session.id());
        session.evict().await;
        if removed.is_some() {
            debug!("Session {} evicted", session.id());
        }
    }
}
