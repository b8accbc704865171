//! Actor-based projection pipeline
//!
//! The projector runs as a single tokio task fed by a ledger subscription.
//! Control messages (barrier, stats, shutdown) arrive on a separate bounded
//! mailbox and are served ahead of feed events.
//!
//! The feed alone is not trusted to be complete. The actor re-reads the
//! log through its [`EventSource`] when an event is dropped or fails to
//! apply, when the gap above the cursor grows past `max_gap`, and when a
//! gap survives two consecutive checks without the cursor moving.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Ledger                          │
//! │       create_packet / claim / refund_expired         │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::unbounded (event feed)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             ProjectorActor (Single Task)             │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Projector: per-packet order, pending buffer    │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                              │
//! │                       ▼                              │
//! │            EntityStore::commit(batch)                │
//! │                       ▲                              │
//! │        catch-up ──────┘  EventSource (ledger log)    │
//! └──────────────────────▲───────────────────────────────┘
//!                        │ mpsc::channel (bounded)
//! ┌──────────────────────┴───────────────────────────────┐
//! │            ProjectorHandle (Clone)                   │
//! │           sync / stats / shutdown                    │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::{
    projector::{ApplyOutcome, Projector, ProjectorStats},
    source::EventSource,
    store::EntityStore,
    Config, Error, Result,
};
use packet_ledger::LedgerEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Message sent to the projector actor
pub enum ProjectorMessage {
    /// Apply everything already delivered, then report
    Sync {
        /// Stats after the barrier
        response: oneshot::Sender<ProjectorStats>,
    },

    /// Report counters
    Stats {
        /// Current stats
        response: oneshot::Sender<ProjectorStats>,
    },

    /// Drain, flush the store and stop
    Shutdown {
        /// Flush result
        response: oneshot::Sender<Result<()>>,
    },
}

/// Actor that owns the projector
pub struct ProjectorActor<S: EntityStore> {
    projector: Projector<S>,
    feed: mpsc::UnboundedReceiver<LedgerEvent>,
    mailbox: mpsc::Receiver<ProjectorMessage>,
    source: Arc<dyn EventSource>,
    catch_up_page: usize,
    max_gap: usize,
    gap_check: Duration,
    /// Cursor seen at the last check while a gap was open
    stalled_at: Option<u64>,
}

impl<S: EntityStore + 'static> ProjectorActor<S> {
    /// Create new actor
    pub fn new(
        projector: Projector<S>,
        feed: mpsc::UnboundedReceiver<LedgerEvent>,
        mailbox: mpsc::Receiver<ProjectorMessage>,
        source: Arc<dyn EventSource>,
        config: &Config,
    ) -> Self {
        Self {
            projector,
            feed,
            mailbox,
            source,
            catch_up_page: config.catch_up_page,
            max_gap: config.max_gap,
            gap_check: Duration::from_millis(config.gap_check_interval_ms.max(1)),
            stalled_at: None,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut gap_check = tokio::time::interval(self.gap_check);
        gap_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut mailbox_open = true;
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;

                msg = self.mailbox.recv(), if mailbox_open => match msg {
                    Some(ProjectorMessage::Sync { response }) => {
                        self.drain_feed();
                        if self.projector.has_gap() {
                            self.resync("sync barrier");
                        }
                        let _ = response.send(self.projector.stats());
                    }
                    Some(ProjectorMessage::Stats { response }) => {
                        let _ = response.send(self.projector.stats());
                    }
                    Some(ProjectorMessage::Shutdown { response }) => {
                        self.drain_feed();
                        let _ = response.send(self.projector.store().flush());
                        break;
                    }
                    None => mailbox_open = false,
                },

                event = self.feed.recv(), if feed_open => match event {
                    Some(event) => self.handle_event(&event),
                    None => feed_open = false,
                },

                _ = gap_check.tick(), if mailbox_open || feed_open => {
                    self.check_gap();
                }

                // Mailbox and feed both closed
                else => {
                    if let Err(e) = self.projector.store().flush() {
                        tracing::error!("Error flushing entity store: {}", e);
                    }
                    break;
                }
            }
        }

        tracing::info!(stats = ?self.projector.stats(), "Projector stopped");
    }

    /// Apply every event already sitting in the feed
    fn drain_feed(&mut self) {
        while let Ok(event) = self.feed.try_recv() {
            self.handle_event(&event);
        }
    }

    fn handle_event(&mut self, event: &LedgerEvent) {
        match self.projector.apply(event) {
            Ok(ApplyOutcome::Dropped) => self.resync("event dropped"),
            Ok(_) if self.projector.gap_len() > self.max_gap => self.resync("gap too wide"),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(seq = event.seq, packet_id = %event.packet_id, "Error applying event: {}", e);
                self.resync("apply failed");
            }
        }
    }

    /// Resync once a gap has outlived a full check interval
    fn check_gap(&mut self) {
        if !self.projector.has_gap() {
            self.stalled_at = None;
            return;
        }

        let cursor = self.projector.cursor();
        if self.stalled_at == Some(cursor) {
            self.stalled_at = None;
            self.resync("gap stalled");
        } else {
            self.stalled_at = Some(cursor);
        }
    }

    fn resync(&mut self, reason: &'static str) {
        let from = self.projector.cursor();
        match self.projector.catch_up(self.source.as_ref(), self.catch_up_page) {
            Ok(replayed) => tracing::info!(
                reason,
                from,
                replayed,
                cursor = self.projector.cursor(),
                "Projector resynced from ledger log"
            ),
            Err(e) => tracing::error!(reason, from, "Resync failed: {}", e),
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct ProjectorHandle {
    sender: mpsc::Sender<ProjectorMessage>,
}

impl ProjectorHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ProjectorMessage>) -> Self {
        Self { sender }
    }

    /// Barrier: returns once every event published before the call is applied
    pub async fn sync(&self) -> Result<ProjectorStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectorMessage::Sync { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Projector mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Current counters
    pub async fn stats(&self) -> Result<ProjectorStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectorMessage::Stats { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Projector mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Drain, flush and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProjectorMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Projector mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }
}

/// Spawn the projector actor on the current runtime
///
/// `source` is where missed events are re-read from; normally the ledger
/// that `feed` subscribes to.
pub fn spawn_projector<S: EntityStore + 'static>(
    projector: Projector<S>,
    feed: mpsc::UnboundedReceiver<LedgerEvent>,
    source: Arc<dyn EventSource>,
    config: &Config,
) -> ProjectorHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let actor = ProjectorActor::new(projector, feed, rx, source, config);

    tokio::spawn(async move {
        actor.run().await;
    });

    ProjectorHandle::new(tx)
}
