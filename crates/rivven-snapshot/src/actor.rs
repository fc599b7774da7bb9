//! # Assigner Coordinator
//!
//! Runs a [`SnapshotSplitAssigner`] as a single tokio task. Readers and the
//! planner talk to it only through an [`AssignerHandle`]: every call is a
//! command on an `mpsc` channel answered over a `oneshot`, so the assigner's
//! state is mutated by one task, one command at a time, without locks.
//!
//! ```text
//!  reader-1 ─┐                       ┌──────────────────────┐
//!  reader-2 ─┼── Command (mpsc) ───▶ │ AssignerActor        │──▶ watch<SnapshotCompleted>
//!  planner  ─┘ ◀── reply (oneshot) ─ │  + reclaim tick      │──▶ CheckpointStore (optional)
//!                                    └──────────────────────┘
//! ```
//!
//! The actor also reclaims expired leases on a fixed tick and publishes the
//! completion signal once on a `watch` channel.

use crate::assigner::{AssignerPhase, AssignerStats, Assignment, FinishOutcome, SnapshotCompleted, SnapshotSplitAssigner};
use crate::checkpoint::{AssignerCheckpoint, CheckpointStore};
use crate::config::SplitConfig;
use crate::error::{Result, SplitError};
use crate::planner::CollectionPlan;
use crate::schema::CollectionId;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

enum Command {
    RequestNext {
        reader: String,
        reply: oneshot::Sender<Assignment>,
    },
    ReportFinished {
        reader: String,
        split_id: String,
        position: Option<String>,
        reply: oneshot::Sender<FinishOutcome>,
    },
    ReaderFailed {
        reader: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    ReclaimExpired {
        reply: oneshot::Sender<Vec<String>>,
    },
    AddPlan {
        plan: Box<CollectionPlan>,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkPlanningFailed {
        collection: CollectionId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ClosePlanning {
        reply: oneshot::Sender<()>,
    },
    Checkpoint {
        reply: oneshot::Sender<AssignerCheckpoint>,
    },
    Stats {
        reply: oneshot::Sender<AssignerStats>,
    },
    Phase {
        reply: oneshot::Sender<AssignerPhase>,
    },
    Shutdown {
        reply: oneshot::Sender<AssignerCheckpoint>,
    },
}

/// Task owning the assigner.
pub struct AssignerActor {
    assigner: SnapshotSplitAssigner,
    commands: mpsc::Receiver<Command>,
    completion_tx: watch::Sender<Option<SnapshotCompleted>>,
    reclaim_interval: Duration,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl AssignerActor {
    /// Spawn the coordinator task.
    ///
    /// The join handle yields the assigner back once the actor stops.
    pub fn spawn(assigner: SnapshotSplitAssigner, config: &SplitConfig) -> (AssignerHandle, JoinHandle<SnapshotSplitAssigner>) {
        Self::start(assigner, config, None)
    }

    /// Spawn the coordinator task, persisting a checkpoint after every
    /// completion, reclaim and planning change.
    pub fn spawn_with_store(
        assigner: SnapshotSplitAssigner,
        config: &SplitConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> (AssignerHandle, JoinHandle<SnapshotSplitAssigner>) {
        Self::start(assigner, config, Some(store))
    }

    fn start(
        assigner: SnapshotSplitAssigner,
        config: &SplitConfig,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> (AssignerHandle, JoinHandle<SnapshotSplitAssigner>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (completion_tx, completion_rx) = watch::channel(None);

        let actor = AssignerActor {
            assigner,
            commands: command_rx,
            completion_tx,
            reclaim_interval: config.reclaim_interval(),
            store,
        };
        let task = tokio::spawn(actor.run());

        let handle = AssignerHandle {
            commands: command_tx,
            completion: completion_rx,
        };
        (handle, task)
    }

    async fn run(mut self) -> SnapshotSplitAssigner {
        let mut tick = tokio::time::interval(self.reclaim_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        tick.tick().await;

        info!(
            reclaim_interval_ms = self.reclaim_interval.as_millis() as u64,
            "Assigner coordinator started"
        );
        // A restored assigner may already be done
        self.publish_completion().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let checkpoint = self.assigner.checkpoint();
                        self.persist(&checkpoint).await;
                        let _ = reply.send(checkpoint);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All assigner handles dropped");
                        break;
                    }
                },
                _ = tick.tick() => {
                    let reclaimed = self.assigner.reclaim_expired_leases(Utc::now());
                    if !reclaimed.is_empty() {
                        self.persist_current().await;
                    }
                }
            }
            self.publish_completion().await;
        }

        info!(phase = ?self.assigner.phase(), "Assigner coordinator stopped");
        self.assigner
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::RequestNext { reader, reply } => {
                let assignment = self.assigner.request_next(&reader, Utc::now());
                let _ = reply.send(assignment);
            }
            Command::ReportFinished {
                reader,
                split_id,
                position,
                reply,
            } => {
                let outcome = self.assigner.report_finished(&reader, &split_id, position);
                let _ = reply.send(outcome);
                if outcome == FinishOutcome::Finished {
                    self.persist_current().await;
                }
            }
            Command::ReaderFailed { reader, reply } => {
                let reclaimed = self.assigner.reader_failed(&reader);
                let changed = !reclaimed.is_empty();
                let _ = reply.send(reclaimed);
                if changed {
                    self.persist_current().await;
                }
            }
            Command::ReclaimExpired { reply } => {
                let reclaimed = self.assigner.reclaim_expired_leases(Utc::now());
                if !reclaimed.is_empty() {
                    self.persist_current().await;
                }
                let _ = reply.send(reclaimed);
            }
            Command::AddPlan { plan, reply } => {
                let result = self.assigner.add_plan(*plan);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.persist_current().await;
                }
            }
            Command::MarkPlanningFailed {
                collection,
                reason,
                reply,
            } => {
                let result = self.assigner.mark_planning_failed(collection, reason);
                let _ = reply.send(result);
                self.persist_current().await;
            }
            Command::ClosePlanning { reply } => {
                self.assigner.close_planning();
                let _ = reply.send(());
                self.persist_current().await;
            }
            Command::Checkpoint { reply } => {
                let _ = reply.send(self.assigner.checkpoint());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.assigner.stats());
            }
            Command::Phase { reply } => {
                let _ = reply.send(self.assigner.phase());
            }
            // Handled by the run loop
            Command::Shutdown { .. } => {}
        }
    }

    async fn publish_completion(&mut self) {
        if let Some(completion) = self.assigner.take_completion() {
            self.completion_tx.send_replace(Some(completion));
            self.persist_current().await;
        }
    }

    async fn persist_current(&self) {
        if self.store.is_some() {
            let checkpoint = self.assigner.checkpoint();
            self.persist(&checkpoint).await;
        }
    }

    async fn persist(&self, checkpoint: &AssignerCheckpoint) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(checkpoint).await {
                warn!(error = %e, "Failed to persist assigner checkpoint");
            }
        }
    }
}

/// Cloneable handle to the coordinator.
#[derive(Clone)]
pub struct AssignerHandle {
    commands: mpsc::Sender<Command>,
    completion: watch::Receiver<Option<SnapshotCompleted>>,
}

impl AssignerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SplitError::AssignerClosed)?;
        response.await.map_err(|_| SplitError::AssignerClosed)
    }

    /// Ask for the next split. Returns immediately.
    pub async fn request_next(&self, reader: impl Into<String>) -> Result<Assignment> {
        let reader = reader.into();
        self.call(|reply| Command::RequestNext { reader, reply }).await
    }

    /// Report a finished split, with the source position reached, if any.
    pub async fn report_finished(
        &self,
        reader: impl Into<String>,
        split_id: impl Into<String>,
        position: Option<String>,
    ) -> Result<FinishOutcome> {
        let reader = reader.into();
        let split_id = split_id.into();
        self.call(|reply| Command::ReportFinished {
            reader,
            split_id,
            position,
            reply,
        })
        .await
    }

    /// Requeue the splits of a reader known to have died.
    pub async fn reader_failed(&self, reader: impl Into<String>) -> Result<Vec<String>> {
        let reader = reader.into();
        self.call(|reply| Command::ReaderFailed { reader, reply }).await
    }

    /// Run a lease reclaim now instead of waiting for the next tick.
    pub async fn reclaim_expired(&self) -> Result<Vec<String>> {
        self.call(|reply| Command::ReclaimExpired { reply }).await
    }

    pub async fn add_plan(&self, plan: CollectionPlan) -> Result<()> {
        self.call(|reply| Command::AddPlan {
            plan: Box::new(plan),
            reply,
        })
        .await?
    }

    pub async fn mark_planning_failed(&self, collection: CollectionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.call(|reply| Command::MarkPlanningFailed {
            collection,
            reason,
            reply,
        })
        .await?
    }

    pub async fn close_planning(&self) -> Result<()> {
        self.call(|reply| Command::ClosePlanning { reply }).await
    }

    pub async fn checkpoint(&self) -> Result<AssignerCheckpoint> {
        self.call(|reply| Command::Checkpoint { reply }).await
    }

    pub async fn stats(&self) -> Result<AssignerStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    pub async fn phase(&self) -> Result<AssignerPhase> {
        self.call(|reply| Command::Phase { reply }).await
    }

    /// Stop the coordinator, returning its final checkpoint.
    pub async fn shutdown(&self) -> Result<AssignerCheckpoint> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    /// Receiver of the one-time completion signal.
    pub fn completion(&self) -> watch::Receiver<Option<SnapshotCompleted>> {
        self.completion.clone()
    }

    /// Wait until the snapshot completes.
    pub async fn wait_for_completion(&self) -> Result<SnapshotCompleted> {
        let mut rx = self.completion.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(completion) = current {
                return Ok(completion);
            }
            rx.changed().await.map_err(|_| SplitError::AssignerClosed)?;
        }
    }

    /// Check if the coordinator has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
