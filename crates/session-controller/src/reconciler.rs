//! Usage reconciliation.
//!
//! The lifecycle manager hands usage events to a [`UsageEmitter`] and returns
//! immediately. One worker per shard takes events off its channel, appends
//! each to the ledger, then forwards it to billing.
//!
//! A session always hashes to the same shard, so its events are persisted and
//! forwarded in emission order. Nothing is ordered across sessions.
//!
//! A failed ledger append is retried by the same shard worker with
//! exponential backoff, so later events of the session wait behind it. Only
//! when the attempts run out is the event dropped and counted as
//! `ledger_failed`.
//!
//! A failed billing forward leaves the ledger entry marked `failed` and is not
//! retried here. Failed entries are found with
//! `UsageLedger::list_by_forward_status`.

use crate::dispatcher::retry_delay;
use crate::models::{UsageEvent, UsageRecord};
use crate::observability::metrics;
use crate::services::BillingGateway;
use crate::store::UsageLedger;
use common::types::SessionId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Ledger append attempts per event.
pub const DEFAULT_APPEND_ATTEMPTS: u32 = 5;

/// Wait after the first failed append. Doubles per attempt.
pub const DEFAULT_APPEND_BACKOFF: Duration = Duration::from_millis(100);

struct Shard {
    tx: mpsc::UnboundedSender<UsageEvent>,
    depth: Arc<AtomicUsize>,
}

/// Sending half of the reconciliation channels.
///
/// Cloning is cheap and `emit` never waits.
#[derive(Clone)]
pub struct UsageEmitter {
    shards: Arc<Vec<Shard>>,
}

impl UsageEmitter {
    /// Queue `event` on its session's shard.
    ///
    /// Returns false if the listener is no longer running. The event is then
    /// lost from reconciliation and the loss is logged.
    pub fn emit(&self, event: UsageEvent) -> bool {
        let index = shard_for(event.session_id, self.shards.len());
        let Some(shard) = self.shards.get(index) else {
            error!(target: "sc.reconciler", shard = index, "No reconciler shard for usage event");
            return false;
        };

        let session_id = event.session_id;
        let depth = shard.depth.fetch_add(1, Ordering::SeqCst) + 1;
        match shard.tx.send(event) {
            Ok(()) => {
                metrics::set_reconciler_queue_depth(index, depth);
                true
            }
            Err(_) => {
                shard.depth.fetch_sub(1, Ordering::SeqCst);
                error!(
                    target: "sc.reconciler",
                    session_id = %session_id,
                    shard = index,
                    "Reconciler stopped, usage event dropped"
                );
                metrics::record_usage_forward("dropped");
                false
            }
        }
    }

    /// Number of reconciliation paths.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Stable shard index for a session.
pub fn shard_for(session_id: SessionId, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let value = u128::from_be_bytes(*session_id.as_uuid().as_bytes());
    let Ok(modulus) = u128::try_from(shards) else {
        return 0;
    };
    usize::try_from(value % modulus).unwrap_or(0)
}

/// Persists and forwards usage events.
pub struct ReconciliationListener {
    ledger: Arc<dyn UsageLedger>,
    billing: Arc<dyn BillingGateway>,
    append_attempts: u32,
    append_backoff: Duration,
}

/// Running shard workers.
pub struct ReconcilerHandle {
    workers: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Wait for every worker to finish draining.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(target: "sc.reconciler", error = %e, "Reconciler worker panicked");
            }
        }
    }
}

impl ReconciliationListener {
    pub fn new(ledger: Arc<dyn UsageLedger>, billing: Arc<dyn BillingGateway>) -> Self {
        Self {
            ledger,
            billing,
            append_attempts: DEFAULT_APPEND_ATTEMPTS,
            append_backoff: DEFAULT_APPEND_BACKOFF,
        }
    }

    /// Override the ledger append retry policy. `attempts` is at least one.
    pub fn with_append_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.append_attempts = attempts.max(1);
        self.append_backoff = backoff;
        self
    }

    /// Spawn one worker per shard.
    ///
    /// When `cancel_token` fires each worker stops accepting events, reconciles
    /// what is already queued, and exits.
    pub fn spawn(
        self,
        shards: usize,
        cancel_token: CancellationToken,
    ) -> (UsageEmitter, ReconcilerHandle) {
        let listener = Arc::new(self);
        let shard_count = shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for index in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let depth = Arc::new(AtomicUsize::new(0));
            senders.push(Shard {
                tx,
                depth: Arc::clone(&depth),
            });

            let worker = Arc::clone(&listener).run_shard(index, rx, depth, cancel_token.clone());
            workers.push(tokio::spawn(
                worker.instrument(tracing::info_span!("reconciler_shard", shard = index)),
            ));
        }

        info!(target: "sc.reconciler", shards = shard_count, "Reconciliation listener started");

        (
            UsageEmitter {
                shards: Arc::new(senders),
            },
            ReconcilerHandle { workers },
        )
    }

    async fn run_shard(
        self: Arc<Self>,
        index: usize,
        mut rx: mpsc::UnboundedReceiver<UsageEvent>,
        depth: Arc<AtomicUsize>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                received = rx.recv() => {
                    let Some(event) = received else { break };
                    self.take(index, &depth);
                    self.reconcile(event).await;
                }
                () = cancel_token.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(event) = rx.recv().await {
                        self.take(index, &depth);
                        self.reconcile(event).await;
                        drained += 1;
                    }
                    info!(target: "sc.reconciler", shard = index, drained, "Reconciler shard drained, exiting");
                    break;
                }
            }
        }
    }

    fn take(&self, index: usize, depth: &AtomicUsize) {
        let remaining = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_reconciler_queue_depth(index, remaining);
    }

    /// Append with retries. `None` once every attempt failed.
    async fn persist(&self, event: &UsageEvent) -> Option<UsageRecord> {
        let mut attempt = 1;
        loop {
            match self.ledger.append(event).await {
                Ok(record) => return Some(record),
                Err(e) if attempt < self.append_attempts => {
                    let delay = retry_delay(self.append_backoff, attempt);
                    warn!(
                        target: "sc.reconciler",
                        session_id = %event.session_id,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Ledger append failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        target: "sc.reconciler",
                        session_id = %event.session_id,
                        meter_event = %event.meter_event,
                        quantity = event.quantity,
                        attempts = attempt,
                        error = %e,
                        "Failed to persist usage event"
                    );
                    metrics::record_usage_forward("ledger_failed");
                    return None;
                }
            }
        }
    }

    /// Ledger first, then billing.
    async fn reconcile(&self, event: UsageEvent) {
        let Some(record) = self.persist(&event).await else {
            return;
        };

        let forwarded = self
            .billing
            .record_usage(
                &record.meter_event,
                record.quantity,
                &record.customer_ref,
                &record.id.to_string(),
            )
            .await;

        match forwarded {
            Ok(()) => {
                if let Err(e) = self.ledger.mark_forwarded(record.id).await {
                    warn!(target: "sc.reconciler", usage_id = %record.id, error = %e, "Failed to mark usage forwarded");
                }
                debug!(target: "sc.reconciler", usage_id = %record.id, session_id = %record.session_id, "Usage forwarded");
                metrics::record_usage_forward("forwarded");
            }
            Err(e) => {
                warn!(
                    target: "sc.reconciler",
                    usage_id = %record.id,
                    session_id = %record.session_id,
                    error = %e,
                    "Billing rejected usage, left in ledger for reconciliation"
                );
                if let Err(mark_err) = self
                    .ledger
                    .mark_forward_failed(record.id, &e.to_string())
                    .await
                {
                    warn!(target: "sc.reconciler", usage_id = %record.id, error = %mark_err, "Failed to mark usage forward failure");
                }
                metrics::record_usage_forward("billing_failed");
            }
        }
    }
}
