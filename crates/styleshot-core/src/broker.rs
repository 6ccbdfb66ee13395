//! In-process priority broker
//!
//! Delivers payloads to worker slots with FIFO order inside each priority
//! class and lower-weight classes first. A payload is owned by the broker
//! between enqueue and delivery and is never redelivered while in flight;
//! the ack/nack protocol is the mutual-exclusion mechanism. Failed payloads
//! are either re-enqueued after an escalating backoff delay with bounded
//! jitter, or forwarded to the dead-letter handler.

use crate::config::{PriorityWeights, QueueConfig};
use crate::dead_letter::DeadLetterHandler;
use crate::error::{PipelineError, Result};
use crate::models::{JobPayload, JobPriority};
use crate::retry::classify;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque handle identifying a payload between enqueue and ack/nack
pub type QueueToken = Uuid;

/// Pure attempt-to-delay mapping injected into the broker at construction
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    table: Vec<Duration>,
    jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(table_ms: &[u64], jitter_ms: u64) -> Self {
        Self {
            table: table_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(&config.backoff_table_ms, config.jitter_ms)
    }

    /// Delay before re-delivering after `attempts_made` attempts; attempts
    /// past the table clamp to its last entry. Bounded random jitter spreads
    /// re-deliveries so retries of a burst do not land together.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = match self.table.last() {
            Some(last) => {
                let index = (attempts_made.saturating_sub(1) as usize).min(self.table.len() - 1);
                self.table.get(index).copied().unwrap_or(*last)
            }
            None => Duration::ZERO,
        };

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }
}

/// One payload delivered to a worker slot
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: QueueToken,
    pub payload: JobPayload,
    pub attempt: u32,
}

/// Outcome of a nack, surfaced for observability and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { delay: Duration },
    DeadLettered,
}

#[derive(Debug)]
struct QueuedEntry {
    token: QueueToken,
    payload: JobPayload,
    weight: u8,
    seq: u64,
    attempt: u32,
    max_attempts: u32,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: the greatest entry is the lowest weight, then the
        // earliest sequence number (FIFO within one class)
        other
            .weight
            .cmp(&self.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct DelayedEntry {
    ready_at: Instant,
    entry: QueuedEntry,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: BinaryHeap<QueuedEntry>,
    delayed: Vec<DelayedEntry>,
    in_flight: HashMap<QueueToken, QueuedEntry>,
    seq: u64,
    deliveries: u64,
    acked: u64,
    dead_lettered: u64,
}

/// Queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub deliveries: u64,
    pub acked: u64,
    pub dead_lettered: u64,
}

/// Priority queue shared by one broker and N worker slots
pub struct Broker {
    state: Mutex<BrokerState>,
    notify: Notify,
    backoff: BackoffPolicy,
    weights: PriorityWeights,
    default_max_attempts: u32,
    fair_share_interval: u64,
    dead_letter: Arc<DeadLetterHandler>,
}

impl Broker {
    pub fn new(
        config: &QueueConfig,
        backoff: BackoffPolicy,
        dead_letter: Arc<DeadLetterHandler>,
    ) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            backoff,
            weights: config.priority_weights,
            default_max_attempts: config.max_attempts,
            fair_share_interval: config.fair_share_interval,
            dead_letter,
        }
    }

    /// Enqueue a payload; the returned token identifies it through delivery
    /// and ack/nack.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        priority: JobPriority,
        max_attempts: Option<u32>,
    ) -> QueueToken {
        let token = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            state.seq += 1;
            let entry = QueuedEntry {
                token,
                weight: self.weights.weight(priority),
                seq: state.seq,
                attempt: 1,
                max_attempts: max_attempts.unwrap_or(self.default_max_attempts),
                payload,
            };
            debug!(%token, weight = entry.weight, seq = entry.seq, "payload enqueued");
            state.ready.push(entry);
        }
        self.notify.notify_one();
        token
    }

    /// Take the next ready payload, suspending until one is available.
    pub async fn deliver(&self) -> Delivery {
        loop {
            let next_ready_at = {
                let mut state = self.state.lock().await;
                Self::promote_due(&mut state);

                if !state.ready.is_empty() {
                    state.deliveries += 1;
                    let take_oldest = self.fair_share_interval > 0
                        && state.deliveries % self.fair_share_interval == 0;
                    let entry = if take_oldest {
                        Self::pop_oldest(&mut state.ready)
                    } else {
                        state.ready.pop()
                    };
                    if let Some(entry) = entry {
                        let delivery = Delivery {
                            token: entry.token,
                            payload: entry.payload.clone(),
                            attempt: entry.attempt,
                        };
                        debug!(
                            token = %entry.token,
                            attempt = entry.attempt,
                            fair_share = take_oldest,
                            "payload delivered"
                        );
                        state.in_flight.insert(entry.token, entry);
                        return delivery;
                    }
                }

                state.delayed.iter().map(|d| d.ready_at).min()
            };

            match next_ready_at {
                Some(ready_at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Acknowledge a successfully processed payload.
    pub async fn ack(&self, token: QueueToken) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&token)
            .ok_or_else(|| PipelineError::InvalidInput {
                message: format!("Unknown queue token {}", token),
            })?;
        state.acked += 1;
        Ok(())
    }

    /// Report a failed payload. Classification decides between re-enqueue
    /// with backoff and hand-off to the dead-letter handler; an exhausted
    /// attempt budget forces dead-letter regardless.
    pub async fn nack(&self, token: QueueToken, error: &PipelineError) -> Result<NackOutcome> {
        let mut entry = {
            let mut state = self.state.lock().await;
            state
                .in_flight
                .remove(&token)
                .ok_or_else(|| PipelineError::InvalidInput {
                    message: format!("Unknown queue token {}", token),
                })?
        };

        let classification = classify(error, entry.attempt, entry.max_attempts);

        if classification.retryable {
            let delay = self.backoff.delay_for(entry.attempt);
            info!(
                %token,
                job_id = %entry.payload.job_id,
                attempt = entry.attempt,
                delay_ms = delay.as_millis() as u64,
                code = classification.code,
                "requeueing payload with backoff"
            );
            entry.attempt += 1;
            {
                let mut state = self.state.lock().await;
                state.delayed.push(DelayedEntry {
                    ready_at: Instant::now() + delay,
                    entry,
                });
            }
            self.notify.notify_one();
            Ok(NackOutcome::Requeued { delay })
        } else {
            {
                let mut state = self.state.lock().await;
                state.dead_lettered += 1;
            }
            self.dead_letter
                .handle(&entry.payload, entry.attempt, error)
                .await;
            Ok(NackOutcome::DeadLettered)
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.lock().await;
        BrokerStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            deliveries: state.deliveries,
            acked: state.acked,
            dead_lettered: state.dead_lettered,
        }
    }

    /// True once nothing is queued, delayed or in flight
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.ready.is_empty() && state.delayed.is_empty() && state.in_flight.is_empty()
    }

    fn promote_due(state: &mut BrokerState) {
        let now = Instant::now();
        let mut index = 0;
        while index < state.delayed.len() {
            if state.delayed[index].ready_at <= now {
                let due = state.delayed.swap_remove(index);
                state.ready.push(due.entry);
            } else {
                index += 1;
            }
        }
    }

    /// Drain the heap to take the globally oldest entry, then rebuild.
    /// Keeps a saturated high-priority stream from starving lower classes.
    fn pop_oldest(ready: &mut BinaryHeap<QueuedEntry>) -> Option<QueuedEntry> {
        let mut entries: Vec<QueuedEntry> = ready.drain().collect();
        let oldest_index = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)?;
        let oldest = entries.swap_remove(oldest_index);
        ready.extend(entries);
        Some(oldest)
    }
}
