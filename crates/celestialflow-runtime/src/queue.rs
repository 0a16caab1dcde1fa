//! # Queue Fabric
//!
//! A [`TaskQueue`] bundles the channel endpoints of one side of a stage:
//! all ingress edges (direction `in`) or all egress edges (direction
//! `out`). Edges are unbounded channels carrying [`QueueItem`]s.
//!
//! The fan-in `get` round-robins across endpoints for fairness and merges
//! per-endpoint termination signals into a single merged signal once every
//! endpoint has terminated. Probing is non-blocking with a short sleep
//! between sweeps, so one worker never starves the others on a shared
//! queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{trace, warn};

use celestialflow_shared::{
    ConfigurationError, EventKind, QueueError, QueueItem, SharedProvenance, TaskEnvelope,
    TerminationSignal,
};

/// Sleep between polling sweeps when every live endpoint is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which side of a stage this bundle serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One graph edge: an unbounded channel with both halves retained so the
/// producer side can broadcast and the consumer side can probe (and
/// re-inject retried envelopes).
#[derive(Debug, Clone)]
pub struct TaskChannel {
    pub tag: String,
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
}

impl TaskChannel {
    pub fn unbounded(tag: impl Into<String>) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            tag: tag.into(),
            sender,
            receiver,
        }
    }

    pub fn send(&self, item: QueueItem) -> Result<(), crossbeam::channel::SendError<QueueItem>> {
        self.sender.send(item)
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Fan-in bookkeeping, shared by every worker polling the same queue.
#[derive(Debug, Default)]
struct FanInState {
    /// Starting endpoint for the next sweep (fairness cursor).
    current_index: usize,
    /// Endpoint index → termination id observed on that endpoint.
    termination_ids: HashMap<usize, String>,
    /// Cached merged signal, returned to every `get` after the merge.
    merged: Option<TerminationSignal>,
}

/// Fan-in / fan-out bundle of channel endpoints with parallel tags.
#[derive(Debug)]
pub struct TaskQueue {
    channels: Vec<TaskChannel>,
    tag_to_idx: HashMap<String, usize>,
    direction: Direction,
    stage_tag: String,
    provenance: SharedProvenance,
    poll_interval: Duration,
    state: Mutex<FanInState>,
}

impl TaskQueue {
    pub fn new(
        channels: Vec<TaskChannel>,
        direction: Direction,
        stage_tag: impl Into<String>,
        provenance: SharedProvenance,
    ) -> Result<Self, ConfigurationError> {
        let mut tag_to_idx = HashMap::with_capacity(channels.len());
        for (idx, ch) in channels.iter().enumerate() {
            if tag_to_idx.insert(ch.tag.clone(), idx).is_some() {
                return Err(ConfigurationError::DuplicateQueueTag(ch.tag.clone()));
            }
        }
        Ok(Self {
            channels,
            tag_to_idx,
            direction,
            stage_tag: stage_tag.into(),
            provenance,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(FanInState::default()),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn add_channel(&mut self, channel: TaskChannel) -> Result<(), ConfigurationError> {
        if self.tag_to_idx.contains_key(&channel.tag) {
            return Err(ConfigurationError::DuplicateQueueTag(channel.tag.clone()));
        }
        self.tag_to_idx
            .insert(channel.tag.clone(), self.channels.len());
        self.channels.push(channel);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.tag.as_str())
    }

    pub fn tag_idx(&self, tag: &str) -> Option<usize> {
        self.tag_to_idx.get(tag).copied()
    }

    /// The merged termination signal, if all endpoints have terminated.
    pub fn merged_signal(&self) -> Option<TerminationSignal> {
        self.state
            .lock()
            .expect("fan-in state lock poisoned")
            .merged
            .clone()
    }

    /// Broadcast: put `item` on every endpoint.
    pub fn put(&self, item: QueueItem) {
        for idx in 0..self.channels.len() {
            self.put_channel(item.clone(), idx);
        }
    }

    /// Put on endpoint 0 only (retry re-injection).
    pub fn put_first(&self, item: QueueItem) {
        self.put_channel(item, 0);
    }

    /// Put on the endpoint registered under `tag`.
    pub fn put_target(&self, item: QueueItem, tag: &str) -> Result<(), ConfigurationError> {
        let idx = self
            .tag_to_idx
            .get(tag)
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownTarget {
                target: tag.to_string(),
                stage: self.stage_tag.clone(),
            })?;
        self.put_channel(item, idx);
        Ok(())
    }

    /// Put on one endpoint by index. Failures are logged, never raised:
    /// losing a downstream consumer must not take the producer down.
    pub fn put_channel(&self, item: QueueItem, idx: usize) {
        let Some(channel) = self.channels.get(idx) else {
            warn!(
                stage = %self.stage_tag,
                direction = %self.direction,
                idx,
                "put on unknown endpoint index"
            );
            return;
        };
        let kind = item.kind();
        let id = item.id().to_string();
        match channel.send(item) {
            Ok(()) => trace!(
                stage = %self.stage_tag,
                direction = %self.direction,
                endpoint = %channel.tag,
                item = kind,
                id = %id,
                "put"
            ),
            Err(err) => {
                let queue_err = QueueError {
                    endpoint_tag: channel.tag.clone(),
                    stage_tag: self.stage_tag.clone(),
                    message: err.to_string(),
                };
                warn!(
                    direction = %self.direction,
                    error = %queue_err,
                    "put failed; endpoint dropped"
                );
            }
        }
    }

    /// Round-robin fetch across endpoints.
    ///
    /// Returns the next [`TaskEnvelope`], or a merged [`TerminationSignal`]
    /// once every endpoint has emitted its own. After the merge, every
    /// subsequent call returns a clone of the merged signal, so each
    /// worker of a pool observes termination exactly once.
    pub async fn get(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_sweep() {
                return item;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One non-blocking sweep over all endpoints.
    fn try_sweep(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().expect("fan-in state lock poisoned");
        if let Some(merged) = &state.merged {
            return Some(QueueItem::Termination(merged.clone()));
        }

        let total = self.channels.len();
        for offset in 0..total {
            let idx = (state.current_index + offset) % total;
            if state.termination_ids.contains_key(&idx) {
                continue;
            }
            match self.channels[idx].receiver.try_recv() {
                Ok(QueueItem::Task(envelope)) => {
                    state.current_index = (idx + 1) % total;
                    trace!(
                        stage = %self.stage_tag,
                        endpoint = %self.channels[idx].tag,
                        item = "task",
                        id = %envelope.id,
                        "get"
                    );
                    return Some(QueueItem::Task(envelope));
                }
                Ok(QueueItem::Termination(signal)) => {
                    trace!(
                        stage = %self.stage_tag,
                        endpoint = %self.channels[idx].tag,
                        item = "termination",
                        id = %signal.id,
                        "get"
                    );
                    state.termination_ids.insert(idx, signal.id);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    // Producer gone without a termination signal: log and
                    // skip this endpoint for the sweep, not permanently.
                    let queue_err = QueueError {
                        endpoint_tag: self.channels[idx].tag.clone(),
                        stage_tag: self.stage_tag.clone(),
                        message: "endpoint disconnected while probing".to_string(),
                    };
                    warn!(error = %queue_err, "get failed");
                }
            }
        }

        if state.termination_ids.len() == total {
            let merged = self.merge_terminations(&state.termination_ids);
            state.merged = Some(merged.clone());
            return Some(QueueItem::Termination(merged));
        }
        None
    }

    fn merge_terminations(&self, termination_ids: &HashMap<usize, String>) -> TerminationSignal {
        let mut parents: Vec<(usize, String)> = termination_ids
            .iter()
            .map(|(idx, id)| (*idx, id.clone()))
            .collect();
        parents.sort_by_key(|(idx, _)| *idx);
        let parent_ids: Vec<String> = parents.into_iter().map(|(_, id)| id).collect();
        let merged_id = self
            .provenance
            .emit(EventKind::TerminationMerge, &parent_ids, None);
        TerminationSignal::new(merged_id)
    }

    /// Non-blocking snapshot of remaining envelopes across all endpoints.
    /// Termination signals encountered are recorded, not returned.
    pub fn drain(&self) -> Vec<TaskEnvelope> {
        let mut state = self.state.lock().expect("fan-in state lock poisoned");
        let mut results = Vec::new();

        for idx in 0..self.channels.len() {
            if state.termination_ids.contains_key(&idx) {
                continue;
            }
            loop {
                match self.channels[idx].receiver.try_recv() {
                    Ok(QueueItem::Task(envelope)) => results.push(envelope),
                    Ok(QueueItem::Termination(signal)) => {
                        state.termination_ids.insert(idx, signal.id);
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!(
                            stage = %self.stage_tag,
                            endpoint = %self.channels[idx].tag,
                            "endpoint disconnected while draining"
                        );
                        break;
                    }
                }
            }
        }
        results
    }

    /// Drain every endpoint regardless of termination state.
    ///
    /// Used by a stage after its pool has quiesced: envelopes found behind
    /// a termination marker can only be retry re-injections, which must
    /// still be processed before the stage emits its own termination.
    pub(crate) fn drain_residual(&self) -> Vec<TaskEnvelope> {
        let mut results = Vec::new();
        for channel in &self.channels {
            while let Ok(item) = channel.receiver.try_recv() {
                if let QueueItem::Task(envelope) = item {
                    results.push(envelope);
                }
            }
        }
        results
    }

    /// Forget fan-in progress (fresh run over the same endpoints).
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("fan-in state lock poisoned");
        state.current_index = 0;
        state.termination_ids.clear();
        state.merged = None;
    }
}
