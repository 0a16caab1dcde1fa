//! # Reporter
//!
//! Periodic status exporter. Pushes the graph structure, topology, and
//! per-stage status snapshots to a live-reporting server over its JSON
//! push API, and polls the server for externally injected tasks, feeding
//! them into the running graph's ingress channels.
//!
//! Every push is best-effort: an unreachable server is logged and the run
//! continues. The server itself is an external collaborator; only the
//! client contract lives here.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use celestialflow_shared::config::ReporterConfig;
use celestialflow_shared::{QueueItem, TaskEnvelope, TaskValue};

use crate::graph::GraphShared;
use crate::queue::TaskChannel;
use crate::stage::TaskStage;

/// Where the reporter can inject externally submitted tasks.
#[derive(Debug, Clone)]
pub struct InjectionTarget {
    pub tag: String,
    pub(crate) channel: TaskChannel,
    pub(crate) stage: TaskStage,
}

/// Running reporter bound to one graph run.
#[derive(Debug)]
pub struct ReporterHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    client: reqwest::Client,
    base_url: String,
    shared: Arc<GraphShared>,
}

impl ReporterHandle {
    /// Stop the push loop and emit one final status/error push so the
    /// server sees the terminal state.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
        push_status(&self.client, &self.base_url, &self.shared).await;
        push_errors(&self.client, &self.base_url, &self.shared).await;
        debug!("reporter stopped");
    }
}

/// Reporter push client.
#[derive(Debug)]
pub struct TaskReporter;

impl TaskReporter {
    /// Spawn the push loop for one run.
    pub(crate) fn spawn(
        config: ReporterConfig,
        shared: Arc<GraphShared>,
        structure: TaskValue,
        topology: TaskValue,
        injection: Vec<InjectionTarget>,
    ) -> ReporterHandle {
        let client = reqwest::Client::new();
        let base_url = config.base_url();
        let (stop_tx, stop_rx) = watch::channel(false);

        let join = tokio::spawn(run_loop(
            client.clone(),
            base_url.clone(),
            config,
            Arc::clone(&shared),
            structure,
            topology,
            injection,
            stop_rx,
        ));

        ReporterHandle {
            stop_tx,
            join,
            client,
            base_url,
            shared,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    client: reqwest::Client,
    base_url: String,
    config: ReporterConfig,
    shared: Arc<GraphShared>,
    structure: TaskValue,
    topology: TaskValue,
    injection: Vec<InjectionTarget>,
    mut stop_rx: watch::Receiver<bool>,
) {
    push_json(&client, &base_url, "/api/push_structure", &structure).await;
    push_json(&client, &base_url, "/api/push_topology", &topology).await;
    push_json(
        &client,
        &base_url,
        "/api/push_interval",
        &json!({ "interval": config.interval.as_millis() as u64 }),
    )
    .await;

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                push_status(&client, &base_url, &shared).await;
                push_errors(&client, &base_url, &shared).await;
                poll_injection(&client, &base_url, &injection).await;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn push_status(client: &reqwest::Client, base_url: &str, shared: &Arc<GraphShared>) {
    let snapshot = shared.snapshot();
    push_json(client, base_url, "/api/push_status", &snapshot).await;
}

async fn push_errors(client: &reqwest::Client, base_url: &str, shared: &Arc<GraphShared>) {
    let errors: Vec<TaskValue> = shared
        .failures
        .lock()
        .expect("failures lock poisoned")
        .iter()
        .map(|record| {
            json!({
                "error": record.error,
                "stage": record.stage_tag,
                "task_id": record.error_id,
                "timestamp": record.timestamp,
            })
        })
        .collect();
    push_json(client, base_url, "/api/push_errors", &errors).await;
}

async fn push_json<T: serde::Serialize>(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    payload: &T,
) {
    let url = format!("{base_url}{path}");
    match client.post(&url).json(payload).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => warn!(url = %url, status = %response.status(), "reporter push rejected"),
        Err(err) => warn!(url = %url, error = %err, "reporter push failed"),
    }
}

/// Fetch pending `{stage_tag, tasks}` injections and feed them into the
/// matching ingress channels, counting them as init inputs.
async fn poll_injection(client: &reqwest::Client, base_url: &str, injection: &[InjectionTarget]) {
    let url = format!("{base_url}/api/get_task_injection");
    let pending: Vec<TaskValue> = match client.get(&url).send().await {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(url = %url, error = %err, "bad injection payload");
                return;
            }
        },
        Err(err) => {
            debug!(url = %url, error = %err, "injection poll failed");
            return;
        }
    };

    for entry in pending {
        let Some(tag) = entry.get("stage_tag").and_then(|t| t.as_str()) else {
            warn!(payload = %entry, "injection entry missing stage_tag");
            continue;
        };
        let Some(target) = injection.iter().find(|t| t.tag == tag) else {
            warn!(stage = %tag, "injection for unknown stage");
            continue;
        };
        let tasks = match entry.get("tasks") {
            Some(TaskValue::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
            None => Vec::new(),
        };
        let count = tasks.len();
        for task in tasks {
            let envelope = TaskEnvelope::wrap(task);
            let _ = target.channel.send(QueueItem::Task(envelope));
            target.stage.metrics().task_counter.add_init_value(1);
        }
        info!(stage = %tag, count, "tasks injected from reporter");
    }
}
