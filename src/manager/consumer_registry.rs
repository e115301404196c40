// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of per-topic consumer workers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backend::ControlQueue;
use crate::config::SimulatorConfig;
use crate::error::Error;
use crate::event::{ControlEvent, EventBus};
use crate::model::WorkerId;

use super::consumer_worker::{ConsumerWorker, WorkerContext};
use super::producer_registry::ControlOutcome;

/// Receiver of decoded control events.
///
/// Consumer workers forward every decoded message to their handler. The
/// supervisor wires the workers to the [`ProducerRegistry`](super::ProducerRegistry).
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    /// Applies one control event.
    ///
    /// # Errors
    ///
    /// Errors are logged by the worker and the message is dropped.
    async fn handle_control(&self, event: ControlEvent) -> Result<ControlOutcome, Error>;
}

/// Topics started and stopped by a [`ConsumerRegistry::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Topics that gained a worker.
    pub started: Vec<String>,
    /// Topics whose worker was stopped.
    pub stopped: Vec<String>,
}

impl ReconcileReport {
    /// Returns true if the reconcile changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Owns one polling worker per device-type topic.
///
/// At most one running worker exists per topic. Workers share a bounded
/// pool of [`consumer_pool_size`](SimulatorConfig::consumer_pool_size)
/// permits; a worker beyond that size waits for a slot before polling.
pub struct ConsumerRegistry {
    workers: DashMap<String, ConsumerWorker>,
    context: Arc<WorkerContext>,
    config: SimulatorConfig,
    root: CancellationToken,
    shutting_down: AtomicBool,
}

impl ConsumerRegistry {
    /// Creates an empty registry whose workers forward to `handler`.
    #[must_use]
    pub fn new(
        config: &SimulatorConfig,
        queue: Arc<dyn ControlQueue>,
        handler: Arc<dyn ControlHandler>,
        events: EventBus,
        root: CancellationToken,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            queue,
            handler,
            permits: Arc::new(Semaphore::new(config.consumer_pool_size())),
            events,
            pop_timeout: config.pop_timeout(),
            io_timeout: config.io_timeout(),
            polling_interval: config.polling_interval(),
        });
        Self {
            workers: DashMap::new(),
            context,
            config: config.clone(),
            root,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Starts a worker for `topic` unless one is already running.
    ///
    /// Returns true if a worker was started.
    pub fn start(&self, topic: &str) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        match self.workers.entry(topic.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    return false;
                }
                // A worker that exited on its own is replaced
                let worker = self.spawn(topic);
                let previous = entry.insert(worker);
                previous.stop();
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn(topic));
                true
            }
        }
    }

    /// Starts a worker for every topic not yet consumed.
    ///
    /// Returns the number of workers started.
    pub fn start_all(&self, topics: &[String]) -> usize {
        let started = topics.iter().filter(|topic| self.start(topic)).count();
        tracing::info!(count = started, "Started consumers");
        started
    }

    /// Makes the worker set match `topics` exactly.
    ///
    /// Workers for topics no longer listed are stopped; listed topics
    /// without a worker get one. Unchanged topics keep their worker.
    pub fn reconcile(&self, topics: &[String]) -> ReconcileReport {
        let wanted: BTreeSet<&str> = topics.iter().map(String::as_str).collect();
        let current: Vec<String> = self.topics();

        let mut report = ReconcileReport::default();
        for topic in current.iter().filter(|t| !wanted.contains(t.as_str())) {
            if self.stop(topic) {
                report.stopped.push(topic.clone());
            }
        }
        for topic in wanted {
            if self.start(topic) {
                report.started.push(topic.to_string());
            }
        }

        if !report.is_empty() {
            tracing::info!(
                started = ?report.started,
                stopped = ?report.stopped,
                "Reconciled consumers"
            );
        }
        report
    }

    /// Stops and removes the worker of `topic`.
    ///
    /// The worker exits after its current pop. A worker that does not exit
    /// in time is aborted in the background. Returns false if no worker was
    /// registered.
    pub fn stop(&self, topic: &str) -> bool {
        let Some((_, worker)) = self.workers.remove(topic) else {
            return false;
        };
        tracing::info!(topic, worker_id = %worker.worker_id(), "Stopping consumer for topic");
        worker.stop();

        let mut handle = worker.into_handle();
        let bound = self.config.pop_timeout() + self.config.shutdown_grace();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if tokio::time::timeout(bound, &mut handle).await.is_err() {
                tracing::warn!(topic = %topic, "Consumer did not stop in time, aborting");
                handle.abort();
            }
        });
        true
    }

    /// Stops every worker and waits for them to exit.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.root.cancel();

        let workers: Vec<ConsumerWorker> = self
            .topics()
            .into_iter()
            .filter_map(|topic| self.workers.remove(&topic).map(|(_, worker)| worker))
            .collect();
        tracing::info!(count = workers.len(), "Stopping all consumers");

        let deadline = tokio::time::Instant::now()
            + self.config.pop_timeout()
            + self.config.shutdown_grace();
        for worker in workers {
            worker.stop();
            let topic = worker.topic().to_string();
            let mut handle = worker.into_handle();
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!(topic = %topic, "Consumer did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    /// Returns the number of running workers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    /// Returns every registered topic with its running flag.
    #[must_use]
    pub fn status_snapshot(&self) -> BTreeMap<String, bool> {
        self.workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.is_running()))
            .collect()
    }

    /// Returns the identity of the worker consuming `topic`.
    #[must_use]
    pub fn worker_id(&self, topic: &str) -> Option<WorkerId> {
        self.workers.get(topic).map(|w| w.worker_id())
    }

    /// Returns the registered topics in order.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    fn spawn(&self, topic: &str) -> ConsumerWorker {
        ConsumerWorker::spawn(
            topic.to_string(),
            Arc::clone(&self.context),
            self.root.child_token(),
        )
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("topics", &self.topics())
            .field("shutting_down", &self.shutting_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::memory::MemoryQueue;

    struct Ignore;

    #[async_trait]
    impl ControlHandler for Ignore {
        async fn handle_control(&self, _event: ControlEvent) -> Result<ControlOutcome, Error> {
            Ok(ControlOutcome::NotRunning)
        }
    }

    fn registry(pool: usize) -> ConsumerRegistry {
        let config = SimulatorConfig::default()
            .with_consumer_pool_size(pool)
            .with_pop_timeout(Duration::from_millis(200));
        ConsumerRegistry::new(
            &config,
            Arc::new(MemoryQueue::new()),
            Arc::new(Ignore),
            EventBus::new(),
            CancellationToken::new(),
        )
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_per_topic() {
        let registry = registry(4);
        assert!(registry.start("temperature"));
        let id = registry.worker_id("temperature");
        assert!(!registry.start("temperature"));
        assert_eq!(registry.worker_id("temperature"), id);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_stops_removed_topics_and_keeps_others() {
        let registry = registry(4);
        let report = registry.reconcile(&topics(&["temperature", "humidity"]));
        assert_eq!(report.started.len(), 2);
        let humidity = registry.worker_id("humidity");

        let report = registry.reconcile(&topics(&["humidity"]));
        assert_eq!(report.stopped, vec!["temperature".to_string()]);
        assert!(report.started.is_empty());
        assert_eq!(registry.worker_id("humidity"), humidity);
        assert_eq!(registry.topics(), vec!["humidity".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_twice_is_a_no_op() {
        let registry = registry(4);
        registry.reconcile(&topics(&["a", "b"]));
        assert!(registry.reconcile(&topics(&["b", "a"])).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unknown_topic_returns_false() {
        let registry = registry(4);
        assert!(!registry.stop("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_snapshot_lists_every_topic() {
        let registry = registry(4);
        registry.start_all(&topics(&["soil", "air"]));
        let snapshot = registry.status_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.values().all(|running| *running));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_all_and_refuses_starts() {
        let registry = registry(1);
        registry.start_all(&topics(&["a", "b", "c"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.shutdown_all().await;

        assert_eq!(registry.active_count(), 0);
        assert!(registry.status_snapshot().is_empty());
        assert!(!registry.start("a"));
    }
}
