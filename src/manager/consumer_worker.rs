// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-queue polling worker of one topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::ControlQueue;
use crate::error::CollaboratorError;
use crate::event::{ControlEvent, EventBus, SimulatorEvent};
use crate::model::WorkerId;

use super::consumer_registry::ControlHandler;

/// Lifecycle of a consumer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Polling its topic.
    Running,
    /// Asked to stop; finishing its current pop.
    Stopping,
    /// Exited.
    Stopped,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Stopping => 1,
            Self::Stopped => 2,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Running.as_u8()))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Handle to a worker polling one topic.
#[derive(Debug)]
pub struct ConsumerWorker {
    worker_id: WorkerId,
    topic: String,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConsumerWorker {
    pub(crate) fn spawn(
        topic: String,
        context: Arc<WorkerContext>,
        cancel: CancellationToken,
    ) -> Self {
        let worker_id = WorkerId::new();
        let state = Arc::new(SharedState::new());
        let handle = tokio::spawn(run(
            topic.clone(),
            worker_id,
            context,
            Arc::clone(&state),
            cancel.clone(),
        ));
        Self {
            worker_id,
            topic,
            state,
            cancel,
            handle,
        }
    }

    /// Returns the worker identity.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the polled topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        if self.handle.is_finished() {
            WorkerState::Stopped
        } else {
            self.state.get()
        }
    }

    /// Returns true while the worker is running and not asked to stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Asks the worker to exit after its current pop.
    pub fn stop(&self) {
        if self.state.get() == WorkerState::Running {
            self.state.set(WorkerState::Stopping);
        }
        self.cancel.cancel();
    }

    pub(crate) fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Resources shared by every worker.
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<dyn ControlQueue>,
    pub(crate) handler: Arc<dyn ControlHandler>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) events: EventBus,
    pub(crate) pop_timeout: Duration,
    pub(crate) io_timeout: Duration,
    pub(crate) polling_interval: Duration,
}

impl WorkerContext {
    /// Decodes one popped message and forwards it to the handler.
    ///
    /// Malformed messages and handler errors are logged and dropped.
    async fn dispatch(&self, topic: &str, message: &str) {
        tracing::info!(topic, payload = message, "Received control message");

        let event = match ControlEvent::decode(message) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::warn!(topic, payload = message, "Control message has no usable device id");
                return;
            }
            Err(e) => {
                tracing::error!(topic, error = %e, "Failed to decode control message");
                return;
            }
        };

        self.events.publish(SimulatorEvent::ControlReceived {
            topic: topic.to_string(),
            device_id: event.device_id().clone(),
            state: event.state(),
        });

        let device_id = event.device_id().clone();
        let state = event.state();
        match self.handler.handle_control(event).await {
            Ok(outcome) => {
                tracing::debug!(topic, %device_id, %state, ?outcome, "Control event handled");
            }
            Err(e) => {
                tracing::error!(topic, %device_id, %state, error = %e, "Control event failed");
            }
        }
    }

    async fn pop(&self, topic: &str) -> Result<Option<String>, CollaboratorError> {
        let bound = self.pop_timeout + self.io_timeout;
        tokio::time::timeout(bound, self.queue.blocking_pop(topic, self.pop_timeout))
            .await
            .unwrap_or_else(|_| Err(CollaboratorError::timeout(bound)))
    }
}

/// Polls `topic` until cancelled.
///
/// The worker holds one consumer permit for its whole life. A pop in flight
/// is allowed to complete; cancellation is observed between pops.
async fn run(
    topic: String,
    worker_id: WorkerId,
    context: Arc<WorkerContext>,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        permit = Arc::clone(&context.permits).acquire_owned() => permit.ok(),
    };

    if let Some(_permit) = permit {
        tracing::info!(topic = %topic, %worker_id, "Starting consumer for topic");
        context.events.publish(SimulatorEvent::ConsumerStarted {
            topic: topic.clone(),
            worker_id,
        });

        while !cancel.is_cancelled() {
            match context.pop(&topic).await {
                Ok(Some(message)) => context.dispatch(&topic, &message).await,
                Ok(None) => tracing::trace!(topic = %topic, "No control message"),
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Error consuming messages");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(context.polling_interval) => {}
                    }
                }
            }
        }

        context.events.publish(SimulatorEvent::ConsumerStopped {
            topic: topic.clone(),
            worker_id,
        });
    }

    state.set(WorkerState::Stopped);
    tracing::info!(topic = %topic, %worker_id, "Consumer stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::backend::memory::MemoryQueue;
    use crate::error::Error;
    use crate::event::DesiredState;
    use crate::manager::ControlOutcome;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ControlEvent>>,
    }

    #[async_trait]
    impl ControlHandler for Recorder {
        async fn handle_control(&self, event: ControlEvent) -> Result<ControlOutcome, Error> {
            self.events.lock().push(event);
            Ok(ControlOutcome::NotRunning)
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl ControlHandler for Failing {
        async fn handle_control(&self, _event: ControlEvent) -> Result<ControlOutcome, Error> {
            self.0.fetch_add(1, Ordering::AcqRel);
            Err(Error::ShuttingDown)
        }
    }

    fn context(queue: Arc<MemoryQueue>, handler: Arc<dyn ControlHandler>) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            queue,
            handler,
            permits: Arc::new(Semaphore::new(1)),
            events: EventBus::new(),
            pop_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_secs(1),
            polling_interval: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_decoded_messages_in_order() {
        let queue = Arc::new(MemoryQueue::new());
        let recorder = Arc::new(Recorder::default());
        queue.push("temperature", r#"{"deviceId":"13","state":1}"#);
        queue.push("temperature", r#"{"deviceId":"13","state":0}"#);

        let worker = ConsumerWorker::spawn(
            "temperature".to_string(),
            context(Arc::clone(&queue), Arc::clone(&recorder) as Arc<dyn ControlHandler>),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let states: Vec<DesiredState> = recorder.events.lock().iter().map(ControlEvent::state).collect();
        assert_eq!(states, vec![DesiredState::Start, DesiredState::Stop]);
        assert!(worker.is_running());

        worker.stop();
        worker.into_handle().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_does_not_stop_worker() {
        let queue = Arc::new(MemoryQueue::new());
        let recorder = Arc::new(Recorder::default());
        queue.push("humidity", "not json");
        queue.push("humidity", r#"{"deviceId":"4","state":"1"}"#);

        let worker = ConsumerWorker::spawn(
            "humidity".to_string(),
            context(Arc::clone(&queue), Arc::clone(&recorder) as Arc<dyn ControlHandler>),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.events.lock().len(), 1);
        worker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_are_contained() {
        let queue = Arc::new(MemoryQueue::new());
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        queue.push("t", r#"{"deviceId":1,"state":1}"#);
        queue.push("t", r#"{"deviceId":2,"state":1}"#);

        let worker = ConsumerWorker::spawn(
            "t".to_string(),
            context(Arc::clone(&queue), Arc::clone(&failing) as Arc<dyn ControlHandler>),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(failing.0.load(Ordering::Acquire), 2);
        assert!(worker.is_running());
        worker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_after_pop_failure() {
        let queue = Arc::new(MemoryQueue::new());
        let recorder = Arc::new(Recorder::default());
        queue.fail_next_pops(1);
        queue.push("t", r#"{"deviceId":"9","state":1}"#);

        let worker = ConsumerWorker::spawn(
            "t".to_string(),
            context(Arc::clone(&queue), Arc::clone(&recorder) as Arc<dyn ControlHandler>),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.events.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.events.lock().len(), 1);
        worker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_finishes_within_one_pop_timeout() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = ConsumerWorker::spawn(
            "idle".to_string(),
            context(queue, Arc::new(Recorder::default())),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopping);

        let handle = worker.into_handle();
        tokio::time::timeout(Duration::from_millis(300), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_free_permit() {
        let queue = Arc::new(MemoryQueue::new());
        let ctx = context(Arc::clone(&queue), Arc::new(Recorder::default()));
        let mut events = ctx.events.subscribe();

        let first = ConsumerWorker::spawn("a".to_string(), Arc::clone(&ctx), CancellationToken::new());
        let second = ConsumerWorker::spawn("b".to_string(), Arc::clone(&ctx), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = events.try_recv().unwrap();
        assert_eq!(started.topic(), Some("a"));
        assert!(events.try_recv().is_err());

        first.stop();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let topics: Vec<Option<String>> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.topic().map(str::to_string))
            .collect();
        assert!(topics.contains(&Some("b".to_string())));
        second.stop();
    }
}
