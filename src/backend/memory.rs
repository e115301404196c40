// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators.
//!
//! These implement the collaborator traits without any network access and
//! are used by the test suite and by embedders that want to drive the
//! simulator locally. Each one can be switched unavailable to exercise the
//! startup connectivity checks.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use sensim_lib::backend::ControlQueue;
//! use sensim_lib::backend::memory::MemoryQueue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), sensim_lib::CollaboratorError> {
//! let queue = MemoryQueue::new();
//! queue.push("temperature", r#"{"deviceId":"13","state":1}"#);
//!
//! let msg = queue.blocking_pop("temperature", Duration::from_millis(10)).await?;
//! assert!(msg.is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{ControlQueue, DeviceCatalog, PublishCallback, ReadingPublisher, ReadingStore};
use crate::error::CollaboratorError;
use crate::model::{DeviceId, DeviceInfo};

/// Availability and closed flags shared by the memory collaborators.
#[derive(Debug)]
struct Switch {
    name: &'static str,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Switch {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), CollaboratorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CollaboratorError::Closed(self.name.to_string()));
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(CollaboratorError::ConnectionFailed(format!(
                "{} unavailable",
                self.name
            )));
        }
        Ok(())
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Decrements `counter` if positive and reports whether it did.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone)]
struct DeviceRow {
    name: String,
    type_name: String,
    active: bool,
}

/// In-memory device and template tables.
///
/// Devices reference their type by name. A device whose type has no
/// template row is still returned, with an empty type name and a null
/// template, matching a left join.
#[derive(Debug)]
pub struct MemoryCatalog {
    templates: Mutex<BTreeMap<String, Option<String>>>,
    devices: Mutex<BTreeMap<DeviceId, DeviceRow>>,
    switch: Switch,
    lookups: AtomicUsize,
}

impl MemoryCatalog {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            templates: Mutex::new(BTreeMap::new()),
            devices: Mutex::new(BTreeMap::new()),
            switch: Switch::new("catalog"),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Adds a template row.
    #[must_use]
    pub fn with_template(self, type_name: impl Into<String>, template: Option<&str>) -> Self {
        self.put_template(type_name, template);
        self
    }

    /// Adds a device row.
    #[must_use]
    pub fn with_device(
        self,
        device_id: impl Into<DeviceId>,
        device_name: impl Into<String>,
        type_name: impl Into<String>,
        active: bool,
    ) -> Self {
        self.put_device(device_id, device_name, type_name, active);
        self
    }

    /// Inserts or replaces a template row.
    pub fn put_template(&self, type_name: impl Into<String>, template: Option<&str>) {
        self.templates
            .lock()
            .insert(type_name.into(), template.map(str::to_string));
    }

    /// Removes a template row.
    pub fn remove_template(&self, type_name: &str) {
        self.templates.lock().remove(type_name);
    }

    /// Inserts or replaces a device row.
    pub fn put_device(
        &self,
        device_id: impl Into<DeviceId>,
        device_name: impl Into<String>,
        type_name: impl Into<String>,
        active: bool,
    ) {
        self.devices.lock().insert(
            device_id.into(),
            DeviceRow {
                name: device_name.into(),
                type_name: type_name.into(),
                active,
            },
        );
    }

    /// Sets a device's persisted state flag.
    pub fn set_device_active(&self, device_id: &DeviceId, active: bool) {
        if let Some(row) = self.devices.lock().get_mut(device_id) {
            row.active = active;
        }
    }

    /// Switches the catalog reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.switch.set_available(available);
    }

    /// Returns true once [`close`](DeviceCatalog::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.switch.is_closed()
    }

    /// Returns how many single-device lookups were served.
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Acquire)
    }

    fn join(&self, device_id: &DeviceId, row: &DeviceRow) -> DeviceInfo {
        let templates = self.templates.lock();
        match templates.get(&row.type_name) {
            Some(template) => DeviceInfo::new(device_id.clone(), &*row.name, &*row.type_name)
                .with_template_text(template.as_deref()),
            None => DeviceInfo::new(device_id.clone(), &*row.name, ""),
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceCatalog for MemoryCatalog {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.switch.check()
    }

    async fn device_types(&self) -> Result<Vec<String>, CollaboratorError> {
        self.switch.check()?;
        Ok(self
            .templates
            .lock()
            .keys()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect())
    }

    async fn device_info(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>, CollaboratorError> {
        self.switch.check()?;
        self.lookups.fetch_add(1, Ordering::AcqRel);
        let row = self.devices.lock().get(device_id).cloned();
        Ok(row.map(|row| self.join(device_id, &row)))
    }

    async fn active_devices(&self) -> Result<Vec<DeviceInfo>, CollaboratorError> {
        self.switch.check()?;
        let rows: Vec<(DeviceId, DeviceRow)> = self
            .devices
            .lock()
            .iter()
            .filter(|(_, row)| row.active)
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        Ok(rows.iter().map(|(id, row)| self.join(id, row)).collect())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.switch.close();
        Ok(())
    }
}

/// In-memory FIFO queue per topic with bounded blocking pops.
#[derive(Debug)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
    switch: Switch,
    failures: AtomicUsize,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            switch: Switch::new("queue"),
            failures: AtomicUsize::new(0),
        }
    }

    /// Appends a message to a topic and wakes waiting pops.
    pub fn push(&self, topic: &str, message: impl Into<String>) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(message.into());
        self.notify.notify_waiters();
    }

    /// Returns the number of messages waiting on a topic.
    #[must_use]
    pub fn pending(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// Makes the next `count` pops fail with a transient error.
    pub fn fail_next_pops(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    /// Switches the queue reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.switch.set_available(available);
    }

    /// Returns true once [`close`](ControlQueue::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.switch.is_closed()
    }

    fn try_pop(&self, topic: &str) -> Option<String> {
        self.topics.lock().get_mut(topic).and_then(VecDeque::pop_front)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlQueue for MemoryQueue {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.switch.check()
    }

    async fn blocking_pop(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CollaboratorError> {
        self.switch.check()?;
        if take_failure(&self.failures) {
            return Err(CollaboratorError::ConnectionFailed(
                "injected pop failure".to_string(),
            ));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop(topic) {
                return Ok(Some(message));
            }
            self.switch.check()?;

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.switch.close();
        self.notify.notify_waiters();
        Ok(())
    }
}

/// In-memory wide-column store.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, HashMap<String, String>>>,
    writes: AtomicUsize,
    switch: Switch,
    failures: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            switch: Switch::new("store"),
            failures: AtomicUsize::new(0),
        }
    }

    /// Returns a stored row.
    #[must_use]
    pub fn get_row(&self, row_key: &str) -> Option<HashMap<String, String>> {
        self.rows.lock().get(row_key).cloned()
    }

    /// Returns the row keys of one device, oldest first.
    #[must_use]
    pub fn rows_for_device(&self, device_id: &DeviceId) -> Vec<String> {
        let prefix = format!("{device_id}_");
        self.rows
            .lock()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Returns all stored rows.
    #[must_use]
    pub fn rows(&self) -> BTreeMap<String, HashMap<String, String>> {
        self.rows.lock().clone()
    }

    /// Returns how many writes succeeded, including overwrites.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next_puts(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    /// Switches the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.switch.set_available(available);
    }

    /// Returns true once [`close`](ReadingStore::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.switch.is_closed()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.switch.check()
    }

    async fn put(
        &self,
        row_key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CollaboratorError> {
        self.switch.check()?;
        if take_failure(&self.failures) {
            return Err(CollaboratorError::Rejected {
                status: 503,
                message: "injected put failure".to_string(),
            });
        }
        self.rows.lock().insert(row_key.to_string(), fields.clone());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.switch.close();
        Ok(())
    }
}

/// A message accepted by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Message key.
    pub key: String,
    /// Message payload.
    pub payload: String,
}

/// In-memory message stream.
#[derive(Debug)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    switch: Switch,
    failures: AtomicUsize,
}

impl MemoryPublisher {
    /// Creates an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            switch: Switch::new("publisher"),
            failures: AtomicUsize::new(0),
        }
    }

    /// Returns every accepted message in order.
    #[must_use]
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().clone()
    }

    /// Returns the accepted messages with the given key.
    #[must_use]
    pub fn messages_for(&self, key: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.key == key)
            .cloned()
            .collect()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    /// Switches the stream reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.switch.set_available(available);
    }

    /// Returns true once [`close`](ReadingPublisher::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.switch.is_closed()
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingPublisher for MemoryPublisher {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.switch.check()
    }

    async fn publish(
        &self,
        key: &str,
        payload: &str,
        on_complete: Option<PublishCallback>,
    ) -> Result<(), CollaboratorError> {
        self.switch.check()?;
        if take_failure(&self.failures) {
            return Err(CollaboratorError::ConnectionFailed(
                "injected publish failure".to_string(),
            ));
        }
        self.messages.lock().push(PublishedMessage {
            key: key.to_string(),
            payload: payload.to_string(),
        });
        if let Some(callback) = on_complete {
            callback(Ok(()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.switch.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_template("temperature", Some(r#"{"temperature":{"range":"-10~40"}}"#))
            .with_template("humidity", Some(r#"{"humidity":{"range":"20~90"}}"#))
            .with_template("", None)
            .with_device("13", "probe", "temperature", true)
            .with_device("14", "hygrometer", "humidity", false)
            .with_device("15", "orphan", "rainfall", true)
    }

    #[tokio::test]
    async fn device_types_are_distinct_and_non_empty() {
        let types = catalog().device_types().await.unwrap();
        assert_eq!(types, vec!["humidity".to_string(), "temperature".to_string()]);
    }

    #[tokio::test]
    async fn device_info_joins_template() {
        let info = catalog()
            .device_info(&DeviceId::from("13"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.type_name(), "temperature");
        assert_eq!(info.template(), &json!({"temperature": {"range": "-10~40"}}));
    }

    #[tokio::test]
    async fn device_without_template_has_empty_type() {
        let info = catalog()
            .device_info(&DeviceId::from("15"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.type_name(), "");
        assert!(info.template().is_null());
    }

    #[tokio::test]
    async fn unknown_device_is_none() {
        let catalog = catalog();
        assert!(catalog.device_info(&DeviceId::from("7")).await.unwrap().is_none());
        assert_eq!(catalog.lookup_count(), 1);
    }

    #[tokio::test]
    async fn active_devices_filters_on_state() {
        let active = catalog().active_devices().await.unwrap();
        let ids: Vec<&str> = active.iter().map(|d| d.device_id().as_str()).collect();
        assert_eq!(ids, vec!["13", "15"]);
    }

    #[tokio::test]
    async fn unavailable_catalog_fails_ping() {
        let catalog = catalog();
        catalog.set_available(false);
        assert!(matches!(
            catalog.ping().await,
            Err(CollaboratorError::ConnectionFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_topic() {
        let queue = MemoryQueue::new();
        let popped = queue
            .blocking_pop("humidity", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .blocking_pop("humidity", Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.push("humidity", "hello");

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn pops_are_fifo_per_topic() {
        let queue = MemoryQueue::new();
        queue.push("a", "1");
        queue.push("b", "x");
        queue.push("a", "2");

        let timeout = Duration::from_millis(1);
        assert_eq!(queue.blocking_pop("a", timeout).await.unwrap().as_deref(), Some("1"));
        assert_eq!(queue.blocking_pop("a", timeout).await.unwrap().as_deref(), Some("2"));
        assert_eq!(queue.pending("b"), 1);
    }

    #[tokio::test]
    async fn injected_pop_failures_are_transient() {
        let queue = MemoryQueue::new();
        queue.push("a", "1");
        queue.fail_next_pops(1);

        let timeout = Duration::from_millis(1);
        assert!(queue.blocking_pop("a", timeout).await.is_err());
        assert_eq!(queue.blocking_pop("a", timeout).await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn store_reads_back_by_device() {
        let store = MemoryStore::new();
        let fields = HashMap::from([("temperature".to_string(), "{}".to_string())]);
        store.put("13_1", &fields).await.unwrap();
        store.put("13_2", &fields).await.unwrap();
        store.put("130_1", &fields).await.unwrap();

        assert_eq!(
            store.rows_for_device(&DeviceId::from("13")),
            vec!["13_1".to_string(), "13_2".to_string()]
        );
        assert_eq!(store.get_row("13_2"), Some(fields));
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn closed_store_rejects_writes() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.put("k", &HashMap::new()).await,
            Err(CollaboratorError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn publisher_invokes_callback() {
        let publisher = MemoryPublisher::new();
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);

        publisher
            .publish(
                "device_13",
                "{}",
                Some(Box::new(move |result| {
                    flag.store(result.is_ok(), Ordering::Release);
                })),
            )
            .await
            .unwrap();

        assert!(delivered.load(Ordering::Acquire));
        assert_eq!(publisher.messages_for("device_13").len(), 1);
    }
}
