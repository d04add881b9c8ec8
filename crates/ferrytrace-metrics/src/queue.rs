//! In-memory event queue
//!
//! [`EventQueue`] holds the pending events of one kind and is the
//! [`BatchSource`] its stream's scheduler drains. A flush takes every queued
//! event as one batch. Events of an abandoned batch are dropped or put back
//! at the front of the queue, depending on the kind's [`RequeuePolicy`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ferrytrace_core::config::MetricsConfig;
use ferrytrace_core::domain::{
    is_empty_value, Attributes, RequeuePolicy, SummedEvent, UniqueEvent,
};
use ferrytrace_core::ports::{IClock, IPayloadSerializer, JsonSerializer, StreamKind};
use ferrytrace_submit::{BatchSource, EncodedBatch};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EventError, Result};
use crate::payload::{EventsMetadata, EventsPayload};

// ============================================================================
// EventKind
// ============================================================================

/// Behavior that differs between unique and summed events
pub trait EventKind: Clone + Serialize + Send + Sync + 'static {
    const STREAM: StreamKind;
    /// Payload key holding the event list
    const PAYLOAD_KEY: &'static str;

    /// Deduplication key; `None` keeps every occurrence.
    fn dedup_key(&self) -> Option<&str>;

    /// Applies a re-added copy of this event.
    fn update_from(&mut self, newer: Self);

    /// Folds an older copy back in without overwriting newer values.
    fn absorb(&mut self, older: Self);

    fn attributes_mut(&mut self) -> &mut Attributes;
}

impl EventKind for UniqueEvent {
    const STREAM: StreamKind = StreamKind::UniqueEvents;
    const PAYLOAD_KEY: &'static str = "unique_events";

    fn dedup_key(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn update_from(&mut self, newer: Self) {
        self.refresh(newer.timestamp, newer.attributes);
    }

    fn absorb(&mut self, older: Self) {
        for (key, value) in older.attributes {
            if is_empty_value(&value) {
                continue;
            }
            self.attributes.entry(key).or_insert(value);
        }
    }

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}

impl EventKind for SummedEvent {
    const STREAM: StreamKind = StreamKind::SummedEvents;
    const PAYLOAD_KEY: &'static str = "summed_events";

    fn dedup_key(&self) -> Option<&str> {
        None
    }

    fn update_from(&mut self, newer: Self) {
        *self = newer;
    }

    fn absorb(&mut self, _older: Self) {}

    fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }
}

// ============================================================================
// BatcherSettings
// ============================================================================

/// Settings of one event batcher
#[derive(Debug, Clone, PartialEq)]
pub struct BatcherSettings {
    /// Maximum queued events (0 = unlimited); reaching it triggers a flush
    pub max_events: u32,
    pub requeue: RequeuePolicy,
    pub flush_interval: Option<Duration>,
    pub application: String,
    pub application_version: String,
    /// Attributes added to every event that does not set them itself
    pub attributes: Attributes,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            max_events: 350,
            requeue: RequeuePolicy::Drop,
            flush_interval: Some(Duration::from_secs(30 * 60)),
            application: String::new(),
            application_version: String::new(),
            attributes: Attributes::new(),
        }
    }
}

impl BatcherSettings {
    fn from_config(config: &MetricsConfig, requeue: RequeuePolicy) -> Self {
        Self {
            max_events: config.max_events,
            requeue,
            flush_interval: (config.flush_interval_secs > 0)
                .then(|| Duration::from_secs(config.flush_interval_secs)),
            application: config.application.clone(),
            application_version: config.application_version.clone(),
            attributes: Attributes::new(),
        }
    }

    pub fn unique(config: &MetricsConfig) -> Self {
        Self::from_config(config, config.unique_requeue)
    }

    pub fn summed(config: &MetricsConfig) -> Self {
        Self::from_config(config, config.summed_requeue)
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Whether `len` queued events leave no room for another one.
    pub fn is_full(&self, len: usize) -> bool {
        self.max_events != 0 && len >= self.max_events as usize
    }
}

// ============================================================================
// EventQueue
// ============================================================================

/// Pending events of one kind
pub struct EventQueue<E: EventKind> {
    events: Mutex<VecDeque<E>>,
    settings: BatcherSettings,
    clock: Arc<dyn IClock>,
    serializer: Arc<dyn IPayloadSerializer<EventsPayload<E>>>,
}

impl<E: EventKind> EventQueue<E> {
    pub fn new(settings: BatcherSettings, clock: Arc<dyn IClock>) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            settings,
            clock,
            serializer: Arc::new(JsonSerializer),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn IPayloadSerializer<EventsPayload<E>>>) -> Self {
        self.serializer = serializer;
        self
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<E>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &BatcherSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the queued events, front first.
    pub fn snapshot(&self) -> Vec<E> {
        self.lock().iter().cloned().collect()
    }

    /// Updates the queued event with the same key or appends a new one.
    ///
    /// Returns the queue length afterwards. Only an insertion can fail with
    /// `CapacityReached`.
    pub fn upsert(&self, event: E) -> Result<usize> {
        let mut events = self.lock();
        if let Some(key) = event.dedup_key() {
            if let Some(existing) = events.iter_mut().find(|e| e.dedup_key() == Some(key)) {
                existing.update_from(event);
                return Ok(events.len());
            }
        }
        if self.settings.is_full(events.len()) {
            return Err(EventError::CapacityReached {
                max: self.settings.max_events,
            });
        }
        events.push_back(event);
        Ok(events.len())
    }

    /// Puts abandoned events back at the front if they all fit.
    ///
    /// Events whose key was re-added meanwhile are merged into the queued
    /// copy. Returns the number of events put back.
    fn requeue_front(&self, items: Vec<E>) -> usize {
        let mut events = self.lock();
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            let queued = item
                .dedup_key()
                .and_then(|key| events.iter().position(|e| e.dedup_key() == Some(key)));
            match queued {
                Some(i) => events[i].absorb(item),
                None => fresh.push(item),
            }
        }

        let max = self.settings.max_events as usize;
        if max != 0 && events.len() + fresh.len() > max {
            warn!(
                stream = %E::STREAM,
                dropped = fresh.len(),
                queued = events.len(),
                "No room to requeue abandoned events"
            );
            return 0;
        }
        let restored = fresh.len();
        for item in fresh.into_iter().rev() {
            events.push_front(item);
        }
        restored
    }

    fn with_defaults(&self, event: &E) -> E {
        let mut event = event.clone();
        let attributes = event.attributes_mut();
        for (key, value) in &self.settings.attributes {
            if is_empty_value(value) {
                continue;
            }
            attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        event
    }
}

impl<E: EventKind> BatchSource for EventQueue<E> {
    type Item = E;

    fn stream(&self) -> StreamKind {
        E::STREAM
    }

    fn next_batch(&self) -> Option<Vec<E>> {
        let mut events = self.lock();
        if events.is_empty() {
            return None;
        }
        Some(events.drain(..).collect())
    }

    fn encode(&self, items: &[E], dropped_events: u32) -> anyhow::Result<EncodedBatch> {
        let payload = EventsPayload {
            application: self.settings.application.clone(),
            application_version: self.settings.application_version.clone(),
            metadata: EventsMetadata { dropped_events },
            events: items.iter().map(|e| self.with_defaults(e)).collect(),
        };
        Ok(EncodedBatch::new(self.serializer.serialize(&payload)?))
    }

    fn on_delivered(&self, items: Vec<E>) {
        debug!(stream = %E::STREAM, events = items.len(), "Events delivered");
    }

    fn on_abandoned(&self, items: Vec<E>) {
        let total = items.len();
        match self.settings.requeue {
            RequeuePolicy::Drop => {
                info!(stream = %E::STREAM, dropped = total, "Dropping abandoned events");
            }
            RequeuePolicy::RequeueFront => {
                let restored = self.requeue_front(items);
                info!(stream = %E::STREAM, total, restored, "Requeued abandoned events");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ferrytrace_core::ports::ManualClock;
    use serde_json::json;

    use super::*;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn unique_queue(max_events: u32, requeue: RequeuePolicy) -> EventQueue<UniqueEvent> {
        let settings = BatcherSettings {
            max_events,
            requeue,
            ..BatcherSettings::default()
        };
        EventQueue::new(settings, clock())
    }

    fn unique(name: &str, attributes: Attributes) -> UniqueEvent {
        UniqueEvent::new(name, Utc::now(), attributes).unwrap()
    }

    #[test]
    fn test_settings_from_config() {
        let config = MetricsConfig {
            max_events: 10,
            flush_interval_secs: 0,
            unique_requeue: RequeuePolicy::RequeueFront,
            ..MetricsConfig::default()
        };
        let unique = BatcherSettings::unique(&config);
        let summed = BatcherSettings::summed(&config);
        assert_eq!(unique.max_events, 10);
        assert_eq!(unique.requeue, RequeuePolicy::RequeueFront);
        assert_eq!(summed.requeue, RequeuePolicy::Drop);
        assert_eq!(unique.flush_interval, None);
    }

    #[test]
    fn test_upsert_refreshes_existing_unique_event() {
        let queue = unique_queue(0, RequeuePolicy::Drop);
        queue.upsert(unique("device.sdk", attrs(&[("a", json!(1))]))).unwrap();
        queue.upsert(unique("device.sdk", attrs(&[("a", json!(2))]))).unwrap();

        let events = queue.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attributes["a"], json!(2));
    }

    #[test]
    fn test_upsert_never_blanks_an_attribute() {
        let queue = unique_queue(0, RequeuePolicy::Drop);
        queue
            .upsert(unique("session", attrs(&[("user", json!("ana"))])))
            .unwrap();
        queue
            .upsert(unique("session", attrs(&[("user", json!("")), ("tier", json!(null))])))
            .unwrap();

        let events = queue.snapshot();
        assert_eq!(events[0].attributes["user"], json!("ana"));
        assert!(!events[0].attributes.contains_key("tier"));
    }

    #[test]
    fn test_capacity_only_blocks_insertions() {
        let queue = unique_queue(2, RequeuePolicy::Drop);
        assert_eq!(queue.upsert(unique("a", Attributes::new())).unwrap(), 1);
        assert_eq!(queue.upsert(unique("b", Attributes::new())).unwrap(), 2);
        assert_eq!(
            queue.upsert(unique("c", Attributes::new())),
            Err(EventError::CapacityReached { max: 2 })
        );
        // updating an existing name still works when full
        assert_eq!(queue.upsert(unique("a", attrs(&[("x", json!(1))]))).unwrap(), 2);
    }

    #[test]
    fn test_next_batch_takes_everything() {
        let queue = unique_queue(0, RequeuePolicy::Drop);
        assert!(queue.next_batch().is_none());
        queue.upsert(unique("a", Attributes::new())).unwrap();
        queue.upsert(unique("b", Attributes::new())).unwrap();

        let batch = queue.next_batch().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_encode_merges_default_attributes() {
        let settings = BatcherSettings {
            application: "demo".to_string(),
            application_version: "2.0".to_string(),
            ..BatcherSettings::default()
        }
        .with_attributes(attrs(&[("os", json!("linux")), ("user", json!("default"))]));
        let queue: EventQueue<UniqueEvent> = EventQueue::new(settings, clock());
        let event = unique("guid", attrs(&[("user", json!("ana"))]));

        let encoded = queue.encode(&[event], 1).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded.payload).unwrap();
        assert_eq!(json["application"], "demo");
        assert_eq!(json["metadata"]["dropped_events"], 1);
        assert_eq!(json["unique_events"][0]["attributes"]["os"], "linux");
        assert_eq!(json["unique_events"][0]["attributes"]["user"], "ana");
    }

    #[test]
    fn test_abandoned_events_dropped_by_default() {
        let queue = unique_queue(0, RequeuePolicy::Drop);
        queue.on_abandoned(vec![unique("a", Attributes::new())]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_front_merges_re_added_names() {
        let queue = unique_queue(0, RequeuePolicy::RequeueFront);
        queue
            .upsert(unique("b", attrs(&[("fresh", json!(true))])))
            .unwrap();

        queue.on_abandoned(vec![
            unique("a", Attributes::new()),
            unique("b", attrs(&[("fresh", json!(false)), ("old", json!(1))])),
        ]);

        let events = queue.snapshot();
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(events[1].attributes["fresh"], json!(true));
        assert_eq!(events[1].attributes["old"], json!(1));
    }

    #[test]
    fn test_requeue_front_respects_capacity() {
        let queue = unique_queue(2, RequeuePolicy::RequeueFront);
        queue.upsert(unique("x", Attributes::new())).unwrap();

        queue.on_abandoned(vec![
            unique("a", Attributes::new()),
            unique("b", Attributes::new()),
        ]);

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_summed_events_never_deduplicate() {
        let settings = BatcherSettings {
            requeue: RequeuePolicy::RequeueFront,
            ..BatcherSettings::default()
        };
        let queue: EventQueue<SummedEvent> = EventQueue::new(settings, clock());
        let launch = SummedEvent::new("launch", Utc::now(), Attributes::new()).unwrap();
        queue.upsert(launch.clone()).unwrap();
        queue.upsert(launch.clone()).unwrap();
        assert_eq!(queue.len(), 2);

        queue.on_abandoned(vec![launch]);
        assert_eq!(queue.len(), 3);
    }
}
