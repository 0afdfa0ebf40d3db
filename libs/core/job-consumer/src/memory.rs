//! In-process broker and store
//!
//! Used by the test suites and for running a worker without infrastructure.
//! [`MemoryBroker`] keeps named queues; publishing through the default
//! exchange enqueues onto the queue named by the routing key, and every
//! publish is recorded for inspection. [`MemoryStore`] honours expiry.

use crate::broker::{Broker, Destination};
use crate::envelope::{Delivery, DeliveryHandle, OutgoingMessage};
use crate::error::{BrokerError, StoreError};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A settlement the broker received for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(DeliveryHandle),
    Reject {
        handle: DeliveryHandle,
        requeue: bool,
    },
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    unsettled: HashMap<DeliveryHandle, (String, Delivery)>,
    consuming: Option<(String, bool)>,
    prefetch: Option<u16>,
    settlements: Vec<Settlement>,
    published: Vec<(Destination, OutgoingMessage)>,
    closed: bool,
}

/// In-memory [`Broker`].
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body onto `queue` as a fresh delivery
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) -> DeliveryHandle {
        let delivery = Delivery::new(self.next_handle(), body);
        let handle = delivery.handle;
        self.enqueue(queue, delivery);
        handle
    }

    /// Enqueue an encoded message onto `queue`
    pub fn push_message(&self, queue: &str, message: &OutgoingMessage) -> DeliveryHandle {
        let delivery = Delivery::new(self.next_handle(), message.body.clone())
            .with_properties(message.properties.clone());
        let handle = delivery.handle;
        self.enqueue(queue, delivery);
        handle
    }

    /// Enqueue a delivery already flagged as redelivered
    pub fn push_redelivered(&self, queue: &str, body: impl Into<Vec<u8>>) -> DeliveryHandle {
        let delivery = Delivery::new(self.next_handle(), body).redelivered(true);
        let handle = delivery.handle;
        self.enqueue(queue, delivery);
        handle
    }

    /// Stop consuming; `is_consuming` reports `false` afterwards
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.arrivals.notify_waiters();
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock_state().settlements.clone()
    }

    pub fn published(&self) -> Vec<(Destination, OutgoingMessage)> {
        self.lock_state().published.clone()
    }

    /// Messages published to one destination
    pub fn published_to(&self, destination: &Destination) -> Vec<OutgoingMessage> {
        self.lock_state()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock_state().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock_state().prefetch
    }

    fn next_handle(&self) -> DeliveryHandle {
        DeliveryHandle::new(self.next_tag.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn enqueue(&self, queue: &str, delivery: Delivery) {
        self.lock_state()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
        self.arrivals.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.lock_state();
        let Some((queue, no_ack)) = state.consuming.clone() else {
            return Err(BrokerError::Consume("no consumer registered".to_string()));
        };

        let Some(delivery) = state.queues.get_mut(&queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        if !no_ack {
            state
                .unsettled
                .insert(delivery.handle, (queue, delivery.clone()));
        }
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<(), BrokerError> {
        let mut state = self.lock_state();
        state.consuming = Some((queue.to_string(), no_ack));
        state.closed = false;
        Ok(())
    }

    async fn next_delivery(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            if self.lock_state().closed {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<(), BrokerError> {
        let mut state = self.lock_state();
        if state.unsettled.remove(&handle).is_none() {
            return Err(BrokerError::Ack(format!("unknown delivery tag {}", handle.tag())));
        }
        state.settlements.push(Settlement::Ack(handle));
        Ok(())
    }

    async fn reject(&self, handle: DeliveryHandle, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock_state();
        let Some((queue, delivery)) = state.unsettled.remove(&handle) else {
            return Err(BrokerError::Ack(format!("unknown delivery tag {}", handle.tag())));
        };
        state.settlements.push(Settlement::Reject { handle, requeue });

        if requeue {
            let redelivery = Delivery {
                handle: DeliveryHandle::new(self.next_tag.fetch_add(1, Ordering::Relaxed) + 1),
                ..delivery.redelivered(true)
            };
            state.queues.entry(queue).or_default().push_front(redelivery);
            drop(state);
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn publish(
        &self,
        message: &OutgoingMessage,
        destination: &Destination,
    ) -> Result<(), BrokerError> {
        self.lock_state()
            .published
            .push((destination.clone(), message.clone()));

        if destination.is_default_exchange() {
            self.push_message(destination.routing_key(), message);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.lock_state().prefetch = Some(count);
        Ok(())
    }

    fn is_consuming(&self) -> bool {
        let state = self.lock_state();
        state.consuming.is_some() && !state.closed
    }
}

/// In-memory [`KeyValueStore`] with per-key expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of a live key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.lock_entries();
        Self::live(&mut entries, key)
            .and_then(|(_, expires)| expires.map(|at| at.saturating_duration_since(Instant::now())))
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Option<Instant>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Entry under `key`, evicting it first when expired
    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Option<Instant>)>,
        key: &str,
    ) -> Option<&'a (String, Option<Instant>)> {
        let expired = entries
            .get(key)
            .is_some_and(|(_, expires)| expires.is_some_and(|at| at <= Instant::now()));
        if expired {
            entries.remove(key);
        }
        entries.get(key)
    }

    fn expiry(ttl: Duration) -> Option<Instant> {
        Instant::now().checked_add(ttl)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock_entries();
        Ok(Self::live(&mut entries, key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock_entries()
            .insert(key.to_string(), (value.to_string(), Self::expiry(ttl)));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock_entries();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(ttl)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock_entries().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.lock_entries();
        let (current, expires) = match Self::live(&mut entries, key) {
            Some((value, expires)) => {
                let current = value.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                    value: value.clone(),
                })?;
                (current, *expires)
            }
            None => (0, None),
        };

        let next = current + 1;
        entries.insert(key.to_string(), (next.to_string(), expires));
        Ok(next)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock_entries();
        match Self::live(&mut entries, key) {
            Some((value, _)) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_expiry() {
        let store = MemoryStore::new();
        store
            .set("status:w:1", "WAIT", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("status:w:1").await.unwrap().as_deref(), Some("WAIT"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("status:w:1").await.unwrap(), None);
        assert!(
            store
                .set_if_absent("status:w:1", "WAIT", Duration::from_secs(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_store_incr_keeps_ttl() {
        let store = MemoryStore::new();
        store
            .set_if_absent("retry:w:1", "0", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.incr("retry:w:1").await.unwrap(), 1);
        assert_eq!(store.incr("retry:w:1").await.unwrap(), 2);
        assert!(store.ttl("retry:w:1").is_some());

        store
            .set("status:w:1", "OK", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            store.incr("status:w:1").await,
            Err(StoreError::NotAnInteger { .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_wait_times_out() {
        let broker = MemoryBroker::new();
        broker.consume("jobs", false).await.unwrap();

        let delivery = broker.next_delivery(Duration::from_millis(10)).await.unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn test_broker_wakes_on_publish() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        broker.consume("jobs", false).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.push("jobs", b"late".to_vec());
        });

        let delivery = broker
            .next_delivery(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("delivery arrives before the timeout");
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test]
    async fn test_broker_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        broker.consume("jobs", false).await.unwrap();
        let handle = broker.push("jobs", b"body".to_vec());

        let first = broker.next_delivery(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(!first.redelivered);
        broker.reject(handle, true).await.unwrap();

        let second = broker.next_delivery(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(second.handle, handle);
        assert_eq!(
            broker.settlements(),
            vec![Settlement::Reject {
                handle,
                requeue: true
            }]
        );
    }

    #[tokio::test]
    async fn test_broker_default_exchange_routes_to_queue() {
        let broker = MemoryBroker::new();
        let message = OutgoingMessage::new(b"x".to_vec(), Default::default());

        broker
            .publish(&message, &Destination::queue("other"))
            .await
            .unwrap();
        broker
            .publish(&message, &Destination::new("dlx", "other"))
            .await
            .unwrap();

        assert_eq!(broker.queue_len("other"), 1);
        assert_eq!(broker.published().len(), 2);
    }
}
