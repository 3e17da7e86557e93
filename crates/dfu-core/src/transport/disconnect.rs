//! Disconnect notification hub.
//!
//! Backends publish device removals here; the DFU device and the flash
//! session subscribe. A subscription is a channel receiver that is
//! unregistered when dropped, so a timed-out wait leaves nothing behind.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

/// Removals remembered for late subscribers; the oldest is forgotten first.
const REMEMBERED_REMOVALS: usize = 64;

struct Subscriber<K> {
    key: Option<K>,
    tx: Sender<K>,
}

struct HubInner<K> {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber<K>>,
    gone: VecDeque<K>,
}

pub struct DisconnectHub<K> {
    inner: Mutex<HubInner<K>>,
}

impl<K> DisconnectHub<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                next_id: 0,
                subscribers: HashMap::new(),
                gone: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the removal of `key`.
    pub fn notify(&self, key: &K) {
        let mut inner = self.lock();
        if inner.gone.contains(key) {
            return;
        }
        if inner.gone.len() == REMEMBERED_REMOVALS {
            inner.gone.pop_front();
        }
        inner.gone.push_back(key.clone());
        debug!(?key, subscribers = inner.subscribers.len(), "Device disconnected");
        for sub in inner.subscribers.values() {
            if sub.key.as_ref().is_none_or(|k| k == key) {
                let _ = sub.tx.send(key.clone());
            }
        }
    }

    /// Forget a previous removal (the same identity enumerated again).
    pub fn reconnected(&self, key: &K) {
        self.lock().gone.retain(|k| k != key);
    }

    pub fn is_disconnected(&self, key: &K) -> bool {
        self.lock().gone.contains(key)
    }

    fn register(self: &Arc<Self>, key: Option<K>) -> Subscription<K> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        if let Some(k) = key.as_ref().filter(|k| inner.gone.contains(*k)) {
            let _ = tx.send(k.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Subscriber { key, tx });
        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// One-device subscription. Fires immediately if the device is already gone.
    pub fn subscribe(self: &Arc<Self>, key: K) -> Subscription<K> {
        self.register(Some(key))
    }

    /// Subscription to every removal published after this call.
    pub fn subscribe_all(self: &Arc<Self>) -> Subscription<K> {
        self.register(None)
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl<K> Default for DisconnectHub<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    id: u64,
    hub: Arc<DisconnectHub<K>>,
    rx: Receiver<K>,
}

impl<K> Subscription<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    /// Block for the next removal; `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<K> {
        match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(key) => Some(key),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => self.rx.recv().ok(),
        }
    }

    /// Next pending removal without blocking.
    pub fn try_next(&self) -> Option<K> {
        self.rx.try_recv().ok()
    }
}

impl<K> Drop for Subscription<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_keyed_subscription() {
        let hub = Arc::new(DisconnectHub::<u32>::new());
        let sub = hub.subscribe(7);
        hub.notify(&3);
        assert_eq!(sub.try_next(), None);
        hub.notify(&7);
        assert_eq!(sub.wait(Some(Duration::from_millis(10))), Some(7));
    }

    #[test]
    fn test_already_gone_fires_immediately() {
        let hub = Arc::new(DisconnectHub::<u32>::new());
        hub.notify(&1);
        let sub = hub.subscribe(1);
        assert_eq!(sub.try_next(), Some(1));

        hub.reconnected(&1);
        let sub = hub.subscribe(1);
        assert_eq!(sub.try_next(), None);
    }

    #[test]
    fn test_removal_memory_is_bounded() {
        let hub = Arc::new(DisconnectHub::<u32>::new());
        let count = REMEMBERED_REMOVALS as u32 + 36;
        for key in 0..count {
            hub.notify(&key);
        }
        assert_eq!(hub.lock().gone.len(), REMEMBERED_REMOVALS);
        assert!(!hub.is_disconnected(&0));
        assert!(hub.is_disconnected(&(count - 1)));

        let sub = hub.subscribe(count - 1);
        assert_eq!(sub.try_next(), Some(count - 1));
        let sub = hub.subscribe(0);
        assert_eq!(sub.try_next(), None);
    }

    #[test]
    fn test_timeout_and_drop_unregisters() {
        let hub = Arc::new(DisconnectHub::<u32>::new());
        {
            let sub = hub.subscribe(5);
            assert_eq!(hub.subscriber_count(), 1);
            assert_eq!(sub.wait(Some(Duration::from_millis(5))), None);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_cross_thread_notify() {
        let hub = Arc::new(DisconnectHub::<u32>::new());
        let all = hub.subscribe_all();
        let publisher = Arc::clone(&hub);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.notify(&9);
        });
        assert_eq!(all.wait(Some(Duration::from_secs(2))), Some(9));
        handle.join().unwrap();
    }
}
