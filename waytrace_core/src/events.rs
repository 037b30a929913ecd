//! The timeline event stream: a typed multi-producer channel fanned out to
//! observer callbacks on a dedicated notification worker, never on the
//! processing queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::item::TimelineItem;

/// Everything subscribers can learn about the timeline.
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    /// A new item entered the timeline.
    NewItem(Arc<TimelineItem>),
    /// An item's samples, links or aggregates changed.
    UpdatedItem(Arc<TimelineItem>),
    /// The item has settled and will no longer be mutated.
    FinalisedItem(Arc<TimelineItem>),
    /// A merge consumed `killed` into `kept`.
    MergedItems {
        kept: Arc<TimelineItem>,
        killed: Vec<Arc<TimelineItem>>,
        description: String,
    },
}

type Observer = Box<dyn Fn(&TimelineEvent) + Send + 'static>;

enum Envelope {
    Event(TimelineEvent),
    Flush(Sender<()>),
}

/// Fan-out hub. Events are delivered in publish order by a single worker
/// thread, so observers see an item's mutations in commit order.
///
/// Observers must not subscribe or unsubscribe from inside a callback.
pub struct EventHub {
    tx: Mutex<Option<Sender<Envelope>>>,
    observers: Arc<Mutex<HashMap<u64, Observer>>>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, rx) = channel::unbounded::<Envelope>();
        let observers: Arc<Mutex<HashMap<u64, Observer>>> = Arc::new(Mutex::new(HashMap::new()));

        let worker_observers = observers.clone();
        let worker = std::thread::Builder::new()
            .name("waytrace-events".into())
            .spawn(move || {
                while let Ok(envelope) = rx.recv() {
                    match envelope {
                        Envelope::Event(event) => {
                            let observers = worker_observers.lock();
                            for observer in observers.values() {
                                observer(&event);
                            }
                        }
                        Envelope::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn event worker");

        Self {
            tx: Mutex::new(Some(tx)),
            observers,
            next_id: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Registers an observer. Dropping the returned subscription
    /// unregisters it.
    pub fn subscribe(&self, observer: impl Fn(&TimelineEvent) + Send + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(id, Box::new(observer));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub(crate) fn publish(&self, event: TimelineEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Envelope::Event(event));
        }
    }

    /// Blocks until every event published before this call has been
    /// delivered.
    pub fn flush(&self) {
        let ack = {
            let tx = self.tx.lock();
            let Some(tx) = tx.as_ref() else { return };
            let (ack_tx, ack_rx) = channel::bounded(1);
            if tx.send(Envelope::Flush(ack_tx)).is_err() {
                return;
            }
            ack_rx
        };
        let _ = ack.recv();
    }

    /// Stops the worker after draining pending events.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps an observer registered while alive.
pub struct Subscription {
    id: u64,
    observers: Weak<Mutex<HashMap<u64, Observer>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_events_delivered_in_order() {
        let hub = EventHub::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _subscription = hub.subscribe(move |event| {
            let label = match event {
                TimelineEvent::NewItem(item) => format!("new:{}", item.id),
                TimelineEvent::UpdatedItem(item) => format!("updated:{}", item.id),
                _ => "other".into(),
            };
            sink.lock().push(label);
        });

        let item = TimelineItem::new(ItemKind::Visit);
        hub.publish(TimelineEvent::NewItem(item.clone()));
        hub.publish(TimelineEvent::UpdatedItem(item.clone()));
        hub.flush();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], format!("new:{}", item.id));
        assert_eq!(seen[1], format!("updated:{}", item.id));
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let subscription = hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let item = TimelineItem::new(ItemKind::Path);
        hub.publish(TimelineEvent::NewItem(item.clone()));
        hub.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(subscription);
        hub.publish(TimelineEvent::NewItem(item));
        hub.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
