//! Fan-out of newly appended samples to registered subscribers.
//!
//! Delivery happens on a dedicated notifier thread fed by a channel whose
//! send sits inside the WAL commit section, so subscribers observe
//! commit order per segment. Slow subscriber callbacks therefore never
//! stall appends, only the notifier.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::reader::ReaderCallback;
use crate::types::{Flag, Id, Sample};

struct SubscribeInfo {
    ids: Vec<Id>,
    flag: Flag,
    clb: Arc<dyn ReaderCallback>,
}

impl SubscribeInfo {
    fn wants(&self, s: &Sample) -> bool {
        (self.ids.is_empty() || self.ids.contains(&s.id)) && s.matches_flag(self.flag)
    }
}

pub struct SubscribeBus {
    subscribers: Arc<RwLock<Vec<SubscribeInfo>>>,
    tx: Mutex<Option<Sender<Sample>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SubscribeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscribeBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let (tx, rx): (Sender<Sample>, Receiver<Sample>) = channel();
        let subscribers = Arc::clone(&self.subscribers);
        let handle = std::thread::Builder::new()
            .name("chronolite-subscribe".into())
            .spawn(move || {
                while let Ok(s) = rx.recv() {
                    for sub in subscribers.read().iter() {
                        if sub.wants(&s) {
                            sub.clb.call(&s);
                        }
                    }
                }
            })
            .expect("spawn subscribe notifier");
        *self.tx.lock() = Some(tx);
        *self.worker.lock() = Some(handle);
    }

    /// Register a subscriber. An empty id set matches every series.
    pub fn add(&self, ids: Vec<Id>, flag: Flag, clb: Arc<dyn ReaderCallback>) {
        self.subscribers.write().push(SubscribeInfo { ids, flag, clb });
    }

    /// Called inside the WAL commit section for every durable append.
    pub fn on_append(&self, s: &Sample) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(*s);
        }
    }

    /// Drop the channel and join the notifier; pending samples are
    /// delivered first.
    pub fn stop(&self) {
        *self.tx.lock() = None;
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::FnCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn matching_samples_are_delivered_in_order() {
        let bus = SubscribeBus::new();
        bus.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add(vec![1], 0, Arc::new(FnCallback::new(move |s: &Sample| sink.lock().push(s.time))));
        bus.on_append(&Sample::new(1, 10, 0.0, 0));
        bus.on_append(&Sample::new(2, 11, 0.0, 0)); // different id, filtered
        bus.on_append(&Sample::new(1, 12, 0.0, 0));
        bus.stop();
        assert_eq!(*seen.lock(), vec![10, 12]);
    }

    #[test]
    fn flag_mask_filters() {
        let bus = SubscribeBus::new();
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.add(
            Vec::new(),
            0b10,
            Arc::new(FnCallback::new(move |_s: &Sample| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        bus.on_append(&Sample::new(5, 1, 0.0, 0b10));
        bus.on_append(&Sample::new(5, 2, 0.0, 0b01));
        bus.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
