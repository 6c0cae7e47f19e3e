//! Reader callback contract shared by queries and subscriptions.
//!
//! A callback receives samples via `call`, learns that the stream is over
//! via `end`, can block a consumer thread in `wait`, and can `cancel` a
//! running query. Producers check `is_canceled` at chunk boundaries and
//! stop within a bounded number of samples.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::types::Sample;

pub trait ReaderCallback: Send + Sync {
    fn call(&self, s: &Sample);
    fn end(&self);
    fn wait(&self);
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
}

/// The condvar-and-flags plumbing every callback needs; implementors embed
/// one and delegate the trait's lifecycle methods to it.
#[derive(Debug, Default)]
pub struct CallbackState {
    ended: Mutex<bool>,
    cond: Condvar,
    canceled: AtomicBool,
}

impl CallbackState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end(&self) {
        let mut ended = self.ended.lock();
        *ended = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut ended = self.ended.lock();
        if !*ended {
            self.cond.wait_while(&mut ended, |done| !*done);
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Accumulates every delivered sample; the workhorse for tests and for
/// materializing per-tier partials inside the engine.
#[derive(Debug, Default)]
pub struct CollectCallback {
    state: CallbackState,
    out: Mutex<Vec<Sample>>,
}

impl CollectCallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut self.out.lock())
    }
}

impl ReaderCallback for CollectCallback {
    fn call(&self, s: &Sample) {
        self.out.lock().push(*s);
    }

    fn end(&self) {
        self.state.end();
    }

    fn wait(&self) {
        self.state.wait();
    }

    fn cancel(&self) {
        self.state.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }
}

/// Adapts a closure to the callback contract, for subscriptions and
/// ad-hoc consumers.
pub struct FnCallback<F: Fn(&Sample) + Send + Sync> {
    state: CallbackState,
    f: F,
}

impl<F: Fn(&Sample) + Send + Sync> FnCallback<F> {
    pub fn new(f: F) -> Self {
        Self { state: CallbackState::new(), f }
    }
}

impl<F: Fn(&Sample) + Send + Sync> ReaderCallback for FnCallback<F> {
    fn call(&self, s: &Sample) {
        (self.f)(s);
    }

    fn end(&self) {
        self.state.end();
    }

    fn wait(&self) {
        self.state.wait();
    }

    fn cancel(&self) {
        self.state.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_unblocks_on_end() {
        let clb = Arc::new(CollectCallback::new());
        let waiter = Arc::clone(&clb);
        let handle = std::thread::spawn(move || waiter.wait());
        clb.call(&Sample::new(1, 1, 1.0, 0));
        clb.end();
        handle.join().unwrap();
        assert_eq!(clb.take().len(), 1);
    }

    #[test]
    fn cancel_is_visible() {
        let clb = CollectCallback::new();
        assert!(!clb.is_canceled());
        clb.cancel();
        assert!(clb.is_canceled());
    }
}
