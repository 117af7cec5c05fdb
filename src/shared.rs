//! Thread-safe wrapper. Every call holds a store-wide mutex, writers arriving while a garbage
//! collection cycle is running additionally park on a gate until the cycle is over.

use crate::error::Error;
use crate::gc::{GcObserver, GcOutcome};
use crate::platform::Platform;
use crate::{Entry, Get, Kv, KvStatistics, Set};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use parking_lot::{Condvar, Mutex, MutexGuard};

struct GateState {
    in_flight: bool,
    waiters: usize,
}

pub(crate) struct GcGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl GcGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                in_flight: false,
                waiters: 0,
            }),
            idle: Condvar::new(),
        }
    }

    fn begin(&self) {
        self.state.lock().in_flight = true;
    }

    /// Wakes every parked writer, not just one.
    fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        drop(state);
        self.idle.notify_all();
    }

    /// Blocks while a cycle is in flight. Returns immediately otherwise.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        if !state.in_flight {
            return;
        }

        state.waiters += 1;
        while state.in_flight {
            self.idle.wait(&mut state);
        }
        state.waiters -= 1;
    }

    fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    fn waiters(&self) -> usize {
        self.state.lock().waiters
    }
}

struct GateObserver(Arc<GcGate>);

impl GcObserver for GateObserver {
    fn gc_started(&self) {
        self.0.begin();
    }

    fn gc_finished(&self) {
        self.0.finish();
    }
}

/// A [`Kv`] shared between threads.
///
/// The wrapper installs its own [`GcObserver`] on the store, replacing any observer set before.
pub struct SharedKv<T: Platform> {
    store: Mutex<Kv<T>>,
    gate: Arc<GcGate>,
}

impl<T: Platform> SharedKv<T> {
    pub fn new(mut kv: Kv<T>) -> Self {
        let gate = Arc::new(GcGate::new());
        kv.set_gc_observer(Some(Box::new(GateObserver(gate.clone()))));
        Self {
            store: Mutex::new(kv),
            gate,
        }
    }

    pub fn get<R>(&self, key: impl AsRef<[u8]>) -> Result<R, Error>
    where
        Kv<T>: Get<R>,
    {
        self.store.lock().get(key)
    }

    pub fn get_into(&self, key: impl AsRef<[u8]>, buf: &mut [u8]) -> Result<usize, Error> {
        self.store.lock().get_into(key, buf)
    }

    pub fn set<R>(&self, key: impl AsRef<[u8]>, value: R) -> Result<(), Error>
    where
        Kv<T>: Set<R>,
    {
        self.gate.wait_idle();
        self.store.lock().set(key, value)
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.gate.wait_idle();
        self.store.lock().delete(key)
    }

    pub fn key_exists(&self, key: impl AsRef<[u8]>) -> bool {
        self.store.lock().key_exists(key)
    }

    pub fn collect_garbage(&self) -> Result<GcOutcome, Error> {
        self.store.lock().collect_garbage()
    }

    pub fn list(&self) -> Result<Vec<Entry>, Error> {
        self.store.lock().list()
    }

    pub fn statistics(&self) -> Result<KvStatistics, Error> {
        self.store.lock().statistics()
    }

    /// Whether a garbage collection cycle is running right now.
    pub fn gc_in_flight(&self) -> bool {
        self.gate.in_flight()
    }

    /// Number of writers parked until the running cycle is over.
    pub fn gc_waiters(&self) -> usize {
        self.gate.waiters()
    }

    /// Exclusive access for everything not covered by the wrapper.
    pub fn lock(&self) -> MutexGuard<'_, Kv<T>> {
        self.store.lock()
    }

    pub fn into_inner(self) -> Kv<T> {
        let mut kv = self.store.into_inner();
        kv.set_gc_observer(None);
        kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn idle_gate_does_not_block() {
        let gate = GcGate::new();
        gate.wait_idle();
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn finish_releases_every_waiter() {
        let gate = Arc::new(GcGate::new());
        gate.begin();

        let (tx, rx) = mpsc::channel();
        let handles = (0..2)
            .map(|id| {
                let gate = gate.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    gate.wait_idle();
                    tx.send(id).unwrap();
                })
            })
            .collect::<Vec<_>>();

        wait_for(|| gate.waiters() == 2);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        gate.finish();

        let mut released = [
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        released.sort();
        assert_eq!(released, [0, 1]);

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.waiters(), 0);
        assert!(!gate.in_flight());
    }
}
