//! Per-invocation resource accounting.
//!
//! One `Meter` lives on each sandbox thread. Every heap value holds a
//! [`Charge`] against it, released on drop, so `used` tracks live
//! interpreter memory and `peak` its high-water mark. The meter also owns
//! the cancellation flag and deadline polled by the interpreter, and the
//! list of containers swept at teardown to break reference cycles.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::error::{Fault, Flow};
use super::interp::Scope;
use super::value::{DictObj, ListObj};

/// How many ticks pass between reads of the wall clock.
const CLOCK_EVERY: u32 = 256;

/// Containers that can take part in a reference cycle.
enum Tracked {
    List(Weak<ListObj>),
    Dict(Weak<DictObj>),
    Scope(Weak<Scope>),
}

pub struct Meter {
    limit: usize,
    used: Cell<usize>,
    peak: Cell<usize>,
    cancel: Arc<AtomicBool>,
    deadline: Instant,
    ticks: Cell<u32>,
    tracked: RefCell<Vec<Tracked>>,
    prune_at: Cell<usize>,
}

impl Meter {
    pub fn new(limit: usize, cancel: Arc<AtomicBool>, deadline: Instant) -> Rc<Self> {
        Rc::new(Self {
            limit,
            used: Cell::new(0),
            peak: Cell::new(0),
            cancel,
            deadline,
            ticks: Cell::new(0),
            tracked: RefCell::new(Vec::new()),
            prune_at: Cell::new(1024),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Bytes that may still be charged.
    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.used.get())
    }

    /// Charge `bytes` for as long as the returned handle lives.
    pub fn charge(self: &Rc<Self>, bytes: usize) -> Flow<Charge> {
        self.acquire(bytes)?;
        Ok(Charge {
            meter: Rc::clone(self),
            bytes: Cell::new(bytes),
        })
    }

    /// Fail early when an allocation of `bytes` could not be charged.
    pub fn ensure(&self, bytes: usize) -> Flow<()> {
        if bytes > self.headroom() {
            return Err(Fault::Memory { limit: self.limit });
        }
        Ok(())
    }

    fn acquire(&self, bytes: usize) -> Flow<()> {
        let next = self.used.get().saturating_add(bytes);
        if next > self.limit {
            return Err(Fault::Memory { limit: self.limit });
        }
        self.used.set(next);
        if next > self.peak.get() {
            self.peak.set(next);
        }
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }

    /// One unit of interpreter work. Fails once the invocation is cancelled
    /// or past its deadline.
    pub fn tick(&self) -> Flow<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Fault::Timeout);
        }
        let ticks = self.ticks.get().wrapping_add(1);
        self.ticks.set(ticks);
        if ticks % CLOCK_EVERY == 0 && Instant::now() >= self.deadline {
            return Err(Fault::Timeout);
        }
        Ok(())
    }

    /// Check the clock immediately, for operations that block.
    pub fn expired(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn track_list(&self, list: &Rc<ListObj>) {
        self.track(Tracked::List(Rc::downgrade(list)));
    }

    pub(crate) fn track_dict(&self, dict: &Rc<DictObj>) {
        self.track(Tracked::Dict(Rc::downgrade(dict)));
    }

    pub(crate) fn track_scope(&self, scope: &Rc<Scope>) {
        self.track(Tracked::Scope(Rc::downgrade(scope)));
    }

    fn track(&self, entry: Tracked) {
        let mut tracked = self.tracked.borrow_mut();
        tracked.push(entry);
        if tracked.len() >= self.prune_at.get() {
            tracked.retain(|t| match t {
                Tracked::List(w) => w.strong_count() > 0,
                Tracked::Dict(w) => w.strong_count() > 0,
                Tracked::Scope(w) => w.strong_count() > 0,
            });
            self.prune_at.set((tracked.len() * 2).max(1024));
        }
    }

    /// Empty every container still alive so cyclic structures are freed
    /// when the interpreter drops its last handles.
    pub fn sweep(&self) {
        let tracked = std::mem::take(&mut *self.tracked.borrow_mut());
        for entry in tracked {
            match entry {
                Tracked::List(w) => {
                    if let Some(list) = w.upgrade() {
                        drop(list.take_all());
                    }
                }
                Tracked::Dict(w) => {
                    if let Some(dict) = w.upgrade() {
                        drop(dict.take_all());
                    }
                }
                Tracked::Scope(w) => {
                    if let Some(scope) = w.upgrade() {
                        drop(scope.take_all());
                    }
                }
            }
        }
    }
}

/// Bytes held against a [`Meter`] by one live value.
pub struct Charge {
    meter: Rc<Meter>,
    bytes: Cell<usize>,
}

impl Charge {
    pub fn bytes(&self) -> usize {
        self.bytes.get()
    }

    pub fn grow(&self, extra: usize) -> Flow<()> {
        self.meter.acquire(extra)?;
        self.bytes.set(self.bytes.get() + extra);
        Ok(())
    }

    /// Re-size the charge to `bytes`, growing or shrinking.
    pub fn set(&self, bytes: usize) -> Flow<()> {
        let current = self.bytes.get();
        if bytes > current {
            self.grow(bytes - current)
        } else {
            self.meter.release(current - bytes);
            self.bytes.set(bytes);
            Ok(())
        }
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.meter.release(self.bytes.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meter(limit: usize) -> Rc<Meter> {
        Meter::new(
            limit,
            Arc::new(AtomicBool::new(false)),
            Instant::now() + Duration::from_secs(60),
        )
    }

    #[test]
    fn charges_are_released_on_drop() {
        let meter = meter(1000);
        let a = meter.charge(400).unwrap();
        let b = meter.charge(500).unwrap();
        assert_eq!(meter.used(), 900);
        drop(a);
        assert_eq!(meter.used(), 500);
        drop(b);
        assert_eq!(meter.used(), 0);
        assert_eq!(meter.peak(), 900);
    }

    #[test]
    fn crossing_the_limit_fails() {
        let meter = meter(1000);
        let _a = meter.charge(800).unwrap();
        assert!(matches!(meter.charge(201), Err(Fault::Memory { limit: 1000 })));
        assert_eq!(meter.used(), 800);
    }

    #[test]
    fn charge_resizes() {
        let meter = meter(1000);
        let c = meter.charge(100).unwrap();
        c.set(700).unwrap();
        assert_eq!(meter.used(), 700);
        c.set(50).unwrap();
        assert_eq!(meter.used(), 50);
        assert!(c.grow(2000).is_err());
        assert_eq!(c.bytes(), 50);
    }

    #[test]
    fn cancellation_stops_ticks() {
        let cancel = Arc::new(AtomicBool::new(false));
        let meter = Meter::new(1000, cancel.clone(), Instant::now() + Duration::from_secs(60));
        assert!(meter.tick().is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert_eq!(meter.tick(), Err(Fault::Timeout));
    }

    #[test]
    fn past_deadline_times_out() {
        let meter = Meter::new(1000, Arc::new(AtomicBool::new(false)), Instant::now());
        let failed = (0..CLOCK_EVERY).any(|_| meter.tick().is_err());
        assert!(failed);
        assert!(meter.expired());
    }
}
