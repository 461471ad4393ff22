//! One-shot and repeating timers driven by the loop

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::event_loop::{EventLoop, TimerId};
use crate::removable::{Removable, RemovalPhase, RemovalState};

struct TimerInner {
    lp: EventLoop,
    armed: Cell<Option<TimerId>>,
    removal: RemovalState,
}

/// Loop timer; clones refer to the same timer
///
/// An armed timer keeps its loop running. Starting an armed timer replaces
/// the pending callback.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                lp: lp.clone(),
                armed: Cell::new(None),
                removal: RemovalState::default(),
            }),
        }
    }

    /// Fires `cb` once after `timeout`
    pub fn start<F: FnOnce(&Timer) + 'static>(&self, timeout: Duration, cb: F) {
        if !self.inner.removal.is_active() {
            log::warn!("timer start ignored, removal already scheduled");
            return;
        }
        self.stop();
        let inner = Rc::clone(&self.inner);
        let id = self.inner.lp.schedule_timer(timeout, move |_| {
            inner.armed.set(None);
            cb(&Timer { inner });
        });
        self.inner.armed.set(Some(id));
    }

    /// Fires `cb` after `timeout`, then every `repeat` until stopped
    pub fn start_repeating<F: FnMut(&Timer) + 'static>(&self, timeout: Duration, repeat: Duration, cb: F) {
        if !self.inner.removal.is_active() {
            log::warn!("timer start ignored, removal already scheduled");
            return;
        }
        self.stop();
        arm_repeating(&self.inner, timeout, repeat, Rc::new(RefCell::new(cb)));
    }

    pub fn stop(&self) {
        if let Some(id) = self.inner.armed.take() {
            self.inner.lp.cancel_timer(id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.armed.get().is_some()
    }
}

fn arm_repeating(inner: &Rc<TimerInner>, delay: Duration, repeat: Duration, cb: Rc<RefCell<dyn FnMut(&Timer)>>) {
    let this = Rc::clone(inner);
    let id = inner.lp.schedule_timer(delay, move |_| {
        this.armed.set(None);
        arm_repeating(&this, repeat, repeat, Rc::clone(&cb));
        let timer = Timer { inner: this };
        (&mut *cb.borrow_mut())(&timer);
    });
    inner.armed.set(Some(id));
}

impl Removable for Timer {
    fn schedule_removal(&self) {
        if !self.inner.removal.begin() {
            return;
        }
        self.stop();
        let inner = Rc::clone(&self.inner);
        self.inner.lp.post(move |_| inner.removal.finish());
    }

    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F) {
        self.inner.removal.set_observer(cb);
    }

    fn removal_phase(&self) -> RemovalPhase {
        self.inner.removal.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_one_shot_fires_after_timeout() {
        let lp = EventLoop::new().unwrap();
        let timer = Timer::new(&lp);
        let fired = Rc::new(Cell::new(None));
        let f = Rc::clone(&fired);
        let started = Instant::now();
        timer.start(Duration::from_millis(30), move |_| f.set(Some(started.elapsed())));
        assert!(timer.is_active());
        lp.run().unwrap();
        assert!(fired.get().unwrap() >= Duration::from_millis(30));
        assert!(!timer.is_active());
    }

    #[test]
    fn test_repeating_until_stopped() {
        let lp = EventLoop::new().unwrap();
        let timer = Timer::new(&lp);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        timer.start_repeating(Duration::from_millis(1), Duration::from_millis(2), move |t| {
            c.set(c.get() + 1);
            if c.get() == 5 {
                t.stop();
            }
        });
        lp.run().unwrap();
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn test_removal_cancels_and_notifies() {
        let lp = EventLoop::new().unwrap();
        let timer = Timer::new(&lp);
        let fired = Rc::new(Cell::new(false));
        let removed = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        timer.start(Duration::from_millis(10), move |_| f.set(true));
        let r = Rc::clone(&removed);
        timer.set_on_schedule_removal(move || r.set(true));
        timer.schedule_removal();
        assert_eq!(timer.removal_phase(), RemovalPhase::RemovalScheduled);
        lp.run().unwrap();
        assert!(!fired.get());
        assert!(removed.get());
        assert_eq!(timer.removal_phase(), RemovalPhase::Removed);
    }
}
