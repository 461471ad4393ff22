//! Items that expire after a period of inactivity
//!
//! A [`BacklogWithTimeout`] keeps a set of items, each with a last-activity
//! time obtained on demand. Expiry is found by one periodic check rather than
//! a timer per item; the check timer is armed only while the backlog is
//! non-empty so an idle backlog does not keep the loop alive.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::event_loop::{EventLoop, TimerId};

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct BacklogInner<K, T> {
    lp: EventLoop,
    timeout: Duration,
    check_interval: Duration,
    items: RefCell<HashMap<K, T>>,
    last_activity: Box<dyn Fn(&T) -> Instant>,
    on_expired: Box<dyn Fn(&T)>,
    timer: Cell<Option<TimerId>>,
}

/// Items keyed by `K`; adding and removing one item is O(1)
pub(crate) struct BacklogWithTimeout<K: Eq + Hash + Clone + 'static, T: 'static> {
    inner: Rc<BacklogInner<K, T>>,
}

impl<K: Eq + Hash + Clone + 'static, T: 'static> BacklogWithTimeout<K, T> {
    pub fn new<G, E>(lp: &EventLoop, timeout: Duration, last_activity: G, on_expired: E) -> Self
    where
        G: Fn(&T) -> Instant + 'static,
        E: Fn(&T) + 'static,
    {
        let check_interval = (timeout / 4).clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL);
        Self {
            inner: Rc::new(BacklogInner {
                lp: lp.clone(),
                timeout,
                check_interval,
                items: RefCell::new(HashMap::new()),
                last_activity: Box::new(last_activity),
                on_expired: Box::new(on_expired),
                timer: Cell::new(None),
            }),
        }
    }

    /// Tracks `item` under `key`; a key already present keeps its first item
    pub fn add_item(&self, key: K, item: T) {
        self.inner.items.borrow_mut().entry(key).or_insert(item);
        arm(&self.inner);
    }

    pub fn remove_item(&self, key: &K) -> Option<T> {
        let removed = self.inner.items.borrow_mut().remove(key);
        if self.inner.items.borrow().is_empty() {
            disarm(&self.inner);
        }
        removed
    }

    pub fn clear(&self) {
        disarm(&self.inner);
        self.inner.items.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone + 'static, T: 'static> Drop for BacklogWithTimeout<K, T> {
    fn drop(&mut self) {
        disarm(&self.inner);
    }
}

fn arm<K: Eq + Hash + Clone + 'static, T: 'static>(inner: &Rc<BacklogInner<K, T>>) {
    if inner.timer.get().is_some() {
        return;
    }
    let weak: Weak<BacklogInner<K, T>> = Rc::downgrade(inner);
    let id = inner.lp.schedule_timer(inner.check_interval, move |_| {
        if let Some(inner) = weak.upgrade() {
            inner.timer.set(None);
            check(&inner);
        }
    });
    inner.timer.set(Some(id));
}

fn disarm<K, T>(inner: &BacklogInner<K, T>) {
    if let Some(id) = inner.timer.take() {
        inner.lp.cancel_timer(id);
    }
}

fn check<K: Eq + Hash + Clone + 'static, T: 'static>(inner: &Rc<BacklogInner<K, T>>) {
    let now = inner.lp.now();
    let expired: Vec<T> = {
        let mut items = inner.items.borrow_mut();
        let keys: Vec<K> = items
            .iter()
            .filter(|(_, item)| now.saturating_duration_since((inner.last_activity)(item)) >= inner.timeout)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| items.remove(key)).collect()
    };

    if !expired.is_empty() {
        log::trace!("backlog evicting {} expired item(s)", expired.len());
    }
    for item in &expired {
        (inner.on_expired)(item);
    }

    if !inner.items.borrow().is_empty() {
        arm(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_items_expire_once() {
        let lp = EventLoop::new().unwrap();
        let start = Instant::now();
        let expired = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&expired);
        let backlog = Rc::new(BacklogWithTimeout::new(
            &lp,
            Duration::from_millis(20),
            move |_: &u32| start,
            move |item: &u32| e.borrow_mut().push(*item),
        ));
        backlog.add_item(1, 1);
        backlog.add_item(2, 2);
        backlog.add_item(2, 20);
        assert_eq!(backlog.len(), 2);

        lp.run().unwrap();
        let mut got = expired.borrow().clone();
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_active_item_survives_until_idle() {
        let lp = EventLoop::new().unwrap();
        let last = Rc::new(Cell::new(Instant::now()));
        let touches = Rc::new(Cell::new(0));
        let evicted_at = Rc::new(Cell::new(None));

        let l = Rc::clone(&last);
        let ev = Rc::clone(&evicted_at);
        let t = Rc::clone(&touches);
        let backlog = BacklogWithTimeout::new(
            &lp,
            Duration::from_millis(30),
            move |_: &u8| l.get(),
            move |_: &u8| ev.set(Some(t.get())),
        );
        backlog.add_item((), 0);

        // Touch the item every 10ms five times, then let it go idle
        let l = Rc::clone(&last);
        let t = Rc::clone(&touches);
        let timer = crate::timer::Timer::new(&lp);
        timer.start_repeating(Duration::from_millis(10), Duration::from_millis(10), move |timer| {
            l.set(Instant::now());
            t.set(t.get() + 1);
            if t.get() == 5 {
                timer.stop();
            }
        });

        lp.run().unwrap();
        assert_eq!(evicted_at.get(), Some(5));
    }

    #[test]
    fn test_many_items_by_key() {
        let lp = EventLoop::new().unwrap();
        let backlog = BacklogWithTimeout::new(&lp, Duration::from_secs(60), |_: &u64| Instant::now(), |_: &u64| {});
        for key in 0..20_000u32 {
            backlog.add_item(key, u64::from(key));
        }
        for key in (0..20_000u32).step_by(2) {
            assert_eq!(backlog.remove_item(&key), Some(u64::from(key)));
        }
        assert_eq!(backlog.len(), 10_000);
        backlog.clear();
        assert!(backlog.is_empty());
        lp.run().unwrap();
    }

    #[test]
    fn test_remove_last_item_disarms() {
        let lp = EventLoop::new().unwrap();
        let backlog = BacklogWithTimeout::new(&lp, Duration::from_secs(60), |_: &i32| Instant::now(), |_: &i32| {});
        backlog.add_item(5, 5);
        assert_eq!(backlog.remove_item(&5), Some(5));
        assert_eq!(backlog.remove_item(&5), None);
        // Nothing armed, so the loop exits right away
        let started = Instant::now();
        lp.run().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
