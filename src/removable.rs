//! Two-phase removal of loop-bound objects
//!
//! Sockets, secure sessions and files cannot be torn down synchronously: a
//! completion for them may already be queued on the loop. Removal therefore
//! happens in two steps. [`Removable::schedule_removal`] closes the OS handle
//! and fails queued operations with `OperationCanceled`; the object reaches
//! [`RemovalPhase::Removed`] later, on the loop thread, once nothing refers
//! to it any more. Completion records keep a strong `Rc` to their object, so
//! a late completion always sees a valid, closed object.

use std::cell::{Cell, RefCell};

/// Lifecycle phase of a removable object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RemovalPhase {
    #[default]
    Active,
    RemovalScheduled,
    Removed,
}

/// Disposal contract shared by every loop-bound object
pub trait Removable {
    /// Starts removal; calling it again has no effect
    fn schedule_removal(&self);

    /// Registers `cb` to run once, when removal completes
    ///
    /// Composite objects use this to remove an inner transport first and
    /// finish their own removal from the observer.
    fn set_on_schedule_removal<F: FnOnce() + 'static>(&self, cb: F)
    where
        Self: Sized;

    fn removal_phase(&self) -> RemovalPhase;

    fn is_removal_scheduled(&self) -> bool {
        self.removal_phase() != RemovalPhase::Active
    }
}

/// Phase tracking plus the removal observer
#[derive(Default)]
pub(crate) struct RemovalState {
    phase: Cell<RemovalPhase>,
    observer: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl RemovalState {
    pub fn phase(&self) -> RemovalPhase {
        self.phase.get()
    }

    pub fn is_active(&self) -> bool {
        self.phase.get() == RemovalPhase::Active
    }

    /// Active -> RemovalScheduled; false when removal was already under way
    pub fn begin(&self) -> bool {
        if self.phase.get() != RemovalPhase::Active {
            return false;
        }
        self.phase.set(RemovalPhase::RemovalScheduled);
        true
    }

    pub fn set_observer<F: FnOnce() + 'static>(&self, cb: F) {
        *self.observer.borrow_mut() = Some(Box::new(cb));
    }

    /// Enters `Removed` and fires the observer; later calls do nothing
    pub fn finish(&self) {
        if self.phase.get() == RemovalPhase::Removed {
            return;
        }
        self.phase.set(RemovalPhase::Removed);
        let observer = self.observer.borrow_mut().take();
        if let Some(cb) = observer {
            cb();
        }
    }
}

impl std::fmt::Debug for RemovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalState").field("phase", &self.phase.get()).finish()
    }
}
