//! Application data attached to clients and peers

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// Type-erased slot for one piece of application data
#[derive(Default)]
pub struct UserData {
    slot: RefCell<Option<Rc<dyn Any>>>,
}

impl UserData {
    pub fn set<T: Any>(&self, value: T) {
        *self.slot.borrow_mut() = Some(Rc::new(value));
    }

    /// Returns the stored value if it has type `T`
    pub fn get<T: Any>(&self) -> Option<Rc<T>> {
        let slot = self.slot.borrow();
        slot.as_ref().and_then(|v| Rc::clone(v).downcast::<T>().ok())
    }

    pub fn clear(&self) {
        self.slot.borrow_mut().take();
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserData").field("set", &self.slot.borrow().is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_typed() {
        let data = UserData::default();
        assert!(data.get::<u32>().is_none());
        data.set(7u32);
        assert_eq!(*data.get::<u32>().unwrap(), 7);
        assert!(data.get::<String>().is_none());
        data.clear();
        assert!(data.get::<u32>().is_none());
    }
}
