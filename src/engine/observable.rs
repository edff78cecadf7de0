//! Minimal observer list for engine lifecycle notifications.

/// Token returned by [`Observable::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct Observable<T> {
    observers: Vec<(ObserverId, Box<dyn FnMut(&T)>)>,
    next_id: u64,
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T> Observable<T> {
    pub fn add(&mut self, observer: impl FnMut(&T) + 'static) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Invoke every observer in registration order.
    pub fn notify(&mut self, event: &T) {
        for (_, observer) in self.observers.iter_mut() {
            observer(event);
        }
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn notifies_in_order_and_removes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut obs: Observable<u32> = Observable::default();
        let a = {
            let seen = seen.clone();
            obs.add(move |v| seen.borrow_mut().push(("a", *v)))
        };
        {
            let seen = seen.clone();
            obs.add(move |v| seen.borrow_mut().push(("b", *v)));
        }
        obs.notify(&1);
        assert!(obs.remove(a));
        assert!(!obs.remove(a));
        obs.notify(&2);
        assert_eq!(*seen.borrow(), vec![("a", 1), ("b", 1), ("b", 2)]);
    }
}
