use derivative::Derivative;

/// Counts active watches and reports when worker should keep process alive
///
/// Hook is called with `true` when count goes from 0 to 1 and with `false`
/// when it returns to 0.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct KeepAlive {
    count: usize,
    #[derivative(Debug = "ignore")]
    hook: Option<Box<dyn FnMut(bool)>>,
}

impl KeepAlive {
    pub fn set_hook<F: FnMut(bool) + 'static>(&mut self, hook: F) {
        self.hook = Some(Box::new(hook));
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_active(&self) -> bool {
        self.count > 0
    }

    pub fn acquire(&mut self) {
        self.count += 1;
        if self.count == 1 {
            self.notify(true);
        }
    }

    pub fn release(&mut self) {
        if self.count == 0 {
            log::warn!("keep-alive released more times than acquired");
            return;
        }
        self.count -= 1;
        if self.count == 0 {
            self.notify(false);
        }
    }

    fn notify(&mut self, keep_alive: bool) {
        if let Some(hook) = self.hook.as_mut() {
            hook(keep_alive);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn transitions() {
        let changes = Rc::new(RefCell::new(vec![]));
        let mut keep_alive = KeepAlive::default();
        {
            let changes = Rc::clone(&changes);
            keep_alive.set_hook(move |active| changes.borrow_mut().push(active));
        }

        keep_alive.acquire();
        keep_alive.acquire();
        keep_alive.release();
        assert!(keep_alive.is_active());
        keep_alive.release();
        assert!(!keep_alive.is_active());
        keep_alive.acquire();

        assert_eq!(*changes.borrow(), vec![true, false, true]);
    }

    #[test]
    fn never_negative() {
        let mut keep_alive = KeepAlive::default();
        keep_alive.release();
        assert_eq!(keep_alive.count(), 0);
        keep_alive.acquire();
        assert_eq!(keep_alive.count(), 1);
    }
}
