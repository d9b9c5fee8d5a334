//! Scope guard that runs a release action unless explicitly disarmed.
//!
//! Multi-step setup registers one guard per acquired resource. If any later
//! step returns early, the guard fires on drop; once the whole sequence has
//! succeeded the caller disarms it and the resource outlives the scope.

use std::ops::{Deref, DerefMut};

/// Owns a value and an action to run on it when the guard goes out of scope.
pub struct Deferred<T, F>
where
    F: FnOnce(&mut T),
{
    value: T,
    action: Option<F>,
}

impl<T, F> Deferred<T, F>
where
    F: FnOnce(&mut T),
{
    /// Arms a guard that runs `action` on `value` when dropped.
    pub const fn new(value: T, action: F) -> Self {
        Self {
            value,
            action: Some(action),
        }
    }

    /// Cancels the pending action.
    pub fn disarm(&mut self) {
        self.action = None;
    }

    /// Returns whether the action will still run on drop.
    pub const fn is_armed(&self) -> bool {
        self.action.is_some()
    }
}

impl<T, F> Deref for Deferred<T, F>
where
    F: FnOnce(&mut T),
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T, F> DerefMut for Deferred<T, F>
where
    F: FnOnce(&mut T),
{
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T, F> Drop for Deferred<T, F>
where
    F: FnOnce(&mut T),
{
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action(&mut self.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn armed_guard_runs_on_drop() {
        let fired = Cell::new(false);
        {
            let _guard = Deferred::new((), |_| fired.set(true));
        }
        assert!(fired.get());
    }

    #[test]
    fn disarmed_guard_does_not_run() {
        let fired = Cell::new(false);
        {
            let mut guard = Deferred::new((), |_| fired.set(true));
            guard.disarm();
            assert!(!guard.is_armed());
        }
        assert!(!fired.get());
    }

    #[test]
    fn guard_gives_access_to_value() {
        let mut log = Vec::new();
        {
            let mut guard = Deferred::new(&mut log, |l| l.push("released"));
            guard.push("acquired");
        }
        assert_eq!(log, vec!["acquired", "released"]);
    }

    #[test]
    fn early_return_fires_guard() {
        fn setup(fail: bool, released: &Cell<u32>) -> Result<(), ()> {
            let mut guard = Deferred::new((), |_| released.set(released.get() + 1));
            if fail {
                return Err(());
            }
            guard.disarm();
            Ok(())
        }

        let released = Cell::new(0);
        assert!(setup(true, &released).is_err());
        assert!(setup(false, &released).is_ok());
        assert_eq!(released.get(), 1);
    }
}
