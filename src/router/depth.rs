//! Nesting limit for recursive routing.
//!
//! Property changes route events from inside rule processing, so a rule that
//! reacts to its own change loops forever. Every `route` call holds a
//! [`DepthGuard`] for its duration; entering beyond the configured limit
//! fails. The counter is per thread, matching the synchronous call stack.

use std::cell::Cell;

use crate::error::RouterError;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks one active `route` call on this thread.
#[derive(Debug)]
pub(crate) struct DepthGuard {
    _private: (),
}

impl DepthGuard {
    pub(crate) fn enter(max_depth: usize, event_type: &str) -> Result<Self, RouterError> {
        DEPTH.with(|depth| {
            let current = depth.get();
            if current >= max_depth {
                return Err(RouterError::RecursionLimit {
                    event_type: event_type.to_string(),
                    depth: max_depth,
                });
            }
            depth.set(current + 1);
            Ok(Self { _private: () })
        })
    }

    /// Active `route` calls on this thread.
    pub(crate) fn current() -> usize {
        DEPTH.with(Cell::get)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_is_counted_and_released() {
        assert_eq!(DepthGuard::current(), 0);
        {
            let _a = DepthGuard::enter(2, "a").unwrap();
            let _b = DepthGuard::enter(2, "b").unwrap();
            assert_eq!(DepthGuard::current(), 2);
            let err = DepthGuard::enter(2, "c").unwrap_err();
            assert!(matches!(err, RouterError::RecursionLimit { depth: 2, ref event_type } if event_type == "c"));
        }
        assert_eq!(DepthGuard::current(), 0);
    }

    #[test]
    fn threads_count_independently() {
        let _outer = DepthGuard::enter(1, "main").unwrap();
        std::thread::spawn(|| {
            assert!(DepthGuard::enter(1, "worker").is_ok());
        })
        .join()
        .unwrap();
    }
}
