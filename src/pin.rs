//! Thread affinity for provider context calls.
//!
//! Some mechanism libraries keep per-thread state during a context step. A [`WorkerPin`]
//! marks the current thread as owning the call until the guard is dropped, and the guard
//! cannot leave that thread.

use std::{
    cell::Cell,
    marker::PhantomData,
    thread::{self, ThreadId},
};

thread_local! {
    static PIN_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub struct WorkerPin {
    thread: ThreadId,
    _not_threadsafe: PhantomData<*mut ()>,
}
impl WorkerPin {
    pub fn acquire() -> Self {
        PIN_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            thread: thread::current().id(),
            _not_threadsafe: PhantomData,
        }
    }
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}
impl Drop for WorkerPin {
    fn drop(&mut self) {
        PIN_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the calling thread currently holds a [`WorkerPin`].
pub fn is_pinned() -> bool {
    PIN_DEPTH.with(|depth| depth.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_scoped_to_the_guard() {
        assert!(!is_pinned());
        {
            let outer = WorkerPin::acquire();
            assert_eq!(outer.thread(), thread::current().id());
            {
                let _inner = WorkerPin::acquire();
                assert!(is_pinned());
            }
            assert!(is_pinned());
        }
        assert!(!is_pinned());
    }

    #[test]
    fn pin_does_not_leak_into_other_threads() {
        let _pin = WorkerPin::acquire();
        let other = thread::spawn(is_pinned).join().unwrap();
        assert!(!other);
        assert!(is_pinned());
    }

    #[test]
    fn pin_is_released_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _pin = WorkerPin::acquire();
            panic!("step failed");
        });
        assert!(result.is_err());
        assert!(!is_pinned());
    }
}
