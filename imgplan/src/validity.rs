//! Liveness checks for resources owned by the host application
//!
//! The planner has no cancellation hook of its own. Hosts check these before
//! handing work to it and again before using the result.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Whether the current thread is the process main thread.
///
/// Decided by thread name: the Rust runtime names its main thread `"main"`.
/// A spawned thread given that name also counts, and when a non-Rust host
/// owns the main thread it has no name, so this returns `false` there.
pub fn is_main_thread() -> bool {
    std::thread::current().name() == Some("main")
}

/// Something that scopes work: a UI owner, a service, the application itself.
pub trait Context {
    /// A UI owner that has begun tearing down. Plain contexts never finish.
    fn is_finishing(&self) -> bool {
        false
    }

    fn is_application_scope(&self) -> bool;

    /// The application-wide context this one belongs to.
    fn application_scope(&self) -> Self
    where
        Self: Sized;
}

/// A UI component attached to a parent, e.g. a fragment inside a screen.
pub trait Component {
    fn is_detached(&self) -> bool;
    fn is_removing(&self) -> bool;
}

/// Work that can be cancelled while in flight.
pub trait Cancellable {
    fn is_cancelled(&self) -> bool;
    fn is_done(&self) -> bool;
    fn cancel(&self, may_interrupt: bool);
}

pub fn is_context_valid<C: Context + ?Sized>(context: Option<&C>) -> bool {
    context.is_some_and(|c| !c.is_finishing())
}

pub fn is_fragment_valid<F: Component + ?Sized>(fragment: Option<&F>) -> bool {
    fragment.is_some_and(|f| !f.is_detached() && !f.is_removing())
}

pub fn is_view_valid<V: ?Sized>(view: Option<&V>) -> bool {
    view.is_some()
}

/// Widen `context` to application scope so it can outlive the UI that handed it over.
pub fn to_application_scope<C: Context + Clone>(context: Option<&C>) -> Result<C> {
    let context = context.ok_or(Error::InvalidArgument("context must not be null"))?;
    if context.is_application_scope() {
        Ok(context.clone())
    } else {
        Ok(context.application_scope())
    }
}

/// Cancel `work` unless it is absent, already finished or already cancelled.
pub fn cancel<C: Cancellable + ?Sized>(work: Option<&C>, may_interrupt: bool) {
    if let Some(work) = work {
        if !work.is_cancelled() && !work.is_done() {
            work.cancel(may_interrupt);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Done = 2,
    Cancelled = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Done,
            _ => TaskState::Cancelled,
        }
    }
}

/// Shared, thread-safe [`Cancellable`] for hosts without a task type of their own.
///
/// Clones observe the same state. Workers call [`CancelHandle::start`] before
/// running and [`CancelHandle::finish`] after; both fail once cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from pending to running. `false` if the work was cancelled first.
    pub fn start(&self) -> bool {
        self.transition(TaskState::Pending, TaskState::Running)
    }

    /// Move from running to done. `false` if the work was cancelled meanwhile.
    pub fn finish(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Done)
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Cancellable for CancelHandle {
    fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    // cooperative only, nothing to interrupt
    fn cancel(&self, _may_interrupt: bool) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match TaskState::from_u8(state) {
                    TaskState::Pending | TaskState::Running => Some(TaskState::Cancelled as u8),
                    TaskState::Done | TaskState::Cancelled => None,
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Clone, Debug, PartialEq)]
    enum Scope {
        Application,
        Screen { finishing: bool },
        Service,
    }

    impl Context for Scope {
        fn is_finishing(&self) -> bool {
            matches!(self, Scope::Screen { finishing: true })
        }

        fn is_application_scope(&self) -> bool {
            *self == Scope::Application
        }

        fn application_scope(&self) -> Self {
            Scope::Application
        }
    }

    struct Fragment {
        detached: bool,
        removing: bool,
    }

    impl Component for Fragment {
        fn is_detached(&self) -> bool {
            self.detached
        }

        fn is_removing(&self) -> bool {
            self.removing
        }
    }

    #[derive(Default)]
    struct PendingResult {
        cancelled: Cell<bool>,
        done: bool,
        cancel_calls: Cell<u32>,
    }

    impl Cancellable for PendingResult {
        fn is_cancelled(&self) -> bool {
            self.cancelled.get()
        }

        fn is_done(&self) -> bool {
            self.done
        }

        fn cancel(&self, _: bool) {
            self.cancel_calls.set(self.cancel_calls.get() + 1);
            self.cancelled.set(true);
        }
    }

    #[test]
    fn context_validity() {
        assert!(!is_context_valid::<Scope>(None));
        assert!(!is_context_valid(Some(&Scope::Screen { finishing: true })));
        assert!(is_context_valid(Some(&Scope::Screen { finishing: false })));
        assert!(is_context_valid(Some(&Scope::Service)));
        assert!(is_context_valid(Some(&Scope::Application)));
    }

    #[test]
    fn fragment_validity() {
        assert!(!is_fragment_valid::<Fragment>(None));
        for (detached, removing, valid) in [
            (false, false, true),
            (true, false, false),
            (false, true, false),
            (true, true, false),
        ] {
            let fragment = Fragment { detached, removing };
            assert_eq!(is_fragment_valid(Some(&fragment)), valid);
        }
    }

    #[test]
    fn view_validity() {
        assert!(!is_view_valid::<str>(None));
        assert!(is_view_valid(Some("button")));
    }

    #[test]
    fn application_scope_conversion() {
        assert!(matches!(
            to_application_scope::<Scope>(None),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            to_application_scope(Some(&Scope::Service)).unwrap(),
            Scope::Application
        );
        assert_eq!(
            to_application_scope(Some(&Scope::Application)).unwrap(),
            Scope::Application
        );
    }

    #[test]
    fn cancel_skips_finished_work() {
        cancel::<PendingResult>(None, true);

        let done = PendingResult {
            done: true,
            ..Default::default()
        };
        cancel(Some(&done), true);
        assert_eq!(done.cancel_calls.get(), 0);

        let pending = PendingResult::default();
        cancel(Some(&pending), false);
        cancel(Some(&pending), false);
        assert_eq!(pending.cancel_calls.get(), 1);
    }

    #[test]
    fn cancel_handle_lifecycle() {
        let handle = CancelHandle::new();
        let worker = handle.clone();
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(worker.start());

        cancel(Some(&handle), true);
        assert!(worker.is_cancelled());
        assert!(!worker.finish());

        let finished = CancelHandle::new();
        assert!(finished.start() && finished.finish());
        cancel(Some(&finished), true);
        assert_eq!(finished.state(), TaskState::Done);
    }

    #[test]
    fn test_threads_are_not_main() {
        let on_spawned = std::thread::spawn(is_main_thread).join().unwrap();
        assert!(!on_spawned);
    }

    #[test]
    fn main_thread_is_recognised_by_name() {
        let named_main = std::thread::Builder::new()
            .name("main".into())
            .spawn(is_main_thread)
            .unwrap()
            .join()
            .unwrap();
        assert!(named_main);
    }
}
