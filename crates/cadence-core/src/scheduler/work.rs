//! Resumable routine bodies
//!
//! A routine body is a state machine driven one slice at a time: the owning
//! processor calls [`Work::resume`], the body runs until it reaches a point
//! where it cannot or should not continue, and reports that point as a
//! [`Step`]. Suspension happens only at these returns; the scheduler never
//! interrupts a body mid-slice.
//!
//! Two kinds of bodies are supported:
//! - closures / hand-written state machines implementing [`Work`]
//! - `async` blocks wrapped in [`FutureWork`], where `Poll::Pending` becomes a
//!   data wait and the future's waker notifies the routine

use crate::scheduler::context::ProcessorContext;
use crate::scheduler::routine::RoutineId;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

/// What a routine blocks on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// External data (e.g. a subscribed channel)
    Data,
    /// An IO completion
    Io,
}

/// How a slice ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// Still runnable; go to the back of the run queue
    Yield,
    /// Blocked until notified
    Wait(WaitKind),
    /// Blocked until the duration elapses or a notify arrives
    Sleep(Duration),
    /// Body completed
    Done,
}

/// A resumable body of work
pub trait Work: Send + 'static {
    /// Run until the next suspension point
    fn resume(&mut self, cx: &mut RoutineContext) -> Step;
}

impl<F> Work for F
where
    F: FnMut(&mut RoutineContext) -> Step + Send + 'static,
{
    fn resume(&mut self, cx: &mut RoutineContext) -> Step {
        self(cx)
    }
}

/// Per-slice view handed to a routine body
pub struct RoutineContext {
    id: RoutineId,
    slice: u64,
    owner: Weak<ProcessorContext>,
}

impl RoutineContext {
    pub(crate) fn new(id: RoutineId, slice: u64, owner: Option<&Arc<ProcessorContext>>) -> Self {
        Self {
            id,
            slice,
            owner: owner.map(Arc::downgrade).unwrap_or_default(),
        }
    }

    /// The running routine's id
    pub fn id(&self) -> RoutineId {
        self.id
    }

    /// 1-based number of the current slice
    pub fn slice(&self) -> u64 {
        self.slice
    }

    /// Handle that notifies this routine; hand it to whatever will produce
    /// the data or IO completion the routine is about to wait for.
    pub fn notifier(&self) -> RoutineNotifier {
        RoutineNotifier {
            id: self.id,
            owner: self.owner.clone(),
        }
    }

    /// A [`Waker`] that notifies this routine
    pub fn waker(&self) -> Waker {
        Waker::from(Arc::new(self.notifier()))
    }
}

/// Notifies one routine on the context that owns it
///
/// Holds only a weak reference: once the context is gone, notifying is a no-op.
#[derive(Clone)]
pub struct RoutineNotifier {
    id: RoutineId,
    owner: Weak<ProcessorContext>,
}

impl RoutineNotifier {
    /// Routine this notifier targets
    pub fn id(&self) -> RoutineId {
        self.id
    }

    /// Move the routine from its wait state to `Ready`.
    ///
    /// Returns whether a transition happened (see [`ProcessorContext::notify`]).
    pub fn notify(&self) -> bool {
        match self.owner.upgrade() {
            Some(context) => context.notify(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for RoutineNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineNotifier").field("id", &self.id).finish()
    }
}

impl Wake for RoutineNotifier {
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

/// Adapter running a future as a routine body
///
/// Each slice polls the future once. `Pending` parks the routine in
/// `DataWait`; the waker passed to the poll notifies it. A wake that lands
/// during the poll itself is not lost: the context records it and makes the
/// routine runnable again as soon as the slice ends.
pub struct FutureWork<F> {
    future: Pin<Box<F>>,
}

impl<F> FutureWork<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    /// Wrap a future
    pub fn new(future: F) -> Self {
        Self {
            future: Box::pin(future),
        }
    }
}

impl<F> Work for FutureWork<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn resume(&mut self, cx: &mut RoutineContext) -> Step {
        let waker = cx.waker();
        let mut task_cx = Context::from_waker(&waker);
        match self.future.as_mut().poll(&mut task_cx) {
            Poll::Ready(()) => Step::Done,
            Poll::Pending => Step::Wait(WaitKind::Data),
        }
    }
}

/// Yield once from an async routine body
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
