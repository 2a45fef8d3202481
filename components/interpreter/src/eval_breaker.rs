//! Asynchronous requests and the interpreter lock
//!
//! Other threads never touch a running interpreter directly. They set a
//! flag on its [`EvalBreaker`], and the eval loop acts on the flag at the
//! next periodic tick or backward jump.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use core_types::Unwind;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::vm::Vm;

const INTERRUPT: u32 = 0x1;
const PENDING_CALLS: u32 = 0x2;
const DROP_REQUEST: u32 = 0x4;

/// How long a waiting thread sleeps before re-requesting the lock
const SWITCH_INTERVAL: Duration = Duration::from_millis(5);

/// Work queued from another thread, run by the interpreter at a tick
pub type PendingCall = Box<dyn FnOnce(&mut Vm) -> Result<(), Unwind> + Send>;

/// Atomic request flags checked between instructions
pub struct EvalBreaker {
    flags: AtomicU32,
    sender: Sender<PendingCall>,
    receiver: Receiver<PendingCall>,
}

impl EvalBreaker {
    /// Create a breaker with nothing pending
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            flags: AtomicU32::new(0),
            sender,
            receiver,
        }
    }

    /// Ask the interpreter to raise `KeyboardInterrupt`
    pub fn request_interrupt(&self) {
        self.flags.fetch_or(INTERRUPT, Ordering::Release);
    }

    /// Queue `call` to run on the interpreter thread
    pub fn add_pending_call<F>(&self, call: F)
    where
        F: FnOnce(&mut Vm) -> Result<(), Unwind> + Send + 'static,
    {
        if self.sender.send(Box::new(call)).is_ok() {
            self.flags.fetch_or(PENDING_CALLS, Ordering::Release);
        }
    }

    /// Ask the interpreter to yield the interpreter lock
    pub fn request_drop(&self) {
        self.flags.fetch_or(DROP_REQUEST, Ordering::Release);
    }

    /// Whether anything at all is pending
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    /// Consume an interrupt request
    pub fn take_interrupt(&self) -> bool {
        self.flags.fetch_and(!INTERRUPT, Ordering::AcqRel) & INTERRUPT != 0
    }

    /// Consume every queued call
    pub fn take_pending_calls(&self) -> Vec<PendingCall> {
        // Clear before draining: a call queued after the drain re-sets the flag.
        self.flags.fetch_and(!PENDING_CALLS, Ordering::AcqRel);
        self.receiver.try_iter().collect()
    }

    /// Consume a lock drop request
    pub fn take_drop_request(&self) -> bool {
        self.flags.fetch_and(!DROP_REQUEST, Ordering::AcqRel) & DROP_REQUEST != 0
    }
}

impl Default for EvalBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EvalBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalBreaker")
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("queued", &self.receiver.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    holder: Option<Arc<EvalBreaker>>,
    waiters: usize,
    acquisitions: u64,
}

/// The global token serializing interpreters that share code units.
///
/// A thread that wants the lock asks the holder to drop it through the
/// holder's eval breaker; the holder hands it over at its next tick.
#[derive(Debug, Default)]
pub struct InterpreterLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl InterpreterLock {
    /// Create an unheld lock
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the current thread holds the lock
    ///
    /// `breaker` is the requesting interpreter's breaker; later waiters use
    /// it to ask for a handoff.
    pub fn acquire(&self, breaker: &Arc<EvalBreaker>) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            return;
        }
        state.waiters += 1;
        while state.owner.is_some() {
            if let Some(holder) = &state.holder {
                holder.request_drop();
            }
            self.changed.wait_for(&mut state, SWITCH_INTERVAL);
        }
        state.waiters -= 1;
        state.owner = Some(me);
        state.holder = Some(Arc::clone(breaker));
        state.acquisitions += 1;
    }

    /// Release the lock if the current thread holds it
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return;
        }
        state.owner = None;
        state.holder = None;
        drop(state);
        self.changed.notify_all();
    }

    /// Hand the lock to a waiting thread, then take it back
    ///
    /// Returns immediately when nobody is waiting.
    pub fn yield_to_waiters(&self, breaker: &Arc<EvalBreaker>) {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) || state.waiters == 0 {
                return;
            }
            let seen = state.acquisitions;
            state.owner = None;
            state.holder = None;
            self.changed.notify_all();
            while state.acquisitions == seen && state.waiters > 0 {
                self.changed.wait_for(&mut state, SWITCH_INTERVAL);
            }
        }
        self.acquire(breaker);
    }

    /// Hold the lock for the guard's lifetime
    pub fn hold<'a>(&'a self, breaker: &Arc<EvalBreaker>) -> LockGuard<'a> {
        self.acquire(breaker);
        LockGuard { lock: self }
    }

    /// Whether the calling thread holds the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Threads blocked in [`acquire`](Self::acquire)
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Total successful acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.state.lock().acquisitions
    }
}

/// Releases the interpreter lock on drop
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a InterpreterLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
