//! Callables that cross the boundary in either direction.
//!
//! A host closure handed to a guest and a guest function handed to the host
//! both become an entry in the [`CallbackTable`]. The entry pins the target
//! for as long as its count is positive; neither side's collector can see
//! references the other side holds, so lifetime is explicit.
//!
//! Closures that must run on the thread that created them are wrapped with
//! [`Affinity::CreatorThread`]. Calls from other threads are queued on the
//! creator's mailbox and block until the creator runs
//! [`Xllr::pump_callbacks`]. A creator thread that never pumps, or that is
//! itself blocked waiting on the caller, deadlocks that caller.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::arena::{Slab, SlotId};
use crate::dispatch::panic_message;
use crate::handle::RuntimeId;
use crate::plugin::{EntityToken, Fresh};
use crate::registry::PluginState;
use crate::{Binding, Cdt, Cdts, ErrorKind, FunctionId, Signature, Xllr, XllrError};

pub type HostFn = dyn Fn(&Cdts, &mut Cdts) -> Result<(), XllrError> + Send + Sync;

type PinnedFn = Rc<dyn Fn(&Cdts, &mut Cdts) -> Result<(), XllrError>>;

/// A callable value. Cloning copies the reference; counting is done with
/// [`Xllr::retain_callable`] and [`Xllr::release_callable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Callable {
    id: SlotId,
    signature: Arc<Signature>,
}

impl Callable {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn to_bits(&self) -> u64 {
        self.id.to_bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    #[default]
    Any,
    /// Must run on the thread that wrapped it.
    CreatorThread,
}

#[derive(Clone)]
pub(crate) enum Target {
    Host(Arc<HostFn>),
    Pinned {
        thread: ThreadId,
        mailbox: Arc<Mailbox>,
    },
    Function(FunctionId),
}

struct CallbackEntry {
    target: Target,
    signature: Arc<Signature>,
    count: u32,
}

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct Mailbox {
    jobs: Mutex<VecDeque<Job>>,
}

impl Mailbox {
    fn post(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    fn pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

/// A thread's mailbox, kept while pinned callables or queued jobs need it.
struct MailboxEntry {
    mailbox: Arc<Mailbox>,
    pinned: usize,
}

#[derive(Default)]
struct Reply {
    slot: Mutex<Option<Result<Cdts, XllrError>>>,
    ready: Condvar,
}

impl Reply {
    fn send(&self, result: Result<Cdts, XllrError>) {
        *self.slot.lock() = Some(result);
        self.ready.notify_one();
    }

    fn wait(&self) -> Result<Cdts, XllrError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.ready.wait(&mut slot);
        }
    }
}

thread_local! {
    // closures wrapped with CreatorThread affinity, keyed by (table, slot)
    static PINNED: RefCell<HashMap<(u64, SlotId), PinnedFn>> = RefCell::new(HashMap::new());
}

pub(crate) struct CallbackTable {
    owner: u64,
    entries: Mutex<Slab<CallbackEntry>>,
    mailboxes: Mutex<HashMap<ThreadId, MailboxEntry>>,
}

impl CallbackTable {
    pub(crate) fn new(owner: u64) -> Self {
        Self {
            owner,
            entries: Mutex::new(Slab::new()),
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, target: Target, signature: Arc<Signature>) -> Callable {
        let id = self.entries.lock().insert(CallbackEntry {
            target,
            signature: signature.clone(),
            count: 1,
        });
        Callable { id, signature }
    }

    /// The mailbox for a callable pinned to `thread`.
    fn mailbox(&self, thread: ThreadId) -> Arc<Mailbox> {
        let mut mailboxes = self.mailboxes.lock();
        let entry = mailboxes.entry(thread).or_insert_with(|| MailboxEntry {
            mailbox: Arc::default(),
            pinned: 0,
        });
        entry.pinned += 1;
        entry.mailbox.clone()
    }

    fn queued_for(&self, thread: ThreadId) -> Option<Arc<Mailbox>> {
        self.mailboxes
            .lock()
            .get(&thread)
            .map(|entry| entry.mailbox.clone())
    }

    /// A callable pinned to `thread` is gone.
    fn unpinned(&self, thread: ThreadId) {
        if let Some(entry) = self.mailboxes.lock().get_mut(&thread) {
            entry.pinned = entry.pinned.saturating_sub(1);
        }
        self.sweep(thread);
    }

    /// Drops the mailbox of `thread` once nothing is pinned there and
    /// nothing is queued.
    fn sweep(&self, thread: ThreadId) {
        let mut mailboxes = self.mailboxes.lock();
        let idle = mailboxes
            .get(&thread)
            .is_some_and(|entry| entry.pinned == 0 && entry.mailbox.is_empty());
        if idle {
            mailboxes.remove(&thread);
            trace!("dropped the callback mailbox of {thread:?}");
        }
    }

    pub(crate) fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().len()
    }

    fn target(&self, callable: &Callable) -> Result<(Target, Arc<Signature>), XllrError> {
        self.entries
            .lock()
            .get(callable.id)
            .map(|entry| (entry.target.clone(), entry.signature.clone()))
            .ok_or_else(|| stale(callable))
    }

    pub(crate) fn lookup(&self, bits: u64) -> Option<Callable> {
        let id = SlotId::from_bits(bits);
        self.entries.lock().get(id).map(|entry| Callable {
            id,
            signature: entry.signature.clone(),
        })
    }

    pub(crate) fn is_live(&self, callable: &Callable) -> bool {
        self.entries.lock().contains(callable.id)
    }

    fn retain(&self, callable: &Callable) -> Result<u32, XllrError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(callable.id).ok_or_else(|| stale(callable))?;
        entry.count += 1;
        Ok(entry.count)
    }

    /// Returns the target once the count reaches zero.
    fn release(&self, callable: &Callable) -> Result<Option<Target>, XllrError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(callable.id).ok_or_else(|| stale(callable))?;
        entry.count -= 1;
        if entry.count > 0 {
            return Ok(None);
        }
        Ok(entries.remove(callable.id).map(|entry| entry.target))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Live guest callables exported by `runtime`.
    pub(crate) fn live_for(&self, runtime: RuntimeId) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.target, Target::Function(function) if function.runtime() == runtime)
            })
            .count()
    }
}

impl Drop for CallbackTable {
    fn drop(&mut self) {
        let live = self.entries.get_mut().len();
        if live > 0 {
            warn!("callback table dropped with {live} live callables");
        }
    }
}

fn stale(callable: &Callable) -> XllrError {
    XllrError::UnknownFunction(format!("callable {:#x}", callable.to_bits()))
}

/// Callback failures surface as a failed call, one boundary at a time.
fn callback_failure(err: XllrError) -> XllrError {
    match err.kind() {
        ErrorKind::InvocationFailed => err,
        _ => XllrError::invocation(format!("callback failed: {err}")),
    }
}

fn run_host(
    f: &dyn Fn(&Cdts, &mut Cdts) -> Result<(), XllrError>,
    params: &Cdts,
    retvals: &mut Cdts,
) -> Result<(), XllrError> {
    match panic::catch_unwind(AssertUnwindSafe(|| f(params, retvals))) {
        Ok(result) => result.map_err(callback_failure),
        Err(payload) => Err(XllrError::invocation(format!(
            "callback panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn run_pinned(owner: u64, id: SlotId, params: &Cdts, retvals: &mut Cdts) -> Result<(), XllrError> {
    let f = PINNED
        .with(|pinned| pinned.borrow().get(&(owner, id)).cloned())
        .ok_or_else(|| {
            XllrError::UnknownFunction(format!("pinned callable {:#x}", id.to_bits()))
        })?;
    run_host(&*f, params, retvals)
}

fn unpin(owner: u64, id: SlotId) {
    PINNED.with(|pinned| pinned.borrow_mut().remove(&(owner, id)));
}

/// Host-invocable view of a guest callable. Holds a reference for as long
/// as it lives.
pub struct GuestFunction {
    xllr: Xllr,
    callable: Callable,
}

impl GuestFunction {
    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn signature(&self) -> &Signature {
        self.callable.signature()
    }

    pub fn call(&self, params: impl IntoIterator<Item = Cdt>) -> Result<Cdts, XllrError> {
        self.xllr
            .call_callable(&self.callable, params.into_iter().collect())
    }

    pub fn call_into(&self, params: &Cdts, retvals: &mut Cdts) -> Result<(), XllrError> {
        self.xllr.call_callable_into(&self.callable, params, retvals)
    }
}

impl std::fmt::Debug for GuestFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestFunction")
            .field("callable", &self.callable)
            .finish()
    }
}

impl Drop for GuestFunction {
    fn drop(&mut self) {
        if let Err(err) = self.xllr.release_callable(&self.callable) {
            warn!("releasing guest callable on drop failed: {err}");
        }
    }
}

impl Xllr {
    /// Wraps a host closure so guests can call it. The callable starts with
    /// a count of one, held by the caller.
    ///
    /// Handles and callables the closure returns are retained for whoever
    /// called it; the closure keeps any references it already held.
    pub fn wrap_host_function<F>(&self, f: F, signature: Signature) -> Result<Callable, XllrError>
    where
        F: Fn(&Cdts, &mut Cdts) -> Result<(), XllrError> + Send + Sync + 'static,
    {
        signature.validate()?;
        let callable = self
            .inner
            .callbacks
            .insert(Target::Host(Arc::new(f)), Arc::new(signature));
        debug!("wrapped host function as callable {:#x}", callable.to_bits());
        Ok(callable)
    }

    /// Like [`wrap_host_function`](Self::wrap_host_function), with a thread
    /// constraint. `CreatorThread` closures need not be `Send`.
    ///
    /// Calls from other threads wait until the creating thread runs
    /// [`pump_callbacks`](Self::pump_callbacks); a creator that never pumps
    /// blocks them forever.
    pub fn wrap_host_function_pinned<F>(
        &self,
        f: F,
        signature: Signature,
    ) -> Result<Callable, XllrError>
    where
        F: Fn(&Cdts, &mut Cdts) -> Result<(), XllrError> + 'static,
    {
        signature.validate()?;
        let thread = thread::current().id();
        let mailbox = self.inner.callbacks.mailbox(thread);
        let callable = self
            .inner
            .callbacks
            .insert(Target::Pinned { thread, mailbox }, Arc::new(signature));
        let f: PinnedFn = Rc::new(f);
        PINNED.with(|pinned| {
            pinned
                .borrow_mut()
                .insert((self.inner.callbacks.owner, callable.id), f)
        });
        debug!(
            "wrapped host function as callable {:#x} pinned to {thread:?}",
            callable.to_bits()
        );
        Ok(callable)
    }

    pub fn wrap_host_function_with<F>(
        &self,
        f: F,
        signature: Signature,
        affinity: Affinity,
    ) -> Result<Callable, XllrError>
    where
        F: Fn(&Cdts, &mut Cdts) -> Result<(), XllrError> + Send + Sync + 'static,
    {
        match affinity {
            Affinity::Any => self.wrap_host_function(f, signature),
            Affinity::CreatorThread => self.wrap_host_function_pinned(f, signature),
        }
    }

    /// Turns a callable received from a guest into something the host can
    /// call. `expected` is bound against the callable's own signature the
    /// same way entity signatures are.
    pub fn wrap_guest_callable(
        &self,
        cdt: &Cdt,
        expected: &Signature,
    ) -> Result<GuestFunction, XllrError> {
        let callable = cdt.as_callable().ok_or_else(|| {
            XllrError::InvalidValue(format!("expected callable, found {}", cdt.cdt_type()))
        })?;
        Binding::bind(callable.signature(), expected)?;
        self.retain_callable(callable)?;
        Ok(GuestFunction {
            xllr: self.clone(),
            callable: callable.clone(),
        })
    }

    pub fn retain_callable(&self, callable: &Callable) -> Result<(), XllrError> {
        let count = self.inner.callbacks.retain(callable)?;
        trace!("retain callable {:#x} -> {count}", callable.to_bits());
        Ok(())
    }

    pub fn release_callable(&self, callable: &Callable) -> Result<(), XllrError> {
        let Some(target) = self.inner.callbacks.release(callable)? else {
            return Ok(());
        };
        trace!("callable {:#x} released", callable.to_bits());
        match target {
            Target::Host(_) => {}
            Target::Pinned { thread, mailbox } => {
                let owner = self.inner.callbacks.owner;
                let id = callable.id;
                if thread::current().id() == thread {
                    unpin(owner, id);
                } else {
                    mailbox.post(Box::new(move || unpin(owner, id)));
                }
                self.inner.callbacks.unpinned(thread);
            }
            Target::Function(function) => self.release_function(function),
        }
        Ok(())
    }

    pub fn call_callable(&self, callable: &Callable, params: Cdts) -> Result<Cdts, XllrError> {
        let mut retvals = Cdts::with_capacity(callable.signature().retvals.len());
        self.call_callable_into(callable, &params, &mut retvals)?;
        Ok(retvals)
    }

    pub fn call_callable_into(
        &self,
        callable: &Callable,
        params: &Cdts,
        retvals: &mut Cdts,
    ) -> Result<(), XllrError> {
        let (target, signature) = self.inner.callbacks.target(callable)?;
        if params.len() != signature.params.len() {
            return Err(XllrError::WrongParamCount {
                expected: signature.params.len(),
                got: params.len(),
            });
        }
        signature.check_params(params)?;
        retvals.reset(signature.retvals.len());

        let result = match target {
            Target::Function(function) => return self.invoke(function, params, retvals),
            Target::Host(f) => run_host(&*f, params, retvals),
            Target::Pinned { thread, mailbox } => {
                let owner = self.inner.callbacks.owner;
                if thread::current().id() == thread {
                    run_pinned(owner, callable.id, params, retvals)
                } else {
                    trace!(
                        "marshalling callable {:#x} onto {thread:?}",
                        callable.to_bits()
                    );
                    let reply = Arc::new(Reply::default());
                    let sender = reply.clone();
                    let id = callable.id;
                    let params = params.clone();
                    let capacity = retvals.capacity();
                    mailbox.post(Box::new(move || {
                        let mut out = Cdts::with_capacity(capacity);
                        let result = run_pinned(owner, id, &params, &mut out).map(|()| out);
                        sender.send(result);
                    }));
                    reply.wait().map(|out| *retvals = out)
                }
            }
        };
        // host closures mint nothing, so every reference they return is retained
        let result = result
            .and_then(|()| signature.check_retvals(retvals))
            .and_then(|()| self.adopt(retvals, Fresh::default()));
        if result.is_err() {
            retvals.clear();
        }
        result
    }

    /// Runs callbacks queued for the current thread by other threads.
    /// Returns how many ran.
    pub fn pump_callbacks(&self) -> usize {
        let thread = thread::current().id();
        let Some(mailbox) = self.inner.callbacks.queued_for(thread) else {
            return 0;
        };
        let mut ran = 0;
        while let Some(job) = mailbox.pop() {
            job();
            ran += 1;
        }
        self.inner.callbacks.sweep(thread);
        ran
    }

    pub fn live_callables(&self) -> usize {
        self.inner.callbacks.len()
    }

    pub(crate) fn export_guest_callable(
        &self,
        state: &PluginState,
        entity: EntityToken,
        signature: Signature,
    ) -> Result<Callable, XllrError> {
        signature.validate()?;
        let signature = Arc::new(signature);
        let function =
            state.add_function(entity, signature.clone(), Arc::new(Binding::Static), "<callable>");
        let callable = self
            .inner
            .callbacks
            .insert(Target::Function(function), signature);
        debug!(
            "{}: exported guest callable {:#x} as {function}",
            state.name,
            callable.to_bits()
        );
        Ok(callable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TypeDescriptor, XllrCreateInfo};

    fn add_signature() -> Signature {
        Signature::new(
            [TypeDescriptor::INT64, TypeDescriptor::INT64],
            [TypeDescriptor::INT64],
        )
    }

    fn add(params: &Cdts, retvals: &mut Cdts) -> Result<(), XllrError> {
        let sum = params[0].get::<i64>()? + params[1].get::<i64>()?;
        retvals.push(sum)
    }

    #[test]
    fn host_function_is_callable_until_released() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callable = xllr.wrap_host_function(add, add_signature()).expect("wrap");
        for _ in 0..5 {
            let out = xllr
                .call_callable(&callable, Cdts::from_vec(vec![Cdt::Int64(1), Cdt::Int64(2)]))
                .expect("call");
            assert_eq!(out[0], Cdt::Int64(3));
        }

        xllr.retain_callable(&callable).expect("retain");
        xllr.release_callable(&callable).expect("release");
        assert_eq!(xllr.live_callables(), 1);
        xllr.release_callable(&callable).expect("final release");
        assert_eq!(xllr.live_callables(), 0);

        let err = xllr
            .call_callable(&callable, Cdts::from_vec(vec![Cdt::Int64(1), Cdt::Int64(2)]))
            .expect_err("released");
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
    }

    #[test]
    fn callback_arity_and_types_are_checked() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callable = xllr.wrap_host_function(add, add_signature()).expect("wrap");
        let err = xllr
            .call_callable(&callable, Cdts::from_vec(vec![Cdt::Int64(1)]))
            .expect_err("arity");
        assert_eq!(err.kind(), ErrorKind::WrongParamCount);
        let err = xllr
            .call_callable(&callable, Cdts::from_vec(vec![Cdt::Int64(1), "2".into()]))
            .expect_err("type");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        xllr.release_callable(&callable).expect("release");
    }

    #[test]
    fn failing_and_panicking_callbacks_become_invocation_failures() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let sig = Signature::new([], []);
        let failing = xllr
            .wrap_host_function(
                |_: &Cdts, _: &mut Cdts| Err(XllrError::InvalidValue("nope".into())),
                sig.clone(),
            )
            .expect("wrap");
        let panicking = xllr
            .wrap_host_function(|_: &Cdts, _: &mut Cdts| panic!("kaboom"), sig)
            .expect("wrap");

        let err = xllr.call_callable(&failing, Cdts::default()).expect_err("fails");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        assert!(err.to_string().contains("nope"));

        let err = xllr.call_callable(&panicking, Cdts::default()).expect_err("panics");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        assert!(err.to_string().contains("kaboom"));

        xllr.release_callable(&failing).expect("release");
        xllr.release_callable(&panicking).expect("release");
    }

    #[test]
    fn missing_return_values_are_reported() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callable = xllr
            .wrap_host_function(
                |_: &Cdts, _: &mut Cdts| Ok(()),
                Signature::new([], [TypeDescriptor::INT64]),
            )
            .expect("wrap");
        let err = xllr.call_callable(&callable, Cdts::default()).expect_err("no retval");
        assert_eq!(err.kind(), ErrorKind::InvocationFailed);
        xllr.release_callable(&callable).expect("release");
    }

    #[test]
    fn pinned_callbacks_run_on_their_creator_thread() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let creator = thread::current().id();
        // Rc makes the closure !Send; it only ever runs here
        let calls = Rc::new(RefCell::new(0));
        let seen = calls.clone();
        let callable = xllr
            .wrap_host_function_pinned(
                move |params: &Cdts, retvals: &mut Cdts| {
                    assert_eq!(thread::current().id(), creator);
                    *seen.borrow_mut() += 1;
                    add(params, retvals)
                },
                add_signature(),
            )
            .expect("wrap");

        let remote = {
            let xllr = xllr.clone();
            let callable = callable.clone();
            thread::spawn(move || {
                xllr.call_callable(
                    &callable,
                    Cdts::from_vec(vec![Cdt::Int64(20), Cdt::Int64(22)]),
                )
            })
        };
        while !remote.is_finished() {
            xllr.pump_callbacks();
            thread::yield_now();
        }
        let out = remote.join().expect("thread").expect("marshalled call");
        assert_eq!(out[0], Cdt::Int64(42));

        let out = xllr
            .call_callable(&callable, Cdts::from_vec(vec![Cdt::Int64(1), Cdt::Int64(2)]))
            .expect("direct call on creator");
        assert_eq!(out[0], Cdt::Int64(3));
        assert_eq!(*calls.borrow(), 2);
        xllr.release_callable(&callable).expect("release");
    }

    #[test]
    fn mailboxes_go_with_their_last_pinned_callable() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callbacks = &xllr.inner.callbacks;
        let first = xllr.wrap_host_function_pinned(add, add_signature()).expect("wrap");
        let second = xllr.wrap_host_function_pinned(add, add_signature()).expect("wrap");
        assert_eq!(callbacks.mailbox_count(), 1);

        xllr.release_callable(&first).expect("release");
        assert_eq!(callbacks.mailbox_count(), 1);
        {
            // released elsewhere: the unpin job keeps the mailbox until pumped
            let xllr = xllr.clone();
            let second = second.clone();
            thread::spawn(move || xllr.release_callable(&second))
                .join()
                .expect("thread")
                .expect("release");
        }
        assert_eq!(callbacks.mailbox_count(), 1);
        assert_eq!(xllr.pump_callbacks(), 1);
        assert_eq!(callbacks.mailbox_count(), 0);
        assert_eq!(xllr.pump_callbacks(), 0);
        assert_eq!(xllr.live_callables(), 0);
    }

    #[test]
    fn host_callbacks_hand_out_owned_references() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let inner = xllr.wrap_host_function(add, add_signature()).expect("wrap");
        let returned = inner.clone();
        let factory = xllr
            .wrap_host_function(
                move |_: &Cdts, retvals: &mut Cdts| retvals.push(returned.clone()),
                Signature::new([], [TypeDescriptor::CALLABLE]),
            )
            .expect("wrap");
        let out = xllr.call_callable(&factory, Cdts::default()).expect("factory");
        assert_eq!(out[0], Cdt::Callable(inner.clone()));

        xllr.release_callable(&inner).expect("wrapper's reference");
        assert_eq!(xllr.live_callables(), 2);
        xllr.release_values(&out).expect("returned reference");
        assert_eq!(xllr.live_callables(), 1);
        xllr.release_callable(&factory).expect("release");
    }

    #[test]
    fn guest_function_holds_a_reference() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callable = xllr.wrap_host_function(add, add_signature()).expect("wrap");
        let function = xllr
            .wrap_guest_callable(&Cdt::Callable(callable.clone()), &add_signature())
            .expect("unwrap");
        xllr.release_callable(&callable).expect("caller's reference");
        assert_eq!(xllr.live_callables(), 1);

        let out = function.call([Cdt::Int64(2), Cdt::Int64(3)]).expect("call");
        assert_eq!(out[0], Cdt::Int64(5));
        drop(function);
        assert_eq!(xllr.live_callables(), 0);
    }

    #[test]
    fn guest_callable_signature_must_bind() {
        let xllr = Xllr::new(XllrCreateInfo::default());
        let callable = xllr.wrap_host_function(add, add_signature()).expect("wrap");
        let wrong = Signature::new([TypeDescriptor::STRING8], [TypeDescriptor::INT64]);
        let err = xllr
            .wrap_guest_callable(&Cdt::Callable(callable.clone()), &wrong)
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
        let err = xllr
            .wrap_guest_callable(&Cdt::Int64(1), &add_signature())
            .expect_err("not a callable");
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        xllr.release_callable(&callable).expect("release");
    }
}
