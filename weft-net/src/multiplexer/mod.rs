//! The I/O multiplexer.
//!
//! One [`Multiplexer`] owns a poll set and services every socket manager
//! registered with it. Exactly one thread drives [`run`]; everyone else
//! talks to the poll set through a [`MultiplexerHandle`], which queues a
//! [`PollsetOp`] and wakes the loop by writing one opcode byte into the
//! internal pipe (serviced by the pollset updater, itself a socket manager).
//!
//! Events for a single manager are dispatched serially; ordering across
//! managers is whatever the OS poll returns. Registration is level-
//! triggered, so a writable socket that still has queued bytes is
//! guaranteed to be re-polled.
//!
//! [`run`]: Multiplexer::run

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, trace, warn};
use weft_core::{NetError, NetResult};

mod timer;
mod updater;

pub use timer::TimeoutTag;

use timer::TimerQueue;
use updater::PollsetUpdater;

/// Token of the pollset updater's pipe.
const UPDATER_TOKEN: Token = Token(0);

/// Upper bound on events fetched per poll.
const EVENT_CAPACITY: usize = 128;

/// A handler for readiness events on one socket.
///
/// `handle_read_event` returning `false` unregisters the manager (fatal
/// error or clean EOF). `handle_write_event` returning `false` only clears
/// the write interest — the manager stays registered for reads.
pub trait SocketManager: Send {
    /// The mio source to (de)register with the poll set.
    fn source(&mut self) -> &mut dyn mio::event::Source;

    /// The socket is readable. Return `false` to unregister.
    fn handle_read_event(&mut self, ctx: &mut MpxContext) -> bool;

    /// The socket is writable. Return `false` to clear the write interest.
    fn handle_write_event(&mut self, ctx: &mut MpxContext) -> bool;

    /// A timeout armed for this manager fired.
    fn handle_timeout(&mut self, _ctx: &mut MpxContext, _tag: TimeoutTag, _id: u64) {}

    /// An error was observed on the socket. The multiplexer unregisters the
    /// manager afterwards.
    fn handle_error(&mut self, err: NetError);

    /// The multiplexer is shutting down; fail pending work with `reason`.
    fn abort(&mut self, reason: &NetError);
}

/// Per-dispatch context handed to socket manager callbacks.
///
/// Interest changes requested here are applied by the multiplexer after the
/// callback returns, so a read handler that queued outbound bytes can ask
/// for the write mask without touching the registry itself.
pub struct MpxContext {
    token: Token,
    want_write: bool,
}

impl MpxContext {
    pub(crate) fn new(token: Token) -> Self {
        MpxContext {
            token,
            want_write: false,
        }
    }

    /// The token of the manager being dispatched.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Request the write interest after this callback returns.
    pub fn register_writing(&mut self) {
        self.want_write = true;
    }
}

/// A pollset operation queued from outside the multiplexer thread.
pub(crate) enum PollsetOp {
    /// Register a new manager with an initial interest set.
    Register(Box<dyn SocketManager>, Token, Interest),
    /// Add interests to a registered manager.
    MaskAdd(Token, Interest),
    /// Remove interests from a registered manager.
    MaskDel(Token, Interest),
    /// Unregister a manager and close its socket.
    Close(Token),
    /// Arm a timeout for a manager.
    SetTimeout {
        /// Target manager.
        token: Token,
        /// Absolute deadline.
        deadline: Instant,
        /// Timer family.
        tag: TimeoutTag,
        /// Pre-allocated timer id.
        id: u64,
    },
    /// Suppress a previously armed timeout.
    CancelTimeout(u64),
    /// Sentinel: drain and exit the run loop.
    Shutdown,
}

impl PollsetOp {
    /// The opcode byte written into the wakeup pipe for this operation.
    fn opcode(&self) -> u8 {
        match self {
            PollsetOp::Register(..) => 0,
            PollsetOp::MaskAdd(..) => 1,
            PollsetOp::MaskDel(..) => 2,
            PollsetOp::Close(..) => 3,
            PollsetOp::SetTimeout { .. } => 4,
            PollsetOp::CancelTimeout(..) => 5,
            PollsetOp::Shutdown => 6,
        }
    }
}

struct MpxShared {
    /// Pending operations; also the map keeping not-yet-consumed managers
    /// alive until the loop picks them up.
    ops: Mutex<VecDeque<PollsetOp>>,
    pipe_tx: Mutex<pipe::Sender>,
    next_token: AtomicUsize,
    next_timeout: AtomicU64,
    shutting_down: AtomicBool,
}

/// Cloneable, thread-safe handle to a [`Multiplexer`].
#[derive(Clone)]
pub struct MultiplexerHandle {
    shared: Arc<MpxShared>,
}

impl MultiplexerHandle {
    /// Reserve a token for a manager that will be registered shortly.
    pub fn allocate_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a manager. The manager is owned by the pending queue until
    /// the multiplexer thread consumes the operation.
    pub fn register(
        &self,
        manager: Box<dyn SocketManager>,
        token: Token,
        interest: Interest,
    ) -> NetResult<()> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(NetError::ShuttingDown);
        }
        self.push(PollsetOp::Register(manager, token, interest));
        Ok(())
    }

    /// Add interests for a registered manager.
    pub fn mask_add(&self, token: Token, interest: Interest) {
        self.push(PollsetOp::MaskAdd(token, interest));
    }

    /// Remove interests for a registered manager.
    pub fn mask_del(&self, token: Token, interest: Interest) {
        self.push(PollsetOp::MaskDel(token, interest));
    }

    /// Unregister a manager and drop it (closing its socket).
    pub fn close(&self, token: Token) {
        self.push(PollsetOp::Close(token));
    }

    /// Arm a timeout for `token`; the manager's `handle_timeout` runs when
    /// the deadline passes. Returns the timer id.
    pub fn set_timeout(&self, token: Token, deadline: Instant, tag: TimeoutTag) -> u64 {
        let id = self.shared.next_timeout.fetch_add(1, Ordering::Relaxed);
        self.push(PollsetOp::SetTimeout {
            token,
            deadline,
            tag,
            id,
        });
        id
    }

    /// Suppress delivery of a previously armed timeout.
    pub fn cancel_timeout(&self, _tag: TimeoutTag, id: u64) {
        self.push(PollsetOp::CancelTimeout(id));
    }

    /// Post the shutdown sentinel. The run loop drains, closes all sockets,
    /// and exits.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.push(PollsetOp::Shutdown);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    fn push(&self, op: PollsetOp) {
        let opcode = op.opcode();
        {
            let mut ops = lock_ops(&self.shared.ops);
            ops.push_back(op);
        }
        self.wake(opcode);
    }

    fn wake(&self, opcode: u8) {
        use std::io::Write;
        let mut tx = match self.shared.pipe_tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tx.write(&[opcode]) {
            Ok(_) => {}
            // A full pipe already guarantees a pending wakeup.
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(?err, "failed to wake multiplexer"),
        }
    }
}

fn lock_ops(ops: &Mutex<VecDeque<PollsetOp>>) -> std::sync::MutexGuard<'_, VecDeque<PollsetOp>> {
    match ops.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Slot {
    manager: Box<dyn SocketManager>,
    /// Current interest set; `None` while the source sits outside the poll
    /// set (manager alive, no interests).
    interest: Option<Interest>,
}

/// The poll loop servicing all socket managers.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    managers: HashMap<Token, Slot>,
    timers: TimerQueue,
    shared: Arc<MpxShared>,
    shutting_down: bool,
}

impl Multiplexer {
    /// Create the poll set and the wakeup pipe, registering the pipe reader
    /// as the pollset updater.
    pub fn new() -> NetResult<Self> {
        let poll = Poll::new().map_err(|e| NetError::runtime(format!("poll creation: {e}")))?;
        let (tx, mut rx) =
            pipe::new().map_err(|e| NetError::runtime(format!("wakeup pipe: {e}")))?;
        poll.registry()
            .register(&mut rx, UPDATER_TOKEN, Interest::READABLE)
            .map_err(NetError::from)?;
        let mut managers: HashMap<Token, Slot> = HashMap::new();
        managers.insert(
            UPDATER_TOKEN,
            Slot {
                manager: Box::new(PollsetUpdater::new(rx)),
                interest: Some(Interest::READABLE),
            },
        );
        Ok(Multiplexer {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            managers,
            timers: TimerQueue::default(),
            shared: Arc::new(MpxShared {
                ops: Mutex::new(VecDeque::new()),
                pipe_tx: Mutex::new(tx),
                next_token: AtomicUsize::new(1),
                next_timeout: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
            shutting_down: false,
        })
    }

    /// A cloneable handle for cross-thread pollset updates.
    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a manager directly. Only valid on the multiplexer thread
    /// (or before the loop starts); other threads use
    /// [`MultiplexerHandle::register`].
    pub fn register_manager(
        &mut self,
        mut manager: Box<dyn SocketManager>,
        token: Token,
        interest: Interest,
    ) -> NetResult<()> {
        self.poll
            .registry()
            .register(manager.source(), token, interest)
            .map_err(NetError::from)?;
        self.managers.insert(
            token,
            Slot {
                manager,
                interest: Some(interest),
            },
        );
        debug!(token = token.0, "registered socket manager");
        Ok(())
    }

    /// Number of registered managers, excluding the pollset updater.
    pub fn manager_count(&self) -> usize {
        self.managers.len().saturating_sub(1)
    }

    /// Run until shutdown, then drain: abort every manager, close all
    /// sockets, and return.
    pub fn run(&mut self) {
        debug!("multiplexer loop starting");
        while !self.shutting_down {
            if let Err(err) = self.poll_once(true) {
                error!(%err, "multiplexer poll failed");
                break;
            }
        }
        self.teardown();
        debug!("multiplexer loop finished");
    }

    /// One iteration of the loop: apply pending operations, poll (blocking
    /// or not), dispatch readiness events, fire due timers. Returns whether
    /// any event was dispatched.
    pub fn poll_once(&mut self, blocking: bool) -> NetResult<bool> {
        self.apply_pending();
        if self.shutting_down {
            return Ok(false);
        }
        let now = Instant::now();
        let timeout = if blocking {
            self.timers.until_next(now)
        } else {
            Some(Duration::ZERO)
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                    event.is_error(),
                )
            })
            .collect();
        let dispatched = !ready.is_empty();
        for (token, readable, writable, errored) in ready {
            self.dispatch(token, readable, writable, errored);
            // Apply between dispatches so a manager registered by an accept
            // handler is in place before its first events arrive.
            self.apply_pending();
        }
        self.fire_timers();
        self.apply_pending();
        Ok(dispatched)
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        let Some(slot) = self.managers.get_mut(&token) else {
            // Stale event for a manager removed earlier in this batch.
            return;
        };
        let mut ctx = MpxContext::new(token);
        let mut remove = false;
        let mut interest = slot.interest;

        if errored && !readable && !writable {
            slot.manager
                .handle_error(NetError::runtime("socket error event"));
            remove = true;
        } else {
            if readable && !slot.manager.handle_read_event(&mut ctx) {
                trace!(token = token.0, "read handler unregistered manager");
                remove = true;
            }
            if !remove && writable && !slot.manager.handle_write_event(&mut ctx) {
                interest = interest.and_then(|i| i.remove(Interest::WRITABLE));
            }
            if !remove && ctx.want_write {
                interest = Some(match interest {
                    Some(i) => i | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }
        }

        if remove {
            self.remove_manager(token);
        } else {
            self.update_interest(token, interest);
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for (token, tag, id) in self.timers.pop_expired(now) {
            let Some(slot) = self.managers.get_mut(&token) else {
                continue;
            };
            let mut ctx = MpxContext::new(token);
            slot.manager.handle_timeout(&mut ctx, tag, id);
            if ctx.want_write {
                let interest = Some(match slot.interest {
                    Some(i) => i | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
                self.update_interest(token, interest);
            }
        }
    }

    fn apply_pending(&mut self) {
        loop {
            let op = lock_ops(&self.shared.ops).pop_front();
            let Some(op) = op else { break };
            self.apply(op);
        }
    }

    fn apply(&mut self, op: PollsetOp) {
        match op {
            PollsetOp::Register(manager, token, interest) => {
                if let Err(err) = self.register_manager(manager, token, interest) {
                    error!(%err, token = token.0, "deferred registration failed");
                }
            }
            PollsetOp::MaskAdd(token, add) => {
                let Some(slot) = self.managers.get(&token) else {
                    return;
                };
                let interest = Some(match slot.interest {
                    Some(i) => i | add,
                    None => add,
                });
                self.update_interest(token, interest);
            }
            PollsetOp::MaskDel(token, del) => {
                let Some(slot) = self.managers.get(&token) else {
                    return;
                };
                let interest = slot.interest.and_then(|i| i.remove(del));
                self.update_interest(token, interest);
            }
            PollsetOp::Close(token) => {
                if let Some(slot) = self.managers.get_mut(&token) {
                    slot.manager.abort(&NetError::ShuttingDown);
                }
                self.remove_manager(token);
            }
            PollsetOp::SetTimeout {
                token,
                deadline,
                tag,
                id,
            } => self.timers.schedule(deadline, tag, token, id),
            PollsetOp::CancelTimeout(id) => self.timers.cancel(id),
            PollsetOp::Shutdown => {
                debug!("multiplexer shutdown requested");
                self.shutting_down = true;
            }
        }
    }

    /// Reconcile a manager's interest set with the poll registration.
    fn update_interest(&mut self, token: Token, interest: Option<Interest>) {
        let Some(slot) = self.managers.get_mut(&token) else {
            return;
        };
        if slot.interest == interest {
            return;
        }
        let registry = self.poll.registry();
        let result = match (slot.interest, interest) {
            (None, Some(new)) => registry.register(slot.manager.source(), token, new),
            (Some(_), Some(new)) => registry.reregister(slot.manager.source(), token, new),
            (Some(_), None) => registry.deregister(slot.manager.source()),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => slot.interest = interest,
            Err(err) => {
                error!(?err, token = token.0, "interest update failed");
                slot.manager.handle_error(err.into());
                self.remove_manager(token);
            }
        }
    }

    fn remove_manager(&mut self, token: Token) {
        if token == UPDATER_TOKEN {
            return;
        }
        let Some(mut slot) = self.managers.remove(&token) else {
            return;
        };
        if slot.interest.is_some() {
            if let Err(err) = self.poll.registry().deregister(slot.manager.source()) {
                warn!(?err, token = token.0, "deregister failed");
            }
        }
        debug!(token = token.0, "removed socket manager");
        // Dropping the slot closes the socket.
    }

    fn teardown(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        // Late-queued registrations also need the shutdown error.
        let pending: Vec<PollsetOp> = lock_ops(&self.shared.ops).drain(..).collect();
        for op in pending {
            if let PollsetOp::Register(mut manager, ..) = op {
                manager.abort(&NetError::ShuttingDown);
            }
        }
        let tokens: Vec<Token> = self.managers.keys().copied().collect();
        for token in tokens {
            if token == UPDATER_TOKEN {
                continue;
            }
            if let Some(slot) = self.managers.get_mut(&token) {
                slot.manager.abort(&NetError::ShuttingDown);
            }
            self.remove_manager(token);
        }
    }
}
