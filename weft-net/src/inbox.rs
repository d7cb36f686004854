//! Cross-thread FIFO inboxes and the deficit-round-robin arbiter.
//!
//! An [`Inbox`] is the only shared mutable state between the multiplexer
//! thread and the rest of the process: any thread may enqueue, exactly one
//! consumer (the multiplexer thread) drains. The [`DrrArbiter`] sits between
//! an endpoint manager's two inboxes and meters how much of each the
//! consumer may take per round, so a flood of large messages cannot starve
//! control events and a burst of control events cannot starve messages.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Cost of a queued item under the arbiter's credit accounting.
pub trait TaskSize {
    /// The credit this item consumes when dequeued.
    fn task_size(&self) -> usize;
}

struct InboxInner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A multi-producer, single-consumer FIFO.
///
/// `try_enqueue` reports the empty→non-empty transition so producers know
/// when to wake the consumer; `close` refuses further enqueues and hands the
/// backlog to the caller for error delivery.
pub struct Inbox<T> {
    inner: Mutex<InboxInner<T>>,
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Inbox<T> {
    /// An empty, open inbox.
    pub fn new() -> Self {
        Inbox {
            inner: Mutex::new(InboxInner {
                queue: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Enqueue an item.
    ///
    /// Returns `Ok(true)` when the inbox was empty before this call (the
    /// producer must wake the consumer), `Ok(false)` otherwise, and
    /// `Err(item)` when the inbox is closed.
    pub fn try_enqueue(&self, item: T) -> Result<bool, T> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(item);
        }
        let was_empty = inner.queue.is_empty();
        inner.queue.push_back(item);
        Ok(was_empty)
    }

    /// Dequeue the oldest item, if any. Consumer side only.
    pub fn pop(&self) -> Option<T> {
        lock(&self.inner).queue.pop_front()
    }

    /// The cost of the item at the head, if any.
    pub fn head_size(&self) -> Option<usize>
    where
        T: TaskSize,
    {
        lock(&self.inner).queue.front().map(TaskSize::task_size)
    }

    /// Whether the inbox holds no items.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).queue.is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// Close the inbox and take the backlog. Further enqueues fail.
    pub fn close(&self) -> Vec<T> {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.queue.drain(..).collect()
    }

    /// Whether the inbox refuses new items.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

fn lock<T>(mutex: &Mutex<InboxInner<T>>) -> std::sync::MutexGuard<'_, InboxInner<T>> {
    // Producers never panic while holding the lock; recover the queue rather
    // than poisoning every later enqueue.
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Credit added to the control lane each round.
pub const CONTROL_QUANTUM: usize = 1;

/// Credit (in payload bytes) added to the message lane each round.
pub const MESSAGE_QUANTUM: usize = 4096;

/// Free-standing deficit-round-robin arbiter over two inboxes.
///
/// Each call to [`new_round`] grants both lanes their quantum; [`take_*`]
/// dequeues the head only while its cost fits in the lane's accumulated
/// deficit. A lane whose inbox is empty forfeits its deficit, so credit
/// never piles up while there is nothing to spend it on.
///
/// [`new_round`]: DrrArbiter::new_round
/// [`take_*`]: DrrArbiter::take_control
pub struct DrrArbiter {
    control_deficit: usize,
    message_deficit: usize,
    control_quantum: usize,
    message_quantum: usize,
}

impl Default for DrrArbiter {
    fn default() -> Self {
        Self::new(CONTROL_QUANTUM, MESSAGE_QUANTUM)
    }
}

impl DrrArbiter {
    /// An arbiter with explicit per-round quanta.
    pub fn new(control_quantum: usize, message_quantum: usize) -> Self {
        DrrArbiter {
            control_deficit: 0,
            message_deficit: 0,
            control_quantum,
            message_quantum,
        }
    }

    /// Start a round: grant both lanes their quantum.
    pub fn new_round(&mut self) {
        self.control_deficit += self.control_quantum;
        self.message_deficit += self.message_quantum;
    }

    /// Take from the control lane if its head is affordable.
    pub fn take_control<T: TaskSize>(&mut self, inbox: &Inbox<T>) -> Option<T> {
        Self::take(&mut self.control_deficit, inbox)
    }

    /// Take from the message lane if its head is affordable.
    pub fn take_message<T: TaskSize>(&mut self, inbox: &Inbox<T>) -> Option<T> {
        Self::take(&mut self.message_deficit, inbox)
    }

    fn take<T: TaskSize>(deficit: &mut usize, inbox: &Inbox<T>) -> Option<T> {
        match inbox.head_size() {
            Some(cost) if cost <= *deficit => {
                let item = inbox.pop()?;
                *deficit -= cost;
                Some(item)
            }
            Some(_) => None,
            None => {
                *deficit = 0;
                None
            }
        }
    }
}
