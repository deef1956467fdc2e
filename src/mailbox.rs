//! A bounded, multi-producer / single-consumer mailbox of fixed-size command
//! records (spec.md §4.1, C1).
//!
//! Producers `enqueue` from any worker; only the owning worker drains with
//! `dequeue_burst`. Both directions are non-blocking: a full mailbox returns
//! `Err(Full(cmd))` to the producer instead of waiting, and an empty
//! mailbox returns immediately with however many commands were available.

use thiserror::Error;

/// Documented default capacity satisfying the source's `MAILBOX_MAX_ENTRIES`
/// contract. Overridable per mailbox via `Mailbox::with_capacity`.
pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Error, Debug)]
#[error("mailbox full")]
pub struct Full<T>(pub T);

/// Gives every dequeued command an explicit `free_entry` releasing its
/// backing slot (spec.md §4.1). A dequeued command already frees its slot
/// when dropped; this consumes `self` so that release is a named, one-time
/// step instead of an implicit side effect, matching the source contract's
/// "must be called exactly once per dequeued command."
pub trait MailboxEntry: Sized {
    fn free_entry(self) {
        drop(self);
    }
}

impl<T> MailboxEntry for T {}

/// The consumer half of a mailbox. Not `Clone`: spec.md requires a single
/// consumer, and making this type non-`Clone` makes that a compile-time
/// fact rather than a usage convention.
pub struct MailboxReceiver<T> {
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> MailboxReceiver<T> {
    /// Drains up to `max` commands in FIFO order. Never blocks: returns as
    /// soon as the mailbox runs dry, even if that is before `max` commands
    /// were found.
    pub fn dequeue_burst(&self, max: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(max.min(64));
        for _ in 0..max {
            match self.rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }
        batch
    }
}

/// A producer handle. `Clone` and `Send`: any worker may hold one and
/// enqueue without coordinating with other producers (FIFO is only
/// guaranteed per-producer, per spec.md §4.1).
#[derive(Clone)]
pub struct MailboxSender<T> {
    tx: crossbeam_channel::Sender<T>,
}

impl<T> MailboxSender<T> {
    /// Copies `cmd` into the mailbox's backing slot pool, or returns it back
    /// to the caller if the mailbox is full. Callers that can tolerate
    /// dropping their own work item on backpressure should just discard the
    /// `Full` payload; callers that must retry should requeue it on the next
    /// loop iteration, per spec.md §7.
    pub fn enqueue(&self, cmd: T) -> Result<(), Full<T>> {
        self.tx.try_send(cmd).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(cmd) => Full(cmd),
            crossbeam_channel::TrySendError::Disconnected(cmd) => Full(cmd),
        })
    }
}

/// Constructs a fresh mailbox with the default capacity.
pub fn channel<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    with_capacity(DEFAULT_CAPACITY)
}

pub fn with_capacity<T>(capacity: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (MailboxSender { tx }, MailboxReceiver { rx })
}
