//! Per-session queue of messages awaiting delivery.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{DeltaPath, Message};

#[derive(Default)]
struct Pending {
    queue: Vec<Message>,
    /// Queue index of the latest message for each target path.
    by_path: HashMap<DeltaPath, usize>,
}

/// Ordered outbox for one session.
///
/// The session's script run is the only producer and the dispatch loop is the
/// only consumer. A message whose target path matches a queued one replaces it
/// in place, so superseded intermediate UI states are never sent.
#[derive(Default)]
pub struct SessionOutbox {
    inner: Mutex<Pending>,
}

impl SessionOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message, coalescing with a pending message at the same path.
    pub fn enqueue(&self, msg: Message) {
        Self::push(&mut self.lock(), msg);
    }

    fn push(pending: &mut Pending, msg: Message) {
        let Some(path) = msg.target_path().map(<[u32]>::to_vec) else {
            pending.queue.push(msg);
            return;
        };

        if let Some(&index) = pending.by_path.get(&path) {
            pending.queue[index] = msg;
        } else {
            let index = pending.queue.len();
            pending.queue.push(msg);
            pending.by_path.insert(path, index);
        }
    }

    /// Take every pending message in enqueue order.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        let mut pending = self.lock();
        pending.by_path.clear();
        std::mem::take(&mut pending.queue)
    }

    /// Put undelivered messages back ahead of anything queued since they were
    /// drained.
    ///
    /// Newer messages still supersede restored ones at the same target path.
    pub fn restore(&self, undelivered: Vec<Message>) {
        let mut pending = self.lock();
        let newer = std::mem::take(&mut pending.queue);
        pending.by_path.clear();
        for msg in undelivered.into_iter().chain(newer) {
            Self::push(&mut pending, msg);
        }
    }

    /// Discard every pending message.
    pub fn clear(&self) {
        let mut pending = self.lock();
        pending.queue.clear();
        pending.by_path.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}
