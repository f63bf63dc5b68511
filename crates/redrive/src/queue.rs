//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

use crate::store::TaskId;

/// FIFO of task ids that are ready to (re-)execute.
///
/// The queue carries ids only: a worker re-reads the full record from the
/// store on pop, so a queued id always reflects the record's latest state.
/// The channel is unbounded; `put` never blocks and never drops.
pub struct WorkQueue {
    tx: Sender<TaskId>,
    rx: Receiver<TaskId>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub(crate) fn put(&self, id: TaskId) {
        debug!("enqueued task {id}");
        if let Err(e) = self.tx.send(id) {
            // unreachable while the queue owns its receiver
            error!("work queue closed, dropped id {}", e.0);
        }
    }

    pub fn try_pop(&self) -> Option<TaskId> {
        self.rx.try_recv().ok()
    }

    /// A receiver for a dispatcher worker to block on. Each queued id is
    /// delivered to exactly one receiver.
    pub(crate) fn receiver(&self) -> Receiver<TaskId> {
        self.rx.clone()
    }

    /// How many deliveries are waiting right now.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_fifo_order() {
        let queue = WorkQueue::new();
        let first = TaskId::random();
        let second = TaskId::random();

        queue.put(first.clone());
        queue.put(second.clone());

        assert_eq!(queue.try_pop(), Some(first));
        assert_eq!(queue.try_pop(), Some(second));
        assert_eq!(queue.try_pop(), None);
    }
}
