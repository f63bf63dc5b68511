//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, error};

use crate::context;
use crate::errors::TaskError;
use crate::runtime::Runtime;
use crate::store::TaskId;

/// The executor pool: workers block on the work queue and drive whatever
/// comes off it. Workers contain their own errors: a task failure is
/// recorded on the task, an internal error is logged, and neither ends the
/// loop.
pub(crate) struct Dispatcher {
    shutdown: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn start(rt: &Arc<Runtime>, worker_count: usize) -> Self {
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let workers = (0..worker_count)
            .map(|n| {
                let rt = rt.clone();
                let jobs = rt.queue().receiver();
                let shutdown_rx = shutdown_rx.clone();

                std::thread::Builder::new()
                    .name(format!("redrive-worker-{n}"))
                    .spawn(move || worker_loop(rt, jobs, shutdown_rx))
                    .expect("couldn't spawn a worker thread")
            })
            .collect();

        Self { shutdown, workers }
    }

    /// Closes the shutdown channel and joins the pool. Tasks already mid-run
    /// finish their current pass.
    pub(crate) fn stop(self) {
        drop(self.shutdown);

        for worker in self.workers {
            if worker.join().is_err() {
                error!("a worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(rt: Arc<Runtime>, jobs: Receiver<TaskId>, shutdown: Receiver<()>) {
    debug!("worker up");

    loop {
        select! {
            recv(jobs) -> msg => match msg {
                Ok(id) => run_one(&rt, id),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }

    debug!("worker down");
}

/// Drive one popped id through the function registered for it.
pub(crate) fn run_one(rt: &Arc<Runtime>, id: TaskId) {
    debug!("popped task {id}");

    context::set_dispatched_id(Some(id.clone()));

    let result = catch_unwind(AssertUnwindSafe(|| drive(rt, &id)));

    // the wrapper takes the slot on entry; clear it for the error paths
    // that never reach the wrapper
    context::set_dispatched_id(None);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("internal error while driving task {id}: {e}"),
        Err(_) => error!("caught a panic outside any task body while driving {id}"),
    }
}

fn drive(rt: &Arc<Runtime>, id: &TaskId) -> Result<(), TaskError> {
    let handle = rt.store().handle(id)?;

    let (ident, data) = {
        let guard = handle.lock();
        (guard.ident.clone(), guard.data.clone())
    };

    let entry = rt
        .registry()
        .get(&ident)
        .ok_or_else(|| TaskError::internal(format!("no function registered for {ident}")))?;

    (entry.run)(rt, data)
}
