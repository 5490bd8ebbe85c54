// src/executor.rs
// Single-writer FIFO executor. Every mutating operation and every
// public cursor exec runs as a task on one worker thread, so the
// indexes and the log only ever change in submission order.
//
// Tasks submitted before the datastore is loaded land in a buffer;
// once persistence signals readiness the buffer drains into the queue
// in arrival order. The load task itself is submitted force-queued so
// it bypasses its own buffer.

use crossbeam::channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;

use crate::error::{Result, VellumError};
use crate::log_trace;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct BufferState {
    ready: bool,
    buffer: Vec<Task>,
}

pub struct Executor {
    sender: Option<Sender<Task>>,
    state: Mutex<BufferState>,
    worker: Option<JoinHandle<()>>,
}

impl Executor {
    pub fn new() -> Result<Executor> {
        let (sender, receiver) = unbounded::<Task>();
        let worker = std::thread::Builder::new()
            .name("vellum-executor".to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })?;
        Ok(Executor {
            sender: Some(sender),
            state: Mutex::new(BufferState {
                ready: false,
                buffer: Vec::new(),
            }),
            worker: Some(worker),
        })
    }

    /// Run a task on the worker and block for its result. `forced`
    /// bypasses the pre-ready buffer (only the load task does this).
    pub fn submit<T, F>(&self, forced: bool, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        self.push(
            Box::new(move || {
                let _ = result_tx.send(f());
            }),
            forced,
        );
        result_rx
            .recv()
            .unwrap_or_else(|_| Err(VellumError::Internal("executor stopped".to_string())))
    }

    /// Enqueue a task without waiting for it. Used for work scheduled
    /// from within a running task (TTL removals, autocompaction ticks),
    /// which must not block the worker on itself, and for the autoload
    /// task (`forced`, like any load).
    pub fn push_detached(&self, forced: bool, task: Task) {
        self.push(task, forced);
    }

    fn push(&self, task: Task, forced: bool) {
        let mut state = self.state.lock();
        if state.ready || forced {
            if let Some(sender) = &self.sender {
                let _ = sender.send(task);
            }
        } else {
            log_trace!("executor not ready, buffering task");
            state.buffer.push(task);
        }
    }

    /// Drain the pre-ready buffer into the queue in arrival order and
    /// mark the executor ready
    pub fn process_buffer(&self) {
        let mut state = self.state.lock();
        state.ready = true;
        log_trace!("executor ready, draining {} buffered tasks", state.buffer.len());
        for task in state.buffer.drain(..) {
            if let Some(sender) = &self.sender {
                let _ = sender.send(task);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the queue and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
