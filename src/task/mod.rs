// src/task/mod.rs
//! Owner-thread task queue
//!
//! Every heap belongs to the thread that created it. Work that must touch a
//! heap from another thread is posted to that heap's queue and executed by
//! the owner inside `run_pending`. The poster parks until the reply arrives
//! and keeps draining its own queue meanwhile, so two heaps that call into
//! each other from different threads do not deadlock.

use crate::heap::lock;
use std::sync::Mutex;
use std::thread::{self, Thread, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Unit of work executed on the queue owner's thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound for one park while polling a caller-supplied condition
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("target runtime has been dropped")]
    RuntimeGone,

    #[error("task queue is closed")]
    Closed,

    #[error("task was dropped before it completed")]
    Dropped,

    #[error("task queue can only be drained by its owner thread")]
    NotOwnerThread,
}

pub struct TaskQueue {
    owner: Thread,
    sender: mpsc::UnboundedSender<Task>,
    receiver: Mutex<mpsc::UnboundedReceiver<Task>>,
}

impl TaskQueue {
    /// Create a queue owned by the calling thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            owner: thread::current(),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner.id()
    }

    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner.id()
    }

    /// Enqueue a task and wake the owner if it is parked in a wait.
    pub fn post(&self, task: Task) -> Result<(), ScheduleError> {
        self.sender.send(task).map_err(|_| ScheduleError::Closed)?;
        self.owner.unpark();
        Ok(())
    }

    /// Enqueue `job` and return a handle to its result.
    pub fn submit<F, R>(&self, job: F) -> Result<Pending<R>, ScheduleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let reply = Reply {
            sender: Some(sender),
            waiter: thread::current(),
        };
        self.post(Box::new(move || reply.send(job())))?;
        Ok(Pending { receiver })
    }

    /// Run every queued task. Only the owner thread may drain the queue.
    pub fn run_pending(&self) -> Result<usize, ScheduleError> {
        if !self.is_owner_thread() {
            return Err(ScheduleError::NotOwnerThread);
        }

        let mut ran = 0;
        loop {
            // Guard released before the task runs; tasks may post or drain again.
            let task = match lock(&self.receiver).try_recv() {
                Ok(task) => task,
                Err(_) => break,
            };
            task();
            ran += 1;
        }
        Ok(ran)
    }

    /// Keep draining the queue until `done` returns true.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> Result<usize, ScheduleError> {
        let mut ran = 0;
        loop {
            ran += self.run_pending()?;
            if done() {
                return Ok(ran);
            }
            thread::park_timeout(POLL_INTERVAL);
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half handed to the task; wakes the waiter however the task ends.
struct Reply<R> {
    sender: Option<oneshot::Sender<R>>,
    waiter: Thread,
}

impl<R> Reply<R> {
    fn send(mut self, value: R) {
        if let Some(sender) = self.sender.take() {
            // The waiter may have given up; nothing to do then.
            let _ = sender.send(value);
        }
    }
}

impl<R> Drop for Reply<R> {
    fn drop(&mut self) {
        // Close the channel before waking, or the waiter could observe it still open.
        drop(self.sender.take());
        self.waiter.unpark();
    }
}

/// Result of a submitted task
pub struct Pending<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> Pending<R> {
    /// Block until the task has run. Tasks posted to `local` meanwhile are executed
    /// on this thread, which must own `local`.
    pub fn wait(mut self, local: Option<&TaskQueue>) -> Result<R, ScheduleError> {
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Ok(value),
                Err(oneshot::error::TryRecvError::Closed) => return Err(ScheduleError::Dropped),
                Err(oneshot::error::TryRecvError::Empty) => {
                    let ran = match local {
                        Some(queue) => queue.run_pending()?,
                        None => 0,
                    };
                    if ran == 0 {
                        thread::park();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_pending_executes_in_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            queue.post(Box::new(move || log.lock().unwrap().push(i))).unwrap();
        }

        assert_eq!(queue.run_pending(), Ok(3));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.run_pending(), Ok(0));
    }

    #[test]
    fn test_only_owner_drains() {
        let queue = Arc::new(TaskQueue::new());
        let remote = Arc::clone(&queue);

        let result = thread::spawn(move || remote.run_pending()).join().unwrap();
        assert_eq!(result, Err(ScheduleError::NotOwnerThread));
    }

    #[test]
    fn test_submit_from_foreign_thread() {
        let queue = Arc::new(TaskQueue::new());
        let owner = thread::current().id();
        let remote = Arc::clone(&queue);

        let worker = thread::spawn(move || {
            let pending = remote.submit(move || thread::current().id()).unwrap();
            pending.wait(None).unwrap()
        });

        queue.run_until(|| worker.is_finished()).unwrap();
        assert_eq!(worker.join().unwrap(), owner);
    }

    #[test]
    fn test_dropped_task_reports_dropped() {
        let queue = TaskQueue::new();
        let pending = queue.submit(|| 1).unwrap();
        drop(queue);

        assert_eq!(pending.wait(None), Err(ScheduleError::Dropped));
    }

    #[test]
    fn test_wait_drains_local_queue() {
        let local = TaskQueue::new();
        let target = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let pending = target.submit(|| 7).unwrap();

        // Only a task on the local queue completes the reply.
        let bump = Arc::clone(&counter);
        let remote = Arc::clone(&target);
        local
            .post(Box::new(move || {
                bump.fetch_add(1, Ordering::SeqCst);
                remote.run_pending().unwrap();
            }))
            .unwrap();

        assert_eq!(pending.wait(Some(&local)), Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
