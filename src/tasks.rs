//! Cooperative single-consumer work queue driving backup-side maintenance
//! (recovery filtering, garbage-collection probes, restart scans).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Outcome of one `perform_task` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task is complete; the queue drops it.
    Done,

    /// Task has future work; the queue re-enqueues it at the back.
    Reschedule,
}

/// One unit of cooperative background work. `perform_task` runs to
/// completion without preemption and must not block; long jobs split
/// themselves across invocations by returning `Reschedule`.
pub trait Task: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Makes some progress; never blocks.
    fn perform_task(&mut self) -> TaskOutcome;
}

/// FIFO queue of scheduled tasks. Production runs a dedicated worker loop;
/// test harnesses step it deterministically via `perform_task`.
pub struct TaskQueue {
    /// Scheduled tasks in FIFO order.
    queue: Mutex<VecDeque<Box<dyn Task>>>,

    /// Woken whenever a task is scheduled or an rpc a task polls completes.
    work: Arc<Notify>,
}

impl TaskQueue {
    /// Creates an empty task queue.
    pub fn new() -> Arc<Self> {
        Arc::new(TaskQueue {
            queue: Mutex::new(VecDeque::new()),
            work: Arc::new(Notify::new()),
        })
    }

    /// Handle tasks hand to rpc completions so the worker re-drains.
    pub fn work_notify(&self) -> Arc<Notify> {
        self.work.clone()
    }

    /// Enqueues a task at the back of the queue.
    pub fn schedule(&self, task: Box<dyn Task>) {
        pf_trace!("taskq"; "scheduled task {}", task.name());
        self.queue.lock().unwrap().push_back(task);
        self.work.notify_one();
    }

    /// Runs the task at the front of the queue, if any, re-enqueueing it if
    /// it asks to continue later. Returns true if a task ran. The queue lock
    /// is not held while the task runs, so tasks may schedule other tasks.
    pub fn perform_task(&self) -> bool {
        let task = self.queue.lock().unwrap().pop_front();
        match task {
            Some(mut task) => {
                match task.perform_task() {
                    TaskOutcome::Done => {
                        pf_trace!("taskq"; "task {} done", task.name());
                    }
                    TaskOutcome::Reschedule => {
                        self.queue.lock().unwrap().push_back(task);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Number of tasks currently enqueued.
    pub fn outstanding_tasks(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Spawns the worker loop that drains the queue whenever work arrives.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                while queue.perform_task() {
                    // yield between tasks so schedulers stay responsive
                    tokio::task::yield_now().await;
                }
                queue.work.notified().await;
            }
        })
    }
}

#[cfg(test)]
mod tasks_tests {
    use super::*;

    struct CountdownTask {
        remaining: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl Task for CountdownTask {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn perform_task(&mut self) -> TaskOutcome {
            self.log.lock().unwrap().push(self.remaining);
            if self.remaining == 0 {
                TaskOutcome::Done
            } else {
                self.remaining -= 1;
                TaskOutcome::Reschedule
            }
        }
    }

    #[test]
    fn stepwise_perform() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(vec![]));
        queue.schedule(Box::new(CountdownTask {
            remaining: 2,
            log: log.clone(),
        }));
        assert_eq!(queue.outstanding_tasks(), 1);

        assert!(queue.perform_task());
        assert!(queue.perform_task());
        assert!(queue.perform_task());
        assert!(!queue.perform_task());
        assert_eq!(queue.outstanding_tasks(), 0);
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn fifo_interleaving() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(vec![]));
        queue.schedule(Box::new(CountdownTask {
            remaining: 1,
            log: log.clone(),
        }));
        queue.schedule(Box::new(CountdownTask {
            remaining: 0,
            log: log.clone(),
        }));

        while queue.perform_task() {}
        // first task reschedules itself behind the second
        assert_eq!(*log.lock().unwrap(), vec![1, 0, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_drains() {
        let queue = TaskQueue::new();
        let _worker = queue.spawn_worker();
        let log = Arc::new(Mutex::new(vec![]));
        queue.schedule(Box::new(CountdownTask {
            remaining: 3,
            log: log.clone(),
        }));

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(queue.outstanding_tasks(), 0);
        assert_eq!(log.lock().unwrap().len(), 4);
    }
}
