// Worker Queue Module
//
// One FIFO queue per (operation kind, tier), each drained by its own pool of
// named OS threads. Stages that must not block an interrupt thread are
// redirected to the issue tier; retries may jump the queue.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::config::TaskqConfig;

use super::types::ZioType;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Which of an operation kind's four queues a request runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskqTier {
    Issue,
    IssueHigh,
    Interrupt,
    InterruptHigh,
}

impl TaskqTier {
    pub const ALL: [TaskqTier; 4] = [
        TaskqTier::Issue,
        TaskqTier::IssueHigh,
        TaskqTier::Interrupt,
        TaskqTier::InterruptHigh,
    ];

    pub fn is_interrupt(self) -> bool {
        matches!(self, TaskqTier::Interrupt | TaskqTier::InterruptHigh)
    }

    pub fn is_high(self) -> bool {
        matches!(self, TaskqTier::IssueHigh | TaskqTier::InterruptHigh)
    }

    pub fn high(self) -> TaskqTier {
        match self {
            TaskqTier::Issue | TaskqTier::IssueHigh => TaskqTier::IssueHigh,
            TaskqTier::Interrupt | TaskqTier::InterruptHigh => TaskqTier::InterruptHigh,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            TaskqTier::Issue => "iss",
            TaskqTier::IssueHigh => "iss_h",
            TaskqTier::Interrupt => "int",
            TaskqTier::InterruptHigh => "int_h",
        }
    }
}

thread_local! {
    static CURRENT_TIER: Cell<Option<TaskqTier>> = const { Cell::new(None) };
}

/// Tier of the worker queue running the current thread, if any.
pub(crate) fn current_tier() -> Option<TaskqTier> {
    CURRENT_TIER.with(|t| t.get())
}

fn type_short_name(io_type: ZioType) -> &'static str {
    match io_type {
        ZioType::Null => "null",
        ZioType::Read => "rd",
        ZioType::Write => "wr",
        ZioType::Free => "fr",
        ZioType::Claim => "cl",
        ZioType::Ioctl => "ioctl",
        ZioType::Trim => "trim",
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
}

/// A single queue and the threads draining it.
pub(crate) struct Taskq {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Taskq {
    fn new(name: String, tier: TaskqTier, nthreads: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            name,
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(nthreads);
        for worker_id in 0..nthreads.max(1) {
            let shared_clone = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}_{}", shared.name, worker_id))
                .spawn(move || Self::worker_loop(worker_id, shared_clone, tier))?;
            threads.push(handle);
        }

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    fn worker_loop(worker_id: usize, shared: Arc<Shared>, tier: TaskqTier) {
        CURRENT_TIER.with(|t| t.set(Some(tier)));
        debug!("{} worker {} started", shared.name, worker_id);

        loop {
            let task = {
                let mut q = shared.queue.lock();
                loop {
                    if let Some(task) = q.tasks.pop_front() {
                        q.active += 1;
                        break Some(task);
                    }
                    if q.shutdown {
                        break None;
                    }
                    shared.work.wait(&mut q);
                }
            };
            let Some(task) = task else {
                break;
            };

            task();

            let mut q = shared.queue.lock();
            q.active -= 1;
            if q.active == 0 && q.tasks.is_empty() {
                shared.idle.notify_all();
            }
        }

        debug!("{} worker {} shutting down", shared.name, worker_id);
    }

    /// Queues `task`. After shutdown the task is handed back to the caller.
    fn dispatch(&self, task: Task, cut_in_line: bool) -> Result<(), Task> {
        let mut q = self.shared.queue.lock();
        if q.shutdown {
            return Err(task);
        }
        if cut_in_line {
            q.tasks.push_front(task);
        } else {
            q.tasks.push_back(task);
        }
        self.shared.work.notify_one();
        Ok(())
    }

    fn wait_idle(&self) {
        let mut q = self.shared.queue.lock();
        while q.active > 0 || !q.tasks.is_empty() {
            self.shared.idle.wait(&mut q);
        }
    }

    fn shutdown(&self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
            self.shared.work.notify_all();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                // A pool closed from one of its own workers: that thread
                // exits on its own once it returns to the loop.
                continue;
            }
            if handle.join().is_err() {
                warn!("{} worker panicked", self.shared.name);
            }
        }
    }
}

/// All worker queues of one pool.
pub(crate) struct TaskqSet {
    queues: Vec<Taskq>,
}

impl TaskqSet {
    /// Starts every queue. Read and write queues use the configured thread
    /// counts; the rest run a single thread per tier.
    pub(crate) fn start(pool: &str, config: &TaskqConfig) -> io::Result<Self> {
        let mut queues = Vec::with_capacity(ZioType::ALL.len() * TaskqTier::ALL.len());
        let mut total = 0;
        for io_type in ZioType::ALL {
            for tier in TaskqTier::ALL {
                let nthreads = match io_type {
                    ZioType::Read | ZioType::Write => match tier {
                        TaskqTier::Issue => config.issue_threads,
                        TaskqTier::IssueHigh => config.issue_high_threads,
                        TaskqTier::Interrupt => config.interrupt_threads,
                        TaskqTier::InterruptHigh => config.interrupt_high_threads,
                    },
                    _ => 1,
                }
                .max(1);
                let name = format!("{}_z_{}_{}", pool, type_short_name(io_type), tier.short_name());
                queues.push(Taskq::new(name, tier, nthreads)?);
                total += nthreads;
            }
        }
        info!("Started {} zio taskq threads for pool {}", total, pool);
        Ok(Self { queues })
    }

    fn queue(&self, io_type: ZioType, tier: TaskqTier) -> &Taskq {
        let t = TaskqTier::ALL.iter().position(|&x| x == tier).unwrap_or(0);
        &self.queues[io_type.index() * TaskqTier::ALL.len() + t]
    }

    /// Queues `task`; once the pool's queues are gone it runs inline.
    pub(crate) fn dispatch(&self, io_type: ZioType, tier: TaskqTier, task: Task, cut_in_line: bool) {
        if let Err(task) = self.queue(io_type, tier).dispatch(task, cut_in_line) {
            warn!("taskq for {:?}/{:?} is shut down; running inline", io_type, tier);
            task();
        }
    }

    /// Blocks until every queue is empty and no task is running.
    pub(crate) fn wait_idle(&self) {
        for q in &self.queues {
            q.wait_idle();
        }
    }

    pub(crate) fn shutdown(&self) {
        for q in &self.queues {
            q.shutdown();
        }
    }
}
