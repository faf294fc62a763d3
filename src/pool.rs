//! Worker thread pool.
//!
//! A fixed-size pool of background threads drains a shared task queue, each
//! task being one unit of compress/decompress/apply work for a single
//! shadow fd. A self-pipe wakes the main thread out of `poll()` whenever the
//! queue transitions from empty to non-empty, and back again whenever the
//! last in-flight task finishes, so the main thread can opportunistically
//! steal work while waiting on the queue to drain.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nix::unistd::{pipe, read, write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// One unit of work handed to a pool thread.
pub enum Task {
    /// Ordinary work item; boxed so the pool stays generic over task
    /// payloads defined by `transfer.rs`.
    Run(Box<dyn FnOnce() + Send + 'static>),
    /// Cooperative shutdown sentinel: a worker that pops this re-queues it
    /// for the next worker (so all of them eventually see it) and exits.
    Stop,
}

struct Shared {
    queue: Mutex<std::collections::VecDeque<Task>>,
    cond: Condvar,
    in_progress: Mutex<usize>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
}

impl Shared {
    fn wake_main(&self) {
        // Best effort: if the pipe is full the main thread is already
        // awake and will observe the queue on its next poll iteration.
        let _ = write(&self.wake_write, &[0u8]);
    }
}

/// A fixed-size pool of worker threads draining a shared FIFO task queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `num_threads` workers. `num_threads == 0` is valid: all work
    /// then runs inline via [`Self::wait_for_thread_pool`] /
    /// [`Self::submit`] on whichever thread calls them.
    pub fn new(num_threads: usize) -> Result<Self> {
        let (read_fd, write_fd) = pipe().context("failed to create thread pool wakeup pipe")?;
        nix::fcntl::fcntl(
            read_fd.as_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .context("failed to set wakeup pipe non-blocking")?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            cond: Condvar::new(),
            in_progress: Mutex::new(0),
            wake_read: read_fd,
            wake_write: write_fd,
        });

        let mut handles = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("shadowlink-worker-{idx}"))
                .spawn(move || worker_loop(&shared))
                .context("failed to spawn worker thread")?;
            handles.push(handle);
        }

        Ok(Self { shared, handles })
    }

    /// The read end of the wakeup pipe, for the main `poll()` loop to watch.
    #[must_use]
    pub fn wake_fd(&self) -> std::os::fd::RawFd {
        self.shared.wake_read.as_raw_fd()
    }

    /// Drains any pending wakeup bytes; call after `poll()` reports the
    /// wakeup fd readable.
    pub fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.shared.wake_read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }

    /// Enqueues a task and wakes any sleeping worker (or the main thread,
    /// if it's the one parked in `poll()`).
    pub fn submit(&self, task: Task) {
        {
            let mut in_progress = self.shared.in_progress.lock().unwrap_or_else(|e| e.into_inner());
            *in_progress += 1;
        }
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(task);
        }
        self.shared.cond.notify_one();
        self.shared.wake_main();
    }

    /// Blocks the calling thread until the queue is empty and no task is
    /// in flight, opportunistically running one queued task inline instead
    /// of idling.
    pub fn wait_for_thread_pool(&self) {
        loop {
            {
                let in_progress = self.shared.in_progress.lock().unwrap_or_else(|e| e.into_inner());
                if *in_progress == 0 {
                    return;
                }
            }
            let task = {
                let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };
            match task {
                Some(Task::Run(f)) => {
                    f();
                    let mut in_progress =
                        self.shared.in_progress.lock().unwrap_or_else(|e| e.into_inner());
                    *in_progress -= 1;
                }
                Some(Task::Stop) => {
                    // Not this thread's sentinel to consume; put it back
                    // for a real worker and yield briefly instead of
                    // busy-spinning.
                    let mut queue =
                        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.push_front(Task::Stop);
                    drop(queue);
                    std::thread::yield_now();
                }
                None => std::thread::yield_now(),
            }
        }
    }

    /// Pushes one `Stop` sentinel per worker and joins them all.
    pub fn shutdown(mut self) {
        for _ in 0..self.handles.len() {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(Task::Stop);
            drop(queue);
            self.shared.cond.notify_one();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                queue = shared.cond.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };
        match task {
            Task::Stop => return,
            Task::Run(f) => {
                f();
                let mut in_progress = shared.in_progress.lock().unwrap_or_else(|e| e.into_inner());
                *in_progress -= 1;
                if *in_progress == 0 {
                    drop(in_progress);
                    shared.wake_main();
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // `shutdown` is the graceful path: it pushes one `Stop` per worker
        // and joins every handle. If a pool is dropped without calling it
        // (e.g. an early error path), still wake every worker so none of
        // them leaks blocked on the condvar forever; don't touch the
        // wakeup pipe's fds here; `OwnedFd`'s own `Drop` closes them
        // exactly once; closing them early through the raw fd would race
        // the pipe's eventual `OwnedFd` drop and double-close it, which
        // spec §5 calls a programming error.
        if let Ok(mut queue) = self.shared.queue.lock() {
            for _ in 0..self.handles.len() {
                queue.push_back(Task::Stop);
            }
        }
        self.shared.cond.notify_all();
    }
}
