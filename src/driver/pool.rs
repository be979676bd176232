use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::socket::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads for hosts driving many connections.
///
/// Connection halves occupy a worker until their connection ends, so a host should check
/// [`ThreadPool::idle`] before handing over work that blocks.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    jobs: Option<Sender<Job>>,
    // Jobs queued or running.
    pending: Arc<AtomicUsize>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let (jobs, queue) = mpsc::channel();
        let queue = Arc::new(Mutex::new(queue));
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|id| Worker::spawn(id, Arc::clone(&queue), Arc::clone(&pending)))
            .collect();

        Self {
            workers,
            jobs: Some(jobs),
            pending,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers with nothing running and nothing queued for them.
    pub fn idle(&self) -> usize {
        self.size().saturating_sub(self.pending.load(Ordering::Acquire))
    }

    /// Queues `f` for the next idle worker. Returns `false` once the pool is shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(jobs) = self.jobs.as_ref() else {
            return false;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if jobs.send(Box::new(f)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.jobs.take());

        for worker in self.workers.drain(..) {
            debug!("joining worker {}", worker.id);
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: JoinHandle<()>,
}

/// Marks a job finished even if it unwinds.
struct Finished<'a>(&'a AtomicUsize);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Worker {
    fn spawn(id: usize, queue: Arc<Mutex<Receiver<Job>>>, pending: Arc<AtomicUsize>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let next = lock(&queue).recv();
                let Ok(job) = next else {
                    debug!("worker {id} stopping, pool closed");
                    break;
                };

                let _finished = Finished(&pending);
                debug!("worker {id} picked up a job");
                job();
            }
        });

        Self { id, thread }
    }
}
