//! A bounded pool of background workers that guarantees fire-and-forget calls get a chance to
//! land before the owner shuts down.
//!
//! Callers submit jobs and move on; the pool's owner calls [`DeliveryPool::drain`] on its
//! shutdown path, which stops intake and waits a bounded grace period for outstanding work. Work
//! still running when the grace period elapses is abandoned — this is a best-effort guarantee,
//! not at-least-once delivery.
use std::{
    sync::{
        mpsc::{Receiver, SyncSender},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

type Job = Box<dyn FnOnce() + Send>;

/// Number of jobs that may sit queued before `submit` applies backpressure.
const QUEUE_DEPTH: usize = 64;

/// A fixed-size pool of worker threads draining a bounded job queue.
pub struct DeliveryPool {
    /// `None` once draining has started; no further work is accepted.
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Count of jobs queued or running, with a condvar signalled on completion.
    outstanding: Arc<(Mutex<usize>, Condvar)>,
}

impl DeliveryPool {
    /// Start a pool with `workers` background threads.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a worker thread fails to start.
    pub fn start(workers: usize) -> std::io::Result<DeliveryPool> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Job>(QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));
        let outstanding = Arc::new((Mutex::new(0usize), Condvar::new()));

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let receiver = Arc::clone(&receiver);
            let outstanding = Arc::clone(&outstanding);
            let handle = std::thread::Builder::new()
                .name(format!("impression-delivery-{n}"))
                .spawn(move || run_worker(receiver, outstanding))?;
            handles.push(handle);
        }

        Ok(DeliveryPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            outstanding,
        })
    }

    /// Queue a job for background execution.
    ///
    /// Blocks only when the queue is full. Returns `false` (and logs) if the pool is already
    /// draining, in which case the job is dropped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self
            .sender
            .lock()
            .expect("thread holding delivery pool lock should not panic");
        let Some(sender) = sender.as_ref() else {
            log::warn!(target: "impressions", "delivery pool is shut down, dropping task");
            return false;
        };

        // Count the job before queueing it so a concurrent drain sees it.
        {
            let (lock, _) = &*self.outstanding;
            let mut count = lock
                .lock()
                .expect("thread holding outstanding count lock should not panic");
            *count += 1;
        }

        if sender.send(Box::new(job)).is_err() {
            // All workers exited. Should not happen before drain, but don't leave the count hanging.
            let (lock, condvar) = &*self.outstanding;
            let mut count = lock
                .lock()
                .expect("thread holding outstanding count lock should not panic");
            *count -= 1;
            condvar.notify_all();
            log::warn!(target: "impressions", "delivery workers exited, dropping task");
            return false;
        }
        true
    }

    /// Stop accepting new work and wait up to `grace` for outstanding jobs to finish.
    ///
    /// Returns `true` if the pool drained completely. On timeout, remaining jobs are abandoned
    /// and `false` is returned.
    pub fn drain(&self, grace: Duration) -> bool {
        // Dropping the sender lets workers exit once the queue empties.
        self.sender
            .lock()
            .expect("thread holding delivery pool lock should not panic")
            .take();

        let deadline = Instant::now() + grace;
        let (lock, condvar) = &*self.outstanding;
        let mut count = lock
            .lock()
            .expect("thread holding outstanding count lock should not panic");
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    target: "impressions",
                    "abandoning {count} undelivered calls after {grace:?} grace period",
                    count = *count,
                );
                return false;
            }
            let (guard, _) = condvar
                .wait_timeout(count, deadline - now)
                .expect("thread holding outstanding count lock should not panic");
            count = guard;
        }
        drop(count);

        for handle in self
            .workers
            .lock()
            .expect("thread holding delivery pool lock should not panic")
            .drain(..)
        {
            // Workers only exit cleanly; a panic inside a job is caught in the run loop.
            let _ = handle.join();
        }
        true
    }
}

fn run_worker(receiver: Arc<Mutex<Receiver<Job>>>, outstanding: Arc<(Mutex<usize>, Condvar)>) {
    loop {
        let job = {
            let receiver = receiver
                .lock()
                .expect("thread holding delivery queue lock should not panic");
            receiver.recv()
        };
        let Ok(job) = job else {
            // Channel closed and queue empty: the pool is draining.
            return;
        };

        // A panicking job must still decrement the count or drain would wait the full grace
        // period for work that can never finish.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));

        let (lock, condvar) = &*outstanding;
        let mut count = lock
            .lock()
            .expect("thread holding outstanding count lock should not panic");
        *count -= 1;
        condvar.notify_all();
    }
}
