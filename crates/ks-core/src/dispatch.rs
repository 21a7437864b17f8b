use std::panic::{catch_unwind, AssertUnwindSafe};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue of jobs that must run on one owning thread (the host's main thread).
///
/// Any thread may [`post`](MainDispatcher::post); the owner drains the queue
/// with [`run_pending`](MainDispatcher::run_pending) from its event loop.
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct MainDispatcher {
    tx: flume::Sender<Job>,
    rx: flume::Receiver<Job>,
}

impl MainDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Enqueue a job for the owning thread.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Both ends live in self, so the channel cannot be disconnected here.
        let _ = self.tx.send(Box::new(job));
    }

    /// Run every job queued so far and return how many ran.
    ///
    /// A panicking job is logged and does not stop the remaining ones.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }

    /// Block until a job arrives or `timeout` elapses, then drain the queue.
    pub fn run_for(&self, timeout: std::time::Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                run_job(job);
                1 + self.run_pending()
            }
            Err(_) => 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for MainDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("main-thread job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn jobs_posted_from_other_threads_run_on_owner() {
        let dispatcher = MainDispatcher::new();
        let owner = std::thread::current().id();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let d = dispatcher.clone();
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    d.post(move || seen.lock().unwrap().push(std::thread::current().id()));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(dispatcher.pending(), 3);
        assert_eq!(dispatcher.run_pending(), 3);
        assert!(seen.lock().unwrap().iter().all(|id| *id == owner));
    }

    #[test]
    fn panicking_job_does_not_stop_queue() {
        let dispatcher = MainDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.post(|| panic!("boom"));
        let c = Arc::clone(&counter);
        dispatcher.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(dispatcher.run_pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_for_times_out_when_idle() {
        let dispatcher = MainDispatcher::new();
        assert_eq!(dispatcher.run_for(Duration::from_millis(10)), 0);
    }
}
