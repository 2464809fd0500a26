//! Bounded pool for background block-producer tasks.
//!
//! The precompute cache hands each scheduled block index to one task that
//! reads, fingerprints, and optionally compresses it.  The pool runs those
//! tasks on rayon threads behind a token channel: a submitter takes a token
//! before spawning and the task returns it on completion, so at most
//! `depth + threads` producers exist at once and `submit` applies
//! back-pressure instead of queueing without bound.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::ThreadPool;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskPool {
    pool: Arc<ThreadPool>,
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskPool {
    /// Build a pool of `threads` workers that admits `depth` queued tasks on
    /// top of the ones executing.  Returns `None` if the thread pool cannot
    /// be built or the arguments are degenerate.
    pub fn new(threads: usize, depth: usize) -> Option<Self> {
        if threads == 0 || depth == 0 {
            return None;
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .ok()?;

        let capacity = depth + threads;
        let (token_tx, token_rx) = bounded(capacity);
        for _ in 0..capacity {
            token_tx.send(()).ok()?;
        }

        Some(TaskPool {
            pool: Arc::new(pool),
            token_tx,
            token_rx,
            pending: Arc::new((Mutex::new(0), Condvar::new())),
        })
    }

    /// Run `task` on the pool.  Blocks while the pool is saturated.
    pub fn submit(&self, task: Task) {
        self.token_rx.recv().expect("task pool token channel closed");

        {
            let (lock, _) = &*self.pending;
            *lock.lock().unwrap() += 1;
        }

        let pending = Arc::clone(&self.pending);
        let token_tx = self.token_tx.clone();
        self.pool.spawn(move || {
            task();
            let (lock, cvar) = &*pending;
            let mut n = lock.lock().unwrap();
            *n -= 1;
            if *n == 0 {
                cvar.notify_all();
            }
            let _ = token_tx.send(());
        });
    }

    /// Block until every submitted task has finished.  The pool stays usable.
    pub fn drain(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock().unwrap();
        while *n > 0 {
            n = cvar.wait(n).unwrap();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // In-flight producers publish into slots others may still hold; let
        // them finish before rayon joins its workers.
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(TaskPool::new(0, 4).is_none());
        assert!(TaskPool::new(4, 0).is_none());
    }

    #[test]
    fn runs_all_tasks() {
        let pool = TaskPool::new(3, 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..40 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn drain_is_reusable() {
        let pool = TaskPool::new(2, 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
