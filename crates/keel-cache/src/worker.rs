use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::lock::LockStateToken;
use crate::store::{PersistentStore, StoreSession};

type Task = Box<dyn FnOnce(&mut StoreSession<'_>) + Send>;

enum Job {
    Run(Task),
    Flush(channel::Sender<()>),
    Stop,
}

/// Observes each batch of work the worker runs under the store lock.
pub trait LockListener: Send + Sync {
    /// Called right after the lock was acquired. `None` means the state token could not be read.
    fn on_start_work(&self, token: Option<LockStateToken>);

    /// Called right before the lock is released, with the token other processes will observe.
    fn on_end_work(&self, token: Option<LockStateToken>);
}

/// A listener that ignores lock events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockListener;

impl LockListener for NoopLockListener {
    fn on_start_work(&self, _token: Option<LockStateToken>) {}
    fn on_end_work(&self, _token: Option<LockStateToken>) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long the worker waits for another queued item before releasing the lock.
    pub batch_window: Duration,
    /// Upper bound on how long one batch holds the lock.
    pub max_locking_time: Duration,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(200),
            max_locking_time: Duration::from_millis(5_000),
            queue_capacity: 1_024,
        }
    }
}

/// The single writer of a [`PersistentStore`].
///
/// Callers never take the store lock themselves: they [`enqueue`](Self::enqueue) fire-and-forget
/// work or block on [`read`](Self::read). The worker thread takes the lock once per burst of
/// queued work, amortizing the cost of cross-process coordination.
pub struct CacheAccessWorker {
    sender: channel::Sender<Job>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    store: Arc<PersistentStore>,
}

impl CacheAccessWorker {
    pub fn spawn(store: Arc<PersistentStore>, listener: Arc<dyn LockListener>, config: WorkerConfig) -> Result<Self> {
        let (sender, receiver) = channel::bounded(config.queue_capacity.max(1));
        let worker_store = store.clone();
        let handle = thread::Builder::new()
            .name("keel-cache-worker".to_string())
            .spawn(move || run_worker(receiver, &worker_store, listener.as_ref(), config))?;
        Ok(Self {
            sender,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
            store,
        })
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Queues `task` without waiting for it. Failures are logged; they never stop the worker.
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut StoreSession<'_>) -> Result<()> + Send + 'static,
    {
        self.submit(Job::Run(Box::new(move |session: &mut StoreSession<'_>| {
            match catch_unwind(AssertUnwindSafe(|| task(session))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(target = "keel.cache", error = %err, "queued cache write failed");
                }
                Err(payload) => {
                    tracing::error!(
                        target = "keel.cache",
                        panic = keel_core::panic_payload_to_str(payload.as_ref()),
                        "queued cache write panicked"
                    );
                }
            }
        })))
    }

    /// Runs `task` on the worker and blocks until it finished, returning its result.
    ///
    /// A panic inside `task` is reported as [`CacheError::WorkerPanicked`].
    pub fn read<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreSession<'_>) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.submit(Job::Run(Box::new(move |session: &mut StoreSession<'_>| {
            let result = catch_unwind(AssertUnwindSafe(|| task(session))).unwrap_or_else(|payload| {
                Err(CacheError::WorkerPanicked {
                    message: keel_core::panic_payload_to_str(payload.as_ref()).to_string(),
                })
            });
            let _ = reply_tx.send(result);
        })))?;
        reply_rx.recv().map_err(|_| CacheError::WorkerDisconnected)?
    }

    /// Blocks until everything enqueued before this call has been written and the lock released.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.submit(Job::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| CacheError::WorkerDisconnected)
    }

    /// Drains already queued work, then stops the worker thread. Later submissions fail with
    /// [`CacheError::WorkerStopped`]. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // The worker may already be gone; joining below reports why.
            let _ = self.sender.send(Job::Stop);
        }
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|payload| CacheError::WorkerPanicked {
            message: keel_core::panic_payload_to_str(payload.as_ref()).to_string(),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.is_stopped() {
            return Err(CacheError::WorkerStopped);
        }
        self.sender.send(job).map_err(|_| CacheError::WorkerDisconnected)
    }
}

impl Drop for CacheAccessWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(target = "keel.cache", error = %err, "cache access worker did not stop cleanly");
        }
    }
}

fn run_worker(
    receiver: channel::Receiver<Job>,
    store: &PersistentStore,
    listener: &dyn LockListener,
    config: WorkerConfig,
) {
    loop {
        let first = match receiver.recv() {
            Ok(Job::Run(task)) => task,
            Ok(Job::Flush(ack)) => {
                // Every earlier batch already released the lock.
                let _ = ack.send(());
                continue;
            }
            Ok(Job::Stop) | Err(_) => return,
        };

        let mut session = match store.lock() {
            Ok(session) => session,
            Err(err) => {
                // Dropping the task drops any reply sender, so a waiting reader sees
                // `WorkerDisconnected` instead of hanging.
                tracing::warn!(target = "keel.cache", error = %err, "failed to acquire cache lock");
                continue;
            }
        };
        let locked_at = Instant::now();
        listener.on_start_work(session.state_token());

        first(&mut session);
        let mut jobs = 1usize;
        let mut acks = Vec::new();
        let mut stop = false;
        loop {
            let held = locked_at.elapsed();
            if held >= config.max_locking_time {
                break;
            }
            let remaining = config.max_locking_time - held;
            match receiver.recv_timeout(config.batch_window.min(remaining)) {
                Ok(Job::Run(task)) => {
                    task(&mut session);
                    jobs += 1;
                }
                Ok(Job::Flush(ack)) => {
                    acks.push(ack);
                    break;
                }
                Ok(Job::Stop) | Err(channel::RecvTimeoutError::Disconnected) => {
                    stop = true;
                    break;
                }
                Err(channel::RecvTimeoutError::Timeout) => break,
            }
        }

        let token = session.commit();
        listener.on_end_work(token);
        drop(session);
        tracing::debug!(
            target = "keel.cache",
            jobs,
            held_ms = locked_at.elapsed().as_millis() as u64,
            "released cache lock"
        );
        for ack in acks {
            let _ = ack.send(());
        }
        if stop {
            return;
        }
    }
}
