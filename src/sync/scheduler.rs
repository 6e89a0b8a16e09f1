use crate::device::{Fence, FenceDevice, FenceStatus, WaitOutcome};
use crate::error::{VmaError, VmaResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Upper bound on one blocking fence wait, so newly queued fences are
/// admitted to the batch promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Waiter {
    fence: Fence,
    tx: oneshot::Sender<VmaResult<()>>,
}

impl Waiter {
    fn resolve(self, result: VmaResult<()>) {
        // The receiver may have been dropped; nobody is left to tell.
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct Queue {
    incoming: VecDeque<Waiter>,
    shutdown: bool,
    /// Set once a fatal device error stopped the worker.
    failure: Option<String>,
}

impl Queue {
    /// The error a new wait gets once the worker no longer accepts work.
    fn refusal(&self) -> Option<VmaError> {
        if self.shutdown {
            Some(VmaError::SchedulerClosed)
        } else {
            self.failure.clone().map(VmaError::WaitFailed)
        }
    }
}

struct Shared {
    device: Arc<dyn FenceDevice>,
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Resolves once the fence it was created for signals.
///
/// Await it from async code, or call [`CompletionFuture::wait`] from a plain
/// thread.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct CompletionFuture {
    rx: oneshot::Receiver<VmaResult<()>>,
}

impl CompletionFuture {
    fn resolved(result: VmaResult<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Blocks the current thread until the fence resolves.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    /// The fence's error, or `SchedulerClosed` if the scheduler shut down first.
    pub fn wait(self) -> VmaResult<()> {
        self.rx.blocking_recv().unwrap_or(Err(VmaError::SchedulerClosed))
    }

    /// Non-blocking check; `None` while the fence is still pending.
    pub fn try_result(&mut self) -> Option<VmaResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(VmaError::SchedulerClosed)),
        }
    }
}

impl Future for CompletionFuture {
    type Output = VmaResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(VmaError::SchedulerClosed)))
    }
}

/// Background waiter that turns fences into futures.
///
/// One worker thread serves every outstanding fence: it sleeps while there
/// is nothing to wait for and otherwise blocks on the whole batch for at most
/// [`POLL_INTERVAL`] at a time. Futures resolve in completion order, not
/// submission order.
pub struct WaitScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WaitScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("WaitScheduler")
            .field("queued", &queue.incoming.len())
            .field("shutdown", &queue.shutdown)
            .field("failure", &queue.failure)
            .finish_non_exhaustive()
    }
}

impl WaitScheduler {
    /// Starts the worker thread.
    ///
    /// # Errors
    /// `Io` if the thread cannot be spawned.
    pub fn new(device: Arc<dyn FenceDevice>) -> VmaResult<Self> {
        let shared = Arc::new(Shared {
            device,
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("vma-wait-scheduler".to_string())
            .spawn(move || run(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Returns a future for `fence` and takes ownership of it: the fence is
    /// destroyed on the device once its outcome is known.
    ///
    /// Fences that are already signaled resolve immediately; a failed status
    /// query resolves the future with that error. Never blocks.
    pub fn wait_async(&self, fence: Fence) -> CompletionFuture {
        if let Some(e) = self.shared.queue.lock().refusal() {
            return CompletionFuture::resolved(Err(e));
        }

        match self.shared.device.fence_status(fence) {
            Ok(FenceStatus::Signaled) => {
                self.shared.device.destroy_fence(fence);
                CompletionFuture::resolved(Ok(()))
            }
            Ok(FenceStatus::NotReady) => {
                let mut queue = self.shared.queue.lock();
                // The worker may have stopped while the status was queried.
                if let Some(e) = queue.refusal() {
                    return CompletionFuture::resolved(Err(e));
                }
                let (tx, rx) = oneshot::channel();
                queue.incoming.push_back(Waiter { fence, tx });
                drop(queue);
                self.shared.wake.notify_one();
                CompletionFuture { rx }
            }
            Err(e) => {
                self.shared.device.destroy_fence(fence);
                CompletionFuture::resolved(Err(e))
            }
        }
    }

    /// Whether a fatal device error stopped the worker.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.shared.queue.lock().failure.is_some()
    }
}

impl Drop for WaitScheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("wait scheduler worker panicked");
            }
        }
        // Anything queued after the worker exited.
        let orphans: Vec<Waiter> = self.shared.queue.lock().incoming.drain(..).collect();
        for waiter in orphans {
            waiter.resolve(Err(VmaError::SchedulerClosed));
        }
    }
}

fn run(shared: &Shared) {
    let mut pending: Vec<Waiter> = Vec::new();

    loop {
        {
            let mut queue = shared.queue.lock();
            while pending.is_empty() && queue.incoming.is_empty() && !queue.shutdown {
                shared.wake.wait(&mut queue);
            }
            if queue.shutdown {
                pending.extend(queue.incoming.drain(..));
                break;
            }
            pending.extend(queue.incoming.drain(..));
        }

        // Waiters whose future was dropped stay until their fence resolves,
        // so the fence is still destroyed.
        if pending.is_empty() {
            continue;
        }

        let fences: Vec<Fence> = pending.iter().map(|w| w.fence).collect();
        match shared.device.wait_for_fences(&fences, POLL_INTERVAL) {
            Ok(WaitOutcome::TimedOut) => continue,
            Ok(WaitOutcome::Signaled) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(pending = pending.len(), "fence wait failed: {e}");
                let reason = e.to_string();
                let mut queue = shared.queue.lock();
                queue.failure = Some(reason);
                pending.extend(queue.incoming.drain(..));
                drop(queue);
                for waiter in pending.drain(..) {
                    shared.device.destroy_fence(waiter.fence);
                    waiter.resolve(Err(VmaError::DeviceLost));
                }
                return;
            }
            Err(e) => {
                tracing::debug!("batch wait failed, querying fences one by one: {e}");
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        resolve_ready(shared, &mut pending);
    }

    for waiter in pending {
        waiter.resolve(Err(VmaError::SchedulerClosed));
    }
}

/// Resolves every waiter whose fence is signaled or reports an error.
fn resolve_ready(shared: &Shared, pending: &mut Vec<Waiter>) {
    let mut index = 0;
    while index < pending.len() {
        match shared.device.fence_status(pending[index].fence) {
            Ok(FenceStatus::NotReady) => index += 1,
            Ok(FenceStatus::Signaled) => {
                let waiter = pending.swap_remove(index);
                shared.device.destroy_fence(waiter.fence);
                waiter.resolve(Ok(()));
            }
            Err(e) => {
                let waiter = pending.swap_remove(index);
                tracing::warn!(fence = waiter.fence.0, "fence reported an error: {e}");
                shared.device.destroy_fence(waiter.fence);
                waiter.resolve(Err(e));
            }
        }
    }
}
