use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Platform-independent helper to spawn an async task that runs in the background.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Platform-independent helper to spawn an async task that runs in the background.
///
/// Outside of a tokio context the task lands on a lazily built single-worker runtime.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use once_cell::sync::Lazy;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
        match Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-sync-background")
            .enable_all()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!("failed to build background tokio runtime: {err}");
                None
            }
        }
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Asynchronously waits for the provided duration in a platform-compatible way.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    use gloo_timers::future::sleep;
    sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    use tokio::time::sleep;
    sleep(duration).await;
}

/// Handle to an operation scheduled with [`spawn_delayed`].
///
/// Cancelling prevents the operation from running if the delay has not elapsed yet.
#[derive(Clone, Debug)]
pub struct DelayedTask {
    cancelled: Arc<AtomicBool>,
}

impl DelayedTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs `operation` after `delay` unless the returned handle is cancelled first.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_delayed<F>(delay: Duration, operation: F) -> DelayedTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = DelayedTask {
        cancelled: Arc::new(AtomicBool::new(false)),
    };
    let flag = task.cancelled.clone();
    spawn_detached(async move {
        sleep(delay).await;
        if !flag.load(Ordering::SeqCst) {
            operation.await;
        }
    });
    task
}

/// Runs `operation` after `delay` unless the returned handle is cancelled first.
#[cfg(target_arch = "wasm32")]
pub fn spawn_delayed<F>(delay: Duration, operation: F) -> DelayedTask
where
    F: Future<Output = ()> + 'static,
{
    let task = DelayedTask {
        cancelled: Arc::new(AtomicBool::new(false)),
    };
    let flag = task.cancelled.clone();
    spawn_detached(async move {
        sleep(delay).await;
        if !flag.load(Ordering::SeqCst) {
            operation.await;
        }
    });
    task
}
