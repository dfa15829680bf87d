use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared flag that stops new work from being picked up. Work already
/// running is left to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `task` over `items` on at most `width` scoped worker threads.
///
/// Workers pull items from a shared queue in order, so a width of 1 handles
/// them strictly one after another. Output order follows completion, not
/// input. Items not yet started when `cancel` fires are dropped.
pub fn run_bounded<T, R, F>(width: usize, items: Vec<T>, cancel: &CancelToken, task: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = width.max(1).min(items.len());
    let queue = Mutex::new(items.into_iter());
    let results = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                let Some(item) = next else {
                    break;
                };
                let output = task(item);
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(output);
            });
        }
    });

    results.into_inner().unwrap_or_else(PoisonError::into_inner)
}
