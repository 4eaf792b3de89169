use std::sync::Arc;

use rocket::tokio::{sync::Semaphore, task};

use crate::error::{Error, Result};

/// Bounded pool for CPU-bound crypto work, so large batches cannot starve the
/// async workers or the blocking thread pool.
#[derive(Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `job` on a blocking thread once a worker slot is free.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("crypto pool closed".to_string()))?;
        task::spawn_blocking(job).await?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rocket::futures::future::join_all;

    use super::*;

    #[rocket::async_test]
    async fn concurrency_is_bounded() {
        let pool = CryptoPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..8).map(|i| {
            let (running, peak) = (running.clone(), peak.clone());
            pool.run(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            })
        });
        let results: Vec<_> = join_all(jobs).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[rocket::async_test]
    async fn job_errors_propagate() {
        let pool = CryptoPool::new(1);
        let result: Result<()> = pool.run(|| Err(Error::authentication("bad"))).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
    }
}
