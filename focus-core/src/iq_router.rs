//! Component H: a bounded, per-conference FIFO of inbound requests,
//! guaranteeing a single in-flight mutation against a conference's state at
//! a time. Overflow is reported as `resource-constraint`, never dropped
//! silently.

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::FocusError;

/// Queue depth per conference before new requests are rejected outright.
pub const QUEUE_CAPACITY: usize = 256;

pub type Job = Box<dyn FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send>;

/// A handle to a conference's serialized dispatch worker. Cloning is cheap;
/// every clone shares the same underlying queue, so at most one job runs at
/// a time regardless of how many callers hold a handle.
#[derive(Clone)]
pub struct IqRouter {
  tx: mpsc::Sender<Job>,
}

impl IqRouter {
  /// Spawn the worker task and return a handle to it.
  pub fn spawn() -> IqRouter {
    let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
    tokio::spawn(async move {
      while let Some(job) = rx.recv().await {
        // A panicking handler must not take the whole worker down with it;
        // it is caught, logged, and the queue keeps draining.
        let result = std::panic::AssertUnwindSafe(job()).catch_unwind().await;
        if let Err(panic) = result {
          tracing::error!("conference dispatch job panicked: {:?}", panic);
        }
      }
    });
    IqRouter { tx }
  }

  /// Enqueue `job`, returning `ResourceConstraint` if the queue is full.
  pub async fn dispatch<F, Fut>(&self, job: F) -> Result<(), FocusError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    let boxed: Job = Box::new(move || Box::pin(job()));
    self.tx.try_send(boxed).map_err(|_| FocusError::ResourceConstraint)
  }

  /// Enqueue `job` and wait for its result, failing with `Timeout` if it
  /// never completes (the caller is expected to pass an already-timeout-
  /// wrapped future if a deadline applies).
  pub async fn dispatch_and_wait<F, Fut, T>(&self, job: F) -> Result<T, FocusError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    self
      .dispatch(move || async move {
        let _ = tx.send(job().await);
      })
      .await?;
    rx.await.map_err(|_| FocusError::Internal(anyhow::anyhow!("dispatch worker dropped the response channel")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  #[tokio::test]
  async fn jobs_run_in_submission_order() {
    let router = IqRouter::spawn();
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    for i in 0..5 {
      let order = order.clone();
      router
        .dispatch(move || async move {
          order.lock().await.push(i);
        })
        .await
        .unwrap();
    }
    // give the worker a chance to drain
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn a_panicking_job_does_not_kill_the_worker() {
    let router = IqRouter::spawn();
    router.dispatch(|| async { panic!("boom") }).await.unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = counter.clone();
    router
      .dispatch(move || async move {
        counter2.fetch_add(1, Ordering::SeqCst);
      })
      .await
      .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn dispatch_and_wait_returns_the_jobs_result() {
    let router = IqRouter::spawn();
    let value = router.dispatch_and_wait(|| async { 42 }).await.unwrap();
    assert_eq!(value, 42);
  }
}
