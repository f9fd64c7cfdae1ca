//! Per-key single-flight: concurrent callers with the same key and the same
//! request share one running future and all receive its (cloned) output. A
//! caller whose request differs from the running one is turned away rather
//! than handed an outcome it did not ask for.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Task<T> = Shared<BoxFuture<'static, T>>;

pub(crate) struct SingleFlight<R, T: Clone> {
    tasks: Arc<Mutex<HashMap<String, (R, Task<T>)>>>,
}

impl<R, T> SingleFlight<R, T>
where
    R: PartialEq + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight task for `key` if it was started for an equal
    /// `request`, or start one with `start`. Returns `None`, without running
    /// anything, when the task in flight was started for a different request.
    /// The entry is removed as soon as the task finishes, so a later call
    /// runs afresh.
    pub async fn run<F>(&self, key: &str, request: R, start: impl FnOnce() -> F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let task = {
            let mut tasks = self.tasks.lock();
            match tasks.get(key) {
                Some((running, task)) if *running == request => task.clone(),
                Some(_) => return None,
                None => {
                    let registry = Arc::clone(&self.tasks);
                    let owned_key = key.to_owned();
                    let fut = start();
                    let task = async move {
                        let out = fut.await;
                        registry.lock().remove(&owned_key);
                        out
                    }
                    .boxed()
                    .shared();
                    tasks.insert(key.to_owned(), (request, task.clone()));
                    task
                }
            }
        };
        Some(task.await)
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let flight = Arc::new(SingleFlight::<u8, usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    flight
                        .run("u1", 7, || async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            runs.fetch_add(1, Ordering::SeqCst) + 1
                        })
                        .await
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.await.unwrap(), Some(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let flight = SingleFlight::<u8, String>::new();
        let (a, b) = tokio::join!(
            flight.run("a", 1, || async { "a".to_string() }),
            flight.run("b", 2, || async { "b".to_string() }),
        );
        assert_eq!((a.as_deref(), b.as_deref()), (Some("a"), Some("b")));
    }

    #[tokio::test]
    async fn finished_task_is_not_reused() {
        let flight = SingleFlight::<u8, u32>::new();
        assert_eq!(flight.run("k", 1, || async { 1 }).await, Some(1));
        assert_eq!(flight.run("k", 2, || async { 2 }).await, Some(2));
    }

    #[tokio::test]
    async fn different_request_on_a_busy_key_is_refused() {
        let flight = SingleFlight::<u8, u32>::new();
        let started = Arc::new(AtomicUsize::new(0));
        let second_started = Arc::clone(&started);

        let (first, second) = tokio::join!(
            flight.run("u1", 1, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                10
            }),
            async {
                tokio::task::yield_now().await;
                flight
                    .run("u1", 2, move || async move {
                        second_started.fetch_add(1, Ordering::SeqCst);
                        20
                    })
                    .await
            },
        );
        assert_eq!(first, Some(10));
        assert_eq!(second, None);
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(flight.in_flight(), 0);
    }
}
