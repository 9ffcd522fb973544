use std::future::Future;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use tracing::debug;

/// Runs independent async operations concurrently on the current task.
///
/// Operations share the caller's task, so they interleave at await points rather
/// than running on separate worker threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelProcessor;

impl ParallelProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Run every operation concurrently and return results in input order.
    pub async fn run_all<'a, T>(&self, operations: Vec<BoxFuture<'a, T>>) -> Vec<T> {
        let count = operations.len();
        let start = Instant::now();
        let results = join_all(operations).await;
        debug!(
            operations = count,
            latency_ms = start.elapsed().as_millis() as u64,
            "Parallel operations completed"
        );
        results
    }

    /// Run two heterogeneous operations concurrently.
    pub async fn join2<A, B, FA, FB>(&self, first: FA, second: FB) -> (A, B)
    where
        FA: Future<Output = A>,
        FB: Future<Output = B>,
    {
        futures::future::join(first, second).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_all_preserves_order() {
        let processor = ParallelProcessor::new();
        let operations: Vec<BoxFuture<'_, u64>> = vec![
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                1
            }
            .boxed(),
            async { 2 }.boxed(),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                3
            }
            .boxed(),
        ];

        assert_eq!(processor.run_all(operations).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_run_all_is_concurrent() {
        let processor = ParallelProcessor::new();
        let start = Instant::now();
        let operations: Vec<BoxFuture<'_, ()>> = (0..4)
            .map(|_| tokio::time::sleep(Duration::from_millis(50)).boxed())
            .collect();

        processor.run_all(operations).await;
        assert!(start.elapsed() < Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_join2_mixed_types() {
        let processor = ParallelProcessor::new();
        let (a, b) = processor
            .join2(async { "similar" }, async { 0.5_f64 })
            .await;
        assert_eq!(a, "similar");
        assert_eq!(b, 0.5);
    }
}
