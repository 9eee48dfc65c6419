//! Adds `.throttled(throttler)` to `Stream`s.
//!
//! The returned stream is the parallel execution stage the throttler plugs
//! into: it pulls input items only while fewer than `qps` are in flight,
//! submits each through the throttler, yields results in input order and,
//! once the input has ended and every outstanding item completed, runs the
//! throttler's flush hook and yields whatever trailing values it returns.
//!
//! ```no_run
//! use futures::{stream, StreamExt};
//! use throttled_transform::{ThrottledStreamExt, Throttler};
//!
//! # async fn demo() -> throttled_transform::Result<()> {
//! let throttler = Throttler::builder()
//!     .qps(10)
//!     .transform_async(|n: u64| async move { Ok(n * 2) })
//!     .build()?;
//! let doubled: Vec<_> = stream::iter(0..100u64).throttled(throttler).collect().await;
//! # Ok(())
//! # }
//! ```

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::debug;

use crate::completion::{Completion, ItemResult};
use crate::error::ItemError;
use crate::throttler::Throttler;

/// The extension trait that adds `.throttled(throttler)` to all `Stream`s.
pub trait ThrottledStreamExt: Stream + Sized {
    fn throttled<R>(self, throttler: Throttler<Self::Item, R>) -> BoxStream<'static, ItemResult<R>>
    where
        Self: Send + 'static,
        Self::Item: Send + 'static,
        R: Send + 'static,
    {
        throttled_stream(self, throttler)
    }
}

impl<S: Stream> ThrottledStreamExt for S {}

/// Takes the `input` stream and runs every element through `throttler`,
/// keeping at most `qps` transformations in flight.
pub fn throttled_stream<S, T, R>(input: S, throttler: Throttler<T, R>) -> BoxStream<'static, ItemResult<R>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
{
    let in_flight = throttler.qps() as usize;
    let dispatcher = throttler.clone();

    let results = input
        .map(move |payload| {
            let (done, pending) = Completion::channel();
            // on error the outcome has already been delivered to `pending`
            if let Err(err) = dispatcher.submit(payload, done) {
                debug!(throttler = %dispatcher.id(), error = %err, "Submission failed");
            }
            pending
        })
        .buffered(in_flight);

    let trailing = stream::once(async move {
        let (done, pending) = Completion::channel();
        throttler.flush(done);
        pending.await
    })
    .flat_map(|flushed| match flushed {
        Ok(values) => stream::iter(values.into_iter().map(Ok::<R, ItemError>)).left_stream(),
        Err(err) => stream::once(future::ready(Err(err))).right_stream(),
    });

    results.chain(trailing).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThrottleError;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_input_order() {
        let throttler = Throttler::builder()
            .qps(4)
            .transform_async(|n: u64| async move {
                // later items finish first
                tokio::time::sleep(Duration::from_millis(100 * (10 - n))).await;
                Ok(n)
            })
            .build()
            .unwrap();

        let results: Vec<u64> = stream::iter(0..10u64)
            .throttled(throttler)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_values_come_last() {
        let throttler = Throttler::builder()
            .qps(2)
            .transform_async(|s: String| async move { Ok(s.to_uppercase()) })
            .flush(|done| done.succeed(vec!["END".to_string()]))
            .build()
            .unwrap();

        let results: Vec<String> = stream::iter(vec!["a".to_string(), "b".to_string()])
            .throttled(throttler)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(results, vec!["A", "B", "END"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_is_reported() {
        let throttler: Throttler<u8, u8> = Throttler::builder()
            .qps(1)
            .transform(|n, done| done.succeed(n))
            .flush(|done| done.fail(ItemError::flush("disk full")))
            .build()
            .unwrap();

        let results: Vec<_> = stream::iter(vec![1u8]).throttled(throttler).collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(matches!(results[1], Err(ItemError::Flush(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_errors_do_not_stop_the_stream() {
        let throttler = Throttler::builder()
            .qps(5)
            .transform_async(|n: i32| async move {
                if n < 0 {
                    Err(ItemError::transform(format!("negative input {}", n)))
                } else {
                    Ok(n)
                }
            })
            .build()
            .unwrap();

        let results: Vec<_> = stream::iter(vec![1, -2, 3]).throttled(throttler).collect().await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ItemError::Transform(_))));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_transformation_surfaces_per_item() {
        let throttler: Throttler<u8, u8> = Throttler::builder().qps(1).build().unwrap();
        assert!(matches!(throttler.call(1), Err(ThrottleError::NotImplemented)));

        let results: Vec<_> = stream::iter(vec![1u8, 2]).throttled(throttler).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Err(ItemError::NotImplemented))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_applies_across_stream() {
        let start = Instant::now();
        let throttler = Throttler::builder()
            .qps(3)
            .transform_async(move |n: u32| async move { Ok((n, start.elapsed())) })
            .build()
            .unwrap();

        let results: Vec<(u32, Duration)> = stream::iter(0..9u32)
            .throttled(throttler)
            .map(|r| r.unwrap())
            .collect()
            .await;
        for (n, at) in results {
            let window = Duration::from_secs(u64::from(n / 3));
            assert!(at >= window, "item {} started at {:?}", n, at);
        }
    }
}
