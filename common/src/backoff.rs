//! Exponential-backoff retry schedulers.
//!
//! Two variants with one contract: keep calling the send function until it
//! reports something other than the failed outcome, or the message's
//! deadline passes. [`BackoffRetries`] retries a single message;
//! [`BackoffBatchedRetries`] additionally groups pending messages into
//! batches, which is what the NB-IoT uplink wants (one `CMQPUB` carrying
//! several punches costs the same airtime as one).

use std::collections::VecDeque;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

const QUEUE_SIZE: usize = 64;

/// Retries a single message with exponential backoff until its deadline.
pub struct BackoffRetries<T, F> {
    send_fn: F,
    failed_outcome: T,
    first_backoff: Duration,
    multiplier: f64,
    max_duration: Duration,
    current_mid: AtomicU64,
}

impl<T: PartialEq, F> BackoffRetries<T, F> {
    pub fn new(
        send_fn: F,
        failed_outcome: T,
        first_backoff: Duration,
        multiplier: f64,
        max_duration: Duration,
    ) -> Self {
        Self {
            send_fn,
            failed_outcome,
            first_backoff,
            multiplier,
            max_duration,
            current_mid: AtomicU64::new(0),
        }
    }

    /// Sends `argument`, retrying failures until the deadline.
    ///
    /// Returns `Some(value)` as soon as the send function reports success,
    /// `None` once the deadline has passed. An error from the send function
    /// counts as a failed attempt.
    pub async fn backoff_send<A, Fut>(&self, argument: A) -> Option<T>
    where
        A: Clone + Debug,
        F: Fn(A) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mid = self.current_mid.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Scheduled: mid={mid}");

        let deadline = Instant::now() + self.max_duration;
        let mut cur_backoff = self.first_backoff;
        while Instant::now() < deadline {
            match (self.send_fn)(argument.clone()).await {
                Ok(ret) if ret != self.failed_outcome => {
                    info!("Sent: mid={mid}");
                    return Some(ret);
                }
                Ok(_) => {}
                Err(err) => error!("Sending failed: {err}"),
            }

            let now = Instant::now();
            if now + cur_backoff >= deadline {
                cur_backoff = deadline.saturating_duration_since(now);
                if cur_backoff.is_zero() {
                    break;
                }
            }
            error!(
                "Message not sent: mid={mid}, retrying after {:.3} seconds",
                cur_backoff.as_secs_f64()
            );
            sleep(cur_backoff).await;
            cur_backoff = cur_backoff.mul_f64(self.multiplier);
        }

        error!("Message mid={mid} expired, args = {argument:?}");
        None
    }
}

struct RetriedMessage<A, T> {
    arg: A,
    mid: u64,
    /// Single-shot completion cell. `Some(value)` publishes the outcome,
    /// `None` (or dropping the sender) wakes the submitter so it can
    /// reschedule itself.
    completion: oneshot::Sender<Option<T>>,
}

/// Retries with exponential backoff, grouping pending messages into
/// batches of up to `batch_count`.
///
/// One worker task serves all submitters, so a single retry attempt is
/// never split: every message in a batch observes the same outcome list,
/// in submission order. A batch retry never extends another message's
/// deadline; each submitter tracks its own.
pub struct BackoffBatchedRetries<A, T> {
    queue: mpsc::Sender<RetriedMessage<A, T>>,
    first_backoff: Duration,
    multiplier: f64,
    max_duration: Duration,
    current_mid: AtomicU64,
}

impl<A, T> BackoffBatchedRetries<A, T>
where
    A: Clone + Debug + Send + 'static,
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new<F, Fut>(
        send_fn: F,
        failed_outcome: T,
        first_backoff: Duration,
        multiplier: f64,
        max_duration: Duration,
        batch_count: usize,
    ) -> Self
    where
        F: Fn(Vec<A>) -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<Vec<T>>> + Send + 'static,
    {
        let (queue, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(Self::worker(rx, send_fn, failed_outcome, batch_count));
        Self {
            queue,
            first_backoff,
            multiplier,
            max_duration,
            current_mid: AtomicU64::new(0),
        }
    }

    async fn worker<F, Fut>(
        mut rx: mpsc::Receiver<RetriedMessage<A, T>>,
        send_fn: F,
        failed_outcome: T,
        batch_count: usize,
    ) where
        F: Fn(Vec<A>) -> Fut,
        Fut: Future<Output = crate::Result<Vec<T>>>,
    {
        while let Some(first) = rx.recv().await {
            let mut batch = VecDeque::with_capacity(batch_count);
            batch.push_back(first);
            while batch.len() < batch_count {
                match rx.try_recv() {
                    Ok(msg) => batch.push_back(msg),
                    Err(_) => break,
                }
            }

            let args: Vec<A> = batch.iter().map(|msg| msg.arg.clone()).collect();
            match send_fn(args).await {
                Ok(returned) => {
                    let mut published = Vec::new();
                    let mut not_published = Vec::new();
                    for (msg, ret) in batch.into_iter().zip(returned) {
                        if ret == failed_outcome {
                            not_published.push(msg.mid.to_string());
                            let _ = msg.completion.send(None);
                        } else {
                            published.push(msg.mid.to_string());
                            let _ = msg.completion.send(Some(ret));
                        }
                    }
                    if !published.is_empty() {
                        info!("Messages sent: {}", published.join(","));
                    }
                    if !not_published.is_empty() {
                        error!("Messages not sent: {}", not_published.join(","));
                    }
                }
                Err(err) => {
                    error!("Batch send failed: {err}");
                    for msg in batch {
                        let _ = msg.completion.send(None);
                    }
                }
            }
        }
    }

    /// Submits one message and waits for its completion or deadline.
    pub async fn send(&self, argument: A) -> Option<T> {
        let mid = self.current_mid.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Scheduled: mid={mid}");

        let deadline = Instant::now() + self.max_duration;
        let mut cur_backoff = self.first_backoff;
        while Instant::now() < deadline {
            let (completion, waiter) = oneshot::channel();
            let msg = RetriedMessage {
                arg: argument.clone(),
                mid,
                completion,
            };
            if self.queue.send(msg).await.is_err() {
                break;
            }
            match waiter.await {
                Ok(Some(ret)) => return Some(ret),
                // Not published this round, reschedule below
                Ok(None) | Err(_) => {}
            }

            let now = Instant::now();
            if now + cur_backoff >= deadline {
                cur_backoff = deadline.saturating_duration_since(now);
                if cur_backoff.is_zero() {
                    break;
                }
            }
            debug!("Retrying mid={mid} after {:.3} seconds", cur_backoff.as_secs_f64());
            sleep(cur_backoff).await;
            cur_backoff = cur_backoff.mul_f64(self.multiplier);
        }

        error!("Message mid={mid} expired, args = {argument:?}");
        None
    }
}

#[cfg(test)]
mod test_backoff {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let send_fn = move |arg: u32| {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                    Ok(None)
                } else {
                    Ok::<_, crate::Error>(Some(arg))
                }
            }
        };
        let retries = BackoffRetries::new(
            send_fn,
            None,
            Duration::from_millis(40),
            2.0,
            Duration::from_secs(6),
        );

        let start = Instant::now();
        let res = retries.backoff_send(7).await;
        assert_eq!(res, Some(Some(7)));
        // Two backoffs: 40 ms + 80 ms
        assert_eq!(start.elapsed(), Duration::from_millis(120));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_hits_deadline_exactly() {
        let send_fn = |_arg: u32| async move { Ok::<_, crate::Error>(None::<u32>) };
        let retries = BackoffRetries::new(
            send_fn,
            None,
            Duration::from_millis(40),
            2.0,
            Duration::from_millis(200),
        );

        let start = Instant::now();
        let res = retries.backoff_send(7).await;
        assert_eq!(res, None);
        // Attempts at 0, 40, 120 ms; the last wait is clamped to the
        // remaining 80 ms, never past the deadline.
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_counts_as_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let send_fn = move |arg: u32| {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(crate::Error::ChannelClosed)
                } else {
                    Ok(Some(arg))
                }
            }
        };
        let retries = BackoffRetries::new(
            send_fn,
            None,
            Duration::from_millis(40),
            2.0,
            Duration::from_secs(1),
        );
        assert_eq!(retries.backoff_send(3).await, Some(Some(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_retries_complete_in_order() {
        // Arg x fails the first x times, so completions must come back in
        // the order 1 < 2 < 3 regardless of how attempts get batched.
        let counters = Arc::new(Mutex::new(HashMap::from([(1u32, 0u32), (2, 0), (3, 0)])));
        let counters_clone = counters.clone();
        let send_fn = move |args: Vec<u32>| {
            let counters = counters_clone.clone();
            async move {
                let mut counters = counters.lock().unwrap();
                let mut res = Vec::with_capacity(args.len());
                for arg in args {
                    let cnt = counters.get_mut(&arg).unwrap();
                    if *cnt < arg {
                        *cnt += 1;
                        res.push(None);
                    } else {
                        res.push(Some(arg));
                    }
                }
                Ok::<_, crate::Error>(res)
            }
        };
        let retries = Arc::new(BackoffBatchedRetries::new(
            send_fn,
            None,
            Duration::from_millis(40),
            2.0,
            Duration::from_secs(10),
            2,
        ));

        let mut handles = Vec::new();
        for (i, arg) in [1u32, 2, 3].into_iter().enumerate() {
            let retries = retries.clone();
            handles.push(tokio::spawn(async move {
                sleep(Duration::from_millis(i as u64 + 1)).await;
                let res = retries.send(arg).await;
                (res, Instant::now())
            }));
        }

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        assert_eq!(finished[0].0, Some(Some(1)));
        assert_eq!(finished[1].0, Some(Some(2)));
        assert_eq!(finished[2].0, Some(Some(3)));
        assert!(finished[0].1 < finished[1].1);
        assert!(finished[1].1 < finished[2].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_expiry() {
        let send_fn = |args: Vec<u32>| async move {
            Ok::<_, crate::Error>(vec![None::<u32>; args.len()])
        };
        let retries = BackoffBatchedRetries::new(
            send_fn,
            None,
            Duration::from_millis(40),
            2.0,
            Duration::from_millis(200),
            2,
        );
        let start = Instant::now();
        assert_eq!(retries.send(1).await, None);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
