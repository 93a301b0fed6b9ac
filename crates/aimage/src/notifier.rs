//! Delivery of completed payloads on a caller-chosen execution context
//!
//! Fetch tasks never call consumers directly. They hand a [`Delivery`] to a
//! [`Notifier`], which decides where it runs: inline on the worker, or queued
//! for a single designated context such as a UI loop.

use tokio::sync::mpsc;
use tracing::debug;

/// One unit of consumer-facing work, typically the drain of one key
pub type Delivery = Box<dyn FnOnce() + Send + 'static>;

/// Marshals deliveries onto the context consumers expect to be called on
pub trait Notifier: Send + Sync + 'static {
    fn post(&self, delivery: Delivery);
}

/// Runs deliveries immediately on whichever thread completed the fetch
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineNotifier;

impl Notifier for InlineNotifier {
    fn post(&self, delivery: Delivery) {
        delivery();
    }
}

/// Queues deliveries for a [`DeliveryQueue`] driven by one context
#[derive(Debug, Clone)]
pub struct QueueNotifier {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Notifier for QueueNotifier {
    fn post(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            debug!("Delivery queue closed, dropping delivery");
        }
    }
}

/// Receiving end of a [`QueueNotifier`].
///
/// Whoever owns the queue is the delivery context: every consumer call
/// happens inside [`run`](Self::run), [`next`](Self::next) or
/// [`drain_pending`](Self::drain_pending), one delivery at a time.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue").finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Run deliveries until every notifier has been dropped
    pub async fn run(mut self) {
        while let Some(delivery) = self.rx.recv().await {
            delivery();
        }
    }

    /// Wait for and run the next delivery, `false` once all notifiers are gone
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(delivery) => {
                delivery();
                true
            }
            None => false,
        }
    }

    /// Run whatever is queued right now without waiting. For hosts that poll.
    pub fn drain_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            delivery();
            count += 1;
        }
        count
    }
}

/// Create a connected notifier and queue
pub fn delivery_queue() -> (QueueNotifier, DeliveryQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueNotifier { tx }, DeliveryQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_inline_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        InlineNotifier.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_defers_until_drained() {
        let (notifier, mut queue) = delivery_queue();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let c = Arc::clone(&count);
            notifier.post(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(queue.drain_pending(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(queue.drain_pending(), 0);
    }

    #[tokio::test]
    async fn test_queue_runs_on_the_draining_thread() {
        let (notifier, mut queue) = delivery_queue();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let notifier = notifier.clone();
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    notifier.post(Box::new(move || {
                        seen.lock().unwrap().push(thread::current().id());
                    }));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        drop(notifier);

        while queue.next().await {}

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|id| *id == thread::current().id()));
    }

    #[test]
    fn test_post_after_queue_dropped_is_ignored() {
        let (notifier, queue) = delivery_queue();
        drop(queue);
        notifier.post(Box::new(|| panic!("must not run")));
    }
}
