use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// An unbounded FIFO hand-off point between a network receive loop (producer) and a
///  protocol logic loop (consumer), so that a slow consumer never blocks the I/O loop
///  and vice versa.
///
/// `push` never blocks. `pop` waits until an item is available or shutdown is
///  requested; after shutdown it returns `None` immediately and pending items are
///  discarded - consumers use `None` as their signal to terminate.
pub struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    readable: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    is_shut_down: bool,
}

impl<T> DeliveryQueue<T> {
    pub fn new() -> DeliveryQueue<T> {
        DeliveryQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                is_shut_down: false,
            }),
            readable: Notify::new(),
        }
    }

    pub fn push(&self, item: T) {
        {
            let mut state = self.state.lock()
                .expect("delivery queue lock poisoned");
            if state.is_shut_down {
                // late producers race shutdown - dropping the item is the documented behavior
                return;
            }
            state.items.push_back(item);
        }
        self.readable.notify_one();
    }

    pub async fn pop(&self) -> Option<T> {
        loop {
            // register interest before checking state so a concurrent push cannot get lost
            let notified = self.readable.notified();
            {
                let mut state = self.state.lock()
                    .expect("delivery queue lock poisoned");
                if state.is_shut_down {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Wakes all blocked consumers. Idempotent.
    pub fn request_shutdown(&self) {
        {
            let mut state = self.state.lock()
                .expect("delivery queue lock poisoned");
            state.is_shut_down = true;
            state.items.clear();
        }
        self.readable.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock()
            .expect("delivery queue lock poisoned")
            .is_shut_down
    }
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_pop_returns_pushed_items_in_order() {
        let queue = DeliveryQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_pop_blocks_until_push() {
        let queue = Arc::new(DeliveryQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42u32);

        let popped = timeout(Duration::from_secs(1), consumer).await
            .expect("consumer did not wake up")
            .unwrap();
        assert_eq!(popped, Some(42));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_consumers() {
        let queue: Arc<DeliveryQueue<u32>> = Arc::new(DeliveryQueue::new());

        let consumers = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.request_shutdown();

        for consumer in consumers {
            let popped = timeout(Duration::from_secs(1), consumer).await
                .expect("consumer was not woken by shutdown")
                .unwrap();
            assert_eq!(popped, None);
        }
    }

    #[tokio::test]
    async fn test_pop_after_shutdown_returns_none_immediately() {
        let queue = DeliveryQueue::new();
        queue.push(1);
        queue.request_shutdown();

        // pinned behavior: items pushed before shutdown are discarded, pop does not block
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_push_after_shutdown_is_dropped() {
        let queue = DeliveryQueue::new();
        queue.request_shutdown();
        queue.push(1);

        assert!(queue.is_shut_down());
        assert_eq!(queue.pop().await, None);
    }
}
