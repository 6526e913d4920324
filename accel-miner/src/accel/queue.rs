//! Completion message queue.
//!
//! The interrupt side pushes from a plain thread; readers consume either
//! without waiting or by awaiting the next message. Messages are delivered in
//! push order and each is handed to exactly one reader.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{AccelError, CompletionMessage};

#[derive(Debug, Default)]
pub struct CompletionQueue {
    messages: Mutex<VecDeque<CompletionMessage>>,
    notify: Notify,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking holder cannot leave the deque half-modified, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<CompletionMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and wake every waiting reader. Callable from any
    /// thread.
    pub fn push(&self, msg: CompletionMessage) {
        self.lock().push_back(msg);
        self.notify.notify_waiters();
    }

    /// Take the oldest message if one is queued.
    pub fn try_recv(&self) -> Option<CompletionMessage> {
        self.lock().pop_front()
    }

    /// Wait for and take the oldest message.
    ///
    /// Returns [`AccelError::Interrupted`] if `cancel` fires first; no
    /// message is consumed in that case.
    pub async fn recv(&self, cancel: &CancellationToken) -> Result<CompletionMessage, AccelError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(msg) = self.try_recv() {
                return Ok(msg);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(AccelError::Interrupted),
            }
        }
    }

    /// Wait until at least one message is queued, without consuming it.
    pub async fn readable(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Whether a read would return a message without waiting.
    pub fn is_ready(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard every queued message, returning how many were dropped.
    pub fn flush(&self) -> usize {
        let mut messages = self.lock();
        let dropped = messages.len();
        messages.clear();
        dropped
    }

    /// Take every queued message, oldest first.
    pub fn drain(&self) -> Vec<CompletionMessage> {
        self.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::accel::Status;

    fn found(nonce: u32) -> CompletionMessage {
        CompletionMessage::new(Status::FOUND, nonce)
    }

    #[test]
    fn test_fifo_order() {
        let queue = CompletionQueue::new();
        queue.push(found(1));
        queue.push(found(2));
        queue.push(found(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_recv(), Some(found(1)));
        assert_eq!(queue.try_recv(), Some(found(2)));
        assert_eq!(queue.try_recv(), Some(found(3)));
        assert_eq!(queue.try_recv(), None);
    }

    #[test]
    fn test_flush_discards_everything() {
        let queue = CompletionQueue::new();
        queue.push(found(1));
        queue.push(found(2));

        assert_eq!(queue.flush(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_ready());
        assert_eq!(queue.flush(), 0);
    }

    #[test]
    fn test_drain_returns_in_order() {
        let queue = CompletionQueue::new();
        queue.push(found(4));
        queue.push(found(5));

        assert_eq!(queue.drain(), vec![found(4), found(5)]);
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_from_thread() {
        let queue = Arc::new(CompletionQueue::new());
        let cancel = CancellationToken::new();

        let pusher = Arc::clone(&queue);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pusher.push(found(7));
        });

        let msg = tokio::time::timeout(Duration::from_secs(5), queue.recv(&cancel))
            .await
            .expect("recv should complete")
            .unwrap();
        assert_eq!(msg, found(7));
    }

    #[tokio::test]
    async fn test_recv_interrupted_by_cancel() {
        let queue = CompletionQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = queue.recv(&cancel).await.unwrap_err();
        assert!(matches!(err, AccelError::Interrupted));
    }

    #[tokio::test]
    async fn test_readable_does_not_consume() {
        let queue = CompletionQueue::new();
        queue.push(found(9));

        queue.readable().await;
        assert!(queue.is_ready());
        assert_eq!(queue.try_recv(), Some(found(9)));
    }

    #[tokio::test]
    async fn test_each_message_goes_to_one_reader() {
        let queue = Arc::new(CompletionQueue::new());
        let cancel = CancellationToken::new();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            readers.push(tokio::spawn(async move { queue.recv(&cancel).await }));
        }

        tokio::task::yield_now().await;
        for nonce in 0..4 {
            queue.push(found(nonce));
        }

        let mut nonces = Vec::new();
        for reader in readers {
            nonces.push(reader.await.unwrap().unwrap().nonce_candidate);
        }
        nonces.sort();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }
}
