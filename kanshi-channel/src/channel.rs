use async_stream::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::FileEvent;

/// Ordered multi-producer, single-consumer queue of [`FileEvent`]s.
///
/// Producers may call [`send`](EventChannel::send) from any thread, including
/// native notification threads; it never blocks and never panics. Closing is
/// graceful: events already queued still drain before `receive` reports
/// end-of-stream with `None`.
pub struct EventChannel {
    // The only sender. Dropping it is what ends the stream.
    sender: Mutex<Option<UnboundedSender<FileEvent>>>,
    receiver: tokio::sync::Mutex<UnboundedReceiver<FileEvent>>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventChannel {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
        }
    }

    /// Queues `event`. Returns `false` and drops the event once closed.
    pub fn send(&self, event: FileEvent) -> bool {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                trace!(kind = ?event.kind(), "dropping event sent to a closed channel");
                false
            }
        }
    }

    /// Waits for the next event. `None` means the channel is closed and drained.
    pub async fn receive(&self) -> Option<FileEvent> {
        self.receiver.lock().await.recv().await
    }

    /// Returns whether this call closed the channel.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn stream(&self) -> impl futures::Stream<Item = FileEvent> + Send + '_ {
        stream! {
            while let Some(event) = self.receive().await {
                yield event;
            }
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use futures::{pin_mut, StreamExt};
    use tokio::time::timeout;

    use super::EventChannel;
    use crate::FileEvent;

    #[tokio::test]
    async fn delivers_in_send_order() {
        let channel = EventChannel::new();
        channel.send(FileEvent::init("/w"));
        channel.send(FileEvent::created("/w", "a"));
        channel.send(FileEvent::deleted("/w", "a"));

        assert_eq!(channel.receive().await, Some(FileEvent::init("/w")));
        assert_eq!(channel.receive().await, Some(FileEvent::created("/w", "a")));
        assert_eq!(channel.receive().await, Some(FileEvent::deleted("/w", "a")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_wakes_a_pending_receiver() {
        let channel = Arc::new(EventChannel::new());

        let c = channel.clone();
        let pending = tokio::spawn(async move { c.receive().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.close());

        let received = timeout(Duration::from_secs(2), pending)
            .await
            .expect("receiver stayed blocked after close")
            .unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn close_is_graceful_and_idempotent() {
        let channel = EventChannel::new();
        assert!(channel.send(FileEvent::created("/w", "a")));

        assert!(channel.close());
        assert!(!channel.close());
        assert!(channel.is_closed());

        assert!(!channel.send(FileEvent::created("/w", "late")));

        assert_eq!(channel.receive().await, Some(FileEvent::created("/w", "a")));
        assert_eq!(channel.receive().await, None);
        assert_eq!(channel.receive().await, None);
    }

    #[tokio::test]
    async fn concurrent_producers_keep_their_own_order() {
        let channel = Arc::new(EventChannel::new());

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        channel.send(FileEvent::created("/w", format!("{producer}-{i}")));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        channel.close();

        let mut last_seen = [-1i32; 4];
        let stream = channel.stream();
        pin_mut!(stream);
        let mut total = 0;
        while let Some(event) = stream.next().await {
            let name = event.name().unwrap().to_string_lossy().into_owned();
            let (producer, i) = name.split_once('-').unwrap();
            let (producer, i): (usize, i32) = (producer.parse().unwrap(), i.parse().unwrap());
            assert!(i > last_seen[producer]);
            last_seen[producer] = i;
            total += 1;
        }

        assert_eq!(total, 400);
    }
}
