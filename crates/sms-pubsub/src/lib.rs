//! A small in-process publish/subscribe fabric.
//!
//! One task feeds the fabric through [`Subscriber::listen`]; any number of
//! subscribers attach a channel with an optional filter predicate. Each
//! subscriber gets its own unbounded backlog drained by a dedicated worker
//! task, so a slow subscriber can never block the publisher or its peers.
//! Delivery order per subscriber is publish order; nothing is promised
//! across subscribers.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A filter predicate. `None` accepts every value.
pub type FilterFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("channel is already subscribed")]
    AlreadySubscribed,
    #[error("fabric is closed")]
    Closed,
}

struct Subscription<T> {
    /// The subscriber's channel, kept for identity comparison on
    /// unsubscribe. The worker owns its own clone.
    channel: mpsc::Sender<T>,
    filter: Option<FilterFn<T>>,
    backlog: mpsc::UnboundedSender<T>,
    worker: JoinHandle<()>,
}

struct State<T> {
    subs: Vec<Subscription<T>>,
    closed: bool,
}

/// The fan-out fabric. See the crate docs for the delivery contract.
pub struct Subscriber<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Default for Subscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                subs: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Broadcasts values received from `src` until the source closes or
    /// `cancel` fires, then closes the fabric: every subscriber worker is
    /// stopped and further subscribes are rejected.
    pub async fn listen(&self, mut src: mpsc::Receiver<T>, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                value = src.recv() => match value {
                    Some(value) => self.publish(&value),
                    None => break,
                },
            }
        }
        self.close();
    }

    /// Appends `value` to the backlog of every subscriber whose filter
    /// accepts it. Never blocks.
    pub fn publish(&self, value: &T) {
        let state = self.state.lock().unwrap();
        for sub in &state.subs {
            let accepted = sub.filter.as_ref().is_none_or(|filter| filter(value));
            if accepted {
                // A send failure means the worker is gone; the entry is
                // removed on unsubscribe or close.
                let _ = sub.backlog.send(value.clone());
            }
        }
    }

    /// Registers `channel` to receive published values accepted by `filter`.
    ///
    /// Fails if the same channel is already subscribed or the fabric has
    /// closed. The fabric holds its own clones of the sender; the channel
    /// observes closure once the caller drops theirs after unsubscribing.
    pub fn subscribe(
        &self,
        channel: mpsc::Sender<T>,
        filter: Option<FilterFn<T>>,
    ) -> Result<(), SubscribeError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SubscribeError::Closed);
        }
        if state.subs.iter().any(|sub| sub.channel.same_channel(&channel)) {
            return Err(SubscribeError::AlreadySubscribed);
        }

        let (backlog_tx, mut backlog_rx) = mpsc::unbounded_channel::<T>();
        let forward = channel.clone();
        let worker = tokio::spawn(async move {
            while let Some(value) = backlog_rx.recv().await {
                if forward.send(value).await.is_err() {
                    // Receiver dropped; nothing left to deliver to.
                    break;
                }
            }
        });

        state.subs.push(Subscription {
            channel,
            filter,
            backlog: backlog_tx,
            worker,
        });
        Ok(())
    }

    /// Removes the subscription for `channel`, stopping its worker. Pending
    /// backlog entries are discarded. Unknown channels are a no-op.
    pub fn unsubscribe(&self, channel: &mpsc::Sender<T>) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state
            .subs
            .iter()
            .position(|sub| sub.channel.same_channel(channel))
        {
            let sub = state.subs.swap_remove(idx);
            sub.worker.abort();
        }
    }

    /// Closes the fabric: all workers stop and later subscribes fail.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for sub in state.subs.drain(..) {
            sub.worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_order_with_filter() {
        let fabric = Subscriber::<u32>::new();
        let (tx, mut rx) = mpsc::channel(4);
        fabric
            .subscribe(tx, Some(Box::new(|v: &u32| v % 2 == 0)))
            .unwrap();

        for v in 0..10u32 {
            fabric.publish(&v);
        }

        for want in [0u32, 2, 4, 6, 8] {
            assert_eq!(rx.recv().await, Some(want));
        }
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_rejected() {
        let fabric = Subscriber::<u32>::new();
        let (tx, _rx) = mpsc::channel(1);
        fabric.subscribe(tx.clone(), None).unwrap();
        assert_eq!(
            fabric.subscribe(tx, None),
            Err(SubscribeError::AlreadySubscribed),
        );
    }

    #[tokio::test]
    async fn subscribe_after_close_is_rejected() {
        let fabric = Subscriber::<u32>::new();
        fabric.close();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(fabric.subscribe(tx, None), Err(SubscribeError::Closed));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let fabric = Subscriber::<u32>::new();

        // A: fast, generous buffer. B: stalled with a capacity-1 channel.
        let (tx_a, mut rx_a) = mpsc::channel(1024);
        let (tx_b, mut rx_b) = mpsc::channel(1);
        fabric.subscribe(tx_a, None).unwrap();
        fabric.subscribe(tx_b.clone(), None).unwrap();

        // publish() is synchronous; reaching the end proves it never blocked
        // on B's full channel.
        for v in 0..1000u32 {
            fabric.publish(&v);
        }

        for want in 0..1000u32 {
            assert_eq!(rx_a.recv().await, Some(want));
        }

        // B's backlog kept everything in order; drain a prefix to prove it.
        for want in 0..100u32 {
            assert_eq!(rx_b.recv().await, Some(want));
        }

        fabric.unsubscribe(&tx_b);
        drop(tx_b);
        // With the fabric's clones gone, the channel drains and then closes.
        tokio::time::timeout(Duration::from_secs(1), async {
            while rx_b.recv().await.is_some() {}
        })
        .await
        .expect("channel should close after unsubscribe");
    }

    #[tokio::test]
    async fn listen_publishes_until_source_closes() {
        let fabric = std::sync::Arc::new(Subscriber::<u32>::new());
        let (src_tx, src_rx) = mpsc::channel(4);
        let (sub_tx, mut sub_rx) = mpsc::channel(4);
        fabric.subscribe(sub_tx, None).unwrap();

        let cancel = CancellationToken::new();
        let listener = {
            let fabric = fabric.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { fabric.listen(src_rx, &cancel).await })
        };

        src_tx.send(7).await.unwrap();
        assert_eq!(sub_rx.recv().await, Some(7));

        drop(src_tx);
        listener.await.unwrap();

        // The fabric closed with its source.
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(fabric.subscribe(tx, None), Err(SubscribeError::Closed));
    }

    #[tokio::test]
    async fn listen_stops_on_cancellation() {
        let fabric = std::sync::Arc::new(Subscriber::<u32>::new());
        let (_src_tx, src_rx) = mpsc::channel::<u32>(1);

        let cancel = CancellationToken::new();
        let listener = {
            let fabric = fabric.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { fabric.listen(src_rx, &cancel).await })
        };

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listen should stop promptly")
            .unwrap();
    }
}
