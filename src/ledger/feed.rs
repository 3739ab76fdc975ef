//! Best-effort push of wallet snapshots to interested readers.
//!
//! The feed is a freshness optimization: a subscriber that lags or reconnects must
//! re-read the balance from the store, which remains the source of truth.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll, ready};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use super::Wallet;

pub const DEFAULT_FEED_CAPACITY: usize = 16;

type Channels = Mutex<HashMap<Uuid, Channel>>;

struct Channel {
    sender: broadcast::Sender<Wallet>,
    /// Id of the newest entry published on this channel.
    high_water: i64,
}

pub struct BalanceFeed {
    channels: Arc<Channels>,
    capacity: usize,
}

impl BalanceFeed {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Feed capacity must be positive");
        assert!(capacity <= 1024, "Feed capacity exceeds bound");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    pub fn subscribe(&self, user_id: Uuid) -> BalanceSubscription {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channels.entry(user_id).or_insert_with(|| Channel {
            sender: broadcast::channel(self.capacity).0,
            high_water: 0,
        });
        BalanceSubscription {
            user_id,
            receiver: channel.sender.subscribe(),
            release: ChannelRelease {
                user_id,
                channels: Arc::downgrade(&self.channels),
            },
        }
    }

    /// Sends the snapshot produced by `entry_id` to the wallet owner's subscribers.
    ///
    /// Snapshots from entries older than one already published are skipped, so
    /// publishes racing out of commit order never leave a stale balance last.
    pub fn publish(&self, wallet: &Wallet, entry_id: i64) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.get_mut(&wallet.user_id) else {
            return 0;
        };
        if entry_id <= channel.high_water {
            debug!(
                "Skipping stale snapshot for {} from entry {entry_id}",
                wallet.user_id
            );
            return 0;
        }
        channel.high_water = entry_id;
        match channel.sender.send(wallet.clone()) {
            Ok(delivered) => delivered,
            Err(_) => {
                // Every receiver is gone
                channels.remove(&wallet.user_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, user_id: Uuid) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(&user_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of users with an open channel.
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for BalanceFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// Removes the user's channel once its last receiver is gone.
///
/// Must be declared after the receiver it guards so it drops second.
struct ChannelRelease {
    user_id: Uuid,
    channels: Weak<Channels>,
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = channels.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = channels
            .get(&self.user_id)
            .is_some_and(|channel| channel.sender.receiver_count() == 0);
        if unused {
            channels.remove(&self.user_id);
        }
    }
}

pub struct BalanceSubscription {
    user_id: Uuid,
    receiver: broadcast::Receiver<Wallet>,
    release: ChannelRelease,
}

impl BalanceSubscription {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Next snapshot; skipped snapshots are dropped in favour of newer ones.
    pub async fn recv(&mut self) -> Option<Wallet> {
        loop {
            match self.receiver.recv().await {
                Ok(wallet) => return Some(wallet),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        "Balance subscriber for {} skipped {skipped} snapshots",
                        self.user_id
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BalanceStream {
        BalanceStream {
            inner: BroadcastStream::new(self.receiver),
            _release: self.release,
        }
    }
}

/// Snapshot stream that keeps the subscription registered while alive.
pub struct BalanceStream {
    inner: BroadcastStream<Wallet>,
    _release: ChannelRelease,
}

impl Stream for BalanceStream {
    type Item = Wallet;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Wallet>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(wallet)) => return Poll::Ready(Some(wallet)),
                Some(Err(lagged)) => debug!("Balance stream lagged: {lagged}"),
                None => return Poll::Ready(None),
            }
        }
    }
}
