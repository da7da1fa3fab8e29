//! Subscription handles for receiving filtered events from one relay.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::Stream;
use nostr::Event;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::relay::RelayConnection;

/// Item delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event(Event),
    /// Stored events are exhausted; later events are live.
    Eose,
    /// The relay ended the subscription, with its reason.
    Closed(String),
}

/// A subscription to filtered events from a relay.
///
/// Dropping the handle closes the subscription on the relay.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    relay: RelayConnection,
    receiver: mpsc::UnboundedReceiver<SubscriptionItem>,
    close_on_eose: bool,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        relay: RelayConnection,
        receiver: mpsc::UnboundedReceiver<SubscriptionItem>,
        close_on_eose: bool,
    ) -> Self {
        Self {
            id,
            relay,
            receiver,
            close_on_eose,
            released: false,
        }
    }

    /// Subscription ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn relay_url(&self) -> &str {
        self.relay.url()
    }

    /// Next item, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        let item = self.receiver.recv().await;
        self.observe(item.as_ref());
        item
    }

    /// Close the subscription on the relay.
    pub async fn close(mut self) -> Result<()> {
        self.released = true;
        self.relay.close(&self.id).await
    }

    fn observe(&mut self, item: Option<&SubscriptionItem>) {
        match item {
            Some(SubscriptionItem::Eose) if self.close_on_eose => self.release(),
            Some(SubscriptionItem::Closed(_)) | None => self.released = true,
            _ => {}
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.relay.release_subscription(&self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(this.receiver.poll_recv(cx));
        this.observe(item.as_ref());
        Poll::Ready(item)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
