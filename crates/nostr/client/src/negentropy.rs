//! NIP-77 session over a relay connection.

use async_trait::async_trait;
use nostr::nip77::{NegClose, NegMsg, NegOpen};
use nostr::{Filter, ReconcileSession};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{ClientError, Result};
use crate::message::ClientMessage;
use crate::relay::RelayConnection;

/// Carries `NEG-OPEN`/`NEG-MSG` frames for one reconciliation.
///
/// A `NEG-ERR` reply fails the pending round with `ClientError::RelayError`.
pub(crate) struct RelayNegentropySession {
    relay: RelayConnection,
    subscription_id: String,
    filter: Filter,
    receiver: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    open: bool,
}

impl RelayNegentropySession {
    pub(crate) fn new(relay: RelayConnection, filter: Filter) -> Self {
        let (subscription_id, receiver) = relay.register_negentropy();
        Self {
            relay,
            subscription_id,
            filter,
            receiver,
            open: true,
        }
    }

    async fn reply(&mut self) -> Result<Vec<u8>> {
        let request_timeout = self.relay.config().request_timeout;
        match timeout(request_timeout, self.receiver.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Err(ClientError::Connection(format!(
                "connection to {} lost during negentropy session",
                self.relay.url()
            ))),
            Err(_) => Err(ClientError::Timeout(format!(
                "no negentropy reply from {} after {:?}",
                self.relay.url(),
                request_timeout
            ))),
        }
    }
}

#[async_trait]
impl ReconcileSession for RelayNegentropySession {
    type Error = ClientError;

    async fn open(&mut self, initial: Vec<u8>) -> Result<Vec<u8>> {
        let frame = NegOpen::new(self.subscription_id.clone(), self.filter.clone(), &initial);
        self.relay
            .send_message(&ClientMessage::NegOpen(frame))
            .await?;
        self.reply().await
    }

    async fn send(&mut self, message: Vec<u8>) -> Result<Vec<u8>> {
        let frame = NegMsg::new(self.subscription_id.clone(), &message);
        self.relay
            .send_message(&ClientMessage::NegMsg(frame))
            .await?;
        self.reply().await
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        // A route already gone means the relay ended the session itself.
        if !self.relay.remove_route(&self.subscription_id) {
            return Ok(());
        }
        self.relay
            .send_message(&ClientMessage::NegClose(NegClose::new(
                self.subscription_id.clone(),
            )))
            .await
    }
}

impl Drop for RelayNegentropySession {
    fn drop(&mut self) {
        if self.open {
            self.relay.release(
                &self.subscription_id,
                ClientMessage::NegClose(NegClose::new(self.subscription_id.clone())),
            );
        }
    }
}
