use std::collections::HashSet;

use async_trait::async_trait;

use super::error::Nip77Error;
use super::model::EventId;
use super::negentropy::Negentropy;
use super::storage::StorageVector;

/// Transport carrying negentropy messages to a responder.
///
/// Messages are raw protocol bytes; hex framing belongs to the implementation.
#[async_trait]
pub trait ReconcileSession: Send {
    type Error: From<Nip77Error> + Send;

    /// Send the opening message and wait for the first reply.
    async fn open(&mut self, initial: Vec<u8>) -> Result<Vec<u8>, Self::Error>;

    /// Send a follow-up message and wait for the reply.
    async fn send(&mut self, message: Vec<u8>) -> Result<Vec<u8>, Self::Error>;

    /// Release the session on the responder.
    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Progress reported after every processed reply.
#[derive(Debug, Clone, Copy)]
pub struct RoundUpdate<'a> {
    /// 1-based count of completed round trips.
    pub round: usize,
    /// Ids first discovered as local-only in this round.
    pub new_have: &'a [EventId],
    /// Ids first discovered as remote-only in this round.
    pub new_need: &'a [EventId],
    /// Every local-only id found so far.
    pub have: &'a [EventId],
    /// Every remote-only id found so far.
    pub need: &'a [EventId],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub have: Vec<EventId>,
    pub need: Vec<EventId>,
    pub rounds: usize,
}

/// Run a full reconciliation of `storage` against the responder behind `session`.
///
/// The session is closed when reconciliation finishes and also when it fails
/// on a protocol error. Close failures after an error are ignored in favour of
/// the original error.
pub async fn reconcile<S, F>(
    storage: StorageVector,
    session: &mut S,
    frame_size_limit: u64,
    mut on_round: F,
) -> Result<ReconcileOutcome, S::Error>
where
    S: ReconcileSession + ?Sized,
    F: FnMut(RoundUpdate<'_>) + Send,
{
    let mut engine = Negentropy::new(storage, frame_size_limit)?;
    let initial = engine.initiate()?;

    match run_rounds(&mut engine, session, initial, &mut on_round).await {
        Ok(outcome) => {
            session.close().await?;
            Ok(outcome)
        }
        Err(error) => {
            let _ = session.close().await;
            Err(error)
        }
    }
}

async fn run_rounds<S, F>(
    engine: &mut Negentropy,
    session: &mut S,
    initial: Vec<u8>,
    on_round: &mut F,
) -> Result<ReconcileOutcome, S::Error>
where
    S: ReconcileSession + ?Sized,
    F: FnMut(RoundUpdate<'_>) + Send,
{
    let mut outcome = ReconcileOutcome::default();
    let mut seen_have: HashSet<EventId> = HashSet::new();
    let mut seen_need: HashSet<EventId> = HashSet::new();

    let mut reply = session.open(initial).await?;

    loop {
        outcome.rounds += 1;

        let mut have = Vec::new();
        let mut need = Vec::new();
        let next = engine.reconcile_with_ids(&reply, &mut have, &mut need)?;

        have.retain(|id| seen_have.insert(*id));
        need.retain(|id| seen_need.insert(*id));
        outcome.have.extend_from_slice(&have);
        outcome.need.extend_from_slice(&need);

        on_round(RoundUpdate {
            round: outcome.rounds,
            new_have: &have,
            new_need: &need,
            have: &outcome.have,
            need: &outcome.need,
        });

        match next {
            Some(message) => reply = session.send(message).await?,
            None => return Ok(outcome),
        }
    }
}
