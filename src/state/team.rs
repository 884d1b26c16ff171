use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::state::estimation::{Deck, Estimation};
use crate::state::message::{Message, MessageBody, MessageId};
use crate::state::participant::{Participant, Role};

/// High-level phases an estimation session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamState {
    /// No estimation has been started yet.
    Initial,
    /// A round is open; voters may submit.
    EstimationInProgress,
    /// Every active voter submitted; results were published.
    EstimationFinished,
    /// The scrum master canceled the round.
    EstimationCanceled,
}

/// Error returned when a team operation violates an invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeamError {
    /// Team or participant names must not be blank.
    #[error("name must not be empty")]
    EmptyName,
    /// A deck must offer at least one value.
    #[error("deck must not be empty")]
    EmptyDeck,
    /// The name is already taken, case-insensitively, by any role.
    #[error("participant `{0}` already exists in the team")]
    AlreadyJoined(String),
    /// No participant with that name.
    #[error("participant `{0}` not found")]
    UnknownParticipant(String),
    /// The operation is reserved for the scrum master.
    #[error("`{0}` is not the scrum master")]
    NotScrumMaster(String),
    /// Observers cannot submit estimations.
    #[error("`{0}` is an observer and cannot vote")]
    NotVoter(String),
    /// The participant is disconnected and must reconnect first.
    #[error("participant `{0}` is disconnected")]
    Dormant(String),
    /// Submitting or canceling requires an open round.
    #[error("estimation is not in progress")]
    EstimationNotInProgress,
    /// Starting a round or changing the deck requires no open round.
    #[error("estimation is already in progress")]
    EstimationInProgress,
    /// The submitted value is not part of the team's deck.
    #[error("estimation value is not part of the deck")]
    ValueNotInDeck,
}

/// One planning poker session: participants, deck, round state, and the
/// per-team message counter feeding every mailbox.
///
/// The registry serializes all access behind a scoped lock; the aggregate
/// itself is single-threaded by construction.
#[derive(Debug)]
pub struct Team {
    name: String,
    state: TeamState,
    deck: Deck,
    /// Keyed by lowercased name; values keep the display casing.
    participants: IndexMap<String, Participant>,
    /// Submitted picks for the open round, keyed by lowercased name.
    estimations: IndexMap<String, Estimation>,
    next_message_id: MessageId,
    updated_at: OffsetDateTime,
}

impl Team {
    /// Create a team with its scrum master already seated.
    pub fn new(
        name: impl Into<String>,
        scrum_master: impl Into<String>,
        deck: Deck,
    ) -> Result<Self, TeamError> {
        let name = name.into();
        let scrum_master = scrum_master.into();
        if name.trim().is_empty() || scrum_master.trim().is_empty() {
            return Err(TeamError::EmptyName);
        }
        if deck.is_empty() {
            return Err(TeamError::EmptyDeck);
        }

        let mut team = Self {
            name,
            state: TeamState::Initial,
            deck,
            participants: IndexMap::new(),
            estimations: IndexMap::new(),
            next_message_id: 1,
            updated_at: OffsetDateTime::now_utc(),
        };
        team.seat(Participant::new(scrum_master, Role::ScrumMaster));
        Ok(team)
    }

    /// Rebuild a team from persisted or replicated parts.
    pub(crate) fn from_parts(
        name: String,
        state: TeamState,
        deck: Deck,
        participants: Vec<Participant>,
        estimations: IndexMap<String, Estimation>,
        next_message_id: MessageId,
        updated_at: OffsetDateTime,
    ) -> Self {
        let participants = participants
            .into_iter()
            .map(|p| (p.name.to_lowercase(), p))
            .collect();
        Self {
            name,
            state,
            deck,
            participants,
            estimations,
            next_message_id,
            updated_at,
        }
    }

    /// Display name of the team.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current round state.
    pub fn state(&self) -> TeamState {
        self.state
    }

    /// Deck the team estimates with.
    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    /// Last time any operation mutated the team.
    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    /// Next message id to be assigned (exposed for snapshotting).
    pub(crate) fn next_message_id(&self) -> MessageId {
        self.next_message_id
    }

    /// Submitted picks of the open round (exposed for snapshotting).
    pub(crate) fn estimations(&self) -> &IndexMap<String, Estimation> {
        &self.estimations
    }

    /// All participants in join order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Look up a participant by case-insensitive name.
    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants.get(&name.to_lowercase())
    }

    /// Mutable participant lookup by case-insensitive name.
    pub fn participant_mut(&mut self, name: &str) -> Option<&mut Participant> {
        self.participants.get_mut(&name.to_lowercase())
    }

    /// The scrum master, when one is seated.
    pub fn scrum_master(&self) -> Option<&Participant> {
        self.participants
            .values()
            .find(|p| p.role == Role::ScrumMaster)
    }

    /// Number of non-dormant participants.
    pub fn active_count(&self) -> usize {
        self.participants.values().filter(|p| !p.dormant).count()
    }

    /// Add a participant. Names are unique across every role; a clash with a
    /// different role is rejected just like a clash with the same one.
    pub fn join(&mut self, name: &str, as_observer: bool) -> Result<Vec<Message>, TeamError> {
        if name.trim().is_empty() {
            return Err(TeamError::EmptyName);
        }
        let key = name.to_lowercase();
        if self.participants.contains_key(&key) {
            return Err(TeamError::AlreadyJoined(name.to_string()));
        }

        let role = if as_observer { Role::Observer } else { Role::Member };
        self.seat(Participant::new(name, role));
        let joined = self.broadcast(MessageBody::MemberJoined {
            name: name.to_string(),
            role,
        });
        Ok(vec![joined])
    }

    /// Clear the dormant flag after a client re-established its connection.
    pub fn reconnect(&mut self, name: &str) -> Result<(), TeamError> {
        let participant = self
            .participants
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| TeamError::UnknownParticipant(name.to_string()))?;
        participant.dormant = false;
        participant.touch();
        self.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    /// Mark a participant dormant and notify the team.
    ///
    /// The participant is retained for a later [`Team::reconnect`]; whether
    /// the team itself survives is the registry's decision based on
    /// [`Team::active_count`]. A round in progress may complete here when the
    /// leaver was the last missing voter.
    pub fn disconnect(&mut self, name: &str) -> Result<Vec<Message>, TeamError> {
        let key = name.to_lowercase();
        let participant = self
            .participants
            .get_mut(&key)
            .ok_or_else(|| TeamError::UnknownParticipant(name.to_string()))?;
        if participant.dormant {
            return Ok(Vec::new());
        }
        participant.dormant = true;
        let display = participant.name.clone();

        let mut messages = vec![self.broadcast(MessageBody::MemberDisconnected { name: display })];
        if let Some(ended) = self.maybe_finish_estimation() {
            messages.push(ended);
        }
        Ok(messages)
    }

    /// Permanently remove a participant; only the scrum master may do this.
    pub fn kick(&mut self, caller: &str, name: &str) -> Result<Vec<Message>, TeamError> {
        self.require_scrum_master(caller)?;
        let key = name.to_lowercase();
        let removed = self
            .participants
            .shift_remove(&key)
            .ok_or_else(|| TeamError::UnknownParticipant(name.to_string()))?;
        self.estimations.shift_remove(&key);

        let mut messages = vec![self.broadcast(MessageBody::MemberDisconnected {
            name: removed.name,
        })];
        if let Some(ended) = self.maybe_finish_estimation() {
            messages.push(ended);
        }
        Ok(messages)
    }

    /// Open a new estimation round. Scrum master only.
    pub fn start_estimation(&mut self, caller: &str) -> Result<Vec<Message>, TeamError> {
        self.require_scrum_master(caller)?;
        if self.state == TeamState::EstimationInProgress {
            return Err(TeamError::EstimationInProgress);
        }
        self.state = TeamState::EstimationInProgress;
        self.estimations.clear();
        Ok(vec![self.broadcast(MessageBody::EstimationStarted)])
    }

    /// Cancel the round in progress. Scrum master only.
    pub fn cancel_estimation(&mut self, caller: &str) -> Result<Vec<Message>, TeamError> {
        self.require_scrum_master(caller)?;
        if self.state != TeamState::EstimationInProgress {
            return Err(TeamError::EstimationNotInProgress);
        }
        self.state = TeamState::EstimationCanceled;
        Ok(vec![self.broadcast(MessageBody::EstimationCanceled)])
    }

    /// Record a voter's pick. `null` and infinity are first-class values as
    /// long as the deck offers them. Completes the round when every active
    /// voter has submitted.
    pub fn submit_estimation(
        &mut self,
        name: &str,
        value: Estimation,
    ) -> Result<Vec<Message>, TeamError> {
        if self.state != TeamState::EstimationInProgress {
            return Err(TeamError::EstimationNotInProgress);
        }
        if !self.deck.contains(&value) {
            return Err(TeamError::ValueNotInDeck);
        }
        let key = name.to_lowercase();
        let participant = self
            .participants
            .get(&key)
            .ok_or_else(|| TeamError::UnknownParticipant(name.to_string()))?;
        if !participant.role.can_vote() {
            return Err(TeamError::NotVoter(name.to_string()));
        }
        if participant.dormant {
            return Err(TeamError::Dormant(name.to_string()));
        }
        let display = participant.name.clone();

        self.estimations.insert(key, value);
        let mut messages = vec![self.broadcast(MessageBody::MemberEstimated { name: display })];
        if let Some(ended) = self.maybe_finish_estimation() {
            messages.push(ended);
        }
        Ok(messages)
    }

    /// Replace the deck. Scrum master only, and never mid-round.
    pub fn change_deck(&mut self, caller: &str, deck: Deck) -> Result<Vec<Message>, TeamError> {
        self.require_scrum_master(caller)?;
        if self.state == TeamState::EstimationInProgress {
            return Err(TeamError::EstimationInProgress);
        }
        if deck.is_empty() {
            return Err(TeamError::EmptyDeck);
        }
        self.deck = deck.clone();
        Ok(vec![
            self.broadcast(MessageBody::AvailableEstimationsChanged { deck }),
        ])
    }

    /// Apply a domain event produced on another node to this replica.
    ///
    /// The event is re-delivered to local mailboxes with fresh local ids so
    /// the per-mailbox ordering invariant stays intact; `estimation` carries
    /// the hidden pick for `MemberEstimated` events so a replica can complete
    /// a round that finished across nodes. Events that no longer apply (an
    /// already-finished round, an unknown leaver) are dropped silently;
    /// divergence is repaired by the next snapshot exchange.
    pub fn apply_remote(
        &mut self,
        body: &MessageBody,
        estimation: Option<Estimation>,
    ) -> Vec<Message> {
        let mut messages = Vec::new();
        match body {
            MessageBody::MemberJoined { name, role } => {
                let key = name.to_lowercase();
                if self.participants.contains_key(&key) {
                    return messages;
                }
                self.seat(Participant::new(name.clone(), *role));
                messages.push(self.broadcast(body.clone()));
            }
            MessageBody::MemberDisconnected { name } => {
                let Some(participant) = self.participants.get_mut(&name.to_lowercase()) else {
                    return messages;
                };
                if participant.dormant {
                    return messages;
                }
                participant.dormant = true;
                messages.push(self.broadcast(body.clone()));
                if let Some(ended) = self.maybe_finish_estimation() {
                    messages.push(ended);
                }
            }
            MessageBody::EstimationStarted => {
                self.state = TeamState::EstimationInProgress;
                self.estimations.clear();
                messages.push(self.broadcast(body.clone()));
            }
            MessageBody::EstimationCanceled => {
                if self.state != TeamState::EstimationInProgress {
                    return messages;
                }
                self.state = TeamState::EstimationCanceled;
                messages.push(self.broadcast(body.clone()));
            }
            MessageBody::MemberEstimated { name } => {
                if self.state != TeamState::EstimationInProgress {
                    return messages;
                }
                if let Some(value) = estimation {
                    self.estimations.insert(name.to_lowercase(), value);
                }
                messages.push(self.broadcast(body.clone()));
                if let Some(ended) = self.maybe_finish_estimation() {
                    messages.push(ended);
                }
            }
            MessageBody::EstimationEnded { .. } => {
                if self.state == TeamState::EstimationFinished {
                    return messages;
                }
                self.state = TeamState::EstimationFinished;
                messages.push(self.broadcast(body.clone()));
            }
            MessageBody::AvailableEstimationsChanged { deck } => {
                self.deck = deck.clone();
                messages.push(self.broadcast(body.clone()));
            }
        }
        messages
    }

    fn seat(&mut self, participant: Participant) {
        self.participants
            .insert(participant.name.to_lowercase(), participant);
        self.updated_at = OffsetDateTime::now_utc();
    }

    fn require_scrum_master(&self, caller: &str) -> Result<(), TeamError> {
        let participant = self
            .participants
            .get(&caller.to_lowercase())
            .ok_or_else(|| TeamError::UnknownParticipant(caller.to_string()))?;
        if participant.role != Role::ScrumMaster {
            return Err(TeamError::NotScrumMaster(caller.to_string()));
        }
        Ok(())
    }

    /// Assign the next id and deliver the message to every mailbox, dormant
    /// participants included (their mailbox survives for reconnection).
    fn broadcast(&mut self, body: MessageBody) -> Message {
        let message = Message {
            id: self.next_message_id,
            body,
        };
        self.next_message_id += 1;
        self.updated_at = OffsetDateTime::now_utc();
        for participant in self.participants.values_mut() {
            participant.deliver(message.clone());
        }
        message
    }

    /// Finish the round when every active voter has submitted.
    fn maybe_finish_estimation(&mut self) -> Option<Message> {
        if self.state != TeamState::EstimationInProgress {
            return None;
        }
        let voters: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.role.can_vote() && !p.dormant)
            .collect();
        if voters.is_empty() {
            return None;
        }
        let complete = voters
            .iter()
            .all(|p| self.estimations.contains_key(&p.name.to_lowercase()));
        if !complete {
            return None;
        }

        let results: IndexMap<String, Estimation> = self
            .estimations
            .iter()
            .map(|(key, value)| {
                let display = self
                    .participants
                    .get(key)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| key.clone());
                (display, *value)
            })
            .collect();
        self.state = TeamState::EstimationFinished;
        Some(self.broadcast(MessageBody::EstimationEnded { results }))
    }
}
