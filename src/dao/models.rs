use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::state::estimation::{Deck, Estimation};
use crate::state::message::{Message, MessageId};
use crate::state::participant::{Participant, Role};
use crate::state::team::{Team, TeamState};

/// Schema version written into every persisted or replicated snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Participant representation stored in persistence and shipped in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantEntity {
    /// Display name, unique within the team case-insensitively.
    pub name: String,
    /// Role ladder position.
    pub role: Role,
    /// Disconnected but retained pending reconnection.
    pub dormant: bool,
    /// Last observed activity.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    /// Undelivered messages, oldest first.
    pub mailbox: Vec<Message>,
}

/// Aggregate team entity persisted by the storage layer and replicated
/// between nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamEntity {
    /// Display name of the team; stores key it case-insensitively.
    pub name: String,
    /// Current round state.
    pub state: TeamState,
    /// Deck the team estimates with.
    pub deck: Deck,
    /// All participants in join order.
    pub participants: Vec<ParticipantEntity>,
    /// Submitted picks for the open round, keyed by lowercased name.
    pub estimations: IndexMap<String, Estimation>,
    /// Next message id the team will assign.
    pub next_message_id: MessageId,
    /// Last mutation timestamp, drives expiry.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Versioned wrapper around [`TeamEntity`] so nodes running different
/// releases can reject snapshots they do not understand instead of
/// misreading them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamSnapshot {
    /// Schema version, currently [`SNAPSHOT_VERSION`].
    pub version: u32,
    /// The wrapped aggregate.
    pub team: TeamEntity,
}

impl TeamSnapshot {
    /// Wrap a live aggregate in the current schema version.
    pub fn of(team: &Team) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            team: TeamEntity::from_team(team),
        }
    }
}

impl TeamEntity {
    /// Capture the full state of a live aggregate.
    pub fn from_team(team: &Team) -> Self {
        Self {
            name: team.name().to_string(),
            state: team.state(),
            deck: team.deck().clone(),
            participants: team.participants().map(ParticipantEntity::from).collect(),
            estimations: team.estimations().clone(),
            next_message_id: team.next_message_id(),
            updated_at: team.updated_at(),
        }
    }

    /// Number of non-dormant participants without rebuilding the aggregate.
    pub fn active_count(&self) -> usize {
        self.participants.iter().filter(|p| !p.dormant).count()
    }
}

impl From<&Participant> for ParticipantEntity {
    fn from(participant: &Participant) -> Self {
        Self {
            name: participant.name.clone(),
            role: participant.role,
            dormant: participant.dormant,
            last_activity: participant.last_activity,
            mailbox: participant.queued_messages().cloned().collect(),
        }
    }
}

impl From<ParticipantEntity> for Participant {
    fn from(entity: ParticipantEntity) -> Self {
        let mut participant = Participant::new(entity.name, entity.role);
        participant.dormant = entity.dormant;
        participant.last_activity = entity.last_activity;
        participant.restore_mailbox(entity.mailbox);
        participant
    }
}

impl From<TeamEntity> for Team {
    fn from(entity: TeamEntity) -> Self {
        Team::from_parts(
            entity.name,
            entity.state,
            entity.deck,
            entity.participants.into_iter().map(Into::into).collect(),
            entity.estimations,
            entity.next_message_id,
            entity.updated_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_round_trips_a_live_team() {
        let mut team = Team::new("My Team", "Duracellko", Deck::standard()).unwrap();
        team.join("Me", false).unwrap();
        team.start_estimation("Duracellko").unwrap();
        team.submit_estimation("Me", Estimation::INFINITY).unwrap();
        team.disconnect("Me").unwrap();

        let entity = TeamEntity::from_team(&team);
        assert_eq!(entity.active_count(), 1);

        let json = serde_json::to_string(&entity).unwrap();
        let back: TeamEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entity);

        let restored: Team = back.into();
        assert_eq!(restored.name(), "My Team");
        assert_eq!(restored.state(), team.state());
        assert_eq!(restored.active_count(), 1);
        let me = restored.participant("Me").unwrap();
        assert!(me.dormant);
        // Mailboxes survive the round trip in order.
        let original_ids: Vec<_> = team
            .participant("Me")
            .unwrap()
            .queued_messages()
            .map(|m| m.id)
            .collect();
        let restored_ids: Vec<_> = me.queued_messages().map(|m| m.id).collect();
        assert_eq!(restored_ids, original_ids);
    }

    #[test]
    fn snapshot_carries_current_version() {
        let team = Team::new("T", "SM", Deck::rating()).unwrap();
        let snapshot = TeamSnapshot::of(&team);
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.team.name, "T");
    }
}
