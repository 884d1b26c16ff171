use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::state::estimation::{Deck, Estimation};
use crate::state::participant::Role;

/// Per-team monotonic identifier assigned to every delivered message.
pub type MessageId = u64;

/// Immutable domain event delivered to every participant's mailbox.
///
/// Within one mailbox ids are strictly increasing and gap-free in delivery
/// order; no ordering is guaranteed across participants or across nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Mailbox-ordering identifier, unique within the team.
    pub id: MessageId,
    /// The event itself.
    pub body: MessageBody,
}

/// The domain events a planning poker session can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// A participant joined the team.
    MemberJoined {
        /// Display name of the new participant.
        name: String,
        /// Role the participant joined with.
        role: Role,
    },
    /// A participant disconnected (or was removed) from the team.
    MemberDisconnected {
        /// Display name of the participant.
        name: String,
    },
    /// The scrum master started a new estimation round.
    EstimationStarted,
    /// Every active voter submitted; the round is complete.
    EstimationEnded {
        /// Picks per participant, in submission order.
        results: IndexMap<String, Estimation>,
    },
    /// The scrum master canceled the round in progress.
    EstimationCanceled,
    /// A voter submitted an estimation (the value stays hidden until the end).
    MemberEstimated {
        /// Display name of the voter.
        name: String,
    },
    /// The scrum master switched the team to a different deck.
    AvailableEstimationsChanged {
        /// The new deck.
        deck: Deck,
    },
}

impl MessageBody {
    /// Stable name used in logs and transport headers.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MessageBody::MemberJoined { .. } => "member_joined",
            MessageBody::MemberDisconnected { .. } => "member_disconnected",
            MessageBody::EstimationStarted => "estimation_started",
            MessageBody::EstimationEnded { .. } => "estimation_ended",
            MessageBody::EstimationCanceled => "estimation_canceled",
            MessageBody::MemberEstimated { .. } => "member_estimated",
            MessageBody::AvailableEstimationsChanged { .. } => "available_estimations_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimation_ended_round_trips_with_sentinel_values() {
        let mut results = IndexMap::new();
        results.insert("Duracellko".to_string(), Estimation::number(20.0));
        results.insert("Me".to_string(), Estimation::INFINITY);
        results.insert("Lurker".to_string(), Estimation::UNKNOWN);

        let message = Message {
            id: 7,
            body: MessageBody::EstimationEnded { results },
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn body_kind_names_are_stable() {
        assert_eq!(MessageBody::EstimationStarted.kind_name(), "estimation_started");
        assert_eq!(
            MessageBody::MemberDisconnected { name: "x".into() }.kind_name(),
            "member_disconnected"
        );
    }
}
