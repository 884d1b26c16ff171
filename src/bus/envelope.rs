use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dao::models::TeamSnapshot;
use crate::state::estimation::Estimation;
use crate::state::message::Message;

/// Discriminator for everything nodes exchange over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMessageKind {
    /// A session-level domain event forwarded to replicas.
    TeamMessage,
    /// A freshly created team, broadcast with its snapshot.
    TeamCreated,
    /// Full snapshot answering a [`NodeMessageKind::RequestTeams`] query.
    InitializeTeam,
    /// Ordered list of team names a node is holding.
    TeamList,
    /// Ask the owner of the named teams for their snapshots.
    RequestTeams,
    /// Ask every node which teams it holds.
    RequestTeamList,
}

impl NodeMessageKind {
    /// Single-byte encoding used by the binary framing.
    pub fn wire_byte(&self) -> u8 {
        match self {
            NodeMessageKind::TeamMessage => 0,
            NodeMessageKind::TeamCreated => 1,
            NodeMessageKind::InitializeTeam => 2,
            NodeMessageKind::TeamList => 3,
            NodeMessageKind::RequestTeams => 4,
            NodeMessageKind::RequestTeamList => 5,
        }
    }

    /// Inverse of [`NodeMessageKind::wire_byte`].
    pub fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(NodeMessageKind::TeamMessage),
            1 => Some(NodeMessageKind::TeamCreated),
            2 => Some(NodeMessageKind::InitializeTeam),
            3 => Some(NodeMessageKind::TeamList),
            4 => Some(NodeMessageKind::RequestTeams),
            5 => Some(NodeMessageKind::RequestTeamList),
            _ => None,
        }
    }

    /// Stable name used in transport headers and logs.
    pub fn name(&self) -> &'static str {
        match self {
            NodeMessageKind::TeamMessage => "team_message",
            NodeMessageKind::TeamCreated => "team_created",
            NodeMessageKind::InitializeTeam => "initialize_team",
            NodeMessageKind::TeamList => "team_list",
            NodeMessageKind::RequestTeams => "request_teams",
            NodeMessageKind::RequestTeamList => "request_team_list",
        }
    }

    /// Inverse of [`NodeMessageKind::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "team_message" => Some(NodeMessageKind::TeamMessage),
            "team_created" => Some(NodeMessageKind::TeamCreated),
            "initialize_team" => Some(NodeMessageKind::InitializeTeam),
            "team_list" => Some(NodeMessageKind::TeamList),
            "request_teams" => Some(NodeMessageKind::RequestTeams),
            "request_team_list" => Some(NodeMessageKind::RequestTeamList),
            _ => None,
        }
    }
}

/// Session-level event payload: the domain message plus the context a
/// replica needs to apply it.
///
/// `estimation` carries the hidden pick for `MemberEstimated` events; it is
/// never shown to clients but lets a replica finish a round whose voters sit
/// on different nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamEventPayload {
    /// Team the event belongs to.
    pub team: String,
    /// The domain event as delivered to local mailboxes.
    pub message: Message,
    /// Hidden pick accompanying a `MemberEstimated` event.
    #[serde(
        default,
        with = "estimation_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimation: Option<Estimation>,
}

/// Field-level serde for `Option<Estimation>` that keeps "absent" and "the
/// null card" distinguishable: absent fields stay absent, a present `null`
/// is the unknown-card pick.
mod estimation_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Estimation>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(estimation) => estimation.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Estimation>, D::Error> {
        Estimation::deserialize(deserializer).map(Some)
    }
}

/// Typed payload of a [`NodeMessage`]; the valid variant is dictated by the
/// message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload_type", content = "payload", rename_all = "snake_case")]
pub enum NodePayload {
    /// Session-level event (`TeamMessage`).
    TeamEvent(TeamEventPayload),
    /// Full aggregate snapshot (`TeamCreated` / `InitializeTeam`).
    Snapshot(TeamSnapshot),
    /// Ordered team names (`TeamList` / `RequestTeams`).
    TeamNames(Vec<String>),
    /// No payload (`RequestTeamList`).
    Empty,
}

impl NodePayload {
    /// Declared subtype name carried in transport headers; `None` when the
    /// message has no payload.
    pub fn subtype_name(&self) -> Option<&'static str> {
        match self {
            NodePayload::TeamEvent(_) => Some("TeamEventPayload"),
            NodePayload::Snapshot(_) => Some("TeamSnapshot"),
            NodePayload::TeamNames(_) => Some("TeamNameList"),
            NodePayload::Empty => None,
        }
    }
}

/// The envelope every inter-node message travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// What the payload means.
    pub kind: NodeMessageKind,
    /// Node that produced the message.
    pub sender: String,
    /// Target node; `None` broadcasts to every peer.
    pub recipient: Option<String>,
    /// Kind-dependent payload.
    pub payload: NodePayload,
}

impl NodeMessage {
    /// Broadcast a session-level domain event.
    pub fn team_event(sender: impl Into<String>, payload: TeamEventPayload) -> Self {
        Self {
            kind: NodeMessageKind::TeamMessage,
            sender: sender.into(),
            recipient: None,
            payload: NodePayload::TeamEvent(payload),
        }
    }

    /// Broadcast a freshly created team.
    pub fn team_created(sender: impl Into<String>, snapshot: TeamSnapshot) -> Self {
        Self {
            kind: NodeMessageKind::TeamCreated,
            sender: sender.into(),
            recipient: None,
            payload: NodePayload::Snapshot(snapshot),
        }
    }

    /// Answer a snapshot request for one team.
    pub fn initialize_team(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        snapshot: TeamSnapshot,
    ) -> Self {
        Self {
            kind: NodeMessageKind::InitializeTeam,
            sender: sender.into(),
            recipient: Some(recipient.into()),
            payload: NodePayload::Snapshot(snapshot),
        }
    }

    /// Answer a team-list request.
    pub fn team_list(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        names: Vec<String>,
    ) -> Self {
        Self {
            kind: NodeMessageKind::TeamList,
            sender: sender.into(),
            recipient: Some(recipient.into()),
            payload: NodePayload::TeamNames(names),
        }
    }

    /// Ask peers for the snapshots of the named teams.
    pub fn request_teams(sender: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            kind: NodeMessageKind::RequestTeams,
            sender: sender.into(),
            recipient: None,
            payload: NodePayload::TeamNames(names),
        }
    }

    /// Ask every peer which teams it holds.
    pub fn request_team_list(sender: impl Into<String>) -> Self {
        Self {
            kind: NodeMessageKind::RequestTeamList,
            sender: sender.into(),
            recipient: None,
            payload: NodePayload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_round_trip() {
        for kind in [
            NodeMessageKind::TeamMessage,
            NodeMessageKind::TeamCreated,
            NodeMessageKind::InitializeTeam,
            NodeMessageKind::TeamList,
            NodeMessageKind::RequestTeams,
            NodeMessageKind::RequestTeamList,
        ] {
            assert_eq!(NodeMessageKind::from_wire_byte(kind.wire_byte()), Some(kind));
            assert_eq!(NodeMessageKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(NodeMessageKind::from_wire_byte(0x2a), None);
    }

    #[test]
    fn unknown_pick_survives_the_event_payload() {
        use crate::state::message::{Message, MessageBody};

        let payload = TeamEventPayload {
            team: "T".into(),
            message: Message {
                id: 3,
                body: MessageBody::MemberEstimated { name: "Me".into() },
            },
            estimation: Some(Estimation::UNKNOWN),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: TeamEventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.estimation, Some(Estimation::UNKNOWN));

        let without = TeamEventPayload {
            estimation: None,
            ..payload
        };
        let json = serde_json::to_string(&without).unwrap();
        assert!(!json.contains("estimation"));
        let back: TeamEventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.estimation, None);
    }
}
