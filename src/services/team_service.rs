use tracing::debug;

use crate::bus::{NodeMessage, TeamEventPayload};
use crate::dao::models::{TeamEntity, TeamSnapshot};
use crate::error::ServiceError;
use crate::services::sync;
use crate::state::estimation::{Deck, Estimation};
use crate::state::message::{Message, MessageBody};
use crate::state::team::Team;
use crate::state::{Lookup, SharedState, TeamGuard};

/// Create a new team with the given scrum master and return its snapshot.
///
/// The creation is announced to the cluster so peers can pre-populate the
/// replica when asked for it later.
pub async fn create_team(
    state: &SharedState,
    team_name: &str,
    scrum_master: &str,
    deck: Option<Deck>,
) -> Result<TeamEntity, ServiceError> {
    let team = Team::new(team_name, scrum_master, deck.unwrap_or_else(Deck::standard))?;
    let guard = state.registry().create_team(team).await?;
    let snapshot = TeamSnapshot::of(&guard);
    let entity = snapshot.team.clone();
    drop(guard);

    send_to_bus(state, NodeMessage::team_created(state.node_id(), snapshot)).await;
    debug!(team = %team_name, "team created");
    Ok(entity)
}

/// Join an existing team as a member or observer.
pub async fn join_team(
    state: &SharedState,
    team_name: &str,
    participant_name: &str,
    as_observer: bool,
) -> Result<TeamEntity, ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.join(participant_name, as_observer)?;
    state.registry().persist(&guard).await;
    let entity = TeamEntity::from_team(&guard);
    drop(guard);

    publish_events(state, team_name, &messages, None).await;
    Ok(entity)
}

/// Reconnect a dormant participant and return the current team snapshot.
pub async fn reconnect(
    state: &SharedState,
    team_name: &str,
    participant_name: &str,
) -> Result<TeamEntity, ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    guard.reconnect(participant_name)?;
    state.registry().persist(&guard).await;
    Ok(TeamEntity::from_team(&guard))
}

/// Disconnect a participant, destroying the team when nobody active remains.
pub async fn disconnect(
    state: &SharedState,
    team_name: &str,
    participant_name: &str,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.disconnect(participant_name)?;
    finish_mutation(state, team_name, guard, &messages).await;
    publish_events(state, team_name, &messages, None).await;
    Ok(())
}

/// Permanently remove a participant; scrum master only.
pub async fn kick(
    state: &SharedState,
    team_name: &str,
    caller: &str,
    participant_name: &str,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.kick(caller, participant_name)?;
    finish_mutation(state, team_name, guard, &messages).await;
    publish_events(state, team_name, &messages, None).await;
    Ok(())
}

/// Open a new estimation round; scrum master only.
pub async fn start_estimation(
    state: &SharedState,
    team_name: &str,
    caller: &str,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.start_estimation(caller)?;
    state.registry().persist(&guard).await;
    drop(guard);
    publish_events(state, team_name, &messages, None).await;
    Ok(())
}

/// Cancel the round in progress; scrum master only.
pub async fn cancel_estimation(
    state: &SharedState,
    team_name: &str,
    caller: &str,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.cancel_estimation(caller)?;
    state.registry().persist(&guard).await;
    drop(guard);
    publish_events(state, team_name, &messages, None).await;
    Ok(())
}

/// Submit a voter's pick for the open round.
pub async fn submit_estimation(
    state: &SharedState,
    team_name: &str,
    participant_name: &str,
    value: Estimation,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.submit_estimation(participant_name, value)?;
    state.registry().persist(&guard).await;
    drop(guard);
    publish_events(state, team_name, &messages, Some(value)).await;
    Ok(())
}

/// Switch the team to a different deck; scrum master only, never mid-round.
pub async fn change_deck(
    state: &SharedState,
    team_name: &str,
    caller: &str,
    deck: Deck,
) -> Result<(), ServiceError> {
    let mut guard = locate_team(state, team_name).await?;
    let messages = guard.change_deck(caller, deck)?;
    state.registry().persist(&guard).await;
    drop(guard);
    publish_events(state, team_name, &messages, None).await;
    Ok(())
}

/// Resolve a team name to a locked guard, fetching the snapshot from a peer
/// first when the name is still initializing.
pub(crate) async fn locate_team(
    state: &SharedState,
    team_name: &str,
) -> Result<TeamGuard, ServiceError> {
    match state.registry().find(team_name).await? {
        Lookup::Found(guard) => Ok(guard),
        Lookup::Initializing(resolved) => sync::fetch_team(state, team_name, resolved).await,
        Lookup::NotFound => Err(ServiceError::NotFound(format!("team `{team_name}`"))),
    }
}

/// Apply the reactive removal rule after a mutation: a team left with zero
/// active participants is destroyed under its own lock; otherwise persist.
pub(crate) async fn finish_mutation(
    state: &SharedState,
    team_name: &str,
    mut guard: TeamGuard,
    messages: &[Message],
) {
    let disconnected = messages
        .iter()
        .any(|m| matches!(m.body, MessageBody::MemberDisconnected { .. }));
    if disconnected && guard.active_count() == 0 {
        debug!(team = %team_name, "last active participant left; removing team");
        state.registry().evict_team(&mut guard).await;
    } else if !messages.is_empty() {
        state.registry().persist(&guard).await;
    }
}

/// Forward locally-produced domain events to the cluster, attaching the
/// hidden pick to `MemberEstimated` events so replicas can complete rounds.
pub(crate) async fn publish_events(
    state: &SharedState,
    team_name: &str,
    messages: &[Message],
    estimation: Option<Estimation>,
) {
    if messages.is_empty() {
        return;
    }
    let Some(bus) = state.bus().await else {
        return;
    };
    for message in messages {
        let hidden_pick = match &message.body {
            MessageBody::MemberEstimated { .. } => estimation,
            _ => None,
        };
        let envelope = NodeMessage::team_event(
            state.node_id(),
            TeamEventPayload {
                team: team_name.to_string(),
                message: message.clone(),
                estimation: hidden_pick,
            },
        );
        // Best-effort: the bus logs and drops after its single retry.
        let _ = bus.send(envelope).await;
    }
}

async fn send_to_bus(state: &SharedState, message: NodeMessage) {
    if let Some(bus) = state.bus().await {
        let _ = bus.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::AppConfig;
    use crate::dao::memory::InMemoryTeamStore;
    use crate::state::AppState;

    fn fresh_state() -> (SharedState, InMemoryTeamStore) {
        let store = InMemoryTeamStore::new();
        let state = AppState::with_node_id(
            "node-test",
            AppConfig::default(),
            Arc::new(store.clone()),
        );
        (state, store)
    }

    #[tokio::test]
    async fn create_join_estimate_full_flow() {
        let (state, _store) = fresh_state();
        let entity = create_team(&state, "My Team", "Duracellko", None)
            .await
            .unwrap();
        assert_eq!(entity.participants.len(), 1);

        join_team(&state, "My Team", "Me", false).await.unwrap();
        start_estimation(&state, "My Team", "Duracellko")
            .await
            .unwrap();
        submit_estimation(&state, "My Team", "Duracellko", Estimation::number(20.0))
            .await
            .unwrap();
        submit_estimation(&state, "My Team", "Me", Estimation::number(5.0))
            .await
            .unwrap();

        let guard = state.registry().get_team("My Team").await.unwrap();
        let ended = guard
            .participant("Me")
            .unwrap()
            .queued_messages()
            .rev()
            .find_map(|m| match &m.body {
                MessageBody::EstimationEnded { results } => Some(results.clone()),
                _ => None,
            })
            .expect("round did not finish");
        assert_eq!(ended["Duracellko"], Estimation::number(20.0));
        assert_eq!(ended["Me"], Estimation::number(5.0));
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let (state, _store) = fresh_state();
        create_team(&state, "My Team", "Duracellko", None)
            .await
            .unwrap();
        let err = create_team(&state, "my team", "Other", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn last_disconnect_destroys_the_team() {
        let (state, store) = fresh_state();
        create_team(&state, "Short", "Duracellko", None).await.unwrap();
        disconnect(&state, "Short", "Duracellko").await.unwrap();

        let err = state.registry().get_team("Short").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(store.is_empty(), "team not deleted from the store");
    }

    #[tokio::test]
    async fn scrum_master_disconnect_keeps_remaining_members() {
        let (state, store) = fresh_state();
        create_team(&state, "Sticky", "Duracellko", None).await.unwrap();
        join_team(&state, "Sticky", "Me", false).await.unwrap();

        disconnect(&state, "Sticky", "Duracellko").await.unwrap();
        let guard = state.registry().get_team("Sticky").await.unwrap();
        assert_eq!(guard.active_count(), 1);
        drop(guard);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn operations_on_unknown_team_are_not_found() {
        let (state, _store) = fresh_state();
        let err = join_team(&state, "Nowhere", "Me", false).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let err = start_estimation(&state, "Nowhere", "Me").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
