use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, NodeMessage, NodeMessageKind, NodePayload, TeamEventPayload};
use crate::dao::models::TeamSnapshot;
use crate::error::ServiceError;
use crate::services::team_service;
use crate::state::team::Team;
use crate::state::{SharedState, TeamGuard};

/// Drive node synchronization over the installed bus: register, discover
/// existing sessions, and serve peer requests until the bus closes.
///
/// Spawned once per node next to the housekeeping task.
pub async fn run(state: SharedState) {
    let Some(bus) = state.bus().await else {
        warn!("no bus installed; node runs standalone");
        return;
    };
    if let Err(err) = bus.register(state.node_id()).await {
        warn!(error = %err, "failed to register on the bus; node runs standalone");
        return;
    }
    let mut inbox = bus.messages();

    // Discover sessions created before this node started.
    let _ = bus
        .send(NodeMessage::request_team_list(state.node_id()))
        .await;
    info!(node = state.node_id(), "node synchronization started");

    loop {
        match inbox.recv().await {
            Ok(message) => handle_message(&state, bus.as_ref(), message).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Lost announcements are repaired by snapshot fetches later.
                warn!(skipped, "bus inbox lagged; messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("node synchronization stopped");
}

/// Fetch a team whose name is still initializing: ask the cluster for the
/// snapshot and wait, bounded, for the placeholder to resolve.
///
/// A timeout abandons the placeholder so the name stops blocking lookups and
/// creation; the caller then observes not-found and may retry normally.
pub(crate) async fn fetch_team(
    state: &SharedState,
    team_name: &str,
    mut resolved: watch::Receiver<bool>,
) -> Result<TeamGuard, ServiceError> {
    if let Some(bus) = state.bus().await {
        let _ = bus
            .send(NodeMessage::request_teams(
                state.node_id(),
                vec![team_name.to_string()],
            ))
            .await;
    }

    let wait = state.config().lock_wait;
    let outcome = timeout(wait, async {
        while !*resolved.borrow() {
            if resolved.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if outcome.is_err() {
        debug!(team = %team_name, "snapshot fetch timed out; abandoning placeholder");
        state.registry().abandon_initializing(team_name);
    }

    state.registry().get_team(team_name).await
}

async fn handle_message(state: &SharedState, bus: &dyn MessageBus, message: NodeMessage) {
    match (message.kind, message.payload) {
        (NodeMessageKind::RequestTeamList, _) => {
            let reply = NodeMessage::team_list(
                state.node_id(),
                message.sender,
                state.registry().team_names(),
            );
            let _ = bus.send(reply).await;
        }
        (NodeMessageKind::TeamList, NodePayload::TeamNames(names)) => {
            for name in names {
                if state.registry().mark_initializing(&name) {
                    debug!(team = %name, peer = %message.sender, "peer team marked initializing");
                }
            }
        }
        (NodeMessageKind::RequestTeams, NodePayload::TeamNames(names)) => {
            for name in names {
                match state.registry().get_if_present(&name).await {
                    Ok(Some(guard)) => {
                        let snapshot = TeamSnapshot::of(&guard);
                        drop(guard);
                        let reply = NodeMessage::initialize_team(
                            state.node_id(),
                            message.sender.clone(),
                            snapshot,
                        );
                        let _ = bus.send(reply).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(team = %name, error = %err, "could not snapshot team for peer");
                    }
                }
            }
        }
        (
            NodeMessageKind::TeamCreated | NodeMessageKind::InitializeTeam,
            NodePayload::Snapshot(snapshot),
        ) => attach_snapshot(state, snapshot).await,
        (NodeMessageKind::TeamMessage, NodePayload::TeamEvent(event)) => {
            apply_team_event(state, event).await;
        }
        (kind, _) => {
            // The codecs enforce kind/payload pairing; anything else points
            // at a peer speaking a different dialect.
            warn!(kind = kind.name(), sender = %message.sender, "dropping malformed bus message");
        }
    }
}

/// Attach a replica exactly once; a racing local copy wins and the snapshot
/// is discarded.
async fn attach_snapshot(state: &SharedState, snapshot: TeamSnapshot) {
    let entity = snapshot.team;
    let name = entity.name.clone();
    let team: Team = entity.clone().into();
    if state.registry().attach_team(team) {
        debug!(team = %name, "attached replica from peer snapshot");
        if let Err(err) = state.registry().store().save_team(entity).await {
            warn!(team = %name, error = %err, "failed to persist attached replica");
        }
    } else {
        debug!(team = %name, "discarded snapshot for team already held");
    }
}

/// Apply a forwarded domain event to the local replica, if one exists.
async fn apply_team_event(state: &SharedState, event: TeamEventPayload) {
    match state.registry().get_if_present(&event.team).await {
        Ok(Some(mut guard)) => {
            let messages = guard.apply_remote(&event.message.body, event.estimation);
            // Locally generated follow-ups (an EstimationEnded, the removal
            // rule) stay local; re-broadcasting them would echo forever.
            team_service::finish_mutation(state, &event.team, guard, &messages).await;
        }
        Ok(None) => {
            debug!(team = %event.team, "ignoring event for team not held here");
        }
        Err(err) => {
            // Divergence is repaired by the next snapshot exchange.
            warn!(team = %event.team, error = %err, "could not apply forwarded event");
        }
    }
}
