use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::services::team_service;
use crate::state::SharedState;
use crate::state::message::Message;

/// Periodic maintenance loop: disconnect participants gone quiet, remove
/// teams nobody active is left in, and purge expired teams from the store.
///
/// Spawned once per node; runs until the process exits.
pub async fn run(state: SharedState) {
    let interval = state.config().housekeeping_interval;
    loop {
        sleep(interval).await;
        sweep(&state).await;
    }
}

/// One maintenance pass over every local team.
///
/// Each team is handled under its own scoped lock; a busy team is skipped
/// and picked up by the next tick. Bus publication happens after the lock is
/// released.
pub async fn sweep(state: &SharedState) {
    if let Err(err) = state
        .registry()
        .store()
        .delete_expired(state.config().team_expiry)
        .await
    {
        warn!(error = %err, "failed to purge expired teams from store");
    }

    let inactivity = state.config().participant_inactivity;
    let cutoff = OffsetDateTime::now_utc() - inactivity;

    for name in state.registry().team_names() {
        let mut guard = match state.registry().get_if_present(&name).await {
            Ok(Some(guard)) => guard,
            Ok(None) => continue,
            Err(ServiceError::Busy) => {
                debug!(team = %name, "team busy during sweep; retrying next tick");
                continue;
            }
            Err(err) => {
                warn!(team = %name, error = %err, "sweep could not lock team");
                continue;
            }
        };

        let stale: Vec<String> = guard
            .participants()
            .filter(|p| !p.dormant && p.last_activity < cutoff)
            .map(|p| p.name.clone())
            .collect();
        if stale.is_empty() {
            continue;
        }

        let mut messages: Vec<Message> = Vec::new();
        for participant in &stale {
            match guard.disconnect(participant) {
                Ok(disconnected) => {
                    debug!(team = %name, participant = %participant, "disconnected inactive participant");
                    messages.extend(disconnected);
                }
                Err(err) => {
                    warn!(team = %name, participant = %participant, error = %err, "sweep disconnect failed");
                }
            }
        }

        team_service::finish_mutation(state, &name, guard, &messages).await;
        team_service::publish_events(state, &name, &messages, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::AppConfig;
    use crate::dao::memory::InMemoryTeamStore;
    use crate::services::team_service;
    use crate::state::AppState;

    fn state_with_inactivity(inactivity: Duration) -> SharedState {
        let mut config = AppConfig::default();
        config.participant_inactivity = inactivity;
        AppState::with_node_id("node-test", config, Arc::new(InMemoryTeamStore::new()))
    }

    #[tokio::test]
    async fn sweep_disconnects_inactive_participants() {
        let state = state_with_inactivity(Duration::from_millis(50));
        team_service::create_team(&state, "Quiet", "Duracellko", None)
            .await
            .unwrap();
        team_service::join_team(&state, "Quiet", "Me", false)
            .await
            .unwrap();

        // "Me" keeps polling; the scrum master goes silent.
        tokio::time::sleep(Duration::from_millis(80)).await;
        {
            let mut guard = state.registry().get_team("Quiet").await.unwrap();
            guard.participant_mut("Me").unwrap().touch();
        }

        sweep(&state).await;

        let guard = state.registry().get_team("Quiet").await.unwrap();
        assert!(guard.participant("Duracellko").unwrap().dormant);
        assert!(!guard.participant("Me").unwrap().dormant);
    }

    #[tokio::test]
    async fn sweep_removes_fully_inactive_teams() {
        let state = state_with_inactivity(Duration::from_millis(50));
        team_service::create_team(&state, "Dead", "Duracellko", None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        sweep(&state).await;

        let err = state.registry().get_team("Dead").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(state.registry().team_names().is_empty());
    }

    #[tokio::test]
    async fn sweep_leaves_active_teams_alone() {
        let state = state_with_inactivity(Duration::from_secs(60));
        team_service::create_team(&state, "Alive", "Duracellko", None)
            .await
            .unwrap();

        sweep(&state).await;

        let guard = state.registry().get_team("Alive").await.unwrap();
        assert!(!guard.participant("Duracellko").unwrap().dormant);
    }
}
