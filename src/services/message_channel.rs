use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::ServiceError;
use crate::state::SharedState;
use crate::state::message::Message;
use crate::state::participant::MailboxSignal;

/// Sender half of a cancellation pair; dropping it never cancels.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Abort the paired wait.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation pair, passed into [`get_messages`].
#[derive(Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires, for callers without a cancellation source.
    pub fn never() -> Self {
        Self { rx: None }
    }

    async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; wait forever.
                return std::future::pending().await;
            }
        }
    }
}

/// Create a linked cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

/// Releases the single-waiter claim on every exit path.
struct WaitClaim {
    signal: Arc<MailboxSignal>,
}

impl Drop for WaitClaim {
    fn drop(&mut self) {
        self.signal.end_wait();
    }
}

/// Return the participant's queued messages, waiting up to `wait` for new
/// ones to arrive.
///
/// Already-queued messages are returned immediately. Otherwise the call
/// suspends without holding the team lock, races the participant's delivery
/// notification against the timer and the cancellation signal, and
/// re-acquires the lock before draining the mailbox. A timeout yields an
/// empty result; cancellation yields [`ServiceError::Canceled`]. Exactly one
/// wait per participant may be in flight; a second one is rejected.
pub async fn get_messages(
    state: &SharedState,
    team_name: &str,
    participant_name: &str,
    wait: Duration,
    mut cancel: CancelSignal,
) -> Result<Vec<Message>, ServiceError> {
    let signal = {
        let mut guard = state.registry().get_team(team_name).await?;
        let participant = guard.participant_mut(participant_name).ok_or_else(|| {
            ServiceError::NotFound(format!("participant `{participant_name}`"))
        })?;
        participant.touch();
        if participant.has_messages() {
            return Ok(participant.take_messages());
        }

        let signal = participant.signal();
        if !signal.begin_wait() {
            return Err(ServiceError::InvalidState(format!(
                "another message wait is already in progress for `{participant_name}`"
            )));
        }
        // The mailbox is empty, so any stored permit is stale.
        signal.clear_pending();
        signal
        // Team lock released here; the wait below holds nothing.
    };
    let claim = WaitClaim {
        signal: Arc::clone(&signal),
    };

    tokio::select! {
        _ = signal.notified() => {}
        _ = sleep(wait) => return Ok(Vec::new()),
        _ = cancel.cancelled() => return Err(ServiceError::Canceled),
    }
    drop(claim);

    // Woken by a delivery: re-acquire the lock to read consistently.
    let mut guard = state.registry().get_team(team_name).await?;
    let participant = guard
        .participant_mut(participant_name)
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_name}`")))?;
    Ok(participant.take_messages())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::config::AppConfig;
    use crate::dao::memory::InMemoryTeamStore;
    use crate::state::AppState;
    use crate::state::estimation::Deck;
    use crate::state::team::Team;

    async fn state_with_team() -> SharedState {
        let state = AppState::with_node_id(
            "node-test",
            AppConfig::default(),
            Arc::new(InMemoryTeamStore::new()),
        );
        let team = Team::new("My Team", "Duracellko", Deck::standard()).unwrap();
        let mut guard = state.registry().create_team(team).await.unwrap();
        guard.join("Me", false).unwrap();
        drop(guard);
        state
    }

    async fn drain(state: &SharedState, participant: &str) {
        let mut guard = state.registry().get_team("My Team").await.unwrap();
        guard.participant_mut(participant).unwrap().take_messages();
    }

    #[tokio::test]
    async fn queued_messages_return_immediately() {
        let state = state_with_team().await;
        // Joining queued a message for the scrum master already.
        let messages = get_messages(
            &state,
            "My Team",
            "Duracellko",
            Duration::from_secs(5),
            CancelSignal::never(),
        )
        .await
        .unwrap();
        assert!(!messages.is_empty());
    }

    #[tokio::test]
    async fn empty_mailbox_times_out_no_earlier_than_requested() {
        let state = state_with_team().await;
        drain(&state, "Me").await;

        let wait = Duration::from_millis(100);
        let started = Instant::now();
        let messages = get_messages(&state, "My Team", "Me", wait, CancelSignal::never())
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert!(started.elapsed() >= wait, "returned before the timeout");
    }

    #[tokio::test]
    async fn delivery_wakes_a_pending_wait() {
        let state = state_with_team().await;
        drain(&state, "Me").await;

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                get_messages(
                    &state,
                    "My Team",
                    "Me",
                    Duration::from_secs(5),
                    CancelSignal::never(),
                )
                .await
            })
        };
        // Let the waiter park before producing the event.
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let mut guard = state.registry().get_team("My Team").await.unwrap();
            guard.start_estimation("Duracellko").unwrap();
        }

        let messages = waiter.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_not_a_timeout() {
        let state = state_with_team().await;
        drain(&state, "Me").await;

        let (handle, signal) = cancel_pair();
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                get_messages(&state, "My Team", "Me", Duration::from_secs(30), signal).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::Canceled));
    }

    #[tokio::test]
    async fn second_concurrent_wait_is_rejected() {
        let state = state_with_team().await;
        drain(&state, "Me").await;

        let first = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                get_messages(
                    &state,
                    "My Team",
                    "Me",
                    Duration::from_millis(300),
                    CancelSignal::never(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = get_messages(
            &state,
            "My Team",
            "Me",
            Duration::from_millis(100),
            CancelSignal::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        // The first wait is unaffected and times out normally.
        assert!(first.await.unwrap().unwrap().is_empty());

        // Once it finished, the slot is free again.
        let messages = get_messages(
            &state,
            "My Team",
            "Me",
            Duration::from_millis(50),
            CancelSignal::never(),
        )
        .await
        .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn unknown_participant_is_not_found() {
        let state = state_with_team().await;
        let err = get_messages(
            &state,
            "My Team",
            "Nobody",
            Duration::from_millis(10),
            CancelSignal::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
