use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::state::message::{Message, MessageId};

/// Role of a participant inside a team.
///
/// A member is a specialization of an observer, and the scrum master a
/// specialization of a member; `can_vote` encodes the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Watches the session without voting.
    Observer,
    /// Votes in estimation rounds.
    Member,
    /// Runs the session; votes like a member.
    ScrumMaster,
}

impl Role {
    /// Whether this role submits estimations.
    pub fn can_vote(&self) -> bool {
        matches!(self, Role::Member | Role::ScrumMaster)
    }
}

/// Notification handle shared between a participant's mailbox and the one
/// task allowed to wait on it.
#[derive(Debug, Default)]
pub struct MailboxSignal {
    notify: Notify,
    waiting: AtomicBool,
}

impl MailboxSignal {
    /// Claim the single waiter slot. Fails when another wait is in flight.
    pub fn begin_wait(&self) -> bool {
        !self.waiting.swap(true, Ordering::AcqRel)
    }

    /// Release the waiter slot. Safe to call from any exit path.
    pub fn end_wait(&self) {
        self.waiting.store(false, Ordering::Release);
    }

    /// Wake the waiter, storing a permit when nobody waits yet.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Await the next wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Drop a permit left over from a push that was already drained under the
    /// team lock, so the next wait does not wake spuriously.
    pub fn clear_pending(&self) {
        use futures::FutureExt;
        let _ = self.notify.notified().now_or_never();
    }
}

/// A participant of a team: observer, member, or scrum master.
#[derive(Debug)]
pub struct Participant {
    /// Display name, unique within the team case-insensitively.
    pub name: String,
    /// Role ladder position.
    pub role: Role,
    /// Disconnected but retained for a possible reconnection.
    pub dormant: bool,
    /// Last time this participant showed any activity.
    pub last_activity: OffsetDateTime,
    mailbox: VecDeque<Message>,
    signal: Arc<MailboxSignal>,
}

impl Participant {
    /// Create a fresh, active participant with an empty mailbox.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            dormant: false,
            last_activity: OffsetDateTime::now_utc(),
            mailbox: VecDeque::new(),
            signal: Arc::new(MailboxSignal::default()),
        }
    }

    /// Refresh the activity clock.
    pub fn touch(&mut self) {
        self.last_activity = OffsetDateTime::now_utc();
    }

    /// Append a message and wake a pending waiter.
    pub fn deliver(&mut self, message: Message) {
        self.mailbox.push_back(message);
        self.signal.wake();
    }

    /// Remove and return all queued messages, refreshing activity.
    pub fn take_messages(&mut self) -> Vec<Message> {
        self.touch();
        self.mailbox.drain(..).collect()
    }

    /// Whether any messages are queued.
    pub fn has_messages(&self) -> bool {
        !self.mailbox.is_empty()
    }

    /// Id of the most recently delivered message, if any.
    pub fn last_message_id(&self) -> Option<MessageId> {
        self.mailbox.back().map(|m| m.id)
    }

    /// Shared handle used by the message channel to wait for deliveries.
    pub fn signal(&self) -> Arc<MailboxSignal> {
        Arc::clone(&self.signal)
    }

    /// Snapshot of the queued messages, oldest first.
    pub fn queued_messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.mailbox.iter()
    }

    /// Restore a mailbox from persisted or replicated state.
    pub fn restore_mailbox(&mut self, messages: Vec<Message>) {
        self.mailbox = messages.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::message::MessageBody;

    fn message(id: MessageId) -> Message {
        Message {
            id,
            body: MessageBody::EstimationStarted,
        }
    }

    #[test]
    fn deliver_and_drain_preserve_order() {
        let mut participant = Participant::new("Me", Role::Member);
        participant.deliver(message(1));
        participant.deliver(message(2));
        assert_eq!(participant.last_message_id(), Some(2));

        let drained = participant.take_messages();
        assert_eq!(drained.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!participant.has_messages());
    }

    #[test]
    fn only_one_waiter_can_claim_the_signal() {
        let signal = MailboxSignal::default();
        assert!(signal.begin_wait());
        assert!(!signal.begin_wait());
        signal.end_wait();
        assert!(signal.begin_wait());
    }

    #[tokio::test]
    async fn wake_releases_a_pending_wait() {
        let signal = Arc::new(MailboxSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.notified().await })
        };
        signal.wake();
        waiter.await.unwrap();
    }
}
