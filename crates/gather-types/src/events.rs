use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MeetingStatus;

/// State transitions that may produce push notifications.
///
/// Handlers publish one of these after the transition is committed; the
/// notifier decides who hears about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    /// A user was added to a meeting by its organiser
    ParticipantAdded {
        meeting_id: Uuid,
        participant_id: Uuid,
        user_id: Uuid,
        organiser_id: Uuid,
    },

    /// A participant accepted or declined a meeting
    ParticipantAnswered {
        meeting_id: Uuid,
        participant_id: Uuid,
        user_id: Uuid,
        accepted: bool,
    },

    /// A participant reached the meeting point
    ParticipantArrived {
        meeting_id: Uuid,
        participant_id: Uuid,
        user_id: Uuid,
    },

    /// The organiser moved the meeting to a new status
    MeetingStatusChanged {
        meeting_id: Uuid,
        status: MeetingStatus,
    },

    /// A friend request was sent
    FriendRequestCreated {
        friendship_id: Uuid,
        from_id: Uuid,
        to_id: Uuid,
    },

    /// The recipient accepted a friend request
    FriendRequestAccepted {
        friendship_id: Uuid,
        from_id: Uuid,
        to_id: Uuid,
    },

    /// A user posted a new position
    PositionShared { user_id: Uuid },
}
