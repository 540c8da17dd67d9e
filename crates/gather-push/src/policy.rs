//! Who hears about what.
//!
//! `plan` turns a domain event into the notifications it causes, reading
//! participants and names from the database. `Notifier::publish` executes
//! the plan.

use anyhow::Result;
use tracing::{debug, error};
use uuid::Uuid;

use gather_db::Database;
use gather_db::models::ParticipantRow;
use gather_types::events::DomainEvent;
use gather_types::models::MeetingStatus;

use crate::message::{MessageTag, Notification};
use crate::notifier::Notifier;

pub const MEETING_TAG: &str = "meeting";
pub const FRIENDSHIP_TAG: &str = "friendship";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// One recipient, single-device send.
    User(Uuid),
    /// Several recipients, one bulk request.
    Users(Vec<Uuid>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub audience: Audience,
    pub notification: Notification,
    pub deferred: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub dispatches: Vec<Dispatch>,
    /// Deferred messages to drop once the dispatches are done.
    pub purge: Option<MessageTag>,
}

pub fn plan(db: &Database, event: &DomainEvent) -> Result<Plan> {
    let mut plan = Plan::default();

    match event {
        DomainEvent::ParticipantAdded {
            meeting_id,
            participant_id,
            user_id,
            organiser_id,
        } => {
            if user_id == organiser_id {
                return Ok(plan);
            }
            // Hidden users were declined on their behalf and are not told
            let declined = db
                .get_participant(&participant_id.to_string())?
                .is_none_or(|p| p.has_declined());
            if declined {
                return Ok(plan);
            }

            let organiser = username(db, *organiser_id)?;
            plan.dispatches.push(Dispatch {
                audience: Audience::User(*user_id),
                notification: meeting_notification(
                    "New gathering",
                    format!("{} added you to a meeting", organiser),
                    "new-gathering",
                    *meeting_id,
                    None,
                ),
                deferred: true,
            });
        }

        DomainEvent::ParticipantAnswered {
            meeting_id,
            participant_id,
            user_id,
            accepted,
        } => {
            let recipients = participants_where(db, *meeting_id, |p| {
                p.user_id != user_id.to_string() && !p.has_declined()
            })?;
            let name = username(db, *user_id)?;
            let (title, body, kind) = if *accepted {
                ("Gathering accepted", format!("{} accepted the meeting", name), "user-accepted-meeting")
            } else {
                ("Gathering declined", format!("{} declined the meeting", name), "user-refused-meeting")
            };

            push_group(
                &mut plan,
                recipients,
                meeting_notification(title, body, kind, *meeting_id, Some(*participant_id)),
                true,
            );
        }

        DomainEvent::ParticipantArrived {
            meeting_id,
            participant_id,
            user_id,
        } => {
            let recipients = participants_where(db, *meeting_id, |p| {
                p.user_id != user_id.to_string() && p.has_accepted()
            })?;
            let name = username(db, *user_id)?;

            push_group(
                &mut plan,
                recipients,
                meeting_notification(
                    "Participant arrived",
                    format!("{} arrived at the meeting point", name),
                    "user-arrived-to-meeting",
                    *meeting_id,
                    Some(*participant_id),
                ),
                true,
            );
        }

        DomainEvent::MeetingStatusChanged { meeting_id, status } => {
            let (title, body, kind, deferred) = match status {
                MeetingStatus::Pending => return Ok(plan),
                MeetingStatus::Progress => ("Gathering started", "Your meeting is in progress", "meeting-in-progress", true),
                MeetingStatus::Ended => ("Gathering ended", "Your meeting is over", "meeting-ended", false),
                MeetingStatus::Canceled => ("Gathering canceled", "Your meeting was canceled", "meeting-canceled", false),
            };
            let recipients = participants_where(db, *meeting_id, ParticipantRow::has_accepted)?;

            push_group(
                &mut plan,
                recipients,
                meeting_notification(title, body.to_string(), kind, *meeting_id, None),
                deferred,
            );
            if status.is_terminal() {
                plan.purge = Some(MessageTag::new(MEETING_TAG, meeting_id));
            }
        }

        DomainEvent::FriendRequestCreated {
            friendship_id,
            from_id,
            to_id,
        } => {
            let name = username(db, *from_id)?;
            plan.dispatches.push(Dispatch {
                audience: Audience::User(*to_id),
                notification: friendship_notification(
                    "New friend request",
                    format!("{} wants to be your friend", name),
                    "friend-request",
                    *friendship_id,
                ),
                deferred: true,
            });
        }

        DomainEvent::FriendRequestAccepted {
            friendship_id,
            from_id,
            to_id,
        } => {
            let name = username(db, *to_id)?;
            plan.dispatches.push(Dispatch {
                audience: Audience::User(*from_id),
                notification: friendship_notification(
                    "Friend request accepted",
                    format!("{} is now your friend", name),
                    "friend-request-accepted",
                    *friendship_id,
                ),
                deferred: true,
            });
        }

        DomainEvent::PositionShared { user_id } => {
            let uid = user_id.to_string();
            let name = username(db, *user_id)?;

            for meeting in db.get_active_meeting_ids_for(&uid)? {
                let participants = db.get_participants(&meeting)?;
                let Some(own) = participants.iter().find(|p| p.user_id == uid) else {
                    continue;
                };
                let recipients = participants
                    .iter()
                    .filter(|p| p.user_id != uid && p.has_accepted())
                    .filter_map(|p| p.user_id.parse().ok())
                    .collect();

                let notification = Notification::new("New position", format!("{} position changed", name))
                    .with_data("type", "user-position-update")
                    .with_data("meeting", meeting.clone())
                    .with_data("participant", own.id.clone());
                push_group(&mut plan, recipients, notification, false);
            }
        }
    }

    Ok(plan)
}

impl Notifier {
    /// Notify everyone concerned by `event`.
    ///
    /// Delivery failures are absorbed by the deferral machinery; only
    /// database errors come back to the caller.
    pub async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let owned = event.clone();
        let plan = self.with_db(move |db| plan(db, &owned)).await?;

        for dispatch in &plan.dispatches {
            debug!(
                "Dispatching {:?} to {:?}",
                dispatch.notification.kind(),
                dispatch.audience
            );
            match &dispatch.audience {
                Audience::User(user_id) => {
                    self.send_to_user(*user_id, &dispatch.notification, dispatch.deferred)
                        .await?;
                }
                Audience::Users(user_ids) => {
                    self.send_to_users(user_ids, &dispatch.notification, dispatch.deferred)
                        .await?;
                }
            }
        }

        if let Some(tag) = &plan.purge {
            self.purge_tag(tag).await?;
        }

        Ok(())
    }

    /// Like `publish`, for callers that have already committed their change
    /// and have nothing to do with a failure but log it.
    pub async fn publish_or_log(&self, event: &DomainEvent) {
        if let Err(e) = self.publish(event).await {
            error!("Failed to publish {:?}: {:#}", event, e);
        }
    }
}

fn push_group(plan: &mut Plan, recipients: Vec<Uuid>, notification: Notification, deferred: bool) {
    if recipients.is_empty() {
        return;
    }
    plan.dispatches.push(Dispatch {
        audience: Audience::Users(recipients),
        notification,
        deferred,
    });
}

fn participants_where<F>(db: &Database, meeting_id: Uuid, keep: F) -> Result<Vec<Uuid>>
where
    F: Fn(&ParticipantRow) -> bool,
{
    Ok(db
        .get_participants(&meeting_id.to_string())?
        .iter()
        .filter(|p| keep(*p))
        .filter_map(|p| p.user_id.parse().ok())
        .collect())
}

fn username(db: &Database, user_id: Uuid) -> Result<String> {
    Ok(db
        .get_user_by_id(&user_id.to_string())?
        .map(|u| u.username)
        .unwrap_or_else(|| "Someone".to_string()))
}

fn meeting_notification(
    title: &str,
    body: String,
    kind: &str,
    meeting_id: Uuid,
    participant_id: Option<Uuid>,
) -> Notification {
    let mut notification = Notification::new(title, body)
        .with_data("type", kind)
        .with_data("meeting", meeting_id.to_string())
        .with_tag(MessageTag::new(MEETING_TAG, meeting_id));
    if let Some(participant_id) = participant_id {
        notification = notification.with_data("participant", participant_id.to_string());
    }
    notification
}

fn friendship_notification(title: &str, body: String, kind: &str, friendship_id: Uuid) -> Notification {
    Notification::new(title, body)
        .with_data("type", kind)
        .with_data("friendship", friendship_id.to_string())
        .with_tag(MessageTag::new(FRIENDSHIP_TAG, friendship_id))
}
