use std::collections::HashSet;

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use gather_db::{Database, NewParticipant};
use gather_types::api::{
    Claims, CreateMeetingRequest, MeetingResponse, UpdateMeetingRequest, UpdateParticipantRequest,
};
use gather_types::events::DomainEvent;
use gather_types::models::{Meeting, MeetingStatus, Participant};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

pub async fn create_meeting(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<CreateMeetingRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let organiser_id = claims.sub;

    let response = blocking(&state, move |db| {
        let mut seen = HashSet::new();
        let invited: Vec<Uuid> = req
            .participants
            .into_iter()
            .filter(|id| *id != organiser_id && seen.insert(*id))
            .collect();

        if invited.is_empty() {
            return Err(ApiError::bad_request(
                "You need at least one participant in addition to yourself",
            ));
        }

        let friends: HashSet<String> = db
            .get_friend_ids(&organiser_id.to_string())?
            .into_iter()
            .collect();
        let strangers: Vec<String> = invited
            .iter()
            .map(Uuid::to_string)
            .filter(|id| !friends.contains(id))
            .collect();
        if !strangers.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "You are not friends with: {}",
                strangers.join(", ")
            )));
        }

        let mut rows = vec![NewParticipant {
            id: Uuid::new_v4().to_string(),
            user_id: organiser_id.to_string(),
            accepted: Some(true),
        }];
        for user_id in &invited {
            let user = db
                .get_user_by_id(&user_id.to_string())?
                .ok_or(ApiError::NotFound("User"))?;
            rows.push(NewParticipant {
                id: Uuid::new_v4().to_string(),
                user_id: user.id,
                // Hidden users cannot be reached; they decline on the spot
                accepted: if user.hidden { Some(false) } else { None },
            });
        }

        let meeting_id = Uuid::new_v4().to_string();
        db.create_meeting(
            &meeting_id,
            &organiser_id.to_string(),
            req.kind,
            req.kind.initial_status(),
            &rows,
        )?;

        load_meeting(db, &meeting_id)
    })
    .await?;

    info!(
        "User {} created {} meeting {} with {} participants",
        claims.username,
        response.meeting.kind.as_str(),
        response.meeting.id,
        response.participants.len()
    );

    for participant in &response.participants {
        if participant.user_id == organiser_id {
            continue;
        }
        state
            .notifier
            .publish_or_log(&DomainEvent::ParticipantAdded {
                meeting_id: response.meeting.id,
                participant_id: participant.id,
                user_id: participant.user_id,
                organiser_id,
            })
            .await;
    }

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn update_meeting(
    State(state): State<AppState>,
    Path(meeting_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<UpdateMeetingRequest>, JsonRejection>,
) -> Result<Json<MeetingResponse>, ApiError> {
    let Json(req) = payload?;
    let user_id = claims.sub.to_string();

    let (response, changed) = blocking(&state, move |db| {
        let mid = meeting_id.to_string();
        let meeting = db.get_meeting(&mid)?.ok_or(ApiError::NotFound("Meeting"))?;
        if meeting.organiser_id != user_id {
            return Err(ApiError::Forbidden("Only the organiser can update a meeting"));
        }

        let current = meeting.status()?;
        if current.is_terminal() {
            return Err(ApiError::BadRequest(format!(
                "You cannot update a meeting that is {}",
                current
            )));
        }
        if req.status == MeetingStatus::Pending && current != MeetingStatus::Pending {
            return Err(ApiError::bad_request("A started meeting cannot go back to pending"));
        }

        let changed = req.status != current;
        if changed {
            db.set_meeting_status(&mid, req.status)?;
        }
        Ok((load_meeting(db, &mid)?, changed))
    })
    .await?;

    if changed {
        info!("Meeting {} is now {}", meeting_id, response.meeting.status);
        state
            .notifier
            .publish_or_log(&DomainEvent::MeetingStatusChanged {
                meeting_id,
                status: response.meeting.status,
            })
            .await;
    }

    Ok(Json(response))
}

pub async fn update_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<UpdateParticipantRequest>, JsonRejection>,
) -> Result<Json<Participant>, ApiError> {
    let Json(req) = payload?;
    if req.accepted.is_none() && req.arrived.is_none() {
        return Err(ApiError::bad_request("Nothing to update"));
    }
    let user_id = claims.sub.to_string();

    let (participant, events) = blocking(&state, move |db| {
        let pid = participant_id.to_string();
        let participant = db
            .get_participant(&pid)?
            .ok_or(ApiError::NotFound("Participant"))?;
        if participant.user_id != user_id {
            return Err(ApiError::Forbidden("You can only answer for yourself"));
        }

        let meeting = db
            .get_meeting(&participant.meeting_id)?
            .ok_or(ApiError::NotFound("Meeting"))?;
        if meeting.status()?.is_terminal() {
            return Err(ApiError::bad_request("This meeting is over"));
        }
        if participant.has_declined() {
            return Err(ApiError::bad_request("You already refused this meeting"));
        }

        let accepted = req.accepted.or(participant.accepted);
        match req.arrived {
            Some(false) if participant.arrived => {
                return Err(ApiError::bad_request("Arrival cannot be undone"));
            }
            Some(true) if accepted != Some(true) => {
                return Err(ApiError::bad_request(
                    "You must accept the meeting before arriving",
                ));
            }
            _ => {}
        }

        let meeting_id: Uuid = meeting.id.parse().map_err(anyhow::Error::from)?;
        let mut events = Vec::new();

        if let Some(answer) = req.accepted {
            if participant.accepted != Some(answer) {
                db.set_participant_accepted(&pid, answer)?;
                events.push(DomainEvent::ParticipantAnswered {
                    meeting_id,
                    participant_id,
                    user_id: claims.sub,
                    accepted: answer,
                });
            }
        }
        if req.arrived == Some(true) && !participant.arrived {
            db.set_participant_arrived(&pid)?;
            events.push(DomainEvent::ParticipantArrived {
                meeting_id,
                participant_id,
                user_id: claims.sub,
            });
        }

        let updated = db
            .get_participant(&pid)?
            .ok_or(ApiError::NotFound("Participant"))?;
        Ok((Participant::try_from(updated)?, events))
    })
    .await?;

    for event in &events {
        state.notifier.publish_or_log(event).await;
    }

    Ok(Json(participant))
}

fn load_meeting(db: &Database, meeting_id: &str) -> Result<MeetingResponse, ApiError> {
    let meeting = db
        .get_meeting(meeting_id)?
        .ok_or(ApiError::NotFound("Meeting"))?;
    let participants = db
        .get_participants(meeting_id)?
        .into_iter()
        .map(Participant::try_from)
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(MeetingResponse {
        meeting: Meeting::try_from(meeting)?,
        participants,
    })
}
