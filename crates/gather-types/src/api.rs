use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Friendship, Meeting, MeetingKind, MeetingStatus, Participant};

// -- JWT Claims --

/// Bearer token claims. Tokens are minted by the identity service that shares
/// the signing secret; this backend only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// -- Devices --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterDeviceRequest {
    pub registration_id: String,
}

// -- Users --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetHiddenRequest {
    pub hidden: bool,
}

// -- Meetings --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateMeetingRequest {
    pub kind: MeetingKind,
    pub participants: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateMeetingRequest {
    pub status: MeetingStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeetingResponse {
    #[serde(flatten)]
    pub meeting: Meeting,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateParticipantRequest {
    pub accepted: Option<bool>,
    pub arrived: Option<bool>,
}

// -- Friendships --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateFriendshipRequest {
    pub friend: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateFriendshipRequest {
    pub is_accepted: Option<bool>,
    pub is_hidden: Option<bool>,
}

pub type FriendshipResponse = Friendship;

// -- Positions --

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionRequest {
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionRequest {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}
