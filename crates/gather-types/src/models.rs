use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Pending,
    Progress,
    Ended,
    Canceled,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progress => "progress",
            Self::Ended => "ended",
            Self::Canceled => "canceled",
        }
    }

    /// Ended and canceled meetings accept no further changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Canceled)
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeetingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "progress" => Ok(Self::Progress),
            "ended" => Ok(Self::Ended),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown meeting status '{}'", other)),
        }
    }
}

/// How the meeting point is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingKind {
    Place,
    Person,
    Shortest,
}

impl MeetingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Place => "place",
            Self::Person => "person",
            Self::Shortest => "shortest",
        }
    }

    /// Only `place` meetings have everything they need to start immediately.
    pub fn initial_status(&self) -> MeetingStatus {
        match self {
            Self::Place => MeetingStatus::Progress,
            Self::Person | Self::Shortest => MeetingStatus::Pending,
        }
    }
}

impl FromStr for MeetingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "place" => Ok(Self::Place),
            "person" => Ok(Self::Person),
            "shortest" => Ok(Self::Shortest),
            other => Err(format!("unknown meeting kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub organiser_id: Uuid,
    pub kind: MeetingKind,
    pub status: MeetingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub user_id: Uuid,
    /// `None` until the user answers.
    pub accepted: Option<bool>,
    pub arrived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub id: Uuid,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub is_accepted: bool,
    pub is_hidden: bool,
    pub from_blocking: bool,
    pub to_blocking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_name() {
        for status in [
            MeetingStatus::Pending,
            MeetingStatus::Progress,
            MeetingStatus::Ended,
            MeetingStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<MeetingStatus>().unwrap(), status);
        }
        assert!("paused".parse::<MeetingStatus>().is_err());
    }

    #[test]
    fn only_place_meetings_start_in_progress() {
        assert_eq!(MeetingKind::Place.initial_status(), MeetingStatus::Progress);
        assert_eq!(MeetingKind::Person.initial_status(), MeetingStatus::Pending);
        assert_eq!(MeetingKind::Shortest.initial_status(), MeetingStatus::Pending);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&MeetingStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
    }
}
