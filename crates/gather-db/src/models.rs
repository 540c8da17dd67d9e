//! Database row types. These map directly to SQLite rows; conversions into
//! the gather-types models live here so callers never parse columns by hand.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use gather_types::models::{Friendship, Meeting, MeetingKind, MeetingStatus, Participant};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub hidden: bool,
    pub created_at: String,
}

pub struct DeviceRow {
    pub id: String,
    pub user_id: String,
    pub registration_id: String,
    pub is_active: bool,
    pub created_at: String,
}

pub struct DeferredMessageRow {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub body: String,
    /// JSON object, stored verbatim.
    pub data: String,
    pub tag_kind: Option<String>,
    pub tag_id: Option<String>,
    pub attempts: i64,
    pub created_at: String,
    pub last_try: Option<String>,
}

pub struct MeetingRow {
    pub id: String,
    pub organiser_id: String,
    pub kind: String,
    pub status: String,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub id: String,
    pub meeting_id: String,
    pub user_id: String,
    pub accepted: Option<bool>,
    pub arrived: bool,
}

pub struct FriendshipRow {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub is_accepted: bool,
    pub is_hidden: bool,
    pub from_blocking: bool,
    pub to_blocking: bool,
}

impl MeetingRow {
    pub fn status(&self) -> Result<MeetingStatus> {
        self.status
            .parse()
            .map_err(|e: String| anyhow::anyhow!("meeting {}: {}", self.id, e))
    }
}

impl ParticipantRow {
    pub fn has_declined(&self) -> bool {
        self.accepted == Some(false)
    }

    pub fn has_accepted(&self) -> bool {
        self.accepted == Some(true)
    }
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without timezone.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().or_else(|_| {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .map(|ndt| ndt.and_utc())
            .with_context(|| format!("Corrupt timestamp '{}'", raw))
    })
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>().with_context(|| format!("Corrupt id '{}'", raw))
}

impl TryFrom<MeetingRow> for Meeting {
    type Error = anyhow::Error;

    fn try_from(row: MeetingRow) -> Result<Self> {
        let status = row.status()?;
        let kind: MeetingKind = row
            .kind
            .parse()
            .map_err(|e: String| anyhow::anyhow!("meeting {}: {}", row.id, e))?;

        Ok(Meeting {
            id: parse_id(&row.id)?,
            organiser_id: parse_id(&row.organiser_id)?,
            kind,
            status,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = anyhow::Error;

    fn try_from(row: ParticipantRow) -> Result<Self> {
        Ok(Participant {
            id: parse_id(&row.id)?,
            meeting_id: parse_id(&row.meeting_id)?,
            user_id: parse_id(&row.user_id)?,
            accepted: row.accepted,
            arrived: row.arrived,
        })
    }
}

impl TryFrom<FriendshipRow> for Friendship {
    type Error = anyhow::Error;

    fn try_from(row: FriendshipRow) -> Result<Self> {
        Ok(Friendship {
            id: parse_id(&row.id)?,
            from_id: parse_id(&row.from_id)?,
            to_id: parse_id(&row.to_id)?,
            is_accepted: row.is_accepted,
            is_hidden: row.is_hidden,
            from_blocking: row.from_blocking,
            to_blocking: row.to_blocking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlite_and_rfc3339_timestamps() {
        let sqlite = parse_timestamp("2024-03-01 12:30:00").unwrap();
        let rfc = parse_timestamp("2024-03-01T12:30:00Z").unwrap();
        assert_eq!(sqlite, rfc);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
