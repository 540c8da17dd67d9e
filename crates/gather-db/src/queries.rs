use crate::Database;
use crate::models::{
    DeferredMessageRow, DeviceRow, FriendshipRow, MeetingRow, ParticipantRow, UserRow,
};
use anyhow::Result;
use gather_types::models::{MeetingKind, MeetingStatus};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};

/// A deferred message before it has been given a row id.
#[derive(Debug, Clone)]
pub struct NewDeferredMessage<'a> {
    pub user_id: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub data: &'a str,
    pub tag: Option<(&'a str, &'a str)>,
}

/// A participant row to insert alongside a new meeting.
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub id: String,
    pub user_id: String,
    pub accepted: Option<bool>,
}

impl Database {
    // -- Users --

    /// Insert the user, or refresh the username if the id is already known.
    pub fn upsert_user(&self, id: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, hidden, created_at FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        hidden: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Returns false when no such user exists.
    pub fn set_user_hidden(&self, id: &str, hidden: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("UPDATE users SET hidden = ?2 WHERE id = ?1", params![id, hidden])?;
            Ok(changed > 0)
        })
    }

    // -- Devices --

    pub fn get_device_for_user(&self, user_id: &str) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, registration_id, is_active, created_at
                 FROM devices WHERE user_id = ?1",
                [user_id],
                map_device,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_device_by_token(&self, registration_id: &str) -> Result<Option<DeviceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, registration_id, is_active, created_at
                 FROM devices WHERE registration_id = ?1",
                [registration_id],
                map_device,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Batch-fetch the devices of a set of users. Users without a device are
    /// simply absent from the result.
    pub fn get_devices_for_users(&self, user_ids: &[String]) -> Result<Vec<DeviceRow>> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=user_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, user_id, registration_id, is_active, created_at
                 FROM devices WHERE user_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(user_ids.iter()), map_device)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Store `registration_id` as the only device of `user_id`.
    ///
    /// Any device the user already had is evicted, and so is any device that
    /// holds the same token for another user: the token moves to its new
    /// owner. Both happen in one transaction.
    pub fn replace_device(&self, id: &str, user_id: &str, registration_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM devices WHERE user_id = ?1 OR registration_id = ?2",
                (user_id, registration_id),
            )?;
            tx.execute(
                "INSERT INTO devices (id, user_id, registration_id, is_active) VALUES (?1, ?2, ?3, 1)",
                (id, user_id, registration_id),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn set_device_active(&self, id: &str, active: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE devices SET is_active = ?2 WHERE id = ?1", params![id, active])?;
            Ok(())
        })
    }

    /// Returns false when the user had no device.
    pub fn delete_device_for_user(&self, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM devices WHERE user_id = ?1", [user_id])?;
            Ok(deleted > 0)
        })
    }

    // -- Deferred messages --

    pub fn insert_deferred_message(&self, message: &NewDeferredMessage<'_>) -> Result<i64> {
        let (tag_kind, tag_id) = match message.tag {
            Some((kind, id)) => (Some(kind), Some(id)),
            None => (None, None),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deferred_messages (user_id, title, body, data, tag_kind, tag_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![message.user_id, message.title, message.body, message.data, tag_kind, tag_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Deferred messages of a user, oldest first.
    pub fn get_deferred_messages(&self, user_id: &str) -> Result<Vec<DeferredMessageRow>> {
        self.with_conn(|conn| query_deferred_messages(conn, user_id))
    }

    pub fn count_deferred_messages(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM deferred_messages WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn delete_deferred_message(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM deferred_messages WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Bump the attempt counter of a message whose replay failed.
    pub fn record_failed_replay(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE deferred_messages SET attempts = attempts + 1, last_try = datetime('now')
                 WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    /// Drop every deferred message produced by the tagged entity.
    /// Returns how many were removed.
    pub fn delete_deferred_by_tag(&self, kind: &str, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM deferred_messages WHERE tag_kind = ?1 AND tag_id = ?2",
                (kind, id),
            )?;
            Ok(deleted)
        })
    }

    // -- Meetings --

    /// Create a meeting and all of its participants atomically.
    pub fn create_meeting(
        &self,
        id: &str,
        organiser_id: &str,
        kind: MeetingKind,
        status: MeetingStatus,
        participants: &[NewParticipant],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO meetings (id, organiser_id, kind, status) VALUES (?1, ?2, ?3, ?4)",
                (id, organiser_id, kind.as_str(), status.as_str()),
            )?;
            for p in participants {
                tx.execute(
                    "INSERT INTO participants (id, meeting_id, user_id, accepted) VALUES (?1, ?2, ?3, ?4)",
                    params![p.id, id, p.user_id, p.accepted],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_meeting(&self, id: &str) -> Result<Option<MeetingRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, organiser_id, kind, status, created_at FROM meetings WHERE id = ?1",
                [id],
                |row| {
                    Ok(MeetingRow {
                        id: row.get(0)?,
                        organiser_id: row.get(1)?,
                        kind: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn set_meeting_status(&self, id: &str, status: MeetingStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE meetings SET status = ?2 WHERE id = ?1", (id, status.as_str()))?;
            Ok(())
        })
    }

    /// Meetings in progress where the user accepted to take part.
    pub fn get_active_meeting_ids_for(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id FROM meetings m
                 JOIN participants p ON p.meeting_id = m.id
                 WHERE p.user_id = ?1 AND p.accepted = 1 AND m.status = 'progress'
                 ORDER BY m.created_at",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Participants --

    pub fn get_participants(&self, meeting_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, meeting_id, user_id, accepted, arrived
                 FROM participants WHERE meeting_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([meeting_id], map_participant)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_participant(&self, id: &str) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, meeting_id, user_id, accepted, arrived FROM participants WHERE id = ?1",
                [id],
                map_participant,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn set_participant_accepted(&self, id: &str, accepted: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE participants SET accepted = ?2 WHERE id = ?1", params![id, accepted])?;
            Ok(())
        })
    }

    pub fn set_participant_arrived(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE participants SET arrived = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Friendships --

    /// Insert a friend request. Returns false if the two users already have
    /// a friendship in either direction.
    pub fn create_friendship(&self, id: &str, from_id: &str, to_id: &str) -> Result<bool> {
        let key = pair_key(from_id, to_id);

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO friendships (id, from_id, to_id, pair_key) VALUES (?1, ?2, ?3, ?4)",
                (id, from_id, to_id, &key),
            );
            match inserted {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_friendship(&self, id: &str) -> Result<Option<FriendshipRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, from_id, to_id, is_accepted, is_hidden, from_blocking, to_blocking
                 FROM friendships WHERE id = ?1",
                [id],
                |row| {
                    Ok(FriendshipRow {
                        id: row.get(0)?,
                        from_id: row.get(1)?,
                        to_id: row.get(2)?,
                        is_accepted: row.get(3)?,
                        is_hidden: row.get(4)?,
                        from_blocking: row.get(5)?,
                        to_blocking: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Update the flags that are present; `None` leaves a column untouched.
    pub fn update_friendship(
        &self,
        id: &str,
        is_accepted: Option<bool>,
        is_hidden: Option<bool>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE friendships
                 SET is_accepted = COALESCE(?2, is_accepted), is_hidden = COALESCE(?3, is_hidden)
                 WHERE id = ?1",
                params![id, is_accepted, is_hidden],
            )?;
            Ok(())
        })
    }

    /// Ids of the user's accepted friends that the user has not blocked.
    pub fn get_friend_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT to_id FROM friendships
                 WHERE from_id = ?1 AND is_accepted = 1 AND from_blocking = 0
                 UNION
                 SELECT from_id FROM friendships
                 WHERE to_id = ?1 AND is_accepted = 1 AND to_blocking = 0",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

/// Order-independent key so that A→B and B→A collide on the UNIQUE index.
fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

fn map_device(row: &Row<'_>) -> rusqlite::Result<DeviceRow> {
    Ok(DeviceRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        registration_id: row.get(2)?,
        is_active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_participant(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        id: row.get(0)?,
        meeting_id: row.get(1)?,
        user_id: row.get(2)?,
        accepted: row.get(3)?,
        arrived: row.get(4)?,
    })
}

fn query_deferred_messages(conn: &Connection, user_id: &str) -> Result<Vec<DeferredMessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, title, body, data, tag_kind, tag_id, attempts, created_at, last_try
         FROM deferred_messages
         WHERE user_id = ?1
         ORDER BY id ASC",
    )?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok(DeferredMessageRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                data: row.get(4)?,
                tag_kind: row.get(5)?,
                tag_id: row.get(6)?,
                attempts: row.get(7)?,
                created_at: row.get(8)?,
                last_try: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users(names: &[&str]) -> Database {
        let db = Database::open_in_memory().unwrap();
        for name in names {
            db.upsert_user(name, name).unwrap();
        }
        db
    }

    fn deferred<'a>(user: &'a str, title: &'a str, tag: Option<(&'a str, &'a str)>) -> NewDeferredMessage<'a> {
        NewDeferredMessage {
            user_id: user,
            title,
            body: "body",
            data: "{}",
            tag,
        }
    }

    #[test]
    fn token_moves_to_its_new_owner() {
        let db = db_with_users(&["alice", "bob"]);
        db.replace_device("d1", "alice", "token-t").unwrap();
        db.replace_device("d2", "bob", "token-t").unwrap();

        let device = db.get_device_by_token("token-t").unwrap().unwrap();
        assert_eq!(device.user_id, "bob");
        assert!(db.get_device_for_user("alice").unwrap().is_none());

        let count: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn new_token_evicts_previous_device() {
        let db = db_with_users(&["alice"]);
        db.replace_device("d1", "alice", "old").unwrap();
        db.replace_device("d2", "alice", "new").unwrap();

        assert!(db.get_device_by_token("old").unwrap().is_none());
        let device = db.get_device_for_user("alice").unwrap().unwrap();
        assert_eq!(device.registration_id, "new");
        assert!(device.is_active);
    }

    #[test]
    fn devices_for_users_skips_users_without_device() {
        let db = db_with_users(&["alice", "bob", "carol"]);
        db.replace_device("d1", "alice", "a").unwrap();
        db.replace_device("d3", "carol", "c").unwrap();
        db.set_device_active("d3", false).unwrap();

        let ids = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
        let devices = db.get_devices_for_users(&ids).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.user_id == "carol" && !d.is_active));
        assert!(db.get_devices_for_users(&[]).unwrap().is_empty());
    }

    #[test]
    fn deferred_messages_come_back_in_creation_order() {
        let db = db_with_users(&["alice"]);
        for title in ["first", "second", "third"] {
            db.insert_deferred_message(&deferred("alice", title, None)).unwrap();
        }

        let titles: Vec<String> = db
            .get_deferred_messages("alice")
            .unwrap()
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn failed_replay_is_counted() {
        let db = db_with_users(&["alice"]);
        let id = db.insert_deferred_message(&deferred("alice", "t", None)).unwrap();
        db.record_failed_replay(id).unwrap();
        db.record_failed_replay(id).unwrap();

        let message = db.get_deferred_messages("alice").unwrap().remove(0);
        assert_eq!(message.attempts, 2);
        assert!(message.last_try.is_some());
    }

    #[test]
    fn purge_by_tag_only_touches_that_entity() {
        let db = db_with_users(&["alice", "bob"]);
        db.insert_deferred_message(&deferred("alice", "a", Some(("meeting", "m1")))).unwrap();
        db.insert_deferred_message(&deferred("bob", "b", Some(("meeting", "m1")))).unwrap();
        db.insert_deferred_message(&deferred("bob", "c", Some(("meeting", "m2")))).unwrap();
        db.insert_deferred_message(&deferred("bob", "d", None)).unwrap();

        assert_eq!(db.delete_deferred_by_tag("meeting", "m1").unwrap(), 2);
        assert_eq!(db.count_deferred_messages("alice").unwrap(), 0);
        assert_eq!(db.count_deferred_messages("bob").unwrap(), 2);
    }

    #[test]
    fn friendship_is_unique_in_both_directions() {
        let db = db_with_users(&["alice", "bob"]);
        assert!(db.create_friendship("f1", "alice", "bob").unwrap());
        assert!(!db.create_friendship("f2", "bob", "alice").unwrap());
        assert!(!db.create_friendship("f3", "alice", "bob").unwrap());
    }

    #[test]
    fn friend_ids_respect_acceptance_and_blocking() {
        let db = db_with_users(&["alice", "bob", "carol", "dave"]);
        db.create_friendship("f1", "alice", "bob").unwrap();
        db.create_friendship("f2", "carol", "alice").unwrap();
        db.create_friendship("f3", "alice", "dave").unwrap();
        db.update_friendship("f1", Some(true), None).unwrap();
        db.update_friendship("f2", Some(true), None).unwrap();
        db.with_conn(|c| {
            c.execute("UPDATE friendships SET to_blocking = 1 WHERE id = 'f2'", [])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.get_friend_ids("alice").unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn meeting_and_participants_are_created_together() {
        let db = db_with_users(&["alice", "bob"]);
        let participants = vec![
            NewParticipant { id: "p1".into(), user_id: "alice".into(), accepted: Some(true) },
            NewParticipant { id: "p2".into(), user_id: "bob".into(), accepted: None },
        ];
        db.create_meeting("m1", "alice", MeetingKind::Place, MeetingStatus::Progress, &participants)
            .unwrap();

        let rows = db.get_participants("m1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].has_accepted());
        assert_eq!(rows[1].accepted, None);

        assert_eq!(db.get_active_meeting_ids_for("alice").unwrap(), vec!["m1".to_string()]);
        assert!(db.get_active_meeting_ids_for("bob").unwrap().is_empty());
    }

    #[test]
    fn duplicate_participant_rolls_back_the_meeting() {
        let db = db_with_users(&["alice"]);
        let participants = vec![
            NewParticipant { id: "p1".into(), user_id: "alice".into(), accepted: Some(true) },
            NewParticipant { id: "p2".into(), user_id: "alice".into(), accepted: None },
        ];
        let result =
            db.create_meeting("m1", "alice", MeetingKind::Person, MeetingStatus::Pending, &participants);

        assert!(result.is_err());
        assert!(db.get_meeting("m1").unwrap().is_none());
    }
}
