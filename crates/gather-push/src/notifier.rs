use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gather_db::models::{DeferredMessageRow, DeviceRow};
use gather_db::{Database, NewDeferredMessage};

use crate::message::{DeliveryReport, MessageTag, Notification, PushMessage};
use crate::provider::PushProvider;

/// Result of a device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new device row was stored (possibly evicting older ones).
    Created,
    /// The token was already this user's device.
    Unchanged,
}

/// Result of replaying a user's deferred messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Replay {
    pub delivered: usize,
    pub remaining: usize,
}

/// Per-user outcome of a bulk send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkDelivery {
    pub delivered: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Sends push notifications and keeps track of the ones that could not be
/// delivered.
///
/// A user has at most one device. When a send fails the device is marked
/// inactive and, if the caller allows it, the message is stored as deferred.
/// Deferred messages are replayed, oldest first, whenever the user's device
/// registers again.
#[derive(Clone)]
pub struct Notifier {
    db: Arc<Database>,
    provider: Arc<dyn PushProvider>,
}

impl Notifier {
    pub fn new(db: Arc<Database>, provider: Arc<dyn PushProvider>) -> Self {
        Self { db, provider }
    }

    /// Run blocking database work off the async runtime. Only provider
    /// calls are awaited on the runtime itself.
    pub(crate) async fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref())).await?
    }

    // -- Devices --

    /// Make `registration_id` the user's only device, then replay whatever
    /// was deferred for them.
    pub async fn register_device(&self, user_id: Uuid, registration_id: &str) -> Result<Registration> {
        let uid = user_id.to_string();
        let token = registration_id.to_string();

        let registration = self
            .with_db(move |db| match db.get_device_by_token(&token)? {
                Some(device) if device.user_id == uid => {
                    if !device.is_active {
                        db.set_device_active(&device.id, true)?;
                    }
                    Ok(Registration::Unchanged)
                }
                previous => {
                    if let Some(device) = previous {
                        info!("Reassigning device {} from user {} to {}", device.id, device.user_id, uid);
                    }
                    db.replace_device(&Uuid::new_v4().to_string(), &uid, &token)?;
                    Ok(Registration::Created)
                }
            })
            .await?;

        debug!("Device registration for user {}: {:?}", user_id, registration);
        self.replay_deferred(user_id).await?;
        Ok(registration)
    }

    /// Mark the user's device active again and replay deferred messages.
    /// Returns false when the user has no device.
    pub async fn reactivate_device(&self, user_id: Uuid) -> Result<bool> {
        let uid = user_id.to_string();
        let found = self
            .with_db(move |db| {
                let Some(device) = db.get_device_for_user(&uid)? else {
                    return Ok(false);
                };
                db.set_device_active(&device.id, true)?;
                Ok(true)
            })
            .await?;

        if found {
            self.replay_deferred(user_id).await?;
        }
        Ok(found)
    }

    /// Returns false when the user had no device.
    pub async fn unregister_device(&self, user_id: Uuid) -> Result<bool> {
        let uid = user_id.to_string();
        self.with_db(move |db| db.delete_device_for_user(&uid)).await
    }

    // -- Dispatch --

    /// Send to one user. Returns whether the message reached the device.
    pub async fn send_to_user(
        &self,
        user_id: Uuid,
        notification: &Notification,
        deferred: bool,
    ) -> Result<bool> {
        let uid = user_id.to_string();

        let lookup = uid.clone();
        let device = match self.with_db(move |db| db.get_device_for_user(&lookup)).await? {
            Some(device) if device.is_active => device,
            _ => {
                debug!("No active device for user {}", uid);
                if deferred {
                    self.defer(&uid, notification).await?;
                }
                return Ok(false);
            }
        };

        let report = match self.provider.send(&device.registration_id, &notification.message).await {
            Ok(report) => report,
            Err(e) => DeliveryReport::Rejected(e.to_string()),
        };

        self.settle(&device, &report, notification, deferred).await?;
        Ok(report.is_delivered())
    }

    /// Send the same notification to several users with one bulk request.
    ///
    /// Users without an active device are not addressed. Duplicate ids are
    /// sent to once.
    pub async fn send_to_users(
        &self,
        user_ids: &[Uuid],
        notification: &Notification,
        deferred: bool,
    ) -> Result<BulkDelivery> {
        let mut seen = HashSet::new();
        let users: Vec<(Uuid, String)> = user_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| (*id, id.to_string()))
            .collect();

        let ids: Vec<String> = users.iter().map(|(_, s)| s.clone()).collect();
        let mut devices: HashMap<String, DeviceRow> = self
            .with_db(move |db| db.get_devices_for_users(&ids))
            .await?
            .into_iter()
            .map(|d| (d.user_id.clone(), d))
            .collect();

        let mut outcome = BulkDelivery::default();
        let mut active: Vec<(Uuid, DeviceRow)> = Vec::new();

        for (user_id, uid) in &users {
            match devices.remove(uid) {
                Some(device) if device.is_active => active.push((*user_id, device)),
                _ => {
                    if deferred {
                        self.defer(uid, notification).await?;
                    }
                    outcome.failed.push(*user_id);
                }
            }
        }

        if active.is_empty() {
            return Ok(outcome);
        }

        let tokens: Vec<String> = active.iter().map(|(_, d)| d.registration_id.clone()).collect();
        let reports = match self.provider.send_bulk(&tokens, &notification.message).await {
            Ok(reports) if reports.len() == tokens.len() => reports,
            Ok(reports) => {
                warn!(
                    "[push] Provider returned {} reports for {} tokens, treating all as failed",
                    reports.len(),
                    tokens.len()
                );
                vec![DeliveryReport::Rejected("report count mismatch".into()); tokens.len()]
            }
            Err(e) => vec![DeliveryReport::Rejected(e.to_string()); tokens.len()],
        };

        for ((user_id, device), report) in active.iter().zip(reports) {
            self.settle(device, &report, notification, deferred).await?;
            if report.is_delivered() {
                outcome.delivered.push(*user_id);
            } else {
                outcome.failed.push(*user_id);
            }
        }

        Ok(outcome)
    }

    /// Apply the persistent side effects of one delivery attempt.
    async fn settle(
        &self,
        device: &DeviceRow,
        report: &DeliveryReport,
        notification: &Notification,
        deferred: bool,
    ) -> Result<()> {
        if let DeliveryReport::Rejected(reason) = report {
            warn!(
                "[push] Delivery to user {} failed ({}), marking device {} inactive",
                device.user_id, reason, device.id
            );
            let device_id = device.id.clone();
            self.with_db(move |db| db.set_device_active(&device_id, false)).await?;
            if deferred {
                self.defer(&device.user_id, notification).await?;
            }
        }
        Ok(())
    }

    async fn defer(&self, user_id: &str, notification: &Notification) -> Result<i64> {
        let data = serde_json::to_string(&notification.message.data)?;
        let owner = user_id.to_string();
        let title = notification.message.title.clone();
        let body = notification.message.body.clone();
        let tag = notification.tag.clone();

        let id = self
            .with_db(move |db| {
                db.insert_deferred_message(&NewDeferredMessage {
                    user_id: &owner,
                    title: &title,
                    body: &body,
                    data: &data,
                    tag: tag.as_ref().map(|t| (t.kind.as_str(), t.id.as_str())),
                })
            })
            .await?;

        debug!("Deferred message {} for user {}", id, user_id);
        Ok(id)
    }

    // -- Deferred messages --

    /// Redeliver the user's deferred messages in the order they were stored.
    ///
    /// Stops at the first failure so later messages never overtake earlier
    /// ones; the failed message keeps its place and its attempt count goes up.
    pub async fn replay_deferred(&self, user_id: Uuid) -> Result<Replay> {
        let uid = user_id.to_string();
        let messages = self.with_db(move |db| db.get_deferred_messages(&uid)).await?;
        let total = messages.len();
        let mut delivered = 0;

        for row in messages {
            let notification = notification_from_row(&row);
            let id = row.id;
            if self.send_to_user(user_id, &notification, false).await? {
                self.with_db(move |db| db.delete_deferred_message(id)).await?;
                delivered += 1;
            } else {
                self.with_db(move |db| db.record_failed_replay(id)).await?;
                break;
            }
        }

        if total > 0 {
            info!(
                "Replayed {}/{} deferred messages for user {}",
                delivered, total, user_id
            );
        }

        Ok(Replay {
            delivered,
            remaining: total - delivered,
        })
    }

    /// Drop every deferred message produced by the tagged entity.
    pub async fn purge_tag(&self, tag: &MessageTag) -> Result<usize> {
        let (kind, id) = (tag.kind.clone(), tag.id.clone());
        let purged = self
            .with_db(move |db| db.delete_deferred_by_tag(&kind, &id))
            .await?;
        if purged > 0 {
            info!("Purged {} deferred messages tagged {}:{}", purged, tag.kind, tag.id);
        }
        Ok(purged)
    }
}

fn notification_from_row(row: &DeferredMessageRow) -> Notification {
    let data = match serde_json::from_str::<Value>(&row.data) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!("Deferred message {} has a corrupt payload, sending without data", row.id);
            Map::new()
        }
    };

    Notification {
        message: PushMessage {
            title: row.title.clone(),
            body: row.body.clone(),
            data,
        },
        tag: match (&row.tag_kind, &row.tag_id) {
            (Some(kind), Some(id)) => Some(MessageTag::new(kind.clone(), id)),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::testing::RecordingProvider;

    struct Harness {
        notifier: Notifier,
        provider: Arc<RecordingProvider>,
        db: Arc<Database>,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let provider = Arc::new(RecordingProvider::new());
        let notifier = Notifier::new(db.clone(), provider.clone());
        Harness { notifier, provider, db }
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.upsert_user(&id.to_string(), name).unwrap();
        id
    }

    fn device(db: &Database, user: Uuid) -> String {
        let token = format!("token-{}", user);
        db.replace_device(&Uuid::new_v4().to_string(), &user.to_string(), &token)
            .unwrap();
        token
    }

    fn note(title: &str) -> Notification {
        Notification::new(title, "body").with_data("type", "test-message")
    }

    fn deferred_count(db: &Database, user: Uuid) -> usize {
        db.count_deferred_messages(&user.to_string()).unwrap()
    }

    fn is_active(db: &Database, user: Uuid) -> bool {
        db.get_device_for_user(&user.to_string()).unwrap().unwrap().is_active
    }

    #[tokio::test]
    async fn successful_send_leaves_no_trace() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);

        assert!(h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap());
        assert_eq!(h.provider.call_count(), 1);
        assert!(is_active(&h.db, alice));
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn no_device_defers_without_calling_provider() {
        let h = harness();
        let alice = user(&h.db, "alice");

        assert!(!h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap());
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(deferred_count(&h.db, alice), 1);
    }

    #[tokio::test]
    async fn inactive_device_defers_without_calling_provider() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);
        let d = h.db.get_device_for_user(&alice.to_string()).unwrap().unwrap();
        h.db.set_device_active(&d.id, false).unwrap();

        assert!(!h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap());
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(deferred_count(&h.db, alice), 1);
    }

    #[tokio::test]
    async fn rejection_deactivates_and_defers() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);
        h.provider.reject_all(true);

        assert!(!h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap());
        assert!(!is_active(&h.db, alice));
        assert_eq!(deferred_count(&h.db, alice), 1);
    }

    #[tokio::test]
    async fn rejection_without_deferral_only_deactivates() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);
        h.provider.reject_all(true);

        assert!(!h.notifier.send_to_user(alice, &note("hi"), false).await.unwrap());
        assert!(!is_active(&h.db, alice));
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn transport_error_counts_as_failure() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);
        h.provider.fail_transport(true);

        assert!(!h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap());
        assert!(!is_active(&h.db, alice));
        assert_eq!(deferred_count(&h.db, alice), 1);
    }

    #[tokio::test]
    async fn deferred_message_keeps_payload_and_tag() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let n = note("hi")
            .with_data("meeting", "m1")
            .with_tag(MessageTag::new("meeting", "m1"));

        h.notifier.send_to_user(alice, &n, true).await.unwrap();

        let row = h.db.get_deferred_messages(&alice.to_string()).unwrap().remove(0);
        assert_eq!(row.title, "hi");
        assert_eq!(row.tag_kind.as_deref(), Some("meeting"));
        assert_eq!(row.tag_id.as_deref(), Some("m1"));
        assert_eq!(notification_from_row(&row), n);
    }

    #[tokio::test]
    async fn bulk_send_uses_one_request() {
        let h = harness();
        let users: Vec<Uuid> = (0..4).map(|i| user(&h.db, &format!("user-{}", i))).collect();
        for u in &users {
            device(&h.db, *u);
        }

        let outcome = h.notifier.send_to_users(&users, &note("hi"), true).await.unwrap();

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].bulk);
        assert_eq!(calls[0].tokens.len(), 4);
        assert_eq!(outcome.delivered, users);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn bulk_failure_only_affects_failed_recipient() {
        let h = harness();
        let users: Vec<Uuid> = (0..4).map(|i| user(&h.db, &format!("user-{}", i))).collect();
        let tokens: Vec<String> = users.iter().map(|u| device(&h.db, *u)).collect();
        h.provider.reject_token(&tokens[2]);

        let outcome = h.notifier.send_to_users(&users, &note("hi"), true).await.unwrap();

        assert_eq!(outcome.failed, vec![users[2]]);
        for (i, u) in users.iter().enumerate() {
            assert_eq!(is_active(&h.db, *u), i != 2);
            assert_eq!(deferred_count(&h.db, *u), usize::from(i == 2));
        }
    }

    #[tokio::test]
    async fn bulk_skips_inactive_devices_but_defers_for_them() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let bob = user(&h.db, "bob");
        let carol = user(&h.db, "carol");
        device(&h.db, alice);
        device(&h.db, bob);
        let d = h.db.get_device_for_user(&bob.to_string()).unwrap().unwrap();
        h.db.set_device_active(&d.id, false).unwrap();

        let outcome = h
            .notifier
            .send_to_users(&[alice, bob, carol, alice], &note("hi"), true)
            .await
            .unwrap();

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tokens, vec![format!("token-{}", alice)]);
        assert_eq!(outcome.delivered, vec![alice]);
        assert_eq!(outcome.failed, vec![bob, carol]);
        assert_eq!(deferred_count(&h.db, bob), 1);
        assert_eq!(deferred_count(&h.db, carol), 1);
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn bulk_with_nobody_reachable_makes_no_request() {
        let h = harness();
        let alice = user(&h.db, "alice");

        let outcome = h.notifier.send_to_users(&[alice], &note("hi"), false).await.unwrap();

        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(outcome.failed, vec![alice]);
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn bulk_transport_error_fails_everyone() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let bob = user(&h.db, "bob");
        device(&h.db, alice);
        device(&h.db, bob);
        h.provider.fail_transport(true);

        let outcome = h.notifier.send_to_users(&[alice, bob], &note("hi"), true).await.unwrap();

        assert_eq!(outcome.failed, vec![alice, bob]);
        assert!(!is_active(&h.db, alice));
        assert!(!is_active(&h.db, bob));
    }

    #[tokio::test]
    async fn bulk_report_count_mismatch_fails_everyone() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let bob = user(&h.db, "bob");
        device(&h.db, alice);
        device(&h.db, bob);
        h.provider.short_reports(true);

        let outcome = h.notifier.send_to_users(&[alice, bob], &note("hi"), true).await.unwrap();

        assert_eq!(h.provider.call_count(), 1);
        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.failed, vec![alice, bob]);
        for u in [alice, bob] {
            assert!(!is_active(&h.db, u));
            assert_eq!(deferred_count(&h.db, u), 1);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn busy_database_does_not_stall_the_runtime() {
        let h = harness();
        let alice = user(&h.db, "alice");

        let db = h.db.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();

        let started = Instant::now();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            started.elapsed()
        });

        h.notifier.register_device(alice, "tok").await.unwrap();
        let fired_after = timer.await.unwrap();
        holder.join().unwrap();

        // The timer runs while registration waits for the connection
        assert!(fired_after < Duration::from_millis(200), "timer fired after {:?}", fired_after);
        assert!(h.db.get_device_by_token("tok").unwrap().is_some());
    }

    #[tokio::test]
    async fn token_registered_by_another_user_moves_over() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let bob = user(&h.db, "bob");

        let first = h.notifier.register_device(alice, "shared").await.unwrap();
        let second = h.notifier.register_device(bob, "shared").await.unwrap();

        assert_eq!(first, Registration::Created);
        assert_eq!(second, Registration::Created);
        let device = h.db.get_device_by_token("shared").unwrap().unwrap();
        assert_eq!(device.user_id, bob.to_string());
        assert!(h.db.get_device_for_user(&alice.to_string()).unwrap().is_none());
    }

    #[tokio::test]
    async fn same_token_same_user_is_unchanged_but_replays() {
        let h = harness();
        let alice = user(&h.db, "alice");
        h.notifier.register_device(alice, "tok").await.unwrap();
        let before = h.db.get_device_for_user(&alice.to_string()).unwrap().unwrap();

        h.provider.reject_all(true);
        h.notifier.send_to_user(alice, &note("one"), true).await.unwrap();
        h.notifier.send_to_user(alice, &note("two"), true).await.unwrap();
        h.provider.reject_all(false);
        h.provider.clear();

        let registration = h.notifier.register_device(alice, "tok").await.unwrap();

        assert_eq!(registration, Registration::Unchanged);
        let after = h.db.get_device_for_user(&alice.to_string()).unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert!(after.is_active);
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn registration_replays_messages_deferred_while_offline() {
        let h = harness();
        let alice = user(&h.db, "alice");
        h.notifier.send_to_user(alice, &note("one"), true).await.unwrap();
        h.notifier.send_to_user(alice, &note("two"), true).await.unwrap();
        assert_eq!(h.provider.call_count(), 0);

        h.notifier.register_device(alice, "tok").await.unwrap();

        let titles: Vec<String> = h.provider.calls().into_iter().map(|c| c.message.title).collect();
        assert_eq!(titles, vec!["one", "two"]);
        assert_eq!(deferred_count(&h.db, alice), 0);
    }

    #[tokio::test]
    async fn replay_stops_at_first_failure() {
        let h = harness();
        let alice = user(&h.db, "alice");
        for title in ["1", "2", "3", "4", "5"] {
            h.notifier.send_to_user(alice, &note(title), true).await.unwrap();
        }
        device(&h.db, alice);
        h.provider.deliver_only(2);

        let replay = h.notifier.replay_deferred(alice).await.unwrap();

        assert_eq!(replay, Replay { delivered: 2, remaining: 3 });
        // The third attempt was made and failed; the fourth and fifth were not tried
        assert_eq!(h.provider.call_count(), 3);
        let left = h.db.get_deferred_messages(&alice.to_string()).unwrap();
        let titles: Vec<&str> = left.iter().map(|m| m.title.as_str()).collect();
        assert_eq!(titles, vec!["3", "4", "5"]);
        assert_eq!(left[0].attempts, 1);
        assert_eq!(left[1].attempts, 0);
        // Replay never defers a second copy
        assert_eq!(left.len(), 3);
    }

    #[tokio::test]
    async fn reactivation_replays() {
        let h = harness();
        let alice = user(&h.db, "alice");
        device(&h.db, alice);
        h.provider.reject_all(true);
        h.notifier.send_to_user(alice, &note("hi"), true).await.unwrap();
        assert!(!is_active(&h.db, alice));

        h.provider.reject_all(false);
        assert!(h.notifier.reactivate_device(alice).await.unwrap());

        assert!(is_active(&h.db, alice));
        assert_eq!(deferred_count(&h.db, alice), 0);
        let nobody = user(&h.db, "bob");
        assert!(!h.notifier.reactivate_device(nobody).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_tagged_messages() {
        let h = harness();
        let alice = user(&h.db, "alice");
        let tagged = note("m").with_tag(MessageTag::new("meeting", "m1"));
        h.notifier.send_to_user(alice, &tagged, true).await.unwrap();
        h.notifier.send_to_user(alice, &note("other"), true).await.unwrap();

        assert_eq!(h.notifier.purge_tag(&MessageTag::new("meeting", "m1")).await.unwrap(), 1);
        assert_eq!(deferred_count(&h.db, alice), 1);
    }
}
