use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::app::AppContext;
use crate::backend::{Backend, ChannelSpec, Filter, Select, object};
use crate::error::{SyncError, SyncResult};
use crate::models::Notification;
use crate::scope::ScreenScope;
use crate::sync::{InFlightKeys, ListQuery, LoadState, SortOrder, SyncedList};

const NOTIFICATIONS: &str = "notifications";
const NOTIFICATION_COLUMNS: &str =
    "*,actor:actor_id(id,username,full_name,avatar_url),post:post_id(id,content,image_url)";

pub struct NotificationsScreen {
    scope: Arc<ScreenScope>,
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    user_id: String,
    notifications: SyncedList<Notification>,
    marking: InFlightKeys,
}

impl NotificationsScreen {
    pub async fn mount(app: &AppContext) -> SyncResult<Self> {
        let user = app.session().require_user().await?;
        let scope = app.open_scope("notifications");
        let query = ListQuery::paged(
            Select::from(NOTIFICATIONS)
                .columns(NOTIFICATION_COLUMNS)
                .eq("user_id", user.id.as_str()),
            "created_at",
            app.page_size(),
        );
        let screen = Self {
            notifications: app.list(&scope, query, SortOrder::NewestFirst),
            scope,
            backend: Arc::clone(app.backend()),
            alerts: Arc::clone(app.alerts()),
            user_id: user.id,
            marking: InFlightKeys::new("mark_read"),
        };
        screen
            .notifications
            .attach(
                ChannelSpec::table("notifications-feed", NOTIFICATIONS)
                    .filtered("user_id", screen.user_id.as_str()),
            )
            .await?;
        match screen.notifications.load().await {
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            // Failures are already alerted and held in the load state.
            _ => Ok(screen),
        }
    }

    pub fn notifications(&self) -> &SyncedList<Notification> {
        &self.notifications
    }

    pub fn load_state(&self) -> LoadState {
        self.notifications.load_state()
    }

    pub async fn refresh(&self) -> SyncResult<LoadState> {
        self.notifications.refresh().await
    }

    pub async fn load_more(&self) -> SyncResult<usize> {
        self.notifications.load_more().await
    }

    /// Unread among the held notifications.
    pub fn unread_count(&self) -> usize {
        self.notifications
            .snapshot()
            .iter()
            .filter(|notification| !notification.read)
            .count()
    }

    /// Marks one notification read. Returns `false` when it already was.
    pub async fn mark_read(&self, id: &str) -> SyncResult<bool> {
        let _in_flight = self.marking.acquire(id)?;
        let Some(current) = self.notifications.get(id) else {
            return Err(SyncError::Validation(format!("Unknown notification {id}")));
        };
        if current.read {
            return Ok(false);
        }
        let previous = self.notifications.patch(id, |notification| notification.read = true);

        let filters = [Filter::eq("id", id)];
        let request = self
            .backend
            .update(NOTIFICATIONS, object(json!({ "read": true })), &filters);
        match self.scope.guard(request).await? {
            Ok(_) => Ok(true),
            Err(err) => {
                if let Some(previous) = previous {
                    self.notifications.restore(previous);
                }
                let err = SyncError::from(err);
                warn!("Marking notification {id} read failed: {err}");
                self.alerts.alert(Alert::from_error(&err));
                Err(err)
            }
        }
    }

    /// Marks every unread notification of the user read. Returns how many
    /// held notifications flipped.
    pub async fn mark_all_read(&self) -> SyncResult<usize> {
        let unread: Vec<String> = self
            .notifications
            .snapshot()
            .into_iter()
            .filter(|notification| !notification.read)
            .map(|notification| notification.id)
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }
        let previous: Vec<Notification> = unread
            .iter()
            .filter_map(|id| self.notifications.patch(id, |notification| notification.read = true))
            .collect();

        let filters = [
            Filter::eq("user_id", self.user_id.as_str()),
            Filter::eq("read", false),
        ];
        let request = self
            .backend
            .update(NOTIFICATIONS, object(json!({ "read": true })), &filters);
        match self.scope.guard(request).await? {
            Ok(rows) => {
                info!("Marked {} notifications read", rows.len());
                Ok(previous.len())
            }
            Err(err) => {
                for notification in previous {
                    self.notifications.restore(notification);
                }
                let err = SyncError::from(err);
                warn!("Marking all notifications read failed: {err}");
                self.alerts.alert(Alert::from_error(&err));
                Err(err)
            }
        }
    }

    pub fn scope(&self) -> &Arc<ScreenScope> {
        &self.scope
    }
}

impl Drop for NotificationsScreen {
    fn drop(&mut self) {
        self.scope.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{TestApp, signed_in, test_app};
    use crate::backend::memory::Op;
    use crate::backend::{ChangeEvent, ChangeKind};
    use crate::error::BackendError;
    use crate::sync::ChannelStatus;

    fn seed(test: &TestApp, user_id: &str, count: usize) {
        test.backend.seed(
            NOTIFICATIONS,
            (0..count).map(|i| {
                object(json!({
                    "id": format!("n{i}"),
                    "user_id": user_id,
                    "type": if i % 2 == 0 { "like" } else { "comment" },
                    "actor_id": "u-grace",
                    "read": false,
                }))
            }),
        );
    }

    #[tokio::test]
    async fn lists_only_the_users_notifications() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        seed(&test, &me.id, 3);
        seed(&test, "someone-else", 2);

        let screen = NotificationsScreen::mount(&test.app).await.expect("mounted");
        assert_eq!(screen.notifications().len(), 3);
        assert_eq!(screen.unread_count(), 3);
        assert_eq!(screen.load_state(), LoadState::Ready);
    }

    #[tokio::test]
    async fn mark_read_is_optimistic_with_rollback() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        seed(&test, &me.id, 2);
        let screen = NotificationsScreen::mount(&test.app).await.expect("mounted");

        test.backend.fail_next(
            NOTIFICATIONS,
            Op::Update,
            BackendError::new("permission denied").with_status(403),
        );
        assert!(screen.mark_read("n0").await.is_err());
        assert!(!screen.notifications().get("n0").unwrap().read);
        assert_eq!(test.alerts.len(), 1);

        assert!(screen.mark_read("n0").await.expect("marked"));
        assert!(screen.notifications().get("n0").unwrap().read);
        assert!(!screen.mark_read("n0").await.expect("already read"));
        assert_eq!(screen.unread_count(), 1);
    }

    #[tokio::test]
    async fn mark_all_read_updates_backend_rows() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        seed(&test, &me.id, 3);
        seed(&test, "someone-else", 1);
        let screen = NotificationsScreen::mount(&test.app).await.expect("mounted");

        assert_eq!(screen.mark_all_read().await.expect("marked"), 3);
        assert_eq!(screen.unread_count(), 0);
        let still_unread = test
            .backend
            .rows(NOTIFICATIONS)
            .into_iter()
            .filter(|row| row["read"] == false)
            .count();
        assert_eq!(still_unread, 1);
        assert_eq!(screen.mark_all_read().await.expect("nothing left"), 0);
    }

    #[tokio::test]
    async fn realtime_inserts_arrive_for_the_user() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        let screen = NotificationsScreen::mount(&test.app).await.expect("mounted");
        assert_eq!(screen.load_state(), LoadState::Empty);
        assert_eq!(screen.notifications().channel_status(), ChannelStatus::Live);
        let mut revisions = screen.notifications().revisions();

        test.backend
            .insert(
                NOTIFICATIONS,
                vec![object(json!({ "user_id": me.id, "type": "follow", "read": false }))],
            )
            .await
            .expect("insert");
        while screen.notifications().is_empty() {
            revisions.changed().await.expect("screen alive");
        }
        assert_eq!(screen.load_state(), LoadState::Ready);
        assert_eq!(screen.unread_count(), 1);
    }

    #[tokio::test]
    async fn read_on_another_device_keeps_the_embedded_actor() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        test.backend.seed(
            NOTIFICATIONS,
            [object(json!({
                "id": "n1",
                "user_id": me.id,
                "type": "like",
                "actor_id": "u-grace",
                "actor": { "id": "u-grace", "username": "grace" },
                "read": false,
            }))],
        );
        let screen = NotificationsScreen::mount(&test.app).await.expect("mounted");
        let held = screen.notifications().get("n1").expect("held");
        assert!(held.actor.is_some());

        // Realtime images carry only the notification's own columns.
        let image = object(json!({
            "id": "n1",
            "user_id": me.id,
            "type": "like",
            "actor_id": "u-grace",
            "read": true,
            "created_at": held.created_at.to_rfc3339(),
        }));
        assert!(screen.notifications().apply_change(&ChangeEvent {
            kind: ChangeKind::Update,
            table: NOTIFICATIONS.to_string(),
            new: Some(image),
            old: None,
        }));

        let updated = screen.notifications().get("n1").expect("still held");
        assert!(updated.read);
        assert_eq!(
            updated.actor.and_then(|actor| actor.username).as_deref(),
            Some("grace")
        );
        assert_eq!(screen.unread_count(), 0);
    }
}
