//! Direct messaging: the inbox of rooms and a single room's conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::app::AppContext;
use crate::backend::{
    Backend, ChangeKind, ChannelEvent, ChannelSpec, Filter, Select, decode_row, decode_rows,
    object,
};
use crate::error::{BackendError, SyncError, SyncResult};
use crate::models::{ChatParticipant, ChatRoom, Message, Profile};
use crate::profiles::ProfileDirectory;
use crate::scope::ScreenScope;
use crate::sync::{ListQuery, LoadState, SortOrder, SyncedList};

const CHAT_ROOMS: &str = "chat_rooms";
const CHAT_PARTICIPANTS: &str = "chat_participants";
const MESSAGES: &str = "messages";

fn rooms_query(room_ids: &[String]) -> ListQuery {
    ListQuery::unpaged(
        Select::from(CHAT_ROOMS).filter(Filter::one_of("id", room_ids.iter().cloned())),
        "last_message_at",
    )
}

/// One inbox row: the room and how many of its messages the user has not read.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub room: ChatRoom,
    pub unread_count: i64,
}

/// Room membership of the signed-in user, shared with the membership pump.
struct Memberships {
    unread: Mutex<HashMap<String, i64>>,
}

impl Memberships {
    fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.unread.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

pub struct InboxScreen {
    scope: Arc<ScreenScope>,
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    profiles: Arc<ProfileDirectory>,
    user_id: String,
    rooms: SyncedList<ChatRoom>,
    memberships: Arc<Memberships>,
}

impl InboxScreen {
    /// Joins the room and membership feeds, then reads the user's
    /// memberships and their rooms.
    pub async fn mount(app: &AppContext) -> SyncResult<Self> {
        let user = app.session().require_user().await?;
        let scope = app.open_scope("inbox");
        let screen = Self {
            rooms: app.list(&scope, rooms_query(&[]), SortOrder::NewestFirst),
            scope,
            backend: Arc::clone(app.backend()),
            alerts: Arc::clone(app.alerts()),
            profiles: Arc::clone(app.profiles()),
            user_id: user.id,
            memberships: Arc::new(Memberships {
                unread: Mutex::new(HashMap::new()),
            }),
        };
        // Room updates for rooms outside the list are ignored by the merge.
        screen
            .rooms
            .attach(ChannelSpec::table("inbox-rooms", CHAT_ROOMS).only(ChangeKind::Update))
            .await?;
        screen.watch_memberships().await?;
        // Failures are alerted and held in the load state.
        match screen.reload_memberships().await {
            Ok(()) => {
                if let Err(SyncError::Cancelled) = screen.rooms.refresh().await {
                    return Err(SyncError::Cancelled);
                }
            }
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(err) => screen.rooms.mark_failed(&err),
        }
        Ok(screen)
    }

    async fn reload_memberships(&self) -> SyncResult<()> {
        let query = Select::from(CHAT_PARTICIPANTS).eq("profile_id", self.user_id.as_str());
        let rows = match self.scope.guard(self.backend.select(&query)).await? {
            Ok(rows) => rows,
            Err(err) if err.is_no_rows() => Vec::new(),
            Err(err) => {
                let err = SyncError::from(err);
                warn!("Failed to load chat memberships: {err}");
                self.alerts.alert(Alert::from_error(&err));
                return Err(err);
            }
        };
        let participants: Vec<ChatParticipant> = decode_rows(CHAT_PARTICIPANTS, rows)?;
        let unread: HashMap<String, i64> = participants
            .into_iter()
            .map(|participant| (participant.chat_room_id, participant.unread_count))
            .collect();
        debug!("User belongs to {} rooms", unread.len());
        *self.memberships.unread.lock() = unread;
        self.rooms.retarget(rooms_query(&self.memberships.room_ids()));
        Ok(())
    }

    async fn watch_memberships(&self) -> SyncResult<()> {
        let spec = ChannelSpec::table("inbox-memberships", CHAT_PARTICIPANTS)
            .filtered("profile_id", self.user_id.as_str());
        let subscription = match self.scope.guard(self.backend.subscribe(spec)).await? {
            Ok(subscription) => subscription,
            Err(err) => {
                let err = SyncError::from(err);
                warn!("Failed to join membership feed: {err}");
                self.alerts.alert(Alert::from_error(&err));
                return Err(err);
            }
        };
        let mut events = self.scope.adopt(subscription);
        // Memberships committed after the join reach the pump; earlier ones
        // are in the read that follows.
        match self.scope.guard(events.recv()).await? {
            Some(ChannelEvent::Subscribed) => debug!("Membership feed joined"),
            Some(ChannelEvent::Error(message)) => warn!("Membership feed errored: {message}"),
            Some(ChannelEvent::Change(_)) => debug!("Membership change ahead of join ack"),
            Some(ChannelEvent::Closed) | None => {
                warn!("Membership feed closed during join");
                return Ok(());
            }
        }
        self.scope.spawn(pump_memberships(
            Arc::clone(&self.memberships),
            self.rooms.clone(),
            events,
        ));
        Ok(())
    }

    pub async fn refresh(&self) -> SyncResult<LoadState> {
        self.reload_memberships().await?;
        self.rooms.refresh().await
    }

    pub fn entries(&self) -> Vec<InboxEntry> {
        let unread = self.memberships.unread.lock().clone();
        self.rooms
            .snapshot()
            .into_iter()
            .map(|room| InboxEntry {
                unread_count: unread.get(&room.id).copied().unwrap_or(0),
                room,
            })
            .collect()
    }

    /// Unread messages in `room_id` as last reported by the backend.
    pub fn unread_count(&self, room_id: &str) -> i64 {
        self.memberships
            .unread
            .lock()
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> i64 {
        self.memberships.unread.lock().values().sum()
    }

    pub fn rooms(&self) -> &SyncedList<ChatRoom> {
        &self.rooms
    }

    pub fn load_state(&self) -> LoadState {
        self.rooms.load_state()
    }

    /// The other member of a direct room.
    pub async fn counterpart(&self, room_id: &str) -> SyncResult<Option<Arc<Profile>>> {
        let query = Select::from(CHAT_PARTICIPANTS)
            .eq("chat_room_id", room_id)
            .filter(Filter::neq("profile_id", self.user_id.as_str()))
            .limit(1);
        let rows = match self.scope.guard(self.backend.select(&query)).await? {
            Ok(rows) => rows,
            Err(err) => {
                let err = SyncError::from(err);
                self.alerts.alert(Alert::from_error(&err));
                return Err(err);
            }
        };
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let participant: ChatParticipant = decode_row(CHAT_PARTICIPANTS, row)?;
        self.profiles.get(&participant.profile_id).await
    }

    pub fn scope(&self) -> &Arc<ScreenScope> {
        &self.scope
    }
}

impl Drop for InboxScreen {
    fn drop(&mut self) {
        self.scope.teardown();
    }
}

async fn pump_memberships(
    memberships: Arc<Memberships>,
    rooms: SyncedList<ChatRoom>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let change = match event {
            ChannelEvent::Change(change) => change,
            ChannelEvent::Subscribed => continue,
            ChannelEvent::Error(message) => {
                warn!("Membership feed errored: {message}");
                continue;
            }
            ChannelEvent::Closed => break,
        };
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = change.new else { continue };
                let participant: ChatParticipant = match decode_row(CHAT_PARTICIPANTS, row) {
                    Ok(participant) => participant,
                    Err(err) => {
                        warn!("Dropping membership change: {err}");
                        continue;
                    }
                };
                let joined = memberships
                    .unread
                    .lock()
                    .insert(participant.chat_room_id.clone(), participant.unread_count)
                    .is_none();
                if joined {
                    info!("Joined room {}", participant.chat_room_id);
                    rooms.retarget(rooms_query(&memberships.room_ids()));
                    if let Err(err) = rooms.refresh().await {
                        debug!("Inbox reload after join failed: {err}");
                    }
                }
            }
            ChangeKind::Delete => {
                let room_id = change
                    .old
                    .as_ref()
                    .and_then(|row| row.get("chat_room_id"))
                    .and_then(|value| value.as_str().map(str::to_string));
                if let Some(room_id) = room_id {
                    memberships.unread.lock().remove(&room_id);
                    rooms.retarget(rooms_query(&memberships.room_ids()));
                    if let Err(err) = rooms.refresh().await {
                        debug!("Inbox reload after leave failed: {err}");
                    }
                }
            }
        }
    }
    debug!("Membership pump stopped");
}

/// One room's conversation, oldest message first.
pub struct ChatScreen {
    scope: Arc<ScreenScope>,
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    room_id: String,
    user_id: String,
    messages: SyncedList<Message>,
    draft: Mutex<String>,
}

impl ChatScreen {
    pub async fn mount(app: &AppContext, room_id: &str) -> SyncResult<Self> {
        assert!(!room_id.is_empty(), "Room id cannot be empty");
        let user = app.session().require_user().await?;
        let scope = app.open_scope(&format!("chat:{room_id}"));
        let query = ListQuery::paged(
            Select::from(MESSAGES).eq("chat_room_id", room_id),
            "created_at",
            app.page_size(),
        );
        let screen = Self {
            messages: app.list(&scope, query, SortOrder::OldestFirst),
            scope,
            backend: Arc::clone(app.backend()),
            alerts: Arc::clone(app.alerts()),
            room_id: room_id.to_string(),
            user_id: user.id,
            draft: Mutex::new(String::new()),
        };
        screen
            .messages
            .attach(
                ChannelSpec::table(&format!("chat-{room_id}"), MESSAGES)
                    .filtered("chat_room_id", room_id),
            )
            .await?;
        match screen.messages.load().await {
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            // Failures are already alerted and held in the load state.
            _ => Ok(screen),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn messages(&self) -> &SyncedList<Message> {
        &self.messages
    }

    /// `Empty` is the start-a-conversation state.
    pub fn load_state(&self) -> LoadState {
        self.messages.load_state()
    }

    /// Older history.
    pub async fn load_earlier(&self) -> SyncResult<usize> {
        self.messages.load_more().await
    }

    pub fn draft(&self) -> String {
        self.draft.lock().clone()
    }

    /// Sends `text`. Blank text is a no-op. The composer keeps the text until
    /// the insert succeeds; the message itself shows up via the realtime echo.
    pub async fn send(&self, text: &str) -> SyncResult<Option<Message>> {
        *self.draft.lock() = text.to_string();
        let content = text.trim();
        if content.is_empty() {
            return Ok(None);
        }
        let row = object(json!({
            "chat_room_id": self.room_id,
            "sender_id": self.user_id,
            "content": content,
        }));
        let inserted = match self.scope.guard(self.backend.insert(MESSAGES, vec![row])).await? {
            Ok(rows) => rows,
            Err(err) => {
                let err = SyncError::from(err);
                warn!("Send to {} failed: {err}", self.room_id);
                self.alerts.alert(Alert::from_error(&err));
                return Err(err);
            }
        };
        self.draft.lock().clear();
        match inserted.into_iter().next() {
            Some(row) => Ok(Some(decode_row(MESSAGES, row)?)),
            None => Ok(None),
        }
    }

    pub fn scope(&self) -> &Arc<ScreenScope> {
        &self.scope
    }
}

impl Drop for ChatScreen {
    fn drop(&mut self) {
        self.scope.teardown();
    }
}

/// Finds the room `other_id` already shares with the signed-in user, or
/// creates one with exactly the two of them.
pub async fn open_direct_room(app: &AppContext, other_id: &str) -> SyncResult<ChatRoom> {
    let user = app.session().require_user().await?;
    let backend = app.backend();
    let alerts = app.alerts();
    if other_id == user.id {
        let err = SyncError::Validation("You cannot message yourself".to_string());
        alerts.alert(Alert::from_error(&err));
        return Err(err);
    }

    match find_or_create_room(backend.as_ref(), &user.id, other_id).await {
        Ok(room) => Ok(room),
        Err(err) => {
            warn!("Opening a room with {other_id} failed: {err}");
            alerts.alert(Alert::from_error(&err));
            Err(err)
        }
    }
}

async fn find_or_create_room(
    backend: &dyn Backend,
    user_id: &str,
    other_id: &str,
) -> SyncResult<ChatRoom> {
    let theirs = backend
        .select(
            &Select::from(CHAT_PARTICIPANTS)
                .columns("chat_room_id")
                .eq("profile_id", other_id),
        )
        .await?;
    let their_rooms: Vec<String> = theirs
        .iter()
        .filter_map(|row| row.get("chat_room_id"))
        .filter_map(|value| match value {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
        .collect();

    if !their_rooms.is_empty() {
        let shared = backend
            .select(
                &Select::from(CHAT_PARTICIPANTS)
                    .eq("profile_id", user_id)
                    .filter(Filter::one_of("chat_room_id", their_rooms))
                    .limit(1),
            )
            .await?;
        if let Some(row) = shared.into_iter().next() {
            let participant: ChatParticipant = decode_row(CHAT_PARTICIPANTS, row)?;
            let room = backend
                .select(&Select::from(CHAT_ROOMS).eq("id", participant.chat_room_id.as_str()).limit(1))
                .await?;
            if let Some(row) = room.into_iter().next() {
                debug!("Reusing room {}", participant.chat_room_id);
                return decode_row(CHAT_ROOMS, row);
            }
        }
    }

    let created = backend
        .insert(CHAT_ROOMS, vec![object(json!({}))])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::no_rows(CHAT_ROOMS))?;
    let room: ChatRoom = decode_row(CHAT_ROOMS, created)?;
    let members = vec![
        object(json!({ "chat_room_id": room.id, "profile_id": user_id })),
        object(json!({ "chat_room_id": room.id, "profile_id": other_id })),
    ];
    if let Err(err) = backend.insert(CHAT_PARTICIPANTS, members).await {
        if let Err(cleanup) = backend
            .delete(CHAT_ROOMS, &[Filter::eq("id", room.id.as_str())])
            .await
        {
            warn!("Failed to remove orphaned room {}: {cleanup}", room.id);
        }
        return Err(err.into());
    }
    info!("Created direct room {}", room.id);
    Ok(room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{TestApp, signed_in, test_app};
    use crate::backend::memory::Op;

    fn seed_room(test: &TestApp, room: &str, members: &[(&str, i64)]) {
        test.backend
            .seed(CHAT_ROOMS, [object(json!({ "id": room, "last_message": null }))]);
        test.backend.seed(
            CHAT_PARTICIPANTS,
            members.iter().map(|(profile, unread)| {
                object(json!({
                    "chat_room_id": room,
                    "profile_id": profile,
                    "unread_count": unread,
                }))
            }),
        );
    }

    #[tokio::test]
    async fn empty_room_is_empty_state_without_alert() {
        let test = test_app();
        signed_in(&test, "ada@example.com").await;
        let chat = ChatScreen::mount(&test.app, "R1").await.expect("mounted");
        assert_eq!(chat.load_state(), LoadState::Empty);
        assert!(test.alerts.is_empty());
    }

    #[tokio::test]
    async fn permission_denied_alerts_once_and_keeps_state() {
        let test = test_app();
        signed_in(&test, "ada@example.com").await;
        test.backend.fail_next(
            MESSAGES,
            Op::Select,
            BackendError::new("permission denied").with_status(403),
        );
        let chat = ChatScreen::mount(&test.app, "R1").await.expect("mounted");
        assert_eq!(test.alerts.messages(), vec!["permission denied".to_string()]);
        assert!(chat.messages().is_empty());
        assert_eq!(
            chat.load_state(),
            LoadState::Failed("permission denied".to_string())
        );
    }

    #[tokio::test]
    async fn send_clears_composer_only_on_success_and_arrives_by_echo() {
        let test = test_app();
        signed_in(&test, "ada@example.com").await;
        let chat = ChatScreen::mount(&test.app, "R1").await.expect("mounted");
        let mut revisions = chat.messages().revisions();

        assert!(chat.send("   ").await.expect("blank").is_none());
        assert_eq!(test.backend.request_count(MESSAGES, Op::Insert), 0);

        test.backend.fail_next(
            MESSAGES,
            Op::Insert,
            BackendError::new("network down"),
        );
        assert!(chat.send("hello").await.is_err());
        assert_eq!(chat.draft(), "hello");
        assert!(chat.messages().is_empty());

        let sent = chat.send("hello").await.expect("sent").expect("row");
        assert_eq!(chat.draft(), "");
        while chat.messages().get(&sent.id).is_none() {
            revisions.changed().await.expect("list alive");
        }
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.load_state(), LoadState::Ready);
    }

    #[tokio::test]
    async fn history_pages_backwards_and_displays_oldest_first() {
        let test = test_app();
        let user = signed_in(&test, "ada@example.com").await;
        for i in 0..5 {
            test.backend
                .insert(
                    MESSAGES,
                    vec![object(json!({
                        "chat_room_id": "R1",
                        "sender_id": user.id,
                        "content": format!("m{i}"),
                    }))],
                )
                .await
                .expect("seed message");
        }
        let mut config = test.app.config().clone();
        config.pagination.page_size = 3;
        let app = AppContext::new(config, Arc::new(test.backend.clone()), Arc::new(test.alerts.clone()));

        let chat = ChatScreen::mount(&app, "R1").await.expect("mounted");
        let contents: Vec<_> = chat.messages().snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        assert_eq!(chat.load_earlier().await.expect("older"), 2);
        let contents: Vec<_> = chat.messages().snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(!chat.messages().has_more());
    }

    #[tokio::test]
    async fn inbox_lists_member_rooms_with_server_unread_counts() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        seed_room(&test, "R1", &[(me.id.as_str(), 2), ("u-grace", 0)]);
        seed_room(&test, "R2", &[("u-grace", 0), ("u-alan", 1)]);

        let inbox = InboxScreen::mount(&test.app).await.expect("mounted");
        let entries = inbox.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].room.id, "R1");
        assert_eq!(entries[0].unread_count, 2);

        // Opening the room never changes the server-owned counter.
        let chat = ChatScreen::mount(&test.app, "R1").await.expect("chat");
        drop(chat);
        assert_eq!(inbox.unread_count("R1"), 2);
        assert_eq!(inbox.total_unread(), 2);
    }

    #[tokio::test]
    async fn inbox_follows_room_updates_and_new_memberships() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        seed_room(&test, "R1", &[(me.id.as_str(), 0)]);
        let inbox = InboxScreen::mount(&test.app).await.expect("mounted");
        let mut revisions = inbox.rooms().revisions();

        test.backend
            .update(
                CHAT_ROOMS,
                object(json!({ "last_message": "hi", "last_message_at": "2024-05-01T10:00:00Z" })),
                &[Filter::eq("id", "R1")],
            )
            .await
            .expect("room update");
        while inbox.rooms().get("R1").and_then(|room| room.last_message).is_none() {
            revisions.changed().await.expect("inbox alive");
        }

        let room = open_direct_room(&test.app, "u-grace").await.expect("room");
        while inbox.rooms().get(&room.id).is_none() {
            revisions.changed().await.expect("inbox alive");
        }
        assert_eq!(inbox.entries().len(), 2);
    }

    #[tokio::test]
    async fn direct_rooms_are_reused() {
        let test = test_app();
        let grace = signed_in(&test, "grace@example.com").await;
        signed_in(&test, "ada@example.com").await;

        let first = open_direct_room(&test.app, &grace.id).await.expect("created");
        let second = open_direct_room(&test.app, &grace.id).await.expect("reused");
        assert_eq!(first.id, second.id);
        assert_eq!(test.backend.rows(CHAT_ROOMS).len(), 1);
        let members = test.backend.rows(CHAT_PARTICIPANTS);
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|row| row["chat_room_id"] == first.id.as_str()));

        let inbox = InboxScreen::mount(&test.app).await.expect("inbox");
        let other = inbox
            .counterpart(&first.id)
            .await
            .expect("lookup")
            .expect("profile");
        assert_eq!(other.id, grace.id);
        assert!(test.alerts.is_empty());
    }

    #[tokio::test]
    async fn messaging_yourself_is_rejected() {
        let test = test_app();
        let me = signed_in(&test, "ada@example.com").await;
        assert!(matches!(
            open_direct_room(&test.app, &me.id).await,
            Err(SyncError::Validation(_))
        ));
        assert_eq!(test.alerts.len(), 1);
    }
}
