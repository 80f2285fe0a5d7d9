//! Home feed: posts newest-first with a per-user like toggle.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::app::AppContext;
use crate::backend::{Backend, ChannelSpec, Filter, Select, decode_rows, fetch_optional, object, row_key};
use crate::error::{SyncError, SyncResult};
use crate::models::{Like, Post, Profile};
use crate::profiles::ProfileDirectory;
use crate::scope::ScreenScope;
use crate::sync::{InFlightKeys, ListQuery, LoadState, SortOrder, SyncedList};

const POSTS: &str = "posts";
const LIKES: &str = "likes";
const POST_COLUMNS: &str = "*, author:profiles(id, username, full_name, avatar_url)";

pub struct FeedScreen {
    scope: Arc<ScreenScope>,
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    profiles: Arc<ProfileDirectory>,
    user_id: String,
    posts: SyncedList<Post>,
    liked: Mutex<HashSet<String>>,
    toggles: InFlightKeys,
}

impl FeedScreen {
    /// Joins the posts feed, then loads the first page and the user's likes
    /// on it.
    pub async fn mount(app: &AppContext) -> SyncResult<Self> {
        let user = app.session().require_user().await?;
        let scope = app.open_scope("feed");
        let query = ListQuery::paged(
            Select::from(POSTS).columns(POST_COLUMNS),
            "created_at",
            app.page_size(),
        );
        let posts = app.list(&scope, query, SortOrder::NewestFirst);
        let screen = Self {
            scope,
            backend: Arc::clone(app.backend()),
            alerts: Arc::clone(app.alerts()),
            profiles: Arc::clone(app.profiles()),
            user_id: user.id,
            posts,
            liked: Mutex::new(HashSet::new()),
            toggles: InFlightKeys::new("toggle_like"),
        };
        screen.posts.attach(ChannelSpec::table("feed-posts", POSTS)).await?;
        match screen.posts.load().await {
            Ok(_) => screen.refresh_likes().await?,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            // Already alerted and held in the load state.
            Err(_) => {}
        }
        Ok(screen)
    }

    pub fn scope(&self) -> &Arc<ScreenScope> {
        &self.scope
    }

    pub fn posts(&self) -> &SyncedList<Post> {
        &self.posts
    }

    pub fn load_state(&self) -> LoadState {
        self.posts.load_state()
    }

    pub fn is_liked(&self, post_id: &str) -> bool {
        self.liked.lock().contains(post_id)
    }

    pub async fn refresh(&self) -> SyncResult<LoadState> {
        let state = self.posts.refresh().await?;
        self.refresh_likes().await?;
        Ok(state)
    }

    pub async fn load_more(&self) -> SyncResult<usize> {
        let added = self.posts.load_more().await?;
        if added > 0 {
            self.refresh_likes().await?;
        }
        Ok(added)
    }

    /// Re-reads which of the held posts the user has liked.
    async fn refresh_likes(&self) -> SyncResult<()> {
        let keys = self.posts.keys();
        if keys.is_empty() {
            self.liked.lock().clear();
            return Ok(());
        }
        let query = Select::from(LIKES)
            .eq("user_id", self.user_id.as_str())
            .filter(Filter::one_of("post_id", keys));
        let rows = match self.scope.guard(self.backend.select(&query)).await? {
            Ok(rows) => rows,
            Err(err) if err.is_no_rows() => Vec::new(),
            Err(err) => {
                let err = SyncError::from(err);
                warn!("Failed to load likes: {err}");
                self.alerts.alert(Alert::from_error(&err));
                return Err(err);
            }
        };
        let likes: Vec<Like> = decode_rows(LIKES, rows)?;
        let liked: HashSet<String> = likes.into_iter().map(|like| like.post_id).collect();
        debug!("User likes {} of {} held posts", liked.len(), self.posts.len());
        *self.liked.lock() = liked;
        Ok(())
    }

    pub async fn author(&self, post: &Post) -> SyncResult<Option<Arc<Profile>>> {
        self.profiles.get(&post.user_id).await
    }

    /// Flips the like on `post_id` and returns the new state. The flip shows
    /// immediately and is rolled back if the backend rejects it. A toggle
    /// while another on the same post is pending is rejected with `Busy`.
    pub async fn toggle_like(&self, post_id: &str) -> SyncResult<bool> {
        let _in_flight = self.toggles.acquire(post_id)?;

        let was_liked = self.is_liked(post_id);
        self.set_liked(post_id, !was_liked);
        let delta = if was_liked { -1 } else { 1 };
        let previous = self.posts.patch(post_id, |post| {
            post.likes_count = (post.likes_count + delta).max(0);
        });

        match self.scope.guard(self.persist_like(post_id)).await {
            Ok(Ok(now_liked)) => {
                self.set_liked(post_id, now_liked);
                info!("Post {post_id} liked={now_liked}");
                Ok(now_liked)
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Ok(Err(err)) | Err(err) => {
                self.set_liked(post_id, was_liked);
                if let Some(previous) = previous {
                    self.posts.restore(previous);
                }
                warn!("Like toggle on {post_id} failed: {err}");
                self.alerts.alert(Alert::from_error(&err));
                Err(err)
            }
        }
    }

    /// Check-then-act against the like row: delete it if present, else
    /// insert it. Returns whether the post is now liked.
    async fn persist_like(&self, post_id: &str) -> SyncResult<bool> {
        let existing = fetch_optional(
            self.backend.as_ref(),
            Select::from(LIKES)
                .eq("post_id", post_id)
                .eq("user_id", self.user_id.as_str()),
        )
        .await?;
        match existing {
            Some(row) => {
                let filters = match row_key(&row) {
                    Some(id) => vec![Filter::eq("id", id)],
                    None => vec![
                        Filter::eq("post_id", post_id),
                        Filter::eq("user_id", self.user_id.as_str()),
                    ],
                };
                self.backend.delete(LIKES, &filters).await?;
                Ok(false)
            }
            None => {
                let row = object(json!({ "post_id": post_id, "user_id": self.user_id }));
                self.backend.insert(LIKES, vec![row]).await?;
                Ok(true)
            }
        }
    }

    fn set_liked(&self, post_id: &str, liked: bool) {
        let mut set = self.liked.lock();
        if liked {
            set.insert(post_id.to_string());
        } else {
            set.remove(post_id);
        }
    }
}

impl Drop for FeedScreen {
    fn drop(&mut self) {
        self.scope.teardown();
    }
}
