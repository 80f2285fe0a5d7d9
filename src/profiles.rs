use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use moka::future::Cache;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::backend::{Backend, Filter, Row, Select, decode_row, decode_rows, fetch_optional};
use crate::config::CacheConfig;
use crate::error::{BackendError, SyncError, SyncResult};
use crate::identity::{
    canonicalize_bio, canonicalize_display_name, canonicalize_username, username_search_pattern,
};
use crate::models::Profile;

pub const AVATAR_BUCKET: &str = "avatars";
pub const SEARCH_LIMIT: usize = 20;
const PROFILES: &str = "profiles";

/// Fields a user may edit from settings. `None` leaves a field unchanged;
/// blank display names and bios clear the column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub bio: Option<String>,
}

impl ProfileUpdate {
    fn into_patch(self) -> SyncResult<Row> {
        let mut patch = Row::new();
        if let Some(username) = self.username {
            patch.insert("username".into(), canonicalize_username(&username)?.into());
        }
        if let Some(full_name) = self.full_name {
            let value = canonicalize_display_name(&full_name)?.map_or(Value::Null, Value::from);
            patch.insert("full_name".into(), value);
        }
        if let Some(bio) = self.bio {
            let value = canonicalize_bio(&bio)?.map_or(Value::Null, Value::from);
            patch.insert("bio".into(), value);
        }
        if patch.is_empty() {
            return Err(SyncError::Validation("Nothing to update".to_string()));
        }
        patch.insert(
            "updated_at".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        Ok(patch)
    }
}

/// Profile reads behind a bounded cache, plus the settings-screen mutations.
pub struct ProfileDirectory {
    backend: Arc<dyn Backend>,
    alerts: Arc<dyn AlertSink>,
    profiles: Cache<String, Arc<Profile>>,
    searches: Cache<String, Arc<Vec<Profile>>>,
}

impl ProfileDirectory {
    pub fn new(backend: Arc<dyn Backend>, alerts: Arc<dyn AlertSink>, config: &CacheConfig) -> Self {
        assert!(
            config.profiles_max_capacity >= 16,
            "Profile cache capacity threshold"
        );
        let profiles = Cache::builder()
            .max_capacity(config.profiles_max_capacity)
            .time_to_live(config.profiles_ttl())
            .time_to_idle(Duration::from_secs(config.profiles_ttl_seconds / 2 + 1))
            .build();
        let searches = Cache::builder()
            .max_capacity(config.profiles_max_capacity / 4)
            .time_to_live(config.profiles_ttl())
            .build();
        Self {
            backend,
            alerts,
            profiles,
            searches,
        }
    }

    fn report<T>(&self, operation: &str, err: SyncError) -> SyncResult<T> {
        warn!("Profile {operation} failed: {err}");
        self.alerts.alert(Alert::from_error(&err));
        Err(err)
    }

    /// The profile keyed by `id`; `None` when no row exists.
    pub async fn get(&self, id: &str) -> SyncResult<Option<Arc<Profile>>> {
        assert!(!id.is_empty(), "Profile id cannot be empty");
        if let Some(cached) = self.profiles.get(id).await {
            return Ok(Some(cached));
        }
        let row = match fetch_optional(self.backend.as_ref(), Select::from(PROFILES).eq("id", id))
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!("No profile row for {id}");
                return Ok(None);
            }
            Err(err) => return self.report("lookup", err.into()),
        };
        let profile = Arc::new(decode_row::<Profile>(PROFILES, row)?);
        self.profiles.insert(id.to_string(), Arc::clone(&profile)).await;
        Ok(Some(profile))
    }

    /// Profiles whose username contains `query`, excluding `exclude`.
    pub async fn search(&self, query: &str, exclude: Option<&str>) -> SyncResult<Arc<Vec<Profile>>> {
        let Some(pattern) = username_search_pattern(query) else {
            return Ok(Arc::new(Vec::new()));
        };
        let cache_key = format!("{pattern}|{}", exclude.unwrap_or_default());
        if let Some(cached) = self.searches.get(&cache_key).await {
            return Ok(cached);
        }

        let mut select = Select::from(PROFILES)
            .filter(Filter::ilike("username", &pattern))
            .order("username", true)
            .limit(SEARCH_LIMIT);
        if let Some(exclude) = exclude {
            select = select.filter(Filter::neq("id", exclude));
        }
        let rows = match self.backend.select(&select).await {
            Ok(rows) => rows,
            Err(err) if err.is_no_rows() => Vec::new(),
            Err(err) => return self.report("search", err.into()),
        };
        let results = Arc::new(decode_rows::<Profile>(PROFILES, rows)?);
        assert!(results.len() <= SEARCH_LIMIT, "Search exceeded its limit");
        self.searches.insert(cache_key, Arc::clone(&results)).await;
        Ok(results)
    }

    pub async fn update(&self, id: &str, update: ProfileUpdate) -> SyncResult<Arc<Profile>> {
        let patch = match update.into_patch() {
            Ok(patch) => patch,
            Err(err) => return self.report("update", err),
        };
        self.write(id, patch, "update").await
    }

    /// Stores `bytes` as the user's avatar and points the profile at it.
    pub async fn upload_avatar(&self, id: &str, bytes: Vec<u8>) -> SyncResult<Arc<Profile>> {
        if bytes.is_empty() {
            return self.report(
                "avatar upload",
                SyncError::Validation("Avatar image is empty".to_string()),
            );
        }
        let path = format!("{id}.jpg");
        if let Err(err) = self
            .backend
            .upload(AVATAR_BUCKET, &path, bytes, "image/jpeg")
            .await
        {
            return self.report("avatar upload", err.into());
        }
        let url = self.backend.public_url(AVATAR_BUCKET, &path);
        let mut patch = Row::new();
        patch.insert("avatar_url".into(), Value::String(url));
        patch.insert(
            "updated_at".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        self.write(id, patch, "avatar update").await
    }

    async fn write(&self, id: &str, patch: Row, operation: &str) -> SyncResult<Arc<Profile>> {
        let rows = match self
            .backend
            .update(PROFILES, patch, &[Filter::eq("id", id)])
            .await
        {
            Ok(rows) => rows,
            Err(err) => return self.report(operation, err.into()),
        };
        self.invalidate(id).await;
        let Some(row) = rows.into_iter().next() else {
            return self.report(operation, BackendError::no_rows(PROFILES).into());
        };
        let profile = Arc::new(decode_row::<Profile>(PROFILES, row)?);
        self.profiles.insert(id.to_string(), Arc::clone(&profile)).await;
        info!("Profile {id} updated");
        Ok(profile)
    }

    pub async fn invalidate(&self, id: &str) {
        self.profiles.invalidate(id).await;
        self.searches.invalidate_all();
    }

    pub fn cached_profiles(&self) -> u64 {
        self.profiles.entry_count()
    }
}
