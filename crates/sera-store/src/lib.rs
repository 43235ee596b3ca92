//! Persistence layer: the [`EngagementStore`] trait plus an in-memory
//! backend for tests/dry runs and a Postgres backend for production.
//!
//! Every write is a single atomic statement scoped to one identity key;
//! conflict resolution between concurrent writers happens inside the store
//! (the rules in [`sera_core::resolve_post_upsert`]), never via
//! application-level locking around read-then-write.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sera_core::{
    regional_offset, resolve_post_upsert, AuditSnapshot, Platform, PostKey, PostMedia, PostRecord,
    PostUpsert, Registry, SnapshotWindow, SourceType, TaskPostExclusion,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sera-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One organizational client (account owner) eligible for syncing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub name: String,
    /// Top-level unit this client reports under.
    pub directorate: Option<String>,
    pub instagram_handle: Option<String>,
    pub tiktok_handle: Option<String>,
    pub active: bool,
    pub daily_sync_enabled: bool,
    pub personnel_count: i64,
}

impl ClientRecord {
    pub fn handle_for(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Instagram => self.instagram_handle.as_deref(),
            Platform::Tiktok => self.tiktok_handle.as_deref(),
        }
    }

    pub fn eligible_for(&self, platform: Platform) -> bool {
        self.active && self.daily_sync_enabled && self.handle_for(platform).is_some()
    }
}

/// One roster member whose engagement is classified by reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterUser {
    pub user_id: String,
    pub name: String,
    pub client_id: String,
    pub instagram_username: Option<String>,
    pub tiktok_username: Option<String>,
}

impl RosterUser {
    pub fn username_for(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Instagram => self.instagram_username.as_deref(),
            Platform::Tiktok => self.tiktok_username.as_deref(),
        }
    }
}

/// Comment row persisted alongside the engagement set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredComment {
    pub key: PostKey,
    pub comment_id: String,
    pub username: Option<String>,
    pub text: Option<String>,
    pub commented_at: Option<DateTime<Utc>>,
}

/// UTC bounds of one regional calendar day.
fn day_bounds_utc(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let offset = regional_offset();
    let start_local = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    let start = offset
        .from_local_datetime(&start_local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&start_local));
    (start, start + Duration::days(1))
}

/// Storage interface consumed by the sync and reporting layers.
#[async_trait]
pub trait EngagementStore: Send + Sync {
    /// Atomic conflict-resolving post upsert keyed by `(registry, platform,
    /// content id)`. Returns the resolved stored row.
    async fn upsert_post(
        &self,
        registry: Registry,
        incoming: &PostUpsert,
    ) -> Result<PostRecord, StoreError>;

    async fn find_post(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<Option<PostRecord>, StoreError>;

    /// Client id owning `key` in the special-assignment registry, if claimed.
    async fn special_assignment_owner(&self, key: &PostKey) -> Result<Option<String>, StoreError>;

    /// Posts for one client within one regional calendar day.
    async fn posts_on_day(
        &self,
        registry: Registry,
        client_id: &str,
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError>;

    /// Posts across a set of clients for one regional calendar day.
    async fn posts_for_clients_on_day(
        &self,
        registry: Registry,
        client_ids: &[String],
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError>;

    /// Cascade delete: audit rows, engagement set, comments, then the post
    /// row. No foreign-key cascade is assumed.
    async fn delete_post_cascade(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<(), StoreError>;

    async fn engagement_set(&self, key: &PostKey) -> Result<BTreeSet<String>, StoreError>;

    /// Full replace of the current engagement pointer. Callers pass a set
    /// that is already a union with the previous state.
    async fn replace_engagement_set(
        &self,
        key: &PostKey,
        usernames: &BTreeSet<String>,
    ) -> Result<(), StoreError>;

    async fn store_comments(
        &self,
        key: &PostKey,
        comments: &[StoredComment],
    ) -> Result<(), StoreError>;

    /// Append-only audit write.
    async fn append_audit(&self, snapshot: &AuditSnapshot) -> Result<(), StoreError>;

    /// Latest audit snapshot for `key` captured inside `window`, if any.
    async fn audit_in_window(
        &self,
        key: &PostKey,
        window: &SnapshotWindow,
    ) -> Result<Option<AuditSnapshot>, StoreError>;

    /// Idempotent exclusion upsert; a later write without a source link must
    /// not erase a stored one.
    async fn add_exclusion(&self, exclusion: &TaskPostExclusion) -> Result<(), StoreError>;

    async fn exclusion_set(
        &self,
        client_id: &str,
        platform: Platform,
    ) -> Result<BTreeSet<String>, StoreError>;

    /// Configured allowlist merged into every engagement set.
    async fn exception_usernames(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError>;

    /// Active clients with a linked handle and daily sync enabled.
    async fn eligible_clients(&self, platform: Platform) -> Result<Vec<ClientRecord>, StoreError>;

    /// Clients whose directorate matches, for role-scoped reporting. May be
    /// empty when the role mapping is stale.
    async fn clients_in_directorate(
        &self,
        directorate: &str,
    ) -> Result<Vec<ClientRecord>, StoreError>;

    async fn roster_for_clients(
        &self,
        client_ids: &[String],
    ) -> Result<Vec<RosterUser>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend

#[derive(Default)]
struct MemoryInner {
    posts: HashMap<Registry, BTreeMap<PostKey, PostRecord>>,
    engagement: BTreeMap<PostKey, BTreeSet<String>>,
    comments: BTreeMap<PostKey, Vec<StoredComment>>,
    audits: Vec<AuditSnapshot>,
    exclusions: BTreeMap<(String, Platform), BTreeMap<String, TaskPostExclusion>>,
    exceptions: BTreeSet<String>,
    clients: BTreeMap<String, ClientRecord>,
    roster: Vec<RosterUser>,
    fail_audit_writes: bool,
}

/// Lock-guarded in-memory implementation. Upserts apply the conflict rules
/// under the write lock, so they are atomic per key like the SQL backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_client(&self, client: ClientRecord) {
        self.inner
            .write()
            .await
            .clients
            .insert(client.client_id.clone(), client);
    }

    pub async fn seed_roster_user(&self, user: RosterUser) {
        self.inner.write().await.roster.push(user);
    }

    pub async fn set_exception_usernames(&self, usernames: impl IntoIterator<Item = String>) {
        self.inner.write().await.exceptions = usernames.into_iter().collect();
    }

    /// Makes subsequent audit writes fail, for exercising the non-fatal
    /// audit path.
    #[doc(hidden)]
    pub async fn set_audit_writes_failing(&self, failing: bool) {
        self.inner.write().await.fail_audit_writes = failing;
    }

    pub async fn audit_count(&self) -> usize {
        self.inner.read().await.audits.len()
    }
}

#[async_trait]
impl EngagementStore for MemoryStore {
    async fn upsert_post(
        &self,
        registry: Registry,
        incoming: &PostUpsert,
    ) -> Result<PostRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let table = inner.posts.entry(registry).or_default();
        let resolved = resolve_post_upsert(table.get(&incoming.key), incoming, Utc::now());
        table.insert(incoming.key.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn find_post(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<Option<PostRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.posts.get(&registry).and_then(|t| t.get(key)).cloned())
    }

    async fn special_assignment_owner(&self, key: &PostKey) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .posts
            .get(&Registry::SpecialAssignment)
            .and_then(|t| t.get(key))
            .map(|p| p.client_id.clone()))
    }

    async fn posts_on_day(
        &self,
        registry: Registry,
        client_id: &str,
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError> {
        self.posts_for_clients_on_day(registry, &[client_id.to_string()], platform, day)
            .await
    }

    async fn posts_for_clients_on_day(
        &self,
        registry: Registry,
        client_ids: &[String],
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError> {
        let (start, end) = day_bounds_utc(day);
        let inner = self.inner.read().await;
        Ok(inner
            .posts
            .get(&registry)
            .map(|table| {
                table
                    .values()
                    .filter(|p| p.key.platform == platform)
                    .filter(|p| client_ids.iter().any(|c| c == &p.client_id))
                    .filter(|p| p.created_at >= start && p.created_at < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_post_cascade(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.audits.retain(|a| &a.key != key);
        inner.engagement.remove(key);
        inner.comments.remove(key);
        if let Some(table) = inner.posts.get_mut(&registry) {
            table.remove(key);
        }
        debug!(%key, ?registry, "post deleted with cascade");
        Ok(())
    }

    async fn engagement_set(&self, key: &PostKey) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.engagement.get(key).cloned().unwrap_or_default())
    }

    async fn replace_engagement_set(
        &self,
        key: &PostKey,
        usernames: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .engagement
            .insert(key.clone(), usernames.clone());
        Ok(())
    }

    async fn store_comments(
        &self,
        key: &PostKey,
        comments: &[StoredComment],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner.comments.entry(key.clone()).or_default();
        for comment in comments {
            if !stored.iter().any(|c| c.comment_id == comment.comment_id) {
                stored.push(comment.clone());
            }
        }
        Ok(())
    }

    async fn append_audit(&self, snapshot: &AuditSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.fail_audit_writes {
            return Err(StoreError::Unavailable("audit writes disabled".into()));
        }
        inner.audits.push(snapshot.clone());
        Ok(())
    }

    async fn audit_in_window(
        &self,
        key: &PostKey,
        window: &SnapshotWindow,
    ) -> Result<Option<AuditSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .audits
            .iter()
            .filter(|a| &a.key == key && window.contains(a.captured_at))
            .max_by_key(|a| a.captured_at)
            .cloned())
    }

    async fn add_exclusion(&self, exclusion: &TaskPostExclusion) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let table = inner
            .exclusions
            .entry((exclusion.client_id.clone(), exclusion.platform))
            .or_default();
        match table.get_mut(&exclusion.content_id) {
            Some(stored) => {
                // Stored link survives a later write that omits it.
                if exclusion.source_link.is_some() {
                    stored.source_link = exclusion.source_link.clone();
                }
            }
            None => {
                table.insert(exclusion.content_id.clone(), exclusion.clone());
            }
        }
        Ok(())
    }

    async fn exclusion_set(
        &self,
        client_id: &str,
        platform: Platform,
    ) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .exclusions
            .get(&(client_id.to_string(), platform))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn exception_usernames(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.inner.read().await.exceptions.clone())
    }

    async fn client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError> {
        Ok(self.inner.read().await.clients.get(client_id).cloned())
    }

    async fn eligible_clients(&self, platform: Platform) -> Result<Vec<ClientRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .values()
            .filter(|c| c.eligible_for(platform))
            .cloned()
            .collect())
    }

    async fn clients_in_directorate(
        &self,
        directorate: &str,
    ) -> Result<Vec<ClientRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .clients
            .values()
            .filter(|c| c.directorate.as_deref() == Some(directorate))
            .cloned()
            .collect())
    }

    async fn roster_for_clients(
        &self,
        client_ids: &[String],
    ) -> Result<Vec<RosterUser>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .roster
            .iter()
            .filter(|u| client_ids.iter().any(|c| c == &u.client_id))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres backend

pub struct PgStore {
    pool: PgPool,
    schema: OnceCell<()>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_posts (
                        registry TEXT NOT NULL,
                        platform TEXT NOT NULL,
                        content_id TEXT NOT NULL,
                        client_id TEXT NOT NULL,
                        caption TEXT,
                        comment_count BIGINT NOT NULL DEFAULT 0,
                        like_count BIGINT NOT NULL DEFAULT 0,
                        media_json JSONB NOT NULL DEFAULT '{}'::jsonb,
                        source_type TEXT NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL,
                        original_created_at TIMESTAMPTZ,
                        fetched_at TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (registry, platform, content_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_engagement (
                        platform TEXT NOT NULL,
                        content_id TEXT NOT NULL,
                        usernames JSONB NOT NULL DEFAULT '[]'::jsonb,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        PRIMARY KEY (platform, content_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_comments (
                        platform TEXT NOT NULL,
                        content_id TEXT NOT NULL,
                        comment_id TEXT NOT NULL,
                        username TEXT,
                        body TEXT,
                        commented_at TIMESTAMPTZ,
                        PRIMARY KEY (platform, content_id, comment_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_audits (
                        id UUID PRIMARY KEY,
                        platform TEXT NOT NULL,
                        content_id TEXT NOT NULL,
                        usernames JSONB NOT NULL,
                        window_start TIMESTAMPTZ NOT NULL,
                        window_end TIMESTAMPTZ NOT NULL,
                        captured_at TIMESTAMPTZ NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_exclusions (
                        client_id TEXT NOT NULL,
                        platform TEXT NOT NULL,
                        content_id TEXT NOT NULL,
                        source_link TEXT,
                        PRIMARY KEY (client_id, platform, content_id)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_exception_users (
                        username TEXT PRIMARY KEY
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_clients (
                        client_id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        directorate TEXT,
                        instagram_handle TEXT,
                        tiktok_handle TEXT,
                        active BOOLEAN NOT NULL DEFAULT TRUE,
                        daily_sync_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                        personnel_count BIGINT NOT NULL DEFAULT 0
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS sera_roster (
                        user_id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        client_id TEXT NOT NULL,
                        instagram_username TEXT,
                        tiktok_username TEXT
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    fn registry_key(registry: Registry) -> &'static str {
        match registry {
            Registry::Primary => "primary",
            Registry::SpecialAssignment => "special_assignment",
        }
    }

    fn row_to_post(row: &sqlx::postgres::PgRow) -> Result<PostRecord, StoreError> {
        let platform_raw: String = row.try_get("platform")?;
        let platform = Platform::parse(&platform_raw).unwrap_or(Platform::Instagram);
        let source_raw: String = row.try_get("source_type")?;
        let media_json: serde_json::Value = row.try_get("media_json")?;
        let media: PostMedia = serde_json::from_value(media_json)?;
        Ok(PostRecord {
            client_id: row.try_get("client_id")?,
            key: PostKey::new(platform, row.try_get::<String, _>("content_id")?),
            caption: row.try_get("caption")?,
            comment_count: row.try_get("comment_count")?,
            like_count: row.try_get("like_count")?,
            media,
            source_type: SourceType::parse_loose(&source_raw),
            created_at: row.try_get("created_at")?,
            original_created_at: row.try_get("original_created_at")?,
            fetched_at: row.try_get("fetched_at")?,
        })
    }

    fn row_to_client(row: &sqlx::postgres::PgRow) -> Result<ClientRecord, StoreError> {
        Ok(ClientRecord {
            client_id: row.try_get("client_id")?,
            name: row.try_get("name")?,
            directorate: row.try_get("directorate")?,
            instagram_handle: row.try_get("instagram_handle")?,
            tiktok_handle: row.try_get("tiktok_handle")?,
            active: row.try_get("active")?,
            daily_sync_enabled: row.try_get("daily_sync_enabled")?,
            personnel_count: row.try_get("personnel_count")?,
        })
    }
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn upsert_post(
        &self,
        registry: Registry,
        incoming: &PostUpsert,
    ) -> Result<PostRecord, StoreError> {
        self.ensure_schema().await?;
        // Single statement mirroring resolve_post_upsert: manual marker is
        // sticky, original_created_at keeps first non-null, fetched_at only
        // moves forward, descriptive fields take the incoming value.
        let row = sqlx::query(
            r#"
            INSERT INTO sera_posts
                (registry, platform, content_id, client_id, caption,
                 comment_count, like_count, media_json, source_type,
                 created_at, original_created_at, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                    COALESCE($10, NOW()), $11, COALESCE($12, NOW()))
            ON CONFLICT (registry, platform, content_id) DO UPDATE SET
                client_id = EXCLUDED.client_id,
                caption = EXCLUDED.caption,
                comment_count = EXCLUDED.comment_count,
                like_count = EXCLUDED.like_count,
                media_json = EXCLUDED.media_json,
                source_type = CASE
                    WHEN sera_posts.source_type = 'manual_input' THEN sera_posts.source_type
                    ELSE EXCLUDED.source_type
                END,
                created_at = CASE
                    WHEN sera_posts.source_type = 'manual_input' THEN sera_posts.created_at
                    ELSE EXCLUDED.created_at
                END,
                original_created_at = COALESCE(sera_posts.original_created_at,
                                               EXCLUDED.original_created_at),
                fetched_at = GREATEST(sera_posts.fetched_at, EXCLUDED.fetched_at)
            RETURNING platform, content_id, client_id, caption, comment_count,
                      like_count, media_json, source_type, created_at,
                      original_created_at, fetched_at
            "#,
        )
        .bind(Self::registry_key(registry))
        .bind(incoming.key.platform.as_str())
        .bind(&incoming.key.content_id)
        .bind(&incoming.client_id)
        .bind(&incoming.caption)
        .bind(incoming.comment_count)
        .bind(incoming.like_count)
        .bind(serde_json::to_value(&incoming.media)?)
        .bind(incoming.source_type.as_str())
        .bind(incoming.created_at)
        .bind(incoming.original_created_at)
        .bind(incoming.fetched_at)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_post(&row)
    }

    async fn find_post(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<Option<PostRecord>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT platform, content_id, client_id, caption, comment_count,
                   like_count, media_json, source_type, created_at,
                   original_created_at, fetched_at
              FROM sera_posts
             WHERE registry = $1 AND platform = $2 AND content_id = $3
            "#,
        )
        .bind(Self::registry_key(registry))
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_post).transpose()
    }

    async fn special_assignment_owner(&self, key: &PostKey) -> Result<Option<String>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT client_id FROM sera_posts
             WHERE registry = 'special_assignment'
               AND platform = $1 AND content_id = $2
            "#,
        )
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("client_id")).transpose()?)
    }

    async fn posts_on_day(
        &self,
        registry: Registry,
        client_id: &str,
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError> {
        self.posts_for_clients_on_day(registry, &[client_id.to_string()], platform, day)
            .await
    }

    async fn posts_for_clients_on_day(
        &self,
        registry: Registry,
        client_ids: &[String],
        platform: Platform,
        day: NaiveDate,
    ) -> Result<Vec<PostRecord>, StoreError> {
        self.ensure_schema().await?;
        let (start, end) = day_bounds_utc(day);
        let rows = sqlx::query(
            r#"
            SELECT platform, content_id, client_id, caption, comment_count,
                   like_count, media_json, source_type, created_at,
                   original_created_at, fetched_at
              FROM sera_posts
             WHERE registry = $1 AND platform = $2
               AND client_id = ANY($3)
               AND created_at >= $4 AND created_at < $5
             ORDER BY created_at
            "#,
        )
        .bind(Self::registry_key(registry))
        .bind(platform.as_str())
        .bind(client_ids)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_post).collect()
    }

    async fn delete_post_cascade(
        &self,
        registry: Registry,
        key: &PostKey,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM sera_audits WHERE platform = $1 AND content_id = $2")
            .bind(key.platform.as_str())
            .bind(&key.content_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sera_engagement WHERE platform = $1 AND content_id = $2")
            .bind(key.platform.as_str())
            .bind(&key.content_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sera_comments WHERE platform = $1 AND content_id = $2")
            .bind(key.platform.as_str())
            .bind(&key.content_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM sera_posts WHERE registry = $1 AND platform = $2 AND content_id = $3",
        )
        .bind(Self::registry_key(registry))
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .execute(&self.pool)
        .await?;
        debug!(%key, ?registry, "post deleted with cascade");
        Ok(())
    }

    async fn engagement_set(&self, key: &PostKey) -> Result<BTreeSet<String>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT usernames FROM sera_engagement WHERE platform = $1 AND content_id = $2",
        )
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("usernames")?;
                Ok(serde_json::from_value(value)?)
            }
            None => Ok(BTreeSet::new()),
        }
    }

    async fn replace_engagement_set(
        &self,
        key: &PostKey,
        usernames: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO sera_engagement (platform, content_id, usernames, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (platform, content_id) DO UPDATE SET
                usernames = EXCLUDED.usernames,
                updated_at = NOW()
            "#,
        )
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .bind(serde_json::to_value(usernames)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_comments(
        &self,
        key: &PostKey,
        comments: &[StoredComment],
    ) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        for comment in comments {
            sqlx::query(
                r#"
                INSERT INTO sera_comments
                    (platform, content_id, comment_id, username, body, commented_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (platform, content_id, comment_id) DO UPDATE SET
                    username = EXCLUDED.username,
                    body = EXCLUDED.body,
                    commented_at = EXCLUDED.commented_at
                "#,
            )
            .bind(key.platform.as_str())
            .bind(&key.content_id)
            .bind(&comment.comment_id)
            .bind(&comment.username)
            .bind(&comment.text)
            .bind(comment.commented_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn append_audit(&self, snapshot: &AuditSnapshot) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO sera_audits
                (id, platform, content_id, usernames, window_start, window_end, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.key.platform.as_str())
        .bind(&snapshot.key.content_id)
        .bind(serde_json::to_value(&snapshot.usernames)?)
        .bind(snapshot.window.start)
        .bind(snapshot.window.end)
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_in_window(
        &self,
        key: &PostKey,
        window: &SnapshotWindow,
    ) -> Result<Option<AuditSnapshot>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT id, usernames, window_start, window_end, captured_at
              FROM sera_audits
             WHERE platform = $1 AND content_id = $2
               AND captured_at >= $3 AND captured_at <= $4
             ORDER BY captured_at DESC
             LIMIT 1
            "#,
        )
        .bind(key.platform.as_str())
        .bind(&key.content_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let id: Uuid = row.try_get("id")?;
                let usernames: serde_json::Value = row.try_get("usernames")?;
                Ok(Some(AuditSnapshot {
                    id,
                    key: key.clone(),
                    usernames: serde_json::from_value(usernames)?,
                    window: SnapshotWindow {
                        start: row.try_get("window_start")?,
                        end: row.try_get("window_end")?,
                    },
                    captured_at: row.try_get("captured_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn add_exclusion(&self, exclusion: &TaskPostExclusion) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO sera_exclusions (client_id, platform, content_id, source_link)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (client_id, platform, content_id) DO UPDATE SET
                source_link = COALESCE(EXCLUDED.source_link, sera_exclusions.source_link)
            "#,
        )
        .bind(&exclusion.client_id)
        .bind(exclusion.platform.as_str())
        .bind(&exclusion.content_id)
        .bind(&exclusion.source_link)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn exclusion_set(
        &self,
        client_id: &str,
        platform: Platform,
    ) -> Result<BTreeSet<String>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT content_id FROM sera_exclusions WHERE client_id = $1 AND platform = $2",
        )
        .bind(client_id)
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(r.try_get::<String, _>("content_id")?))
            .collect()
    }

    async fn exception_usernames(&self) -> Result<BTreeSet<String>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT username FROM sera_exception_users")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok(r.try_get::<String, _>("username")?))
            .collect()
    }

    async fn client(&self, client_id: &str) -> Result<Option<ClientRecord>, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            r#"
            SELECT client_id, name, directorate, instagram_handle, tiktok_handle,
                   active, daily_sync_enabled, personnel_count
              FROM sera_clients
             WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_client).transpose()
    }

    async fn eligible_clients(&self, platform: Platform) -> Result<Vec<ClientRecord>, StoreError> {
        self.ensure_schema().await?;
        let handle_column = match platform {
            Platform::Instagram => "instagram_handle",
            Platform::Tiktok => "tiktok_handle",
        };
        let query = format!(
            r#"
            SELECT client_id, name, directorate, instagram_handle, tiktok_handle,
                   active, daily_sync_enabled, personnel_count
              FROM sera_clients
             WHERE active AND daily_sync_enabled
               AND {handle_column} IS NOT NULL AND {handle_column} <> ''
             ORDER BY client_id
            "#
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_client).collect()
    }

    async fn clients_in_directorate(
        &self,
        directorate: &str,
    ) -> Result<Vec<ClientRecord>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT client_id, name, directorate, instagram_handle, tiktok_handle,
                   active, daily_sync_enabled, personnel_count
              FROM sera_clients
             WHERE directorate = $1
             ORDER BY client_id
            "#,
        )
        .bind(directorate)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_client).collect()
    }

    async fn roster_for_clients(
        &self,
        client_ids: &[String],
    ) -> Result<Vec<RosterUser>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT user_id, name, client_id, instagram_username, tiktok_username
              FROM sera_roster
             WHERE client_id = ANY($1)
             ORDER BY user_id
            "#,
        )
        .bind(client_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RosterUser {
                    user_id: row.try_get("user_id")?,
                    name: row.try_get("name")?,
                    client_id: row.try_get("client_id")?,
                    instagram_username: row.try_get("instagram_username")?,
                    tiktok_username: row.try_get("tiktok_username")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(content_id: &str) -> PostKey {
        PostKey::new(Platform::Instagram, content_id)
    }

    fn upsert(content_id: &str, client: &str, source: SourceType) -> PostUpsert {
        PostUpsert {
            client_id: client.to_string(),
            key: key(content_id),
            caption: Some("apel pagi".into()),
            comment_count: 2,
            like_count: 10,
            media: PostMedia::default(),
            source_type: source,
            created_at: Some(Utc.with_ymd_and_hms(2026, 3, 10, 4, 0, 0).unwrap()),
            original_created_at: None,
            fetched_at: Some(Utc.with_ymd_and_hms(2026, 3, 10, 5, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn manual_marker_survives_cron_upsert_through_store() {
        let store = MemoryStore::new();
        store
            .upsert_post(Registry::Primary, &upsert("ABC", "sat-1", SourceType::ManualInput))
            .await
            .expect("manual upsert");

        let mut cron = upsert("ABC", "sat-1", SourceType::CronFetch);
        cron.created_at = Some(Utc.with_ymd_and_hms(2026, 3, 11, 4, 0, 0).unwrap());
        let stored = store
            .upsert_post(Registry::Primary, &cron)
            .await
            .expect("cron upsert");

        assert_eq!(stored.source_type, SourceType::ManualInput);
        assert_eq!(
            stored.created_at,
            Utc.with_ymd_and_hms(2026, 3, 10, 4, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn exclusion_upsert_preserves_source_link() {
        let store = MemoryStore::new();
        store
            .add_exclusion(&TaskPostExclusion {
                client_id: "sat-1".into(),
                platform: Platform::Instagram,
                content_id: "ABC".into(),
                source_link: Some("https://instagram.com/p/ABC".into()),
            })
            .await
            .expect("first write");
        store
            .add_exclusion(&TaskPostExclusion {
                client_id: "sat-1".into(),
                platform: Platform::Instagram,
                content_id: "ABC".into(),
                source_link: None,
            })
            .await
            .expect("second write");

        let inner = store.inner.read().await;
        let stored = inner
            .exclusions
            .get(&("sat-1".to_string(), Platform::Instagram))
            .and_then(|t| t.get("ABC"))
            .expect("row present");
        assert_eq!(
            stored.source_link.as_deref(),
            Some("https://instagram.com/p/ABC")
        );
    }

    #[tokio::test]
    async fn cascade_delete_removes_dependents_first_class() {
        let store = MemoryStore::new();
        let k = key("ABC");
        store
            .upsert_post(Registry::Primary, &upsert("ABC", "sat-1", SourceType::CronFetch))
            .await
            .expect("upsert");
        store
            .replace_engagement_set(&k, &BTreeSet::from(["budi".to_string()]))
            .await
            .expect("engagement");
        store
            .append_audit(&AuditSnapshot::new(
                k.clone(),
                BTreeSet::from(["budi".to_string()]),
                SnapshotWindow::resolve(None, None, Utc::now()),
                Utc::now(),
            ))
            .await
            .expect("audit");

        store
            .delete_post_cascade(Registry::Primary, &k)
            .await
            .expect("delete");

        assert!(store
            .find_post(Registry::Primary, &k)
            .await
            .expect("find")
            .is_none());
        assert!(store.engagement_set(&k).await.expect("set").is_empty());
        assert_eq!(store.audit_count().await, 0);
    }

    #[tokio::test]
    async fn audit_window_read_picks_latest_inside_window() {
        let store = MemoryStore::new();
        let k = key("ABC");
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let window = SnapshotWindow {
            start: base,
            end: base + Duration::minutes(30),
        };
        for (minutes, user) in [(5, "ani"), (20, "budi"), (45, "late")] {
            let captured = base + Duration::minutes(minutes);
            store
                .append_audit(&AuditSnapshot::new(
                    k.clone(),
                    BTreeSet::from([user.to_string()]),
                    window,
                    captured,
                ))
                .await
                .expect("audit");
        }

        let found = store
            .audit_in_window(&k, &window)
            .await
            .expect("read")
            .expect("snapshot inside window");
        assert!(found.usernames.contains("budi"));
    }

    #[tokio::test]
    async fn eligibility_requires_active_flag_and_handle() {
        let store = MemoryStore::new();
        let base = ClientRecord {
            client_id: "sat-1".into(),
            name: "Satker Satu".into(),
            directorate: Some("dit-a".into()),
            instagram_handle: Some("satker.satu".into()),
            tiktok_handle: None,
            active: true,
            daily_sync_enabled: true,
            personnel_count: 120,
        };
        store.seed_client(base.clone()).await;
        store
            .seed_client(ClientRecord {
                client_id: "sat-2".into(),
                active: false,
                ..base.clone()
            })
            .await;
        store
            .seed_client(ClientRecord {
                client_id: "sat-3".into(),
                instagram_handle: None,
                ..base.clone()
            })
            .await;

        let eligible = store
            .eligible_clients(Platform::Instagram)
            .await
            .expect("clients");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].client_id, "sat-1");
        assert!(store
            .eligible_clients(Platform::Tiktok)
            .await
            .expect("clients")
            .is_empty());
    }

    #[tokio::test]
    async fn day_bounds_follow_regional_offset() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let (start, end) = day_bounds_utc(day);
        // Regional midnight is 17:00 UTC the previous evening.
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 17, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 2, 17, 0, 0).unwrap());

        let store = MemoryStore::new();
        let mut post = upsert("LATE", "sat-1", SourceType::CronFetch);
        post.created_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 23, 30, 0).unwrap());
        store
            .upsert_post(Registry::Primary, &post)
            .await
            .expect("upsert");

        let on_second = store
            .posts_on_day(Registry::Primary, "sat-1", Platform::Instagram, day)
            .await
            .expect("query");
        assert_eq!(on_second.len(), 1);
        let on_first = store
            .posts_on_day(
                Registry::Primary,
                "sat-1",
                Platform::Instagram,
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            )
            .await
            .expect("query");
        assert!(on_first.is_empty());
    }

    #[tokio::test]
    async fn failing_audit_writes_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.set_audit_writes_failing(true).await;
        let err = store
            .append_audit(&AuditSnapshot::new(
                key("ABC"),
                BTreeSet::new(),
                SnapshotWindow::resolve(None, None, Utc::now()),
                Utc::now(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
