//! Core domain model and provenance-aware merge rules for SERA.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sera-core";

/// Default snapshot window span when only one bound (or none) is supplied.
pub const DEFAULT_WINDOW_MINUTES: i64 = 30;

/// Regional calendar offset (Asia/Jakarta, fixed UTC+7, no DST).
pub fn regional_offset() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).expect("UTC+7 is a valid offset")
}

/// Calendar day a UTC instant falls on in the regional timezone.
///
/// A post published `2026-01-01T23:30:00Z` belongs to `2026-01-02` regionally;
/// every day-scoped query must go through this single conversion.
pub fn day_key(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&regional_offset()).date_naive()
}

pub fn today(now: DateTime<Utc>) -> NaiveDate {
    day_key(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
}

impl Platform {
    /// Loose parser; anything unrecognized is `None` and must be rejected
    /// before I/O.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "instagram" | "ig" => Some(Self::Instagram),
            "tiktok" | "tt" => Some(Self::Tiktok),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::Tiktok => "tiktok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance tag: automated crawl discovery vs human submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    CronFetch,
    ManualInput,
}

impl SourceType {
    /// Loose parser for values seen in the wild: `manual_fetch`,
    /// `Manual Input`, `manual-input` all collapse to `ManualInput`;
    /// empty or unknown values default to `CronFetch`.
    pub fn parse_loose(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "manual_input" | "manual_fetch" => Self::ManualInput,
            _ => Self::CronFetch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CronFetch => "cron_fetch",
            Self::ManualInput => "manual_input",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post identity: content id is unique per platform (Instagram shortcode,
/// TikTok video id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostKey {
    pub platform: Platform,
    pub content_id: String,
}

impl PostKey {
    pub fn new(platform: Platform, content_id: impl Into<String>) -> Self {
        Self {
            platform,
            content_id: content_id.into(),
        }
    }
}

impl fmt::Display for PostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.content_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMedia {
    pub thumbnail_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub images_url: Option<Vec<String>>,
    pub is_video: bool,
    pub is_carousel: bool,
}

/// Incoming upsert payload for one post, from either acquisition path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostUpsert {
    pub client_id: String,
    pub key: PostKey,
    pub caption: Option<String>,
    pub comment_count: i64,
    pub like_count: i64,
    pub media: PostMedia,
    pub source_type: SourceType,
    /// System-facing timestamp; semantics depend on `source_type` (platform
    /// publish time for crawls, operator upload time for manual input).
    pub created_at: Option<DateTime<Utc>>,
    /// True publish time on the platform, when known.
    pub original_created_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Stored post row after conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub client_id: String,
    pub key: PostKey,
    pub caption: Option<String>,
    pub comment_count: i64,
    pub like_count: i64,
    pub media: PostMedia,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub original_created_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Pure conflict-resolving merge for a post upsert, keyed by content id.
///
/// Precedence rules:
/// - a stored `manual_input` marker is sticky: source type and `created_at`
///   survive any later `cron_fetch` upsert;
/// - an incoming `manual_input` over a crawl row takes the incoming marker
///   and `created_at`;
/// - `original_created_at` keeps the first non-null value ever seen;
/// - `fetched_at` only moves forward (max of stored and incoming, incoming
///   defaulting to `now`);
/// - descriptive fields (caption, counts, media, owning client) always take
///   the incoming value.
///
/// Storage backends must apply this atomically per key: `MemoryStore` calls
/// it under a write lock, `PgStore` expresses the same rules as one
/// `ON CONFLICT DO UPDATE` statement.
pub fn resolve_post_upsert(
    stored: Option<&PostRecord>,
    incoming: &PostUpsert,
    now: DateTime<Utc>,
) -> PostRecord {
    let incoming_fetched_at = incoming.fetched_at.unwrap_or(now);
    let incoming_created_at = incoming.created_at.unwrap_or(now);

    match stored {
        None => PostRecord {
            client_id: incoming.client_id.clone(),
            key: incoming.key.clone(),
            caption: incoming.caption.clone(),
            comment_count: incoming.comment_count,
            like_count: incoming.like_count,
            media: incoming.media.clone(),
            source_type: incoming.source_type,
            created_at: incoming_created_at,
            original_created_at: incoming.original_created_at,
            fetched_at: incoming_fetched_at,
        },
        Some(prev) => {
            let manual_stored = prev.source_type == SourceType::ManualInput;
            let manual_incoming = incoming.source_type == SourceType::ManualInput;

            let (source_type, created_at) = if manual_stored {
                (SourceType::ManualInput, prev.created_at)
            } else if manual_incoming {
                (SourceType::ManualInput, incoming_created_at)
            } else {
                (incoming.source_type, incoming_created_at)
            };

            PostRecord {
                client_id: incoming.client_id.clone(),
                key: incoming.key.clone(),
                caption: incoming.caption.clone(),
                comment_count: incoming.comment_count,
                like_count: incoming.like_count,
                media: incoming.media.clone(),
                source_type,
                created_at,
                original_created_at: prev.original_created_at.or(incoming.original_created_at),
                fetched_at: prev.fetched_at.max(incoming_fetched_at),
            }
        }
    }
}

/// Normalize one engagement username: trim, strip one leading `@`, lowercase.
/// Returns `None` for values that are empty after normalization.
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Union-only engagement merge: existing ∪ fresh ∪ exception allowlist,
/// every input normalized. The result is a superset of `existing`.
pub fn merge_usernames<'a, I, J, K>(existing: I, fresh: J, exceptions: K) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
    K: IntoIterator<Item = &'a str>,
{
    existing
        .into_iter()
        .chain(fresh)
        .chain(exceptions)
        .filter_map(normalize_username)
        .collect()
}

/// Bounded time interval an engagement audit record claims validity over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SnapshotWindow {
    /// Resolve a possibly-partial window: a missing bound is derived at the
    /// default offset from the given one; with neither bound the window is
    /// `[now - 30min, now]`.
    pub fn resolve(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let span = Duration::minutes(DEFAULT_WINDOW_MINUTES);
        match (start, end) {
            (Some(start), Some(end)) => Self { start, end },
            (Some(start), None) => Self {
                start,
                end: start + span,
            },
            (None, Some(end)) => Self {
                start: end - span,
                end,
            },
            (None, None) => Self {
                start: now - span,
                end: now,
            },
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Immutable time-windowed engagement capture. Append-only; reporting reads
/// these to answer "who had engaged as of the window" without being affected
/// by later fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub id: Uuid,
    pub key: PostKey,
    pub usernames: BTreeSet<String>,
    pub window: SnapshotWindow,
    pub captured_at: DateTime<Utc>,
}

impl AuditSnapshot {
    pub fn new(
        key: PostKey,
        usernames: BTreeSet<String>,
        window: SnapshotWindow,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            usernames,
            window,
            captured_at,
        }
    }
}

/// Which of the two parallel post registries a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    /// Auto-discovered posts plus every manual upload merged in.
    Primary,
    /// Manual-only "special assignment" posts, scoped to one client.
    SpecialAssignment,
}

/// Per-client per-platform opt-out marker for a content id manually removed
/// from task scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPostExclusion {
    pub client_id: String,
    pub platform: Platform,
    pub content_id: String,
    pub source_link: Option<String>,
}

/// Merge the official registry with the special-assignment registry for one
/// day's task view. An official row wins over a manual row sharing its
/// content id; within a registry the first occurrence wins.
pub fn dedup_registries(official: Vec<PostRecord>, manual: Vec<PostRecord>) -> Vec<PostRecord> {
    let mut seen: BTreeSet<PostKey> = BTreeSet::new();
    let mut merged = Vec::with_capacity(official.len() + manual.len());
    for post in official {
        if seen.insert(post.key.clone()) {
            merged.push(post);
        }
    }
    for post in manual {
        if seen.insert(post.key.clone()) {
            merged.push(post);
        }
    }
    merged
}

/// Extract a content id from a share link or a bare id.
///
/// Instagram accepts `/p/`, `/reel/` and `/tv/` paths or a bare shortcode;
/// TikTok accepts `/video/<id>` links or a bare numeric id.
pub fn extract_content_id(platform: Platform, link_or_code: &str) -> Option<String> {
    let input = link_or_code.trim();
    if input.is_empty() {
        return None;
    }

    match platform {
        Platform::Instagram => {
            if let Some(rest) = input.split_once("instagram.com/").map(|(_, r)| r) {
                let mut segments = rest.split('/').filter(|s| !s.is_empty());
                while let Some(segment) = segments.next() {
                    if matches!(segment, "p" | "reel" | "tv") {
                        let code = segments.next()?;
                        let code: String = code
                            .chars()
                            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                            .collect();
                        return (!code.is_empty()).then_some(code);
                    }
                }
                return None;
            }
            let bare = input
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            (bare && !input.contains('/')).then(|| input.to_string())
        }
        Platform::Tiktok => {
            if let Some(idx) = input.find("/video/") {
                let id: String = input[idx + "/video/".len()..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                return (!id.is_empty()).then_some(id);
            }
            let numeric = !input.is_empty() && input.chars().all(|c| c.is_ascii_digit());
            numeric.then(|| input.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn upsert(source_type: SourceType) -> PostUpsert {
        PostUpsert {
            client_id: "POLRES_A".into(),
            key: PostKey::new(Platform::Instagram, "abc123"),
            caption: Some("caption".into()),
            comment_count: 4,
            like_count: 88,
            media: PostMedia::default(),
            source_type,
            created_at: None,
            original_created_at: None,
            fetched_at: None,
        }
    }

    #[test]
    fn source_type_parses_loose_variants() {
        assert_eq!(SourceType::parse_loose("manual_fetch"), SourceType::ManualInput);
        assert_eq!(SourceType::parse_loose("Manual Input"), SourceType::ManualInput);
        assert_eq!(SourceType::parse_loose("manual-input"), SourceType::ManualInput);
        assert_eq!(SourceType::parse_loose(""), SourceType::CronFetch);
        assert_eq!(SourceType::parse_loose("cron_fetch"), SourceType::CronFetch);
        assert_eq!(SourceType::parse_loose("mystery"), SourceType::CronFetch);
    }

    #[test]
    fn manual_marker_is_sticky_across_cron_upserts() {
        let now = ts("2026-01-10T08:00:00Z");
        let later = ts("2026-01-10T09:00:00Z");

        let mut manual = upsert(SourceType::ManualInput);
        manual.created_at = Some(now);
        let stored = resolve_post_upsert(None, &manual, now);
        assert_eq!(stored.source_type, SourceType::ManualInput);

        let mut cron = upsert(SourceType::CronFetch);
        cron.created_at = Some(later);
        cron.caption = Some("fresher caption".into());
        let merged = resolve_post_upsert(Some(&stored), &cron, later);

        assert_eq!(merged.source_type, SourceType::ManualInput);
        assert_eq!(merged.created_at, now, "manual created_at survives");
        assert_eq!(merged.caption.as_deref(), Some("fresher caption"));
    }

    #[test]
    fn manual_incoming_overrides_cron_stored() {
        let t0 = ts("2026-01-10T08:00:00Z");
        let t1 = ts("2026-01-10T09:00:00Z");

        let mut cron = upsert(SourceType::CronFetch);
        cron.created_at = Some(t0);
        let stored = resolve_post_upsert(None, &cron, t0);

        let mut manual = upsert(SourceType::ManualInput);
        manual.created_at = Some(t1);
        let merged = resolve_post_upsert(Some(&stored), &manual, t1);

        assert_eq!(merged.source_type, SourceType::ManualInput);
        assert_eq!(merged.created_at, t1);
    }

    #[test]
    fn original_created_at_never_nulled_once_set() {
        let t0 = ts("2026-01-10T08:00:00Z");
        let publish = ts("2026-01-09T22:15:00Z");

        let mut first = upsert(SourceType::CronFetch);
        first.original_created_at = Some(publish);
        let stored = resolve_post_upsert(None, &first, t0);
        assert_eq!(stored.original_created_at, Some(publish));

        let second = upsert(SourceType::CronFetch);
        let merged = resolve_post_upsert(Some(&stored), &second, t0);
        assert_eq!(merged.original_created_at, Some(publish));
    }

    #[test]
    fn fetched_at_is_monotonic_max() {
        let t0 = ts("2026-01-10T08:00:00Z");
        let t1 = ts("2026-01-10T09:00:00Z");

        let mut newer = upsert(SourceType::CronFetch);
        newer.fetched_at = Some(t1);
        let stored = resolve_post_upsert(None, &newer, t1);

        let mut older = upsert(SourceType::CronFetch);
        older.fetched_at = Some(t0);
        let merged = resolve_post_upsert(Some(&stored), &older, t0);
        assert_eq!(merged.fetched_at, t1, "fetched_at never moves backwards");
    }

    #[test]
    fn fetched_at_defaults_to_now_when_omitted() {
        let now = ts("2026-01-10T08:00:00Z");
        let stored = resolve_post_upsert(None, &upsert(SourceType::CronFetch), now);
        assert_eq!(stored.fetched_at, now);
    }

    #[test]
    fn username_normalization() {
        assert_eq!(normalize_username("  @Budi_01 "), Some("budi_01".into()));
        assert_eq!(normalize_username("SIPIL"), Some("sipil".into()));
        assert_eq!(normalize_username("@"), None);
        assert_eq!(normalize_username("   "), None);
        // Only one marker comes off; further `@` are part of the handle.
        assert_eq!(normalize_username("@@budi"), Some("@budi".into()));
    }

    #[test]
    fn merge_is_union_and_idempotent() {
        let first = merge_usernames(["ani"], ["@Budi", "ani", ""], ["ops_account"]);
        assert_eq!(
            first.iter().cloned().collect::<Vec<_>>(),
            vec!["ani", "budi", "ops_account"]
        );

        let existing: Vec<&str> = first.iter().map(|s| s.as_str()).collect();
        let again = merge_usernames(existing, ["@budi"], ["ops_account"]);
        assert_eq!(again, first, "re-merging the same inputs is a no-op");
    }

    #[test]
    fn day_boundary_shifts_to_regional_calendar() {
        let late_utc = ts("2026-01-01T23:30:00Z");
        assert_eq!(
            day_key(late_utc),
            NaiveDate::from_ymd_opt(2026, 1, 2).unwrap()
        );
        let midday = ts("2026-01-01T05:00:00Z");
        assert_eq!(
            day_key(midday),
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
        );
    }

    #[test]
    fn window_resolution_defaults() {
        let now = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let span = Duration::minutes(DEFAULT_WINDOW_MINUTES);

        let both_missing = SnapshotWindow::resolve(None, None, now);
        assert_eq!(both_missing.end, now);
        assert_eq!(both_missing.start, now - span);

        let start = now - Duration::hours(2);
        let only_start = SnapshotWindow::resolve(Some(start), None, now);
        assert_eq!(only_start.end, start + span);

        let only_end = SnapshotWindow::resolve(None, Some(now), now);
        assert_eq!(only_end.start, now - span);
    }

    #[test]
    fn registry_dedup_prefers_official_rows() {
        let now = ts("2026-01-10T08:00:00Z");
        let mk = |content_id: &str, source_type: SourceType| {
            let mut data = upsert(source_type);
            data.key = PostKey::new(Platform::Instagram, content_id);
            resolve_post_upsert(None, &data, now)
        };

        let official = vec![mk("shared", SourceType::CronFetch), mk("only_official", SourceType::CronFetch)];
        let manual = vec![mk("shared", SourceType::ManualInput), mk("only_manual", SourceType::ManualInput)];

        let merged = dedup_registries(official, manual);
        assert_eq!(merged.len(), 3);
        let shared = merged.iter().find(|p| p.key.content_id == "shared").unwrap();
        assert_eq!(shared.source_type, SourceType::CronFetch, "official wins on overlap");
    }

    #[test]
    fn content_id_extraction() {
        assert_eq!(
            extract_content_id(Platform::Instagram, "https://www.instagram.com/p/abc123/"),
            Some("abc123".into())
        );
        assert_eq!(
            extract_content_id(Platform::Instagram, "https://instagram.com/reel/DEF-4_5?igsh=x"),
            Some("DEF-4_5".into())
        );
        assert_eq!(
            extract_content_id(Platform::Instagram, "abc123"),
            Some("abc123".into())
        );
        assert_eq!(extract_content_id(Platform::Instagram, "https://instagram.com/someuser"), None);
        assert_eq!(
            extract_content_id(Platform::Tiktok, "https://www.tiktok.com/@acct/video/7301?lang=en"),
            Some("7301".into())
        );
        assert_eq!(extract_content_id(Platform::Tiktok, "7301"), Some("7301".into()));
        assert_eq!(extract_content_id(Platform::Tiktok, "not-a-video"), None);
    }
}
