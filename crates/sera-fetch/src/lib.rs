//! Bounded-concurrency, retrying client for paginated engagement APIs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use sera_core::Platform;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub mod decode;

pub use decode::{CommentItem, Cursor, LikersPage, PostPayload};

pub const CRATE_NAME: &str = "sera-fetch";

/// Consecutive pages without a single extractable username before the
/// pagination loop assumes the upstream is serving stale/looping pages.
pub const MAX_EMPTY_USERNAME_PAGES: usize = 4;

const DEFAULT_COMMENT_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network resets, timeouts, 5xx: retried up to the backoff bound.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// 4xx or otherwise non-retryable: fails the item immediately.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
    /// Structurally unusable payload; never retried.
    #[error("undecodable upstream payload: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// One page of cursor-paginated comments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentsPage {
    pub items: Vec<CommentItem>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    pub total: Option<u64>,
}

/// Per-page progress event, emitted for observability; carries no storage
/// side effects.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: &'static str,
    pub page: usize,
    pub fetched: usize,
    pub running_total: usize,
}

pub type ProgressFn = dyn Fn(&ProgressEvent) + Send + Sync;

/// Abstract upstream engagement API. Implementations own payload decoding
/// and single-page fetches; the fetcher owns retry, concurrency bounds and
/// the pagination loops.
#[async_trait]
pub trait EngagementApi: Send + Sync {
    async fn list_posts(&self, handle: &str, limit: usize) -> Result<Vec<PostPayload>, FetchError>;

    async fn post_detail(
        &self,
        platform: Platform,
        content_id: &str,
    ) -> Result<PostPayload, FetchError>;

    /// One page of usernames that liked the content.
    async fn likers_page(
        &self,
        content_id: &str,
        cursor: Option<String>,
    ) -> Result<LikersPage, FetchError>;

    async fn comments_page(
        &self,
        content_id: &str,
        cursor: Cursor,
        count: usize,
    ) -> Result<CommentsPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Simultaneous in-flight upstream operations (small fixed pool).
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Delay between successive comment pages of one content id.
    pub page_delay: Duration,
    pub max_comment_pages: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            backoff: BackoffPolicy::default(),
            page_delay: Duration::from_millis(2000),
            max_comment_pages: 10,
        }
    }
}

pub struct RateLimitedFetcher {
    api: Arc<dyn EngagementApi>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    page_delay: Duration,
    max_comment_pages: usize,
}

impl RateLimitedFetcher {
    pub fn new(api: Arc<dyn EngagementApi>, config: FetcherConfig) -> Self {
        Self {
            api,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
            page_delay: config.page_delay,
            max_comment_pages: config.max_comment_pages.max(1),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                    let wait = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, wait_ms = wait.as_millis() as u64, %err, "retrying transient fetch failure");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn list_posts(
        &self,
        handle: &str,
        limit: usize,
    ) -> Result<Vec<PostPayload>, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("list_posts", handle, limit);
        self.with_retry(|| self.api.list_posts(handle, limit))
            .instrument(span)
            .await
    }

    pub async fn post_detail(
        &self,
        platform: Platform,
        content_id: &str,
    ) -> Result<PostPayload, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("post_detail", %platform, content_id);
        self.with_retry(|| self.api.post_detail(platform, content_id))
            .instrument(span)
            .await
    }

    pub async fn list_likes(&self, content_id: &str) -> Result<Vec<String>, FetchError> {
        self.collect_likers(content_id, None).await
    }

    /// Drive the cursor-paginated likers endpoint to exhaustion.
    ///
    /// Termination mirrors [`collect_comments`]: an empty page, a missing
    /// cursor, or a repeating cursor (cycle guard) stop the loop.
    pub async fn collect_likers(
        &self,
        content_id: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<String>, FetchError> {
        let mut usernames = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();
        let mut page_no = 0usize;

        loop {
            page_no += 1;
            let page = {
                let _permit = self.limit.acquire().await.expect("semaphore not closed");
                let span = info_span!("likers_page", content_id, page = page_no);
                let cursor_ref = &cursor;
                self.with_retry(|| self.api.likers_page(content_id, cursor_ref.clone()))
                    .instrument(span)
                    .await?
            };

            if let Some(progress) = progress {
                progress(&ProgressEvent {
                    stage: "likers",
                    page: page_no,
                    fetched: page.usernames.len(),
                    running_total: usernames.len() + page.usernames.len(),
                });
            }
            debug!(
                content_id,
                page = page_no,
                fetched = page.usernames.len(),
                running_total = usernames.len() + page.usernames.len(),
                "likers page fetched"
            );

            if page.usernames.is_empty() {
                break;
            }
            usernames.extend(page.usernames);

            let Some(next) = page.next_cursor else { break };
            if !seen_cursors.insert(next.clone()) {
                warn!(content_id, cursor = %next, "stopping likers pagination: cursor cycle detected");
                break;
            }
            cursor = Some(next);
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(usernames)
    }

    /// Drive the cursor-paginated comments endpoint to exhaustion.
    ///
    /// Termination: upstream signals no more pages, the cursor goes missing,
    /// a cursor repeats (cycle guard), the page bound is hit, or
    /// [`MAX_EMPTY_USERNAME_PAGES`] consecutive pages yield zero extractable
    /// usernames (stale-pagination guard).
    pub async fn collect_comments(
        &self,
        content_id: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<CommentItem>, FetchError> {
        let mut all = Vec::new();
        let mut cursor = Cursor::Offset(0);
        let mut seen_cursors: HashSet<String> = HashSet::from([cursor.cache_key()]);
        let mut empty_username_pages = 0usize;

        for page_no in 1..=self.max_comment_pages {
            let page = {
                let _permit = self.limit.acquire().await.expect("semaphore not closed");
                let cursor_ref = &cursor;
                self.with_retry(|| {
                    self.api
                        .comments_page(content_id, cursor_ref.clone(), DEFAULT_COMMENT_PAGE_SIZE)
                })
                .await?
            };

            if let Some(progress) = progress {
                progress(&ProgressEvent {
                    stage: "comments",
                    page: page_no,
                    fetched: page.items.len(),
                    running_total: all.len() + page.items.len(),
                });
            }
            debug!(
                content_id,
                page = page_no,
                fetched = page.items.len(),
                running_total = all.len() + page.items.len(),
                "comments page fetched"
            );

            if page.items.is_empty() {
                break;
            }

            let has_username = page.items.iter().any(|c| c.username.is_some());
            if has_username {
                empty_username_pages = 0;
            } else {
                empty_username_pages += 1;
                if empty_username_pages >= MAX_EMPTY_USERNAME_PAGES {
                    warn!(content_id, pages = empty_username_pages, "stopping comments pagination: repeated username-less pages");
                    break;
                }
            }

            all.extend(page.items);

            let Some(next) = page.next_cursor else { break };
            if !page.has_more {
                break;
            }
            if !seen_cursors.insert(next.cache_key()) {
                warn!(content_id, cursor = %next, "stopping comments pagination: cursor cycle detected");
                break;
            }
            cursor = next;
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(all)
    }
}

#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub host: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// RapidAPI-style gateway implementation of [`EngagementApi`].
pub struct HttpEngagementApi {
    client: reqwest::Client,
    host: String,
    api_key: String,
}

impl HttpEngagementApi {
    pub fn new(config: HttpApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            host: config.host,
            api_key: config.api_key,
        })
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let url = format!("https://{}/{}", self.host, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .header("X-RapidAPI-Key", &self.api_key)
            .header("X-RapidAPI-Host", &self.host)
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => FetchError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => FetchError::Permanent(err.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("http {status} for {path}: {body}");
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => FetchError::Transient(message),
                RetryDisposition::NonRetryable => FetchError::Permanent(message),
            });
        }

        response
            .json::<JsonValue>()
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))
    }
}

#[async_trait]
impl EngagementApi for HttpEngagementApi {
    async fn list_posts(&self, handle: &str, limit: usize) -> Result<Vec<PostPayload>, FetchError> {
        let handle = handle.trim_start_matches('@').to_string();
        let body = self
            .get_json(
                "api/user/posts",
                &[
                    ("uniqueId", handle.clone()),
                    ("username", handle),
                    ("count", limit.max(1).to_string()),
                    ("cursor", "0".to_string()),
                ],
            )
            .await?;
        let mut posts = decode::decode_posts(&body);
        posts.truncate(limit.max(1));
        Ok(posts)
    }

    async fn post_detail(
        &self,
        platform: Platform,
        content_id: &str,
    ) -> Result<PostPayload, FetchError> {
        let (path, param) = match platform {
            Platform::Instagram => ("api/post/info", "shortcode"),
            Platform::Tiktok => ("api/post/detail", "videoId"),
        };
        let body = self
            .get_json(path, &[(param, content_id.to_string())])
            .await?;
        decode::decode_post_detail(&body).ok_or_else(|| {
            FetchError::Decode(format!("no structurally valid post object for {content_id}"))
        })
    }

    async fn likers_page(
        &self,
        content_id: &str,
        cursor: Option<String>,
    ) -> Result<LikersPage, FetchError> {
        let mut params = vec![
            ("shortcode", content_id.to_string()),
            ("count", DEFAULT_COMMENT_PAGE_SIZE.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor));
        }
        let body = self.get_json("api/post/likers", &params).await?;
        Ok(decode::decode_likers(&body))
    }

    async fn comments_page(
        &self,
        content_id: &str,
        cursor: Cursor,
        count: usize,
    ) -> Result<CommentsPage, FetchError> {
        let body = self
            .get_json(
                "api/post/comments",
                &[
                    ("videoId", content_id.to_string()),
                    ("count", count.to_string()),
                    ("cursor", cursor.to_string()),
                ],
            )
            .await?;
        Ok(decode::decode_comments_page(&body, &cursor, count as u64))
    }
}
