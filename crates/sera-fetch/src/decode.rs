//! Tolerant decoding of upstream JSON envelopes.
//!
//! Gateways disagree on where lists live, what the id field is called and
//! whether pagination flags are booleans or numbers. The decoders here try
//! known candidate shapes instead of failing on the first mismatch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::CommentsPage;

/// Key depth bound for the structural post search. Keeps the walk cheap on
/// adversarially nested payloads.
const DETAIL_SEARCH_MAX_DEPTH: usize = 5;

/// Pagination cursor; some gateways hand back numeric offsets, others opaque
/// tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    Offset(u64),
    Token(String),
}

impl Cursor {
    /// Stable key for cursor-cycle detection.
    pub fn cache_key(&self) -> String {
        match self {
            Cursor::Offset(n) => format!("o:{n}"),
            Cursor::Token(t) => format!("t:{t}"),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Offset(n) => write!(f, "{n}"),
            Cursor::Token(t) => write!(f, "{t}"),
        }
    }
}

/// Post object as decoded from an upstream payload, before snapshot merging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostPayload {
    pub content_id: String,
    /// Unix seconds of the original publication, when present.
    pub taken_at: Option<i64>,
    pub caption: Option<String>,
    pub like_count: u64,
    pub comment_count: u64,
    pub is_video: bool,
    pub is_carousel: bool,
    pub thumbnail_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub images_url: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentItem {
    pub id: String,
    pub username: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LikersPage {
    pub usernames: Vec<String>,
    pub next_cursor: Option<String>,
}

fn get_path<'v>(root: &'v JsonValue, path: &[&str]) -> Option<&'v JsonValue> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

/// Some gateways double-encode: `data` arrives as a JSON string.
fn unwrap_string_encoded(value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::String(raw) => serde_json::from_str(raw).ok(),
        _ => None,
    }
}

fn as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| value.get(k).and_then(as_string))
}

fn as_u64_loose(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn first_u64(value: &JsonValue, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(k).and_then(as_u64_loose))
}

fn as_i64_loose(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn as_bool_loose(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => Some(n.as_i64().unwrap_or(0) != 0),
        JsonValue::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Decode a list-posts envelope. Tries the known list locations in order and
/// takes the first non-empty one.
pub fn decode_posts(body: &JsonValue) -> Vec<PostPayload> {
    let decoded;
    let body = match unwrap_string_encoded(body) {
        Some(inner) => {
            decoded = inner;
            &decoded
        }
        None => body,
    };

    let roots: Vec<&JsonValue> = [
        get_path(body, &["data", "data"]),
        get_path(body, &["data", "result"]),
        body.get("data"),
        Some(body),
    ]
    .into_iter()
    .flatten()
    .collect();

    for root in roots {
        for list_key in ["itemList", "items", "videos", "posts"] {
            if let Some(JsonValue::Array(items)) = root.get(list_key) {
                let posts: Vec<PostPayload> =
                    items.iter().filter_map(normalize_post_item).collect();
                if !posts.is_empty() {
                    return posts;
                }
            }
        }
    }
    Vec::new()
}

/// Decode a single post object from whatever field names the gateway used.
/// Returns `None` when no id-like field exists.
pub fn normalize_post_item(item: &JsonValue) -> Option<PostPayload> {
    let content_id = first_string(item, &["id", "video_id", "aweme_id", "code", "shortcode"])?;

    let stats = item.get("stats").or_else(|| item.get("statsV2"));
    let stat_u64 = |keys: &[&str]| {
        stats
            .and_then(|s| first_u64(s, keys))
            .or_else(|| first_u64(item, keys))
            .unwrap_or(0)
    };

    let caption = first_string(item, &["desc", "caption", "title"]).or_else(|| {
        item.get("caption")
            .and_then(|c| c.get("text"))
            .and_then(as_string)
    });

    let taken_at = ["createTime", "create_time", "taken_at", "taken_at_timestamp"]
        .iter()
        .find_map(|k| item.get(k).and_then(as_i64_loose));

    let video_url = first_string(item, &["video_url", "play_url"]).or_else(|| {
        get_path(item, &["video", "playAddr"])
            .or_else(|| get_path(item, &["video", "play_addr", "url_list"]).and_then(|l| l.get(0)))
            .and_then(as_string)
    });

    let thumbnail_url = first_string(item, &["thumbnail_url", "thumbnail_src", "display_url"])
        .or_else(|| get_path(item, &["video", "cover"]).and_then(as_string))
        .or_else(|| {
            get_path(item, &["image_versions2", "candidates"])
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("url"))
                .and_then(as_string)
        });

    let images_url: Vec<String> = item
        .get("carousel_media")
        .and_then(JsonValue::as_array)
        .map(|media| {
            media
                .iter()
                .filter_map(|m| first_string(m, &["display_url", "image_url", "url"]))
                .collect()
        })
        .unwrap_or_default();

    let is_video = item
        .get("is_video")
        .and_then(as_bool_loose)
        .unwrap_or(video_url.is_some());

    Some(PostPayload {
        content_id,
        taken_at,
        caption,
        like_count: stat_u64(&["diggCount", "digg_count", "like_count", "likes"]),
        comment_count: stat_u64(&["commentCount", "comment_count", "comments"]),
        is_video,
        is_carousel: images_url.len() > 1,
        thumbnail_url: thumbnail_url.clone(),
        image_url: thumbnail_url,
        video_url,
        images_url,
    })
}

/// Find the post object inside a detail envelope. Tries the well-known
/// wrapper keys first, then a bounded depth-first search for anything that
/// looks structurally like a post.
pub fn decode_post_detail(body: &JsonValue) -> Option<PostPayload> {
    let decoded;
    let body = match unwrap_string_encoded(body) {
        Some(inner) => {
            decoded = inner;
            &decoded
        }
        None => body,
    };

    let known: [&[&str]; 7] = [
        &["data", "itemInfo", "itemStruct"],
        &["itemInfo", "itemStruct"],
        &["data", "aweme_detail"],
        &["aweme_detail"],
        &["data", "item"],
        &["data", "post"],
        &["data"],
    ];
    for path in known {
        if let Some(candidate) = get_path(body, path) {
            if looks_like_post(candidate) {
                return normalize_post_item(candidate);
            }
        }
    }

    find_post_like(body, 0).and_then(normalize_post_item)
}

fn looks_like_post(value: &JsonValue) -> bool {
    if !value.is_object() {
        return false;
    }
    let has_id = ["id", "video_id", "aweme_id", "code", "shortcode"]
        .iter()
        .any(|k| value.get(k).is_some());
    let has_body = ["desc", "caption", "stats", "statsV2", "like_count"]
        .iter()
        .any(|k| value.get(k).is_some());
    has_id && has_body
}

fn find_post_like(value: &JsonValue, depth: usize) -> Option<&JsonValue> {
    if depth > DETAIL_SEARCH_MAX_DEPTH {
        return None;
    }
    if looks_like_post(value) {
        return Some(value);
    }
    match value {
        JsonValue::Object(map) => map
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "status_code" | "message" | "msg" | "extra"))
            .find_map(|(_, child)| find_post_like(child, depth + 1)),
        JsonValue::Array(items) => items.iter().find_map(|i| find_post_like(i, depth + 1)),
        _ => None,
    }
}

fn normalize_comment(item: &JsonValue) -> Option<CommentItem> {
    let id = first_string(item, &["cid", "id", "comment_id"])?;
    let username = item
        .get("user")
        .map(|u| first_string(u, &["unique_id", "uniqueId", "username"]))
        .unwrap_or(None)
        .or_else(|| first_string(item, &["username", "unique_id"]))
        .and_then(|u| sera_core::normalize_username(&u));
    Some(CommentItem {
        id,
        username,
        text: first_string(item, &["text", "comment", "content"]),
        created_at: ["create_time", "createTime", "created_at"]
            .iter()
            .find_map(|k| item.get(k).and_then(as_i64_loose)),
    })
}

/// Decode one comments page and resolve its pagination state.
///
/// `has_more` accepts booleans or numeric flags; the next cursor falls back
/// to `current offset + requested count` when the gateway reports more pages
/// without echoing a cursor.
pub fn decode_comments_page(body: &JsonValue, current: &Cursor, count: u64) -> CommentsPage {
    let decoded;
    let body = match unwrap_string_encoded(body) {
        Some(inner) => {
            decoded = inner;
            &decoded
        }
        None => body,
    };

    let root = get_path(body, &["data", "data"])
        .or_else(|| body.get("data"))
        .unwrap_or(body);

    let items: Vec<CommentItem> = ["comments", "items", "itemList"]
        .iter()
        .find_map(|k| root.get(*k).and_then(JsonValue::as_array))
        .map(|list| list.iter().filter_map(normalize_comment).collect())
        .unwrap_or_default();

    let total = first_u64(root, &["total", "total_count", "comment_count"]);

    let has_more = ["has_more", "hasMore", "more", "hasNextPage"]
        .iter()
        .find_map(|k| root.get(*k).and_then(as_bool_loose))
        .unwrap_or(false);

    let echoed = ["cursor", "next_cursor", "nextCursor", "max_cursor", "maxCursor"]
        .iter()
        .find_map(|k| root.get(*k))
        .and_then(|v| match v {
            JsonValue::Number(_) => as_u64_loose(v).map(Cursor::Offset),
            JsonValue::String(s) => match s.trim().parse::<u64>() {
                Ok(n) => Some(Cursor::Offset(n)),
                Err(_) if !s.trim().is_empty() => Some(Cursor::Token(s.trim().to_string())),
                Err(_) => None,
            },
            _ => None,
        });

    let next_cursor = if has_more {
        echoed.or_else(|| match current {
            Cursor::Offset(offset) => Some(Cursor::Offset(offset + count)),
            Cursor::Token(_) => None,
        })
    } else {
        None
    };

    CommentsPage {
        items,
        next_cursor,
        has_more,
        total,
    }
}

pub fn decode_likers(body: &JsonValue) -> LikersPage {
    let root = get_path(body, &["data", "data"])
        .or_else(|| body.get("data"))
        .unwrap_or(body);

    let usernames = ["likers", "users", "items"]
        .iter()
        .find_map(|k| root.get(*k).and_then(JsonValue::as_array))
        .map(|list| {
            list.iter()
                .filter_map(|u| first_string(u, &["username", "unique_id", "uniqueId"]))
                .filter_map(|u| sera_core::normalize_username(&u))
                .collect()
        })
        .unwrap_or_default();

    LikersPage {
        usernames,
        next_cursor: first_string(root, &["next_cursor", "cursor", "end_cursor"]),
    }
}
