//! Semantic broadcast events
//!
//! Results of contexts that run without private signalling are announced to
//! every subscriber of the owning site, keyed by the action that produced them.

use serde_json::{Map, Value};
use std::sync::Arc;

use super::error::FailureReport;
use crate::interpreter::to_text;

/// Event broadcast to all subscribers of a site
#[derive(Debug, Clone)]
pub enum SiteEvent {
    /// `get_name` finished
    SiteNameLoaded(String),
    /// `get_channel` produced a channel map
    ChannelInfoLoaded(Map<String, Value>),
    /// `get_channel` produced a bare name
    ChannelNameLoaded(String),
    /// `get_channel_videos` produced a list
    VideoListLoaded(Vec<Value>),
    /// `get_channel_videos` produced (or yielded) a single entry
    VideoItemLoaded(Value),
    /// `get_video_url(s)` produced a single URL
    VideoUrlLoaded(String),
    /// `get_video_url(s)` produced a list of sources
    VideoUrlsLoaded(Vec<Value>),
    /// A thumbnail fetch finished
    ThumbnailLoaded {
        /// Requested URL
        url: String,
        /// Caller-chosen tag identifying the requester
        tag: String,
        /// Image bytes
        bytes: Vec<u8>,
    },
    /// A broadcast-mode action failed
    ActionFailed(Arc<FailureReport>),
}

/// Map an action result onto its broadcast event.
///
/// Returns `None` for actions that have no well-known event.
pub fn for_result(action: &str, value: &Value) -> Option<SiteEvent> {
    let event = match action {
        "get_name" => SiteEvent::SiteNameLoaded(to_text(value)),
        "get_channel" => match value {
            Value::Object(map) => SiteEvent::ChannelInfoLoaded(map.clone()),
            other => SiteEvent::ChannelNameLoaded(to_text(other)),
        },
        "get_channel_videos" => match value {
            Value::Array(items) => SiteEvent::VideoListLoaded(items.clone()),
            other => SiteEvent::VideoItemLoaded(other.clone()),
        },
        "get_video_url" | "get_video_urls" => match value {
            Value::Array(items) => SiteEvent::VideoUrlsLoaded(items.clone()),
            other => SiteEvent::VideoUrlLoaded(to_text(other)),
        },
        _ => return None,
    };
    Some(event)
}
