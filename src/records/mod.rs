
pub mod loader;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use loader::{ArchiveLoader, LoadReport, LoadedArchive};

/// Longest body excerpt kept in metadata, in characters.
pub const PREVIEW_CHARS: usize = 200;

pub const UNKNOWN_SENDER: &str = "unknown";
pub const UNKNOWN_TIME: &str = "unknown-time";

const FRIEND_GREETING: &str = "I've accepted your friend request. Now let's chat!";

/// One row of an exported chat table, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    /// File the row was read from
    pub source: String,
    pub create_time: Option<String>,
    pub talker: Option<String>,
    pub type_name: Option<String>,
    pub msg: Option<String>,
    pub room_name: Option<String>,
    pub is_sender: Option<String>,
}

impl RawRecord {
    /// Parse the `key: value` text form of a row. Lines without a colon are skipped and only the
    /// first colon separates key from value.
    #[inline]
    pub fn parse(source: &str, text: &str) -> Self {
        Self::from_pairs(
            source,
            text.lines()
                .filter_map(|line| line.split_once(':'))
                .map(|(key, value)| (key.trim(), value.trim())),
        )
    }

    /// Build a record from `(column, value)` pairs. Unknown columns are ignored and a repeated
    /// column keeps its last value.
    #[inline]
    pub fn from_pairs<'a, I>(source: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut record = Self {
            source: source.to_string(),
            ..Self::default()
        };

        for (key, value) in pairs {
            let slot = match key.trim() {
                "CreateTime" => &mut record.create_time,
                "talker" => &mut record.talker,
                "type_name" => &mut record.type_name,
                "msg" => &mut record.msg,
                "room_name" => &mut record.room_name,
                "is_sender" => &mut record.is_sender,
                _ => continue,
            };
            *slot = Some(value.trim().to_string());
        }

        record
    }
}

/// Why a record was kept out of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rejection {
    EmptyMessage,
    TooShort,
    Bracketed,
    Sticker,
    AnimatedSticker,
    FriendGreeting,
    XmlPayload,
}

impl Rejection {
    /// Stable identifier used as a counter key
    #[inline]
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::TooShort => "too_short",
            Self::Bracketed => "bracketed",
            Self::Sticker => "sticker",
            Self::AnimatedSticker => "animated_sticker",
            Self::FriendGreeting => "friend_greeting",
            Self::XmlPayload => "xml_payload",
        }
    }
}

impl fmt::Display for Rejection {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::EmptyMessage => "message body is empty",
            Self::TooShort => "message body has two characters or fewer",
            Self::Bracketed => "message body starts with '['",
            Self::Sticker => "message body is a sticker placeholder",
            Self::AnimatedSticker => "message type is an animated sticker",
            Self::FriendGreeting => "message is the automatic friend greeting",
            Self::XmlPayload => "message body is an embedded XML payload",
        };
        f.write_str(reason)
    }
}

/// Metadata stored next to every indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    pub chat_time: Option<String>,
    pub sender: Option<String>,
    pub msg_type: Option<String>,
    pub room: Option<String>,
    pub is_sender: bool,
    /// First [`PREVIEW_CHARS`] characters of the message body
    pub msg_content_preview: String,
}

impl DocumentMetadata {
    #[inline]
    pub fn sender_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.sender.as_deref().unwrap_or(fallback)
    }

    #[inline]
    pub fn chat_time_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.chat_time.as_deref().unwrap_or(fallback)
    }
}

/// A normalized chat message, ready to embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// Apply the filtering policy to a raw record and render the retrievable text block.
#[inline]
pub fn normalize(record: &RawRecord) -> Result<Document, Rejection> {
    let msg = record.msg.as_deref().map(str::trim).unwrap_or_default();

    if msg.is_empty() {
        return Err(Rejection::EmptyMessage);
    }
    if msg.chars().count() <= 2 {
        return Err(Rejection::TooShort);
    }
    if msg.starts_with('[') {
        return Err(Rejection::Bracketed);
    }
    if msg.starts_with("表情") {
        return Err(Rejection::Sticker);
    }
    if record
        .type_name
        .as_deref()
        .is_some_and(|kind| kind.contains("动画表情"))
    {
        return Err(Rejection::AnimatedSticker);
    }
    if msg == FRIEND_GREETING {
        return Err(Rejection::FriendGreeting);
    }
    if msg.contains("<msg>") {
        return Err(Rejection::XmlPayload);
    }

    let chat_time = present(record.create_time.as_deref());
    let sender = present(record.talker.as_deref());
    let msg_type = present(record.type_name.as_deref());
    let room = present(record.room_name.as_deref());
    let is_sender = record.is_sender.as_deref().map(str::trim) == Some("1");

    let content = format!(
        "聊天记录:\n时间: {}\n发送者: {}\n消息类型: {}\n内容: {}\n房间: {}\n是否自己发送: {}",
        chat_time.as_deref().unwrap_or("未知时间"),
        sender.as_deref().unwrap_or("未知用户"),
        msg_type.as_deref().unwrap_or("文本"),
        msg,
        room.as_deref().unwrap_or("私聊"),
        if is_sender { "是" } else { "否" },
    );

    Ok(Document {
        content,
        metadata: DocumentMetadata {
            source: record.source.clone(),
            chat_time,
            sender,
            msg_type,
            room,
            is_sender,
            msg_content_preview: msg.chars().take(PREVIEW_CHARS).collect(),
        },
    })
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
