use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stream::StreamKey;

/// Current envelope wire schema. Older versions are upgraded on decode,
/// newer versions are rejected as `BadEnvelope`.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 2;

fn default_schema_version() -> u32 {
    ENVELOPE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Private,
    Group,
    Notice,
    Meta,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Private => "private",
            MessageKind::Group => "group",
            MessageKind::Notice => "notice",
            MessageKind::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserInfo {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: None,
            display_name: None,
        }
    }

    /// The name to show in prompts and logs: display name, falling back to
    /// user name, falling back to the raw id.
    pub fn readable_name(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.user_name.as_deref())
            .unwrap_or(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_type: MessageKind,
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
    #[serde(default)]
    pub self_id: String,
    #[serde(default)]
    pub to_me: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One node of the message segment tree. Serializes to `{type, data}` on the
/// wire; `seglist` holds an ordered sequence of children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Segment {
    Text(String),
    Image(MediaPayload),
    At { user_id: String },
    Face { face_id: String },
    Reply { message_id: String },
    Forward { message_ids: Vec<String> },
    Voice(MediaPayload),
    Video(MediaPayload),
    File(MediaPayload),
    Command(String),
    Seglist(Vec<Segment>),
}

impl Segment {
    pub fn text(content: &str) -> Self {
        Segment::Text(content.to_string())
    }

    /// Flatten the tree into its plain-text rendering. Non-text leaves
    /// contribute placeholders so downstream consumers keep positions.
    pub fn plain_text(&self) -> String {
        match self {
            Segment::Text(s) => s.clone(),
            Segment::Image(_) => "[image]".to_string(),
            Segment::At { user_id } => format!("@{}", user_id),
            Segment::Face { face_id } => format!("[face:{}]", face_id),
            Segment::Reply { .. } => String::new(),
            Segment::Forward { .. } => "[forward]".to_string(),
            Segment::Voice(_) => "[voice]".to_string(),
            Segment::Video(_) => "[video]".to_string(),
            Segment::File(_) => "[file]".to_string(),
            Segment::Command(raw) => raw.clone(),
            Segment::Seglist(children) => {
                children.iter().map(|c| c.plain_text()).collect::<Vec<_>>().join("")
            }
        }
    }

    /// First command payload anywhere in the tree, if present. Plain text
    /// starting with `/` also counts as a command invocation.
    pub fn command_text(&self) -> Option<String> {
        match self {
            Segment::Command(raw) => Some(raw.clone()),
            Segment::Text(s) if s.trim_start().starts_with('/') => {
                Some(s.trim_start().trim_start_matches('/').to_string())
            }
            Segment::Seglist(children) => children.iter().find_map(|c| c.command_text()),
            _ => None,
        }
    }

    /// Whether the tree mentions the given user via an `at` segment.
    pub fn mentions(&self, user_id: &str) -> bool {
        match self {
            Segment::At { user_id: id } => id == user_id,
            Segment::Seglist(children) => children.iter().any(|c| c.mentions(user_id)),
            _ => false,
        }
    }
}

/// The universal inter-subsystem record: one platform event, immutable after
/// ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub direction: Direction,
    pub platform: String,
    pub message_id: String,
    pub timestamp_ms: i64,
    pub message_info: MessageInfo,
    pub message_segment: Segment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl MessageEnvelope {
    pub fn incoming(platform: &str, message_id: &str, info: MessageInfo, segment: Segment) -> Self {
        Self {
            direction: Direction::Incoming,
            platform: platform.to_string(),
            message_id: message_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            message_info: info,
            message_segment: segment,
            raw_message: None,
            schema_version: ENVELOPE_SCHEMA_VERSION,
        }
    }

    /// Build the outgoing reply envelope addressed to the same
    /// `(platform, party)` as this incoming one.
    pub fn reply_with(&self, segment: Segment) -> Self {
        Self {
            direction: Direction::Outgoing,
            platform: self.platform.clone(),
            message_id: String::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            message_info: self.message_info.clone(),
            message_segment: segment,
            raw_message: None,
            schema_version: ENVELOPE_SCHEMA_VERSION,
        }
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::from_info(&self.platform, &self.message_info)
    }

    pub fn plain_text(&self) -> String {
        self.message_segment.plain_text()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one envelope, applying the schema upgrade hook when the wire
    /// version is older than the current one.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::BadEnvelope(format!("malformed JSON: {}", e)))?;
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(ENVELOPE_SCHEMA_VERSION as u64) as u32;

        if version > ENVELOPE_SCHEMA_VERSION {
            return Err(Error::BadEnvelope(format!(
                "schema version {} is newer than supported {}",
                version, ENVELOPE_SCHEMA_VERSION
            )));
        }
        if version < ENVELOPE_SCHEMA_VERSION {
            upgrade_envelope(version, &mut value)?;
        }

        serde_json::from_value(value).map_err(|e| Error::BadEnvelope(e.to_string()))
    }
}

/// In-place upgrade of an older wire envelope to the current schema.
/// v1 carried `message_info.sender` instead of `message_info.user`.
fn upgrade_envelope(from_version: u32, value: &mut serde_json::Value) -> Result<()> {
    if from_version < 2 {
        if let Some(info) = value.get_mut("message_info").and_then(|v| v.as_object_mut()) {
            if let Some(sender) = info.remove("sender") {
                info.insert("user".to_string(), sender);
            }
        }
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "schema_version".to_string(),
            serde_json::json!(ENVELOPE_SCHEMA_VERSION),
        );
    }
    Ok(())
}

/// Batch wire form used by the HTTP adapter transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBatch {
    pub schema_version: u32,
    pub items: Vec<MessageEnvelope>,
}

impl EnvelopeBatch {
    pub fn new(items: Vec<MessageEnvelope>) -> Self {
        Self {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_info(user_id: &str) -> MessageInfo {
        MessageInfo {
            message_type: MessageKind::Private,
            user: UserInfo::new(user_id),
            group: None,
            self_id: "bot".to_string(),
            to_me: true,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let env = MessageEnvelope::incoming(
            "qq",
            "m1",
            private_info("42"),
            Segment::Seglist(vec![
                Segment::text("hello "),
                Segment::At {
                    user_id: "bot".to_string(),
                },
            ]),
        );
        let encoded = env.encode().unwrap();
        let decoded = MessageEnvelope::decode(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_decode_rejects_newer_schema() {
        let mut env = MessageEnvelope::incoming("qq", "m1", private_info("42"), Segment::text("x"));
        env.schema_version = ENVELOPE_SCHEMA_VERSION + 1;
        let raw = serde_json::to_string(&env).unwrap();
        assert!(matches!(
            MessageEnvelope::decode(&raw),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_upgrades_v1_sender_field() {
        let raw = serde_json::json!({
            "direction": "incoming",
            "platform": "qq",
            "message_id": "m1",
            "timestamp_ms": 1000,
            "message_info": {
                "message_type": "private",
                "sender": { "user_id": "42" },
                "self_id": "bot",
                "to_me": true
            },
            "message_segment": { "type": "text", "data": "hi" },
            "schema_version": 1
        })
        .to_string();

        let env = MessageEnvelope::decode(&raw).unwrap();
        assert_eq!(env.message_info.user.user_id, "42");
        assert_eq!(env.schema_version, ENVELOPE_SCHEMA_VERSION);
    }

    #[test]
    fn test_decode_malformed_is_bad_envelope() {
        assert!(matches!(
            MessageEnvelope::decode("{not json"),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_plain_text_flattens_seglist() {
        let seg = Segment::Seglist(vec![
            Segment::text("look "),
            Segment::Image(MediaPayload::default()),
            Segment::Seglist(vec![Segment::text(" nested")]),
        ]);
        assert_eq!(seg.plain_text(), "look [image] nested");
    }

    #[test]
    fn test_command_text_from_slash_prefix() {
        let seg = Segment::text("/permission grant qq 9 node.x");
        assert_eq!(
            seg.command_text().as_deref(),
            Some("permission grant qq 9 node.x")
        );
        assert_eq!(Segment::text("plain").command_text(), None);
    }

    #[test]
    fn test_reply_targets_same_party() {
        let env = MessageEnvelope::incoming("qq", "m1", private_info("1"), Segment::text("hello"));
        let reply = env.reply_with(Segment::text("hi"));
        assert_eq!(reply.direction, Direction::Outgoing);
        assert_eq!(reply.platform, "qq");
        assert_eq!(reply.stream_key(), env.stream_key());
    }
}
