use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::{MessageInfo, MessageKind};

/// One conversation thread: a platform plus either a group or a private
/// counterpart. Renders as `platform:group:<id>` / `platform:private:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub platform: String,
    pub scope: StreamScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum StreamScope {
    Private(String),
    Group(String),
}

impl StreamKey {
    pub fn private(platform: &str, user_id: &str) -> Self {
        Self {
            platform: platform.to_string(),
            scope: StreamScope::Private(user_id.to_string()),
        }
    }

    pub fn group(platform: &str, group_id: &str) -> Self {
        Self {
            platform: platform.to_string(),
            scope: StreamScope::Group(group_id.to_string()),
        }
    }

    /// Group identity wins when present; notices and meta events from a user
    /// collapse into that user's private stream.
    pub fn from_info(platform: &str, info: &MessageInfo) -> Self {
        match (&info.group, info.message_type) {
            (Some(group), MessageKind::Group) | (Some(group), MessageKind::Notice) => {
                Self::group(platform, &group.group_id)
            }
            (Some(group), _) => Self::group(platform, &group.group_id),
            (None, _) => Self::private(platform, &info.user.user_id),
        }
    }

    /// Parse the rendered `platform:kind:id` form.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let platform = parts.next()?;
        let kind = parts.next()?;
        let id = parts.next()?;
        match kind {
            "private" => Some(Self::private(platform, id)),
            "group" => Some(Self::group(platform, id)),
            _ => None,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            StreamScope::Private(id) => write!(f, "{}:private:{}", self.platform, id),
            StreamScope::Group(id) => write!(f, "{}:group:{}", self.platform, id),
        }
    }
}
