use serde::{Deserialize, Serialize};

/// Payload kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            _ => None,
        }
    }
}

/// Delivery state of a message. The ordering is the allowed direction of
/// transitions: a persisted status never moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            _ => None,
        }
    }
}

/// Display projection of a user, embedded in message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBrief {
    pub id: String,
    pub username: String,
    #[serde(rename = "profilePicture")]
    pub profile_picture: String,
}

/// Result of the polling online-status query (30s last-seen window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    #[serde(rename = "isOnline")]
    pub is_online: bool,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
}

/// A 1:1 message joined with its sender/receiver projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    #[serde(rename = "senderId")]
    pub sender: UserBrief,
    #[serde(rename = "receiverId")]
    pub receiver: UserBrief,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Display projection of a group, embedded in group-message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBrief {
    pub id: String,
    #[serde(rename = "groupName")]
    pub name: String,
    #[serde(rename = "groupImage")]
    pub image: String,
}

/// A group message with its per-member delivery and read sets. `status` is a
/// coarse projection derived from the sets (any read -> read, any delivered
/// -> delivered, else sent), never stored separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: String,
    #[serde(rename = "groupId")]
    pub group: GroupBrief,
    #[serde(rename = "senderId")]
    pub sender: UserBrief,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    #[serde(rename = "deliveredTo")]
    pub delivered_to: Vec<String>,
    #[serde(rename = "readBy")]
    pub read_by: Vec<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(rename = "groupName")]
    pub name: String,
    #[serde(rename = "groupImage")]
    pub image: String,
    #[serde(rename = "adminId")]
    pub admin_id: String,
    pub members: Vec<UserBrief>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Normalized notification shape shared by the pull and push paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "isGroupChat")]
    pub is_group_chat: bool,
    #[serde(rename = "senderId")]
    pub sender: UserBrief,
    pub content: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(rename = "groupInfo", skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupBrief>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Per-id outcome of a bulk add-members call. Callers must handle partial
/// success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddMembersOutcome {
    pub added: Vec<String>,
    #[serde(rename = "alreadyInGroup")]
    pub already_in_group: Vec<String>,
    #[serde(rename = "notFound")]
    pub not_found: Vec<String>,
}

/// Per-id outcome of a bulk remove-members call. The admin is never removed;
/// such ids land in `admin_cannot_remove_self` instead of failing the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveMembersOutcome {
    pub removed: Vec<String>,
    #[serde(rename = "notInGroup")]
    pub not_in_group: Vec<String>,
    #[serde(rename = "notFound")]
    pub not_found: Vec<String>,
    #[serde(rename = "adminCannotRemoveSelf")]
    pub admin_cannot_remove_self: Vec<String>,
}
