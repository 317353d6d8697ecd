use crate::common::models::{DirectMessage, GroupBrief, GroupMessage, Notification};
use serde::{Deserialize, Serialize};

/// Inbound real-time events. Frames are JSON objects of the form
/// `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Binds the connection to a user identity via a session token. Every
    /// other identity-requiring event is dropped until this succeeds.
    #[serde(rename = "setup")]
    Setup { token: String },
    #[serde(rename = "join chat")]
    JoinChat(String),
    #[serde(rename = "join group")]
    JoinGroup(String),
    #[serde(rename = "leave group")]
    LeaveGroup(String),
    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    #[serde(rename = "stop typing")]
    StopTyping {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    #[serde(rename = "typing in group")]
    GroupTyping {
        #[serde(rename = "groupId")]
        group_id: String,
    },
    #[serde(rename = "stop typing in group")]
    GroupStopTyping {
        #[serde(rename = "groupId")]
        group_id: String,
    },
    /// Announces a direct message that was already persisted via the API.
    #[serde(rename = "new message")]
    NewMessage {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "message delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    #[serde(rename = "message read")]
    MessageRead {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    #[serde(rename = "clear notifications")]
    ClearNotifications {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "isGroupChat")]
        is_group_chat: bool,
    },
    #[serde(rename = "new group message")]
    NewGroupMessage {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "groupId")]
        group_id: String,
    },
    #[serde(rename = "group message status")]
    GroupMessageStatus {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "groupId")]
        group_id: String,
        status: String,
    },
    #[serde(rename = "group user added")]
    GroupUserAdded {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "group user removed")]
    GroupUserRemoved {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "group settings updated")]
    GroupSettingsUpdated(GroupBrief),
}

impl ClientEvent {
    /// Event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Setup { .. } => "setup",
            ClientEvent::JoinChat(_) => "join chat",
            ClientEvent::JoinGroup(_) => "join group",
            ClientEvent::LeaveGroup(_) => "leave group",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stop typing",
            ClientEvent::GroupTyping { .. } => "typing in group",
            ClientEvent::GroupStopTyping { .. } => "stop typing in group",
            ClientEvent::NewMessage { .. } => "new message",
            ClientEvent::MessageDelivered { .. } => "message delivered",
            ClientEvent::MessageRead { .. } => "message read",
            ClientEvent::ClearNotifications { .. } => "clear notifications",
            ClientEvent::NewGroupMessage { .. } => "new group message",
            ClientEvent::GroupMessageStatus { .. } => "group message status",
            ClientEvent::GroupUserAdded { .. } => "group user added",
            ClientEvent::GroupUserRemoved { .. } => "group user removed",
            ClientEvent::GroupSettingsUpdated(_) => "group settings updated",
        }
    }

    /// Whether the event may be handled before the connection has bound a
    /// user identity.
    pub fn allowed_unestablished(&self) -> bool {
        matches!(self, ClientEvent::Setup { .. })
    }
}

/// Outbound real-time events, mirrored by the client vocabulary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "user status update")]
    UserStatusUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isOnline")]
        is_online: bool,
        #[serde(rename = "lastSeen")]
        last_seen: Option<i64>,
    },
    #[serde(rename = "message received")]
    MessageReceived(DirectMessage),
    #[serde(rename = "message status updated")]
    MessageStatusUpdated {
        #[serde(rename = "messageId")]
        message_id: String,
        status: String,
        message: DirectMessage,
    },
    #[serde(rename = "message delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
        status: String,
        message: DirectMessage,
    },
    #[serde(rename = "new group message")]
    NewGroupMessage(GroupMessage),
    #[serde(rename = "group message status updated")]
    GroupMessageStatusUpdated {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(rename = "groupId")]
        group_id: String,
        message: GroupMessage,
        #[serde(rename = "statusType")]
        status_type: String,
        #[serde(rename = "deliveredTo")]
        delivered_to: Vec<String>,
        #[serde(rename = "readBy", skip_serializing_if = "Option::is_none")]
        read_by: Option<Vec<String>>,
    },
    /// Pushed to the sender's personal room when another member reads one of
    /// their group messages.
    #[serde(rename = "message read")]
    GroupMessageRead {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "readBy")]
        read_by: Vec<String>,
    },
    #[serde(rename = "new notification")]
    NewNotification(Notification),
    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "roomId", skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(rename = "groupId", skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
    },
    #[serde(rename = "stop typing")]
    StopTyping {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "roomId", skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(rename = "groupId", skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
    },
    #[serde(rename = "user joined group")]
    UserJoinedGroup {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user left group")]
    UserLeftGroup {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "group updated")]
    GroupUpdated(GroupBrief),
    #[serde(rename = "error")]
    Error { message: String },
}
