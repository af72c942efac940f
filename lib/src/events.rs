use serde::{Deserialize, Serialize};
use std::fmt;

pub type InboxId = String;
pub type ConversationId = String;
pub type EventId = u64;

/// Metadata field carrying a group's display name.
pub const GROUP_NAME_FIELD: &str = "group_name";

/// Kinds of live event a worker can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Conversation,
    MetadataUpdate,
    MembershipAdd,
    MembershipRemove,
    Consent,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Message,
        EventKind::Conversation,
        EventKind::MetadataUpdate,
        EventKind::MembershipAdd,
        EventKind::MembershipRemove,
        EventKind::Consent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Conversation => "conversation",
            EventKind::MetadataUpdate => "metadata_update",
            EventKind::MembershipAdd => "membership_add",
            EventKind::MembershipRemove => "membership_remove",
            EventKind::Consent => "consent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentState {
    Unknown,
    Allowed,
    Denied,
}

impl ConsentState {
    /// The state a consent flip moves to: allowed becomes denied, anything
    /// else becomes allowed.
    pub fn toggled(self) -> Self {
        match self {
            ConsentState::Allowed => ConsentState::Denied,
            ConsentState::Denied | ConsentState::Unknown => ConsentState::Allowed,
        }
    }
}

/// What a consent record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentEntity {
    Inbox,
    Group,
}

/// A single event observed on a live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    // A content message in a conversation
    Message {
        id: EventId,
        conversation_id: ConversationId,
        sender_inbox_id: InboxId,
        content: String,
    },
    // The receiver was made part of a new (or newly joined) conversation
    Conversation {
        conversation_id: ConversationId,
        creator_inbox_id: InboxId,
        name: String,
        is_dm: bool,
    },
    // A metadata field of a conversation changed
    MetadataUpdate {
        conversation_id: ConversationId,
        initiated_by: InboxId,
        field: String,
        new_value: String,
    },
    MembersAdded {
        conversation_id: ConversationId,
        initiated_by: InboxId,
        inbox_ids: Vec<InboxId>,
    },
    MembersRemoved {
        conversation_id: ConversationId,
        initiated_by: InboxId,
        inbox_ids: Vec<InboxId>,
    },
    // `initiated_by` changed its consent toward `entity`
    Consent {
        initiated_by: InboxId,
        entity: String,
        entity_type: ConsentEntity,
        state: ConsentState,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Message { .. } => EventKind::Message,
            StreamEvent::Conversation { .. } => EventKind::Conversation,
            StreamEvent::MetadataUpdate { .. } => EventKind::MetadataUpdate,
            StreamEvent::MembersAdded { .. } => EventKind::MembershipAdd,
            StreamEvent::MembersRemoved { .. } => EventKind::MembershipRemove,
            StreamEvent::Consent { .. } => EventKind::Consent,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Message {
                conversation_id, ..
            }
            | StreamEvent::Conversation {
                conversation_id, ..
            }
            | StreamEvent::MetadataUpdate {
                conversation_id, ..
            }
            | StreamEvent::MembersAdded {
                conversation_id, ..
            }
            | StreamEvent::MembersRemoved {
                conversation_id, ..
            } => Some(conversation_id),
            StreamEvent::Consent { .. } => None,
        }
    }
}

/// Canonical form of a member set: sorted, deduplicated, comma-joined.
pub fn member_set_key(inbox_ids: &[InboxId]) -> String {
    let mut ids: Vec<&str> = inbox_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}
