use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stash::Keyed;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Pending,
    Inactive,
}

impl ClientStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Pending => "pending",
            ClientStatus::Inactive => "inactive",
        }
    }
}

/// Where a roster entry came from. All three kinds live in one collection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientOrigin {
    /// A confirmed trainer/student link.
    Roster,
    /// A link request waiting for an answer.
    Request,
    /// A trainer-managed entry with no backend account.
    Guest,
}

/// One row of the trainer's roster, as the app renders it.
///
/// `id` is local to the roster and never equal to `user_id`: confirmed members use their
/// relationship id, requests and guests use prefixed ids so the three kinds cannot collide.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub user_id: Option<String>,
    pub relationship_id: Option<i64>,
    pub request_id: Option<i64>,
    pub requested_by: Option<String>,
    pub guest_id: Option<i64>,
    pub status: ClientStatus,
    pub origin: ClientOrigin,
    pub name: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub join_date: DateTime<Utc>,
    pub plan: Option<String>,
    pub progress: u32,
    pub sessions_completed: u32,
}

impl Client {
    pub fn member_id(relationship_id: i64) -> String {
        relationship_id.to_string()
    }

    pub fn request_key(request_id: i64) -> String {
        format!("request-{request_id}")
    }

    pub fn guest_key(guest_id: i64) -> String {
        format!("guest-{guest_id}")
    }

    pub fn is_pending(&self) -> bool {
        self.status == ClientStatus::Pending
    }

    pub fn is_guest(&self) -> bool {
        self.origin == ClientOrigin::Guest
    }

    /// Whether the pending request behind this entry was sent by `user_id`.
    pub fn requested_by_user(&self, user_id: &str) -> bool {
        self.requested_by.as_deref() == Some(user_id)
    }
}

impl Keyed for Client {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}
