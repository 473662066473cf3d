use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// The authenticated user record supplied by the host application.
///
/// Its presence gates every other component: no identity means no socket
/// connection, no subscriptions, and no fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthIdentity {
    pub user_id: UserId,
    pub display_name: String,
    /// Opaque credential presented when opening the socket and on REST
    /// calls.
    pub token: String,
}

impl AuthIdentity {
    /// Whether `other` denotes the same session. A change of user id or
    /// token is an identity transition and requires full teardown.
    pub fn same_session(&self, other: &AuthIdentity) -> bool {
        self.user_id == other.user_id && self.token == other.token
    }
}
