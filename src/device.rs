//! What the service knows about the one device it reminds.

use serde::{Deserialize, Serialize};

/// Notification permission as last reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Undetermined,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub push_token: Option<String>,
    pub permission: PermissionStatus,
}

impl DeviceState {
    /// Registering a push token means the OS granted notifications.
    pub fn register_push_token(&mut self, push_token: String) {
        self.push_token = Some(push_token);
        self.permission = PermissionStatus::Granted;
    }

    /// A denial drops the token; pushes to it would be discarded anyway.
    pub fn set_permission(&mut self, permission: PermissionStatus) {
        if permission == PermissionStatus::Denied {
            self.push_token = None;
        }
        self.permission = permission;
    }
}
