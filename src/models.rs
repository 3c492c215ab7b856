use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmSnapshot, TriggerId};
use crate::device::PermissionStatus;

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AlarmTimeRequest {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PushTokenData {
    pub push_token: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PermissionData {
    pub permission: PermissionStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AlarmList {
    pub alarms: Vec<AlarmSnapshot>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeResponse {
    pub trigger_id: TriggerId,
    pub fires_in_seconds: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}
