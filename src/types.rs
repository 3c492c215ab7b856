use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc::Sender, RwLock};

use crate::alarm::TriggerId;
use crate::device::DeviceState;
use crate::scheduler::PendingTrigger;

/// <trigger_id, (trigger, cancel sender)>
pub type CancelMap = HashMap<TriggerId, (PendingTrigger, Sender<bool>)>;

pub type SharedCancelMap = Arc<RwLock<CancelMap>>;

pub type SharedDevice = Arc<RwLock<DeviceState>>;
