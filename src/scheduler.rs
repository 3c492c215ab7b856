//! Notification scheduling.
//!
//! [`NotificationScheduler`] is the seam the alarm store schedules through.
//! [`TokioScheduler`] backs it with one tokio task per trigger; each task owns
//! the receiving half of a cancel channel whose sender sits in the pending map.
//! Daily triggers can be mirrored into a key-value registry so a restarted
//! process picks them up again under the same ids, the way an OS keeps its
//! scheduled notifications across app restarts.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, RwLock},
    time::Duration,
};

use crate::alarm::{SoundBand, TriggerId};
use crate::apns::NotificationSink;
use crate::device::PermissionStatus;
use crate::error::SchedulingError;
use crate::persistence::KeyValueStore;
use crate::timing::{start_daily_loop, start_once, TriggerContext};
use crate::types::{SharedCancelMap, SharedDevice};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerKind {
    Daily { hour: u32, minute: u32 },
    #[serde(rename_all = "camelCase")]
    Once { fire_at: DateTime<Local> },
}

/// A trigger the scheduler currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTrigger {
    pub trigger_id: TriggerId,
    pub kind: TriggerKind,
    pub band: SoundBand,
}

#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    /// Create a trigger repeating daily at `hour:minute`. The sound band follows the hour.
    async fn schedule(&self, hour: u32, minute: u32) -> Result<TriggerId, SchedulingError>;

    /// Create a trigger that fires once after `delay`.
    async fn schedule_once(&self, delay: Duration, band: SoundBand) -> Result<TriggerId, SchedulingError>;

    /// Remove a trigger. Unknown or already canceled ids are not an error.
    async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), SchedulingError>;

    /// Every trigger still pending. For diagnostics only.
    async fn list_pending(&self) -> Vec<PendingTrigger>;
}

pub struct TokioScheduler {
    pending: SharedCancelMap,
    device: SharedDevice,
    sink: Arc<dyn NotificationSink>,
    max_pending: usize,
    registry: Option<Arc<dyn KeyValueStore>>,
    closed: AtomicBool,
}

const REGISTRY_PREFIX: &str = "trigger:";

impl TokioScheduler {
    pub fn new(device: SharedDevice, sink: Arc<dyn NotificationSink>, max_pending: usize) -> TokioScheduler {
        TokioScheduler {
            pending: Arc::new(RwLock::new(HashMap::new())),
            device,
            sink,
            max_pending,
            registry: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Mirror daily triggers into `registry` so `restore` can re-arm them later.
    pub fn with_registry(mut self, registry: Arc<dyn KeyValueStore>) -> TokioScheduler {
        self.registry = Some(registry);
        self
    }

    /// Re-arm every daily trigger found in the registry, keeping its id.
    /// Restored triggers count against the pending limit; whatever does not
    /// fit stays registered but unarmed. Returns how many were restored.
    pub async fn restore(&self) -> usize {
        let Some(registry) = &self.registry else {
            return 0;
        };
        let keys = match registry.keys_with_prefix(REGISTRY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("scheduler:: could not list registered triggers: {e}");
                return 0;
            }
        };

        let mut restored = 0;
        for key in keys {
            let trigger = match registry.get(&key).await {
                Ok(Some(raw)) => serde_json::from_str::<PendingTrigger>(&raw).map_err(|e| e.to_string()),
                Ok(None) => continue,
                Err(e) => Err(e.to_string()),
            };
            match trigger {
                Ok(trigger) => {
                    let TriggerKind::Daily { hour, minute } = trigger.kind else {
                        continue;
                    };
                    let (trigger_id, band) = (trigger.trigger_id.clone(), trigger.band);
                    match self.admit(trigger).await {
                        Ok(rx) => {
                            tokio::spawn(start_daily_loop(trigger_id, hour, minute, band, rx, self.context()));
                            restored += 1;
                        }
                        Err(e) => {
                            warn!("scheduler:: stopped restoring at trigger {trigger_id}: {e}");
                            break;
                        }
                    }
                }
                Err(e) => warn!("scheduler:: skipping registered trigger '{key}': {e}"),
            }
        }
        info!("scheduler:: restored {restored} daily trigger(s)");
        restored
    }

    async fn remember(&self, trigger: &PendingTrigger) {
        let Some(registry) = &self.registry else {
            return;
        };
        let key = format!("{REGISTRY_PREFIX}{}", trigger.trigger_id);
        let result = match serde_json::to_string(trigger) {
            Ok(json) => registry.set(&key, json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("scheduler:: could not register trigger {}: {e}", trigger.trigger_id);
        }
    }

    async fn forget(&self, trigger_id: &TriggerId) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.remove(&format!("{REGISTRY_PREFIX}{trigger_id}")).await {
                warn!("scheduler:: could not deregister trigger {trigger_id}: {e}");
            }
        }
    }

    fn context(&self) -> TriggerContext {
        TriggerContext {
            pending: Arc::clone(&self.pending),
            device: Arc::clone(&self.device),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Admit a trigger into the pending map and hand back its cancel receiver.
    async fn admit(&self, trigger: PendingTrigger) -> Result<mpsc::Receiver<bool>, SchedulingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulingError::Shutdown);
        }
        if self.device.read().await.permission == PermissionStatus::Denied {
            return Err(SchedulingError::PermissionDenied);
        }

        let mut pending = self.pending.write().await;
        if pending.len() >= self.max_pending {
            return Err(SchedulingError::LimitReached { limit: self.max_pending });
        }
        let (tx, rx) = mpsc::channel(1);
        pending.insert(trigger.trigger_id.clone(), (trigger, tx));
        debug!("scheduler:: {} trigger(s) pending", pending.len());
        Ok(rx)
    }

    /// Stop every running trigger. Registered daily triggers stay in the
    /// registry so the next process restores them.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.write().await.drain().collect();
        for (_, (_, cancel)) in &drained {
            cancel.send(true).await.ok();
        }
        info!("scheduler:: shut down, {} trigger(s) stopped", drained.len());
    }
}

#[async_trait]
impl NotificationScheduler for TokioScheduler {
    async fn schedule(&self, hour: u32, minute: u32) -> Result<TriggerId, SchedulingError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulingError::InvalidTime { hour, minute });
        }
        let band = SoundBand::for_hour(hour);
        let trigger_id = TriggerId::generate();
        let trigger = PendingTrigger {
            trigger_id: trigger_id.clone(),
            kind: TriggerKind::Daily { hour, minute },
            band,
        };
        let rx = self.admit(trigger.clone()).await?;
        self.remember(&trigger).await;

        info!(
            "scheduler:: trigger {} daily at {:02}:{:02} with {}",
            trigger_id,
            hour,
            minute,
            band.sound_file()
        );
        tokio::spawn(start_daily_loop(trigger_id.clone(), hour, minute, band, rx, self.context()));
        Ok(trigger_id)
    }

    async fn schedule_once(&self, delay: Duration, band: SoundBand) -> Result<TriggerId, SchedulingError> {
        let fire_at = Local::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let trigger_id = TriggerId::generate();
        let rx = self
            .admit(PendingTrigger {
                trigger_id: trigger_id.clone(),
                kind: TriggerKind::Once { fire_at },
                band,
            })
            .await?;

        info!("scheduler:: one-shot trigger {} in {:?}", trigger_id, delay);
        tokio::spawn(start_once(trigger_id.clone(), delay, band, rx, self.context()));
        Ok(trigger_id)
    }

    async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), SchedulingError> {
        let removed = self.pending.write().await.remove(trigger_id);
        self.forget(trigger_id).await;
        match removed {
            Some((_, cancel)) => {
                cancel.send(true).await.ok();
                info!("scheduler:: trigger {} canceled", trigger_id);
            }
            None => debug!("scheduler:: cancel of unknown trigger {} ignored", trigger_id),
        }
        Ok(())
    }

    async fn list_pending(&self) -> Vec<PendingTrigger> {
        let mut triggers: Vec<PendingTrigger> = self
            .pending
            .read()
            .await
            .values()
            .map(|(trigger, _)| trigger.clone())
            .collect();
        triggers.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apns::Reminder;
    use crate::device::DeviceState;
    use crate::error::DeliveryError;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct RecordingSink(UnboundedSender<(String, Reminder)>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, push_token: &str, reminder: &Reminder) -> Result<(), DeliveryError> {
            self.0.send((push_token.to_string(), reminder.clone())).ok();
            Ok(())
        }
    }

    fn scheduler(max_pending: usize) -> (TokioScheduler, SharedDevice, UnboundedReceiver<(String, Reminder)>) {
        let (tx, rx) = unbounded_channel();
        let mut device = DeviceState::default();
        device.register_push_token("device-push-token".into());
        let device = Arc::new(RwLock::new(device));
        let scheduler = TokioScheduler::new(Arc::clone(&device), Arc::new(RecordingSink(tx)), max_pending);
        (scheduler, device, rx)
    }

    #[tokio::test]
    async fn schedule_registers_pending_trigger_with_band() {
        let (scheduler, _, _rx) = scheduler(8);
        let id = scheduler.schedule(14, 30).await.unwrap();
        let pending = scheduler.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trigger_id, id);
        assert_eq!(pending[0].kind, TriggerKind::Daily { hour: 14, minute: 30 });
        assert_eq!(pending[0].band, SoundBand::Afternoon);
    }

    #[tokio::test]
    async fn cancel_twice_is_harmless() {
        let (scheduler, _, _rx) = scheduler(8);
        let id = scheduler.schedule(7, 5).await.unwrap();
        scheduler.cancel(&id).await.unwrap();
        scheduler.cancel(&id).await.unwrap();
        scheduler.cancel(&TriggerId::from("never-existed")).await.unwrap();
        assert!(scheduler.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn denied_permission_refuses_scheduling() {
        let (scheduler, device, _rx) = scheduler(8);
        device.write().await.set_permission(PermissionStatus::Denied);
        assert_eq!(scheduler.schedule(7, 0).await, Err(SchedulingError::PermissionDenied));
        assert!(scheduler.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn pending_limit_is_enforced() {
        let (scheduler, _, _rx) = scheduler(2);
        scheduler.schedule(6, 0).await.unwrap();
        scheduler.schedule(7, 0).await.unwrap();
        assert_eq!(
            scheduler.schedule(8, 0).await,
            Err(SchedulingError::LimitReached { limit: 2 })
        );
    }

    #[tokio::test]
    async fn out_of_range_time_is_rejected() {
        let (scheduler, _, _rx) = scheduler(8);
        assert_eq!(
            scheduler.schedule(24, 0).await,
            Err(SchedulingError::InvalidTime { hour: 24, minute: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_and_leaves_pending_set() {
        let (scheduler, _, mut rx) = scheduler(8);
        let id = scheduler
            .schedule_once(Duration::from_secs(300), SoundBand::Morning)
            .await
            .unwrap();

        let (token, reminder) = rx.recv().await.unwrap();
        assert_eq!(token, "device-push-token");
        assert_eq!(reminder.trigger_id, id);
        assert_eq!(reminder.band, SoundBand::Morning);
        assert!(scheduler.list_pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_one_shot_never_fires() {
        let (scheduler, _, mut rx) = scheduler(8);
        let id = scheduler
            .schedule_once(Duration::from_secs(300), SoundBand::Morning)
            .await
            .unwrap();
        scheduler.cancel(&id).await.unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_restores_daily_triggers_under_same_id() {
        let registry = Arc::new(crate::persistence::MemoryKeyValueStore::new());
        let (first, _, _rx1) = scheduler(8);
        let first = first.with_registry(registry.clone());
        let kept = first.schedule(6, 30).await.unwrap();
        let dropped = first.schedule(21, 0).await.unwrap();
        first.schedule_once(Duration::from_secs(300), SoundBand::Morning).await.unwrap();
        first.cancel(&dropped).await.unwrap();
        first.shutdown().await;

        let (second, _, _rx2) = scheduler(8);
        let second = second.with_registry(registry);
        assert_eq!(second.restore().await, 1);
        let pending = second.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trigger_id, kept);
        assert_eq!(pending[0].kind, TriggerKind::Daily { hour: 6, minute: 30 });
        second.shutdown().await;
    }

    #[tokio::test]
    async fn shut_down_scheduler_refuses_new_triggers() {
        let (scheduler, _, _rx) = scheduler(8);
        scheduler.schedule(7, 0).await.unwrap();
        scheduler.shutdown().await;
        assert!(scheduler.list_pending().await.is_empty());
        assert_eq!(scheduler.schedule(8, 0).await, Err(SchedulingError::Shutdown));
    }

    #[tokio::test]
    async fn restore_respects_pending_limit() {
        let registry = Arc::new(crate::persistence::MemoryKeyValueStore::new());
        let (first, _, _rx1) = scheduler(8);
        let first = first.with_registry(registry.clone());
        for hour in [5, 6, 7] {
            first.schedule(hour, 0).await.unwrap();
        }
        first.shutdown().await;

        let (second, _, _rx2) = scheduler(2);
        let second = second.with_registry(registry.clone());
        assert_eq!(second.restore().await, 2);
        assert_eq!(second.list_pending().await.len(), 2);
        // the one that didn't fit is still registered
        assert_eq!(registry.keys_with_prefix(REGISTRY_PREFIX).await.unwrap().len(), 3);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn shut_down_scheduler_restores_nothing() {
        let registry = Arc::new(crate::persistence::MemoryKeyValueStore::new());
        let (first, _, _rx1) = scheduler(8);
        let first = first.with_registry(registry.clone());
        first.schedule(5, 0).await.unwrap();
        first.shutdown().await;

        let (second, _, _rx2) = scheduler(8);
        let second = second.with_registry(registry);
        second.shutdown().await;
        assert_eq!(second.restore().await, 0);
        assert!(second.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn restore_without_registry_is_a_noop() {
        let (scheduler, _, _rx) = scheduler(8);
        assert_eq!(scheduler.restore().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_trigger_delivers() {
        let (scheduler, _, mut rx) = scheduler(8);
        let id = scheduler.schedule(5, 45).await.unwrap();

        let (_, reminder) = rx.recv().await.unwrap();
        assert_eq!(reminder.trigger_id, id);
        assert_eq!(reminder.band, SoundBand::Morning);
        scheduler.shutdown().await;
        assert!(scheduler.list_pending().await.is_empty());
    }
}
