//! The alarm store.
//!
//! Owns the session's alarm collection and keeps it aligned with the
//! notification scheduler and with persistence. Every operation holds the
//! collection lock from start to finish, so operations run one at a time and
//! nobody reads a half-applied mutation. Each mutation adjusts the scheduler
//! first, then memory, then flushes the whole collection before returning.
//!
//! `edit_alarm` and `delete_alarm` expect the caller to have canceled the
//! alarm's old trigger beforehand; toggling off cancels inside the store.
//! `reschedule_alarm` and `remove_alarm` do the caller's cancel and the
//! mutation under one lock, so concurrent callers cannot interleave them.

use chrono::{DateTime, Local, Timelike};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::{watch, Mutex};

use crate::alarm::{AlarmId, AlarmRecord, TriggerId};
use crate::error::{AlarmError, SchedulingError};
use crate::persistence::AlarmPersistence;
use crate::scheduler::{NotificationScheduler, PendingTrigger, TriggerKind};

pub struct AlarmStore {
    /// Insertion order; sorting happens on every read.
    alarms: Mutex<Vec<AlarmRecord>>,
    scheduler: Arc<dyn NotificationScheduler>,
    persistence: Arc<dyn AlarmPersistence>,
    changes: watch::Sender<Vec<AlarmRecord>>,
}

impl AlarmStore {
    pub fn new(scheduler: Arc<dyn NotificationScheduler>, persistence: Arc<dyn AlarmPersistence>) -> AlarmStore {
        let (changes, _) = watch::channel(Vec::new());
        AlarmStore {
            alarms: Mutex::new(Vec::new()),
            scheduler,
            persistence,
            changes,
        }
    }

    /// The scheduler this store schedules through. Callers of `edit_alarm` or
    /// `delete_alarm` cancel the old trigger with it first.
    pub fn scheduler(&self) -> &Arc<dyn NotificationScheduler> {
        &self.scheduler
    }

    /// Receives the sorted collection after every completed mutation or reload.
    pub fn subscribe(&self) -> watch::Receiver<Vec<AlarmRecord>> {
        self.changes.subscribe()
    }

    /// Schedule a trigger for `time` and append a new enabled alarm.
    pub async fn create_alarm(&self, time: DateTime<Local>) -> Result<AlarmRecord, AlarmError> {
        let mut alarms = self.alarms.lock().await;

        let trigger_id = self.schedule_for(&time).await?;
        let record = AlarmRecord {
            id: AlarmId::generate(),
            scheduled_time: time,
            trigger_id: Some(trigger_id),
        };
        alarms.push(record.clone());
        info!("store:: created alarm {} at {}", record.id, record.display_time().trim());

        self.commit(&alarms).await;
        Ok(record)
    }

    /// Move an alarm to `new_time` with a fresh trigger. The result is always
    /// enabled. Returns `None`, without scheduling anything, for an unknown id.
    ///
    /// The old trigger must already be canceled. If scheduling the new one
    /// fails, the alarm is left disabled rather than pointing at a dead trigger.
    pub async fn edit_alarm(&self, id: &AlarmId, new_time: DateTime<Local>) -> Result<Option<AlarmRecord>, AlarmError> {
        let mut alarms = self.alarms.lock().await;
        let Some(index) = position(&alarms, id) else {
            debug!("store:: edit of unknown alarm {id} ignored");
            return Ok(None);
        };
        self.move_alarm(&mut alarms, index, new_time).await.map(Some)
    }

    /// Cancel an alarm's current trigger and move it to `new_time`, as one
    /// operation. On a scheduling failure the alarm ends up disabled.
    pub async fn reschedule_alarm(
        &self,
        id: &AlarmId,
        new_time: DateTime<Local>,
    ) -> Result<Option<AlarmRecord>, AlarmError> {
        let mut alarms = self.alarms.lock().await;
        let Some(index) = position(&alarms, id) else {
            debug!("store:: reschedule of unknown alarm {id} ignored");
            return Ok(None);
        };
        if let Some(old) = &alarms[index].trigger_id {
            self.cancel(old).await?;
        }
        self.move_alarm(&mut alarms, index, new_time).await.map(Some)
    }

    async fn move_alarm(
        &self,
        alarms: &mut [AlarmRecord],
        index: usize,
        new_time: DateTime<Local>,
    ) -> Result<AlarmRecord, AlarmError> {
        let trigger_id = match self.schedule_for(&new_time).await {
            Ok(trigger_id) => trigger_id,
            Err(e) => {
                if alarms[index].trigger_id.take().is_some() {
                    warn!("store:: alarm {} left disabled, its old trigger is gone", alarms[index].id);
                    self.commit(alarms).await;
                }
                return Err(e);
            }
        };
        let record = AlarmRecord {
            id: alarms[index].id.clone(),
            scheduled_time: new_time,
            trigger_id: Some(trigger_id),
        };
        alarms[index] = record.clone();
        info!("store:: edited alarm {} to {}", record.id, record.display_time().trim());

        self.commit(alarms).await;
        Ok(record)
    }

    /// Turn an alarm on (new trigger) or off (cancel its trigger). Setting the
    /// state it already has changes nothing.
    pub async fn set_enabled(&self, id: &AlarmId, enabled: bool) -> Result<Option<AlarmRecord>, AlarmError> {
        let mut alarms = self.alarms.lock().await;
        let Some(index) = position(&alarms, id) else {
            debug!("store:: toggle of unknown alarm {id} ignored");
            return Ok(None);
        };
        if alarms[index].enabled() == enabled {
            return Ok(Some(alarms[index].clone()));
        }

        let trigger_id = if enabled {
            Some(self.schedule_for(&alarms[index].scheduled_time).await?)
        } else {
            if let Some(old) = &alarms[index].trigger_id {
                self.cancel(old).await?;
            }
            None
        };
        alarms[index].trigger_id = trigger_id;
        let record = alarms[index].clone();
        info!("store:: alarm {} enabled={}", record.id, record.enabled());

        self.commit(&alarms).await;
        Ok(Some(record))
    }

    /// Drop an alarm from memory and from storage. Returns whether it was in memory.
    ///
    /// The storage key is removed even for an id memory does not know, since a
    /// flush only rewrites current alarms and would never clean it up.
    pub async fn delete_alarm(&self, id: &AlarmId) -> bool {
        let mut alarms = self.alarms.lock().await;
        self.drop_alarm(&mut alarms, id).await
    }

    /// Cancel an alarm's trigger and delete it, as one operation. A failed
    /// cancel leaves the alarm in place.
    pub async fn remove_alarm(&self, id: &AlarmId) -> Result<bool, AlarmError> {
        let mut alarms = self.alarms.lock().await;
        if let Some(trigger_id) = position(&alarms, id).and_then(|index| alarms[index].trigger_id.clone()) {
            self.cancel(&trigger_id).await?;
        }
        Ok(self.drop_alarm(&mut alarms, id).await)
    }

    async fn drop_alarm(&self, alarms: &mut Vec<AlarmRecord>, id: &AlarmId) -> bool {
        let before = alarms.len();
        alarms.retain(|alarm| &alarm.id != id);
        let existed = alarms.len() != before;

        if existed {
            info!("store:: deleted alarm {id}");
            self.commit(alarms).await;
        }
        self.persistence.remove(id).await;
        existed
    }

    /// Replace memory with what storage holds. A storage failure leaves memory as it was.
    pub async fn reload(&self) -> Vec<AlarmRecord> {
        let mut alarms = self.alarms.lock().await;
        match self.persistence.load_all().await {
            Ok(loaded) => {
                info!("store:: reloaded {} alarm(s) from storage", loaded.len());
                *alarms = loaded;
            }
            Err(e) => warn!("store:: reload failed, keeping {} alarm(s) in memory: {e}", alarms.len()),
        }
        let snapshot = sorted(&alarms);
        self.changes.send_replace(snapshot.clone());
        snapshot
    }

    /// All alarms, ascending by minute of day; ties keep insertion order.
    pub async fn list(&self) -> Vec<AlarmRecord> {
        sorted(&self.alarms.lock().await)
    }

    pub async fn get(&self, id: &AlarmId) -> Option<AlarmRecord> {
        let alarms = self.alarms.lock().await;
        position(&alarms, id).map(|index| alarms[index].clone())
    }

    /// Compare memory with the scheduler's pending set. Never changes anything.
    pub async fn diagnose(&self) -> ConsistencyReport {
        let alarms = self.list().await;
        let pending = self.scheduler.list_pending().await;
        let report = ConsistencyReport::build(&alarms, pending);
        if report.is_consistent() {
            debug!("store:: {} alarm(s) consistent with scheduler", report.alarms);
        } else {
            warn!(
                "store:: inconsistent: {} orphaned trigger(s), {} missing trigger(s), {} mismatched",
                report.orphaned_triggers.len(),
                report.missing_triggers.len(),
                report.mismatched_times.len()
            );
        }
        report
    }

    async fn schedule_for(&self, time: &DateTime<Local>) -> Result<TriggerId, AlarmError> {
        self.scheduler
            .schedule(time.hour(), time.minute())
            .await
            .map_err(|e| {
                error!("store:: scheduling {:02}:{:02} failed: {e}", time.hour(), time.minute());
                AlarmError::from(e)
            })
    }

    async fn cancel(&self, trigger_id: &TriggerId) -> Result<(), SchedulingError> {
        self.scheduler.cancel(trigger_id).await.map_err(|e| {
            error!("store:: canceling trigger {trigger_id} failed: {e}");
            e
        })
    }

    /// Flush the final state of memory, then tell subscribers.
    async fn commit(&self, alarms: &[AlarmRecord]) {
        let report = self.persistence.save_all(alarms).await;
        if report.failed > 0 {
            warn!(
                "store:: flush wrote {} alarm(s), {} failed; storage is behind memory",
                report.written, report.failed
            );
        }
        self.changes.send_replace(sorted(alarms));
    }
}

fn position(alarms: &[AlarmRecord], id: &AlarmId) -> Option<usize> {
    alarms.iter().position(|alarm| &alarm.id == id)
}

fn sorted(alarms: &[AlarmRecord]) -> Vec<AlarmRecord> {
    let mut sorted = alarms.to_vec();
    // stable, so equal times keep insertion order
    sorted.sort_by_key(AlarmRecord::minute_of_day);
    sorted
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub alarms: usize,
    pub enabled: usize,
    pub pending: Vec<PendingTrigger>,
    /// Daily triggers no alarm refers to.
    pub orphaned_triggers: Vec<TriggerId>,
    /// Enabled alarms whose trigger is not pending.
    pub missing_triggers: Vec<AlarmId>,
    /// Alarms whose trigger fires at a different time than the alarm says.
    pub mismatched_times: Vec<AlarmId>,
}

impl ConsistencyReport {
    fn build(alarms: &[AlarmRecord], pending: Vec<PendingTrigger>) -> ConsistencyReport {
        let referenced: HashSet<&TriggerId> = alarms.iter().filter_map(|a| a.trigger_id.as_ref()).collect();

        let orphaned_triggers = pending
            .iter()
            .filter(|p| matches!(p.kind, TriggerKind::Daily { .. }) && !referenced.contains(&p.trigger_id))
            .map(|p| p.trigger_id.clone())
            .collect();

        let mut missing_triggers = Vec::new();
        let mut mismatched_times = Vec::new();
        for alarm in alarms {
            let Some(trigger_id) = &alarm.trigger_id else {
                continue;
            };
            match pending.iter().find(|p| &p.trigger_id == trigger_id) {
                None => missing_triggers.push(alarm.id.clone()),
                Some(PendingTrigger {
                    kind: TriggerKind::Daily { hour, minute },
                    ..
                }) if (*hour, *minute) == (alarm.hour(), alarm.minute()) => {}
                Some(_) => mismatched_times.push(alarm.id.clone()),
            }
        }

        ConsistencyReport {
            alarms: alarms.len(),
            enabled: alarms.iter().filter(|a| a.enabled()).count(),
            pending,
            orphaned_triggers,
            missing_triggers,
            mismatched_times,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.orphaned_triggers.is_empty() && self.missing_triggers.is_empty() && self.mismatched_times.is_empty()
    }
}
