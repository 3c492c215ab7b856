use chrono::{DateTime, Duration as ChronoDuration, Local};
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::{sync::mpsc::Receiver, time::Duration};

use crate::alarm::{time_on, SoundBand, TriggerId};
use crate::apns::{NotificationSink, Reminder};
use crate::types::{SharedCancelMap, SharedDevice};
use crate::util::get_short_token;

const PUSH_TOKEN_RETRY: Duration = Duration::from_secs(4);

/// Everything a running trigger needs to deliver and to deregister itself.
#[derive(Clone)]
pub struct TriggerContext {
    pub pending: SharedCancelMap,
    pub device: SharedDevice,
    pub sink: Arc<dyn NotificationSink>,
}

impl TriggerContext {
    async fn fire(&self, reminder: &Reminder) {
        let mut push_token = self.device.read().await.push_token.clone();
        if push_token.is_none() {
            // try again after a couple seconds if we don't yet have a push token
            tokio::time::sleep(PUSH_TOKEN_RETRY).await;
            push_token = self.device.read().await.push_token.clone();
        }

        match push_token {
            Some(push_token) => {
                debug!(
                    "timing:: trigger {} delivering to ...{}",
                    reminder.trigger_id,
                    get_short_token(&push_token)
                );
                if let Err(e) = self.sink.deliver(&push_token, reminder).await {
                    error!("timing:: trigger {} delivery failed: {e}", reminder.trigger_id);
                }
            }
            None => warn!("timing:: trigger {} fired without a push token, reminder dropped", reminder.trigger_id),
        }
    }
}

/// First `hour:minute` strictly after `after`, in local time.
pub fn next_occurrence(after: DateTime<Local>, hour: u32, minute: u32) -> Option<DateTime<Local>> {
    let today = after.date_naive();
    let candidate = time_on(today, hour, minute)?;
    if candidate > after {
        return Some(candidate);
    }
    time_on(today + ChronoDuration::days(1), hour, minute)
}

fn wait_time(now: DateTime<Local>, target: DateTime<Local>) -> Duration {
    // Set wait time to a second if the target already slipped by
    (target - now).to_std().unwrap_or(Duration::from_secs(1))
}

/// Fires every day at `hour:minute` until canceled.
pub async fn start_daily_loop(
    trigger_id: TriggerId,
    hour: u32,
    minute: u32,
    band: SoundBand,
    mut cancel: Receiver<bool>,
    ctx: TriggerContext,
) {
    let reminder = Reminder { trigger_id, band };
    let mut last_target: Option<DateTime<Local>> = None;

    loop {
        let now = Local::now();
        let after = last_target.map_or(now, |prev| prev.max(now));
        let Some(target) = next_occurrence(after, hour, minute) else {
            error!("timing:: trigger {} has no valid next occurrence", reminder.trigger_id);
            break;
        };
        let wait = wait_time(now, target);

        debug!("timing:: trigger {} waiting for {:?} (until {})", reminder.trigger_id, wait, target);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.recv() => {
                debug!("timing:: trigger {} canceled", reminder.trigger_id);
                break;
            }
        }

        last_target = Some(target);
        ctx.fire(&reminder).await;
    }
}

/// Fires once after `delay`, then removes itself from the pending set.
pub async fn start_once(
    trigger_id: TriggerId,
    delay: Duration,
    band: SoundBand,
    mut cancel: Receiver<bool>,
    ctx: TriggerContext,
) {
    debug!("timing:: one-shot trigger {} waiting for {:?}", trigger_id, delay);

    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.recv() => {
            debug!("timing:: one-shot trigger {} canceled", trigger_id);
            return;
        }
    }

    ctx.pending.write().await.remove(&trigger_id);
    ctx.fire(&Reminder { trigger_id, band }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn local(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> DateTime<Local> {
        time_on(NaiveDate::from_ymd_opt(y, m, d).unwrap(), hour, minute).unwrap()
    }

    #[test]
    fn next_occurrence_later_today() {
        let now = local(2026, 10, 18, 6, 0);
        let next = next_occurrence(now, 7, 5).unwrap();
        assert_eq!(next.date_naive(), now.date_naive());
        assert_eq!((next.hour(), next.minute()), (7, 5));
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow() {
        let now = local(2026, 10, 18, 22, 0);
        let next = next_occurrence(now, 7, 5).unwrap();
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let now = local(2026, 10, 18, 7, 5);
        let next = next_occurrence(now, 7, 5).unwrap();
        assert!(next > now);
    }

    #[test]
    fn next_occurrence_rejects_bad_time() {
        assert!(next_occurrence(Local::now(), 25, 0).is_none());
    }

    #[test]
    fn past_target_waits_one_second() {
        let now = local(2026, 10, 18, 8, 0);
        let past = local(2026, 10, 18, 7, 0);
        assert_eq!(wait_time(now, past), Duration::from_secs(1));
    }
}
