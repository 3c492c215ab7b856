use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SnapshotError;

/// Identifier of an alarm. Generated once at creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(String);

impl AlarmId {
    pub fn generate() -> AlarmId {
        AlarmId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AlarmId {
    fn from(value: String) -> Self {
        AlarmId(value)
    }
}

impl From<&str> for AlarmId {
    fn from(value: &str) -> Self {
        AlarmId(value.to_string())
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier handed out by a `NotificationScheduler` for one live trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(String);

impl TriggerId {
    pub fn generate() -> TriggerId {
        TriggerId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TriggerId {
    fn from(value: String) -> Self {
        TriggerId(value)
    }
}

impl From<&str> for TriggerId {
    fn from(value: &str) -> Self {
        TriggerId(value.to_string())
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which reminder sound plays, picked from the hour of the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundBand {
    Morning,
    Afternoon,
    Evening,
}

impl SoundBand {
    /// Noon itself falls in the evening band, as does everything from 17:00.
    pub fn for_hour(hour: u32) -> SoundBand {
        if hour < 12 {
            SoundBand::Morning
        } else if hour > 12 && hour < 17 {
            SoundBand::Afternoon
        } else {
            SoundBand::Evening
        }
    }

    pub fn sound_file(self) -> &'static str {
        match self {
            SoundBand::Morning => "ourfather.m4a",
            SoundBand::Afternoon => "hailmary.m4a",
            SoundBand::Evening => "glorybe.m4a",
        }
    }

    pub fn channel_name(self) -> &'static str {
        match self {
            SoundBand::Morning => "Morning",
            SoundBand::Afternoon => "Afternoon",
            SoundBand::Evening => "Evening",
        }
    }
}

/// A user-configured daily reminder.
///
/// Only the hour and minute of `scheduled_time` drive recurrence; the date part
/// is whatever day the time was picked on. The alarm is enabled exactly when it
/// holds a `trigger_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub scheduled_time: DateTime<Local>,
    pub trigger_id: Option<TriggerId>,
}

impl AlarmRecord {
    pub fn enabled(&self) -> bool {
        self.trigger_id.is_some()
    }

    pub fn hour(&self) -> u32 {
        self.scheduled_time.hour()
    }

    pub fn minute(&self) -> u32 {
        self.scheduled_time.minute()
    }

    /// Sort key used by every listing: `hour * 60 + minute`.
    pub fn minute_of_day(&self) -> u32 {
        self.hour() * 60 + self.minute()
    }

    pub fn display_time(&self) -> String {
        display_time(&self.scheduled_time)
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        AlarmSnapshot::from(self)
    }
}

/// 12-hour clock string, e.g. `" 7:05am"` or `"10:30pm"`.
///
/// Single-digit hours are padded with a leading space so the strings line up.
pub fn display_time<T: Timelike>(time: &T) -> String {
    let (is_pm, hour) = time.hour12();
    let suffix = if is_pm { "pm" } else { "am" };
    format!("{hour:>2}:{:02}{suffix}", time.minute())
}

/// Today's local date at `hour:minute`, or `None` when the values are out of range.
pub fn time_today(hour: u32, minute: u32) -> Option<DateTime<Local>> {
    time_on(Local::now().date_naive(), hour, minute)
}

/// `hour:minute` on `date` in local time. When a DST gap swallows that time,
/// the same wall-clock time on the next day is used instead; only the time of
/// day matters to a daily alarm.
pub fn time_on(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Local>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    first_existing(naive, |naive| Local.from_local_datetime(naive))
}

fn first_existing<Tz: TimeZone>(
    naive: NaiveDateTime,
    resolve: impl Fn(&NaiveDateTime) -> LocalResult<DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    resolve(&naive)
        .earliest()
        .or_else(|| resolve(&(naive + ChronoDuration::days(1))).earliest())
}

/// Serialized form of an alarm, shared by the on-disk record and the HTTP API:
/// `{ id, time, triggerId, enabled, displayTime }`.
///
/// Records written by older clients used `nId`, `switch` and `alarmTime`; those
/// names are still accepted when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSnapshot {
    pub id: String,
    pub time: String,
    #[serde(default, alias = "nId")]
    pub trigger_id: Option<String>,
    #[serde(default, alias = "switch")]
    pub enabled: bool,
    #[serde(default, alias = "alarmTime")]
    pub display_time: String,
}

impl From<&AlarmRecord> for AlarmSnapshot {
    fn from(record: &AlarmRecord) -> Self {
        AlarmSnapshot {
            id: record.id.to_string(),
            time: record.scheduled_time.to_rfc3339(),
            trigger_id: record.trigger_id.as_ref().map(ToString::to_string),
            enabled: record.enabled(),
            display_time: record.display_time(),
        }
    }
}

impl TryFrom<AlarmSnapshot> for AlarmRecord {
    type Error = SnapshotError;

    /// The trigger id is authoritative for the enabled state; the stored
    /// `displayTime` is ignored and recomputed on read.
    fn try_from(snapshot: AlarmSnapshot) -> Result<Self, Self::Error> {
        if snapshot.id.is_empty() {
            return Err(SnapshotError::MissingId);
        }
        let scheduled_time = DateTime::parse_from_rfc3339(&snapshot.time)?.with_timezone(&Local);
        let trigger_id = snapshot
            .trigger_id
            .filter(|id| !id.is_empty())
            .map(TriggerId::from);
        if snapshot.enabled != trigger_id.is_some() {
            log::warn!(
                "alarm {} stored enabled={} but trigger present={}, trusting the trigger",
                snapshot.id,
                snapshot.enabled,
                trigger_id.is_some()
            );
        }
        Ok(AlarmRecord {
            id: AlarmId::from(snapshot.id),
            scheduled_time,
            trigger_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn time_in_a_dst_gap_keeps_hour_and_minute() {
        use chrono::Utc;
        let gap_day = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();
        let naive = gap_day.and_hms_opt(2, 30, 0).unwrap();
        // a zone where 02:30 does not exist on the gap day
        let resolved = first_existing(naive, |n| {
            if n.date() == gap_day {
                LocalResult::None
            } else {
                Utc.from_local_datetime(n)
            }
        })
        .unwrap();
        assert_eq!((resolved.hour(), resolved.minute()), (2, 30));
        assert_eq!(resolved.date_naive(), NaiveDate::from_ymd_opt(2026, 3, 30).unwrap());
    }

    #[test]
    fn time_on_keeps_requested_time() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let time = time_on(date, 6, 45).unwrap();
        assert_eq!((time.hour(), time.minute()), (6, 45));
        assert!(time_on(date, 24, 0).is_none());
    }

    #[test]
    fn display_time_pads_single_digit_hours() {
        assert_eq!(display_time(&at(7, 5)), " 7:05am");
        assert_eq!(display_time(&at(13, 30)), " 1:30pm");
        assert_eq!(display_time(&at(22, 0)), "10:00pm");
    }

    #[test]
    fn display_time_midnight_and_noon_read_as_twelve() {
        assert_eq!(display_time(&at(0, 0)), "12:00am");
        assert_eq!(display_time(&at(12, 45)), "12:45pm");
    }

    #[test]
    fn sound_band_boundaries() {
        assert_eq!(SoundBand::for_hour(0), SoundBand::Morning);
        assert_eq!(SoundBand::for_hour(11), SoundBand::Morning);
        assert_eq!(SoundBand::for_hour(12), SoundBand::Evening);
        assert_eq!(SoundBand::for_hour(13), SoundBand::Afternoon);
        assert_eq!(SoundBand::for_hour(16), SoundBand::Afternoon);
        assert_eq!(SoundBand::for_hour(17), SoundBand::Evening);
        assert_eq!(SoundBand::for_hour(23), SoundBand::Evening);
    }

    #[test]
    fn time_today_rejects_out_of_range() {
        assert!(time_today(24, 0).is_none());
        assert!(time_today(7, 60).is_none());
        let t = time_today(7, 5).unwrap();
        assert_eq!((t.hour(), t.minute()), (7, 5));
    }

    #[test]
    fn snapshot_roundtrip_keeps_hour_and_minute() {
        let record = AlarmRecord {
            id: AlarmId::from("a1"),
            scheduled_time: time_today(21, 15).unwrap(),
            trigger_id: Some(TriggerId::from("t1")),
        };
        let json = serde_json::to_string(&record.snapshot()).unwrap();
        assert!(json.contains("\"triggerId\":\"t1\""));
        assert!(json.contains("\"displayTime\":\" 9:15pm\""));

        let parsed: AlarmSnapshot = serde_json::from_str(&json).unwrap();
        let restored = AlarmRecord::try_from(parsed).unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.minute_of_day(), record.minute_of_day());
        assert!(restored.enabled());
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let json = r#"{"id":"old","time":"2022-03-01T06:30:00.000Z","switch":false,"alarmTime":" 6:30am"}"#;
        let snapshot: AlarmSnapshot = serde_json::from_str(json).unwrap();
        let record = AlarmRecord::try_from(snapshot).unwrap();
        assert_eq!(record.id.as_str(), "old");
        assert!(!record.enabled());
    }

    #[test]
    fn bad_time_is_rejected() {
        let snapshot = AlarmSnapshot {
            id: "x".into(),
            time: "not a date".into(),
            trigger_id: None,
            enabled: false,
            display_time: String::new(),
        };
        assert!(matches!(
            AlarmRecord::try_from(snapshot),
            Err(SnapshotError::InvalidTime(_))
        ));
    }
}
