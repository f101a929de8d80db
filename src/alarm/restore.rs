use chrono::{Local, TimeZone};
use tracing::{debug, info};

use crate::alarm::model::{Alarm, latest_occurrence_at_or_before};
use crate::alarm::scheduler::AlarmStore;
use crate::timer::restore::RangAtSource;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AlarmRestoreCase {
    /// Was ringing at close; the ring is tagged and silenced.
    RingingAtClose { rang_at: i64, source: RangAtSource },
    /// Its time came and went while the app was closed. The alarm is
    /// disabled until the user turns it back on.
    FiredWhileClosed { rang_at: i64 },
}

impl AlarmRestoreCase {
    pub fn rang_at(self) -> i64 {
        match self {
            AlarmRestoreCase::RingingAtClose { rang_at, .. }
            | AlarmRestoreCase::FiredWhileClosed { rang_at } => rang_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlarmRestoreReport {
    pub restored: Vec<(String, AlarmRestoreCase)>,
}

impl AlarmRestoreReport {
    pub fn case_for(&self, id: &str) -> Option<AlarmRestoreCase> {
        self.restored
            .iter()
            .find(|(alarm_id, _)| alarm_id == id)
            .map(|(_, case)| *case)
    }
}

impl AlarmStore {
    pub fn restore(&mut self, last_visit_ms: Option<i64>) -> AlarmRestoreReport {
        self.restore_in_tz(last_visit_ms, &Local)
    }

    pub fn restore_in_tz<Tz>(
        &mut self,
        last_visit_ms: Option<i64>,
        timezone: &Tz,
    ) -> AlarmRestoreReport
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        let now = self.now();
        let mut report = AlarmRestoreReport::default();
        for alarm in self.alarms_mut() {
            if let Some(case) = resolve_alarm(alarm, now, last_visit_ms, timezone) {
                info!(alarm = %alarm.id, ?case, "restored alarm");
                report.restored.push((alarm.id.clone(), case));
            }
        }
        if !report.restored.is_empty() {
            self.persist_or_warn();
        }
        debug!("alarm restoration resolved {} records", report.restored.len());
        report
    }
}

/// Resolves one alarm against the closed window `(last_visit_ms, now_ms)`.
/// Without a last visit there is no window, so only a ring in progress is
/// resolved.
pub fn resolve_alarm<Tz>(
    alarm: &mut Alarm,
    now_ms: i64,
    last_visit_ms: Option<i64>,
    timezone: &Tz,
) -> Option<AlarmRestoreCase>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let time = alarm.time()?;

    if alarm.is_ringing {
        let (rang_at, source) = match alarm.last_triggered {
            Some(triggered) => (triggered, RangAtSource::LastTriggered),
            None => (
                latest_occurrence_at_or_before(time, last_visit_ms.unwrap_or(now_ms), timezone)
                    .unwrap_or(now_ms)
                    .min(now_ms),
                RangAtSource::Estimated,
            ),
        };
        alarm.is_ringing = false;
        alarm.rang_at = Some(rang_at);
        return Some(AlarmRestoreCase::RingingAtClose { rang_at, source });
    }

    let last_visit = last_visit_ms?;
    if !alarm.enabled || now_ms <= last_visit {
        return None;
    }
    let occurrence = latest_occurrence_at_or_before(time, now_ms - 1, timezone)?;
    let after_creation = alarm
        .created_at()
        .is_none_or(|created| occurrence > created);
    if occurrence > last_visit && after_creation {
        alarm.rang_at = Some(occurrence);
        alarm.enabled = false;
        return Some(AlarmRestoreCase::FiredWhileClosed {
            rang_at: occurrence,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use chrono_tz::America::New_York;

    use super::*;
    use crate::alarm::scheduler::DEFAULT_MAX_USER_ALARMS;
    use crate::alerts::DEFAULT_SOUND;
    use crate::runtime::testkit::Harness;

    fn utc_ms(d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(2026, 3, d, h, mi, 0)
            .single()
            .expect("valid")
            .timestamp_millis()
    }

    fn seven_am(created_ms: i64) -> Alarm {
        Alarm::user(
            "alarm-1".to_string(),
            "Wake".to_string(),
            7,
            0,
            DEFAULT_SOUND.to_string(),
            created_ms,
        )
    }

    #[test]
    fn alarm_time_inside_closed_window_disables_it() {
        let mut alarm = seven_am(utc_ms(1, 20, 0));
        let case = resolve_alarm(
            &mut alarm,
            utc_ms(2, 7, 30),
            Some(utc_ms(2, 6, 30)),
            &Utc,
        );
        assert_eq!(
            case,
            Some(AlarmRestoreCase::FiredWhileClosed {
                rang_at: utc_ms(2, 7, 0)
            })
        );
        assert!(!alarm.enabled);
        assert_eq!(alarm.rang_at, Some(utc_ms(2, 7, 0)));

        let again = resolve_alarm(
            &mut alarm,
            utc_ms(2, 7, 30),
            Some(utc_ms(2, 6, 30)),
            &Utc,
        );
        assert_eq!(again, None);
    }

    #[test]
    fn alarm_created_after_its_time_is_not_tagged() {
        let mut alarm = seven_am(utc_ms(2, 7, 10));
        let case = resolve_alarm(
            &mut alarm,
            utc_ms(2, 7, 30),
            Some(utc_ms(2, 6, 30)),
            &Utc,
        );
        assert_eq!(case, None);
        assert!(alarm.enabled);
    }

    #[test]
    fn window_outside_alarm_time_leaves_it_armed() {
        let mut alarm = seven_am(utc_ms(1, 0, 0));
        assert_eq!(
            resolve_alarm(&mut alarm, utc_ms(2, 9, 0), Some(utc_ms(2, 7, 5)), &Utc),
            None
        );
        assert_eq!(resolve_alarm(&mut alarm, utc_ms(2, 9, 0), None, &Utc), None);
        assert!(alarm.enabled);
    }

    #[test]
    fn ringing_alarm_uses_last_triggered() {
        let mut alarm = seven_am(utc_ms(1, 0, 0));
        alarm.is_ringing = true;
        alarm.last_triggered = Some(utc_ms(2, 7, 0) + 150);
        let case = resolve_alarm(&mut alarm, utc_ms(2, 8, 0), Some(utc_ms(2, 7, 1)), &Utc);
        assert_eq!(
            case,
            Some(AlarmRestoreCase::RingingAtClose {
                rang_at: utc_ms(2, 7, 0) + 150,
                source: RangAtSource::LastTriggered
            })
        );
        assert!(!alarm.is_ringing);
        assert!(alarm.enabled);
    }

    #[test]
    fn ringing_alarm_without_trigger_uses_scheduled_time() {
        let mut today = seven_am(utc_ms(1, 0, 0));
        today.is_ringing = true;
        let case = resolve_alarm(&mut today, utc_ms(2, 9, 0), Some(utc_ms(2, 7, 2)), &Utc);
        assert_eq!(
            case,
            Some(AlarmRestoreCase::RingingAtClose {
                rang_at: utc_ms(2, 7, 0),
                source: RangAtSource::Estimated
            })
        );

        let mut yesterday = seven_am(utc_ms(1, 0, 0));
        yesterday.is_ringing = true;
        let case = resolve_alarm(&mut yesterday, utc_ms(2, 9, 0), Some(utc_ms(2, 6, 50)), &Utc);
        assert_eq!(
            case,
            Some(AlarmRestoreCase::RingingAtClose {
                rang_at: utc_ms(1, 7, 0),
                source: RangAtSource::Estimated
            })
        );
    }

    #[test]
    fn nonexistent_local_time_is_not_tagged_on_spring_forward() {
        let created = New_York
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let mut alarm = Alarm::user(
            "alarm-2".to_string(),
            "Night shift".to_string(),
            2,
            30,
            DEFAULT_SOUND.to_string(),
            created,
        );
        let closed = New_York
            .with_ymd_and_hms(2026, 3, 8, 1, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let reopened = New_York
            .with_ymd_and_hms(2026, 3, 8, 4, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        assert_eq!(resolve_alarm(&mut alarm, reopened, Some(closed), &New_York), None);
        assert!(alarm.enabled);
    }

    #[test]
    fn store_restore_persists_tags() {
        let harness = Harness::new(utc_ms(2, 6, 0));
        let mut store = AlarmStore::load(harness.services(), DEFAULT_MAX_USER_ALARMS);
        let id = store.add("Wake", 7, 0, None).expect("add");

        harness.clock.set(utc_ms(2, 7, 30));
        let report = store.restore_in_tz(Some(utc_ms(2, 6, 30)), &Utc);
        assert_eq!(
            report.case_for(&id),
            Some(AlarmRestoreCase::FiredWhileClosed {
                rang_at: utc_ms(2, 7, 0)
            })
        );

        let reloaded = AlarmStore::load(harness.services(), DEFAULT_MAX_USER_ALARMS);
        let alarm = reloaded.get(&id).expect("alarm");
        assert!(!alarm.enabled);
        assert_eq!(alarm.rang_at, Some(utc_ms(2, 7, 0)));
    }
}
