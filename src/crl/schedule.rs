use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Utc};
use thiserror::Error;

/// Errors produced while parsing a daily update list
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("daily update list is empty")]
    Empty,

    #[error("invalid update time '{0}', expected H:MM")]
    InvalidTime(String),

    #[error("update times must be strictly increasing within a day: '{0}'")]
    NotIncreasing(String),
}

/// A single time of day at which a CRL is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySlot {
    pub minute_of_day: u32,
    /// Slot only produces a delta CRL in the extended schedule.
    pub delta_only: bool,
}

impl DailySlot {
    fn offset(&self) -> Duration {
        Duration::minutes(i64::from(self.minute_of_day))
    }
}

/// Parsed daily update list.
///
/// Days are separated by `;` and cycle, times within a day by `,`. A time
/// prefixed with `*` only produces a delta CRL, which turns the list into
/// the extended form where each day's full CRL is tied to the unmarked slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule {
    days: Vec<Vec<DailySlot>>,
    extended: bool,
}

impl DailySchedule {
    pub fn days(&self) -> &[Vec<DailySlot>] {
        &self.days
    }

    pub fn day_count(&self) -> usize {
        self.days.len()
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Number of slots across all days.
    pub fn slot_count(&self) -> usize {
        self.days.iter().map(Vec::len).sum()
    }

    fn single_slot(&self) -> Option<DailySlot> {
        match self.days.as_slice() {
            [day] if day.len() == 1 => Some(day[0]),
            _ => None,
        }
    }
}

impl FromStr for DailySchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut days = Vec::new();
        let mut extended = false;

        for day in s.split(';') {
            let mut slots: Vec<DailySlot> = Vec::new();
            for token in day.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let (delta_only, time) = match token.strip_prefix('*') {
                    Some(rest) => (true, rest.trim()),
                    None => (false, token),
                };
                let minute_of_day = parse_time_of_day(time)
                    .ok_or_else(|| ScheduleError::InvalidTime(token.to_string()))?;
                if slots
                    .last()
                    .is_some_and(|prev| minute_of_day <= prev.minute_of_day)
                {
                    return Err(ScheduleError::NotIncreasing(day.trim().to_string()));
                }
                extended |= delta_only;
                slots.push(DailySlot {
                    minute_of_day,
                    delta_only,
                });
            }
            days.push(slots);
        }

        if days.iter().all(Vec::is_empty) {
            return Err(ScheduleError::Empty);
        }
        Ok(Self { days, extended })
    }
}

fn parse_time_of_day(time: &str) -> Option<u32> {
    let (hours, minutes) = time.split_once(':')?;
    if hours.is_empty() || minutes.len() != 2 {
        return None;
    }
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

/// Inputs for a next-update computation
#[derive(Debug, Clone, Copy)]
pub struct NextUpdateQuery {
    /// Schedule the following tick from the last update, as the update loop does.
    pub from_last_update: bool,
    /// Compute the delta CRL's nextUpdate rather than the full CRL's.
    pub delta: bool,
    pub delta_enabled: bool,
    pub now: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub current_day: usize,
}

/// The next scheduled point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub at: DateTime<Utc>,
    pub day: usize,
    pub delta_only: bool,
}

/// Effective update schedule of an issuing point
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub interval: Option<Duration>,
    pub daily: Option<DailySchedule>,
    pub min_update_interval: Duration,
    pub update_schema: u32,
    pub extended_next_update: bool,
    pub grace_period: Duration,
    pub next_as_this_update_extension: Duration,
    pub utc_offset: FixedOffset,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: None,
            daily: None,
            min_update_interval: Duration::zero(),
            update_schema: 1,
            extended_next_update: true,
            grace_period: Duration::zero(),
            next_as_this_update_extension: Duration::zero(),
            utc_offset: Utc.fix(),
        }
    }
}

impl Schedule {
    /// No automatic trigger is configured.
    pub fn is_manual(&self) -> bool {
        self.interval.is_none() && self.daily.is_none()
    }

    pub fn is_extended_daily(&self) -> bool {
        self.daily.as_ref().is_some_and(DailySchedule::is_extended)
    }

    /// Number of update cycles between two full CRLs.
    pub fn cycle_length(&self, delta_enabled: bool) -> u32 {
        if !delta_enabled {
            return 1;
        }
        match &self.daily {
            Some(daily) if daily.is_extended() => {
                u32::try_from(daily.slot_count()).unwrap_or(1).max(1)
            }
            _ => self.update_schema.max(1),
        }
    }

    /// Computes the next scheduled update.
    ///
    /// The result excludes the grace period; see [`Schedule::next_update_times`]
    /// for the values written into a CRL.
    pub fn find_next_update(&self, query: &NextUpdateQuery) -> Option<ScheduledSlot> {
        let last = query.last_update.unwrap_or(query.now);
        let full_only = self.extended_next_update
            && !query.from_last_update
            && !query.delta
            && query.delta_enabled;
        let multiplier = if full_only && self.update_schema > 1 {
            i32::try_from(self.update_schema).unwrap_or(i32::MAX)
        } else {
            1
        };

        // Overflowing arithmetic yields no next update.
        let Some(daily) = &self.daily else {
            let interval = self.interval?;
            return Some(ScheduledSlot {
                at: last.checked_add_signed(interval.checked_mul(multiplier)?)?,
                day: query.current_day,
                delta_only: false,
            });
        };

        let local = last.with_timezone(&self.utc_offset);
        let since_midnight = local.time().signed_duration_since(NaiveTime::MIN);
        let start_of_day = last - since_midnight;
        let one_day = Duration::days(1);
        let is_due = |offset: Duration| {
            offset
                .checked_sub(&self.min_update_interval)
                .is_some_and(|left| left > since_midnight)
        };

        if let (Some(interval), Some(first)) = (self.interval, daily.single_slot()) {
            let step = interval.checked_mul(multiplier)?;
            let mut offset = first.offset();
            while offset < one_day {
                if is_due(offset) {
                    return Some(ScheduledSlot {
                        at: start_of_day.checked_add_signed(offset)?,
                        day: 0,
                        delta_only: false,
                    });
                }
                match offset.checked_add(&step) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
            return Some(ScheduledSlot {
                at: start_of_day.checked_add_signed(one_day + first.offset())?,
                day: 0,
                delta_only: false,
            });
        }

        let skip = |slot: &DailySlot| full_only && daily.is_extended() && slot.delta_only;
        let days = daily.days();
        let today = query.current_day % days.len();

        if let Some(slot) = days[today]
            .iter()
            .filter(|slot| !skip(slot))
            .find(|slot| is_due(slot.offset()))
        {
            return Some(ScheduledSlot {
                at: start_of_day.checked_add_signed(slot.offset())?,
                day: today,
                delta_only: slot.delta_only,
            });
        }

        for ahead in 1..=days.len() {
            let day = (today + ahead) % days.len();
            if let Some(slot) = days[day].iter().find(|slot| !skip(slot)) {
                let days_ahead = i32::try_from(ahead).unwrap_or(i32::MAX);
                return Some(ScheduledSlot {
                    at: start_of_day.checked_add_signed(one_day * days_ahead + slot.offset())?,
                    day,
                    delta_only: slot.delta_only,
                });
            }
        }
        None
    }

    /// Returns `(nextUpdate, deltaNextUpdate)` for CRLs issued at `this_update`.
    pub fn next_update_times(
        &self,
        this_update: DateTime<Utc>,
        current_day: usize,
        delta_enabled: bool,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let extend = |slot: ScheduledSlot| {
            slot.at
                .checked_add_signed(self.grace_period)?
                .checked_add_signed(self.next_as_this_update_extension)
        };
        let query = |delta| NextUpdateQuery {
            from_last_update: false,
            delta,
            delta_enabled,
            now: this_update,
            last_update: Some(this_update),
            current_day,
        };

        let full = self.find_next_update(&query(false)).and_then(extend);
        let delta = if delta_enabled {
            self.find_next_update(&query(true)).and_then(extend)
        } else {
            None
        };
        (full, delta)
    }

    /// Advances the daily cycle position by the number of local days elapsed.
    pub fn advance_day(
        &self,
        current_day: usize,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(daily) = &self.daily else {
            return 0;
        };
        let Some(previous) = previous else {
            return current_day % daily.day_count();
        };
        let elapsed = now
            .with_timezone(&self.utc_offset)
            .date_naive()
            .signed_duration_since(previous.with_timezone(&self.utc_offset).date_naive())
            .num_days()
            .max(0);
        let elapsed = usize::try_from(elapsed).unwrap_or(0) % daily.day_count();
        (current_day + elapsed) % daily.day_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    fn daily(list: &str) -> Schedule {
        Schedule {
            daily: Some(list.parse().unwrap()),
            ..Schedule::default()
        }
    }

    fn query(last: DateTime<Utc>, current_day: usize) -> NextUpdateQuery {
        NextUpdateQuery {
            from_last_update: true,
            delta: false,
            delta_enabled: false,
            now: last,
            last_update: Some(last),
            current_day,
        }
    }

    #[test]
    fn test_parse_daily_updates() {
        let schedule: DailySchedule = "1:00,5:30;*2:00,23:59".parse().unwrap();
        assert_eq!(schedule.day_count(), 2);
        assert_eq!(schedule.slot_count(), 4);
        assert!(schedule.is_extended());
        assert_eq!(schedule.days()[1][0].minute_of_day, 120);
        assert!(schedule.days()[1][0].delta_only);

        assert!(!"3:45".parse::<DailySchedule>().unwrap().is_extended());
    }

    #[test]
    fn test_parse_rejects_malformed_lists() {
        assert_eq!(
            "5:00,4:00".parse::<DailySchedule>(),
            Err(ScheduleError::NotIncreasing("5:00,4:00".to_string()))
        );
        assert_eq!(
            "1:00,1:00".parse::<DailySchedule>(),
            Err(ScheduleError::NotIncreasing("1:00,1:00".to_string()))
        );
        assert_eq!(
            "24:00".parse::<DailySchedule>(),
            Err(ScheduleError::InvalidTime("24:00".to_string()))
        );
        assert!(matches!(
            "1:5".parse::<DailySchedule>(),
            Err(ScheduleError::InvalidTime(_))
        ));
        assert_eq!(" ; ".parse::<DailySchedule>(), Err(ScheduleError::Empty));
    }

    #[test]
    fn test_interval_only() {
        let schedule = Schedule {
            interval: Some(Duration::minutes(60)),
            ..Schedule::default()
        };
        let next = schedule.find_next_update(&query(at(1, 10, 0), 0)).unwrap();
        assert_eq!(next.at, at(1, 11, 0));
    }

    #[test]
    fn test_interval_full_crl_spans_schema() {
        let schedule = Schedule {
            interval: Some(Duration::minutes(60)),
            update_schema: 4,
            ..Schedule::default()
        };
        let (full, delta) = schedule.next_update_times(at(1, 10, 0), 0, true);
        assert_eq!(full, Some(at(1, 14, 0)));
        assert_eq!(delta, Some(at(1, 11, 0)));

        let (full, delta) = schedule.next_update_times(at(1, 10, 0), 0, false);
        assert_eq!(full, Some(at(1, 11, 0)));
        assert_eq!(delta, None);
    }

    #[test]
    fn test_daily_single_time_rolls_to_tomorrow() {
        let schedule = daily("3:45");
        let next = schedule.find_next_update(&query(at(1, 3, 45), 0)).unwrap();
        assert_eq!(next.at, at(2, 3, 45));
    }

    #[test]
    fn test_daily_picks_next_slot_today() {
        let schedule = daily("1:00,6:00,18:00");
        let next = schedule.find_next_update(&query(at(1, 7, 0), 0)).unwrap();
        assert_eq!(next.at, at(1, 18, 0));
    }

    #[test]
    fn test_daily_cycles_through_days() {
        let schedule = daily("1:00;2:00");
        let next = schedule.find_next_update(&query(at(1, 5, 0), 0)).unwrap();
        assert_eq!(next.at, at(2, 2, 0));
        assert_eq!(next.day, 1);

        let next = schedule.find_next_update(&query(at(2, 5, 0), 1)).unwrap();
        assert_eq!(next.at, at(3, 1, 0));
        assert_eq!(next.day, 0);
    }

    #[test]
    fn test_min_update_interval_skips_close_slots() {
        let mut schedule = daily("3:45,4:00");
        schedule.min_update_interval = Duration::minutes(30);
        let next = schedule.find_next_update(&query(at(1, 3, 45), 0)).unwrap();
        assert_eq!(next.at, at(2, 3, 45));
    }

    #[test]
    fn test_daily_start_with_interval() {
        let mut schedule = daily("1:00");
        schedule.interval = Some(Duration::hours(6));
        let next = schedule.find_next_update(&query(at(1, 7, 30), 0)).unwrap();
        assert_eq!(next.at, at(1, 13, 0));

        let next = schedule.find_next_update(&query(at(1, 19, 0), 0)).unwrap();
        assert_eq!(next.at, at(2, 1, 0));
    }

    #[test]
    fn test_extended_full_update_skips_delta_slots() {
        let schedule = daily("1:00,*5:00,*9:00");
        let (full, delta) = schedule.next_update_times(at(1, 1, 0), 0, true);
        assert_eq!(full, Some(at(2, 1, 0)));
        assert_eq!(delta, Some(at(1, 5, 0)));
        assert_eq!(schedule.cycle_length(true), 3);
        assert_eq!(schedule.cycle_length(false), 1);
    }

    #[test]
    fn test_local_timezone_offset() {
        let mut schedule = daily("0:30");
        schedule.utc_offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap();
        let next = schedule.find_next_update(&query(last, 0)).unwrap();
        assert_eq!(next.at, Utc.with_ymd_and_hms(2024, 1, 1, 22, 30, 0).unwrap());
    }

    #[test]
    fn test_grace_period_is_added() {
        let schedule = Schedule {
            interval: Some(Duration::minutes(60)),
            grace_period: Duration::minutes(10),
            next_as_this_update_extension: Duration::minutes(5),
            ..Schedule::default()
        };
        let (full, _) = schedule.next_update_times(at(1, 10, 0), 0, false);
        assert_eq!(full, Some(at(1, 11, 15)));
    }

    #[test]
    fn test_overflowing_durations_yield_no_update() {
        let schedule = Schedule {
            interval: Some(Duration::MAX),
            update_schema: 4,
            ..Schedule::default()
        };
        assert!(schedule.find_next_update(&query(at(1, 10, 0), 0)).is_none());
        assert_eq!(schedule.next_update_times(at(1, 10, 0), 0, true), (None, None));

        let schedule = Schedule {
            grace_period: Duration::MAX,
            ..daily("1:00")
        };
        assert_eq!(schedule.next_update_times(at(1, 10, 0), 0, false), (None, None));
    }

    #[test]
    fn test_huge_intervals_fall_back_to_daily_slots() {
        let schedule = Schedule {
            interval: Some(Duration::MAX),
            ..daily("1:00")
        };
        let next = schedule.find_next_update(&query(at(1, 10, 0), 0)).unwrap();
        assert_eq!(next.at, at(2, 1, 0));

        let schedule = Schedule {
            min_update_interval: Duration::MAX,
            ..daily("1:00,5:00")
        };
        let next = schedule.find_next_update(&query(at(1, 10, 0), 0)).unwrap();
        assert_eq!(next.at, at(2, 1, 0));
    }

    #[test]
    fn test_advance_day() {
        let schedule = daily("1:00;2:00;3:00");
        assert_eq!(schedule.advance_day(0, Some(at(1, 23, 0)), at(2, 1, 0)), 1);
        assert_eq!(schedule.advance_day(2, Some(at(1, 1, 0)), at(2, 1, 0)), 0);
        assert_eq!(schedule.advance_day(1, Some(at(1, 1, 0)), at(1, 9, 0)), 1);
        assert_eq!(Schedule::default().advance_day(5, None, at(1, 0, 0)), 0);
    }

    #[test]
    fn test_manual_schedule_has_no_next_update() {
        let schedule = Schedule::default();
        assert!(schedule.is_manual());
        assert_eq!(schedule.next_update_times(at(1, 0, 0), 0, true), (None, None));
    }
}
