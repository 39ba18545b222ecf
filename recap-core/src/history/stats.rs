use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;

use super::VideoEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total_weekly: f64,
    pub total_monthly: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBucket {
    pub total_seconds: f64,
    pub entries: Vec<VideoEvent>,
}

fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            // Midnight skipped by a DST jump.
            let one_am = date.and_hms_opt(1, 0, 0)?;
            tz.from_local_datetime(&one_am).earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn start_of_week<Tz: TimeZone>(now: &DateTime<Tz>, week_start: Weekday) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let days_back = (today.weekday().num_days_from_monday() + 7
        - week_start.num_days_from_monday())
        % 7;
    let first_day = today.checked_sub_days(Days::new(u64::from(days_back)))?;
    local_midnight(&now.timezone(), first_day)
}

pub fn start_of_month<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let first_day = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
    local_midnight(&now.timezone(), first_day)
}

/// Sums durations recorded since the start of the current week and month,
/// with calendar boundaries taken in `now`'s time zone. Events whose
/// timestamp does not parse are ignored.
pub fn compute_stats<Tz: TimeZone>(
    videos: &[VideoEvent],
    now: &DateTime<Tz>,
    week_start: Weekday,
) -> AggregateStats {
    let week = start_of_week(now, week_start);
    let month = start_of_month(now);
    let mut stats = AggregateStats::default();
    for video in videos {
        let Some(recorded) = video.recorded_at() else {
            continue;
        };
        if week.is_some_and(|start| recorded >= start) {
            stats.total_weekly += video.duration;
        }
        if month.is_some_and(|start| recorded >= start) {
            stats.total_monthly += video.duration;
        }
    }
    stats
}

/// Groups events by UTC calendar day (`YYYY-MM-DD`).
pub fn daily_totals(videos: &[VideoEvent]) -> BTreeMap<String, DailyBucket> {
    let mut days: BTreeMap<String, DailyBucket> = BTreeMap::new();
    for video in videos {
        let Some(recorded) = video.recorded_at() else {
            continue;
        };
        let bucket = days
            .entry(recorded.format("%Y-%m-%d").to_string())
            .or_default();
        bucket.total_seconds += video.duration;
        bucket.entries.push(video.clone());
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn video(ts: DateTime<Utc>, duration: f64) -> VideoEvent {
        VideoEvent::at(
            format!("/clips/{}/video.mp4", ts.timestamp()).into(),
            duration,
            "Hades",
            ts,
        )
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekly_and_monthly_windows_with_monday_start() {
        // Wednesday.
        let now = utc(2024, 5, 15, 12, 0);
        let videos = vec![
            video(utc(2024, 5, 13, 0, 0), 100.0),
            video(utc(2024, 5, 7, 12, 0), 20.0),
            video(utc(2024, 4, 30, 23, 59), 3.0),
            video(utc(2024, 2, 14, 9, 0), 4000.0),
            video(utc(2024, 5, 12, 23, 59), 7.0),
        ];
        let stats = compute_stats(&videos, &now, Weekday::Mon);
        assert_eq!(stats.total_weekly, 100.0);
        assert_eq!(stats.total_monthly, 127.0);
    }

    #[test]
    fn sunday_start_includes_the_weekend() {
        let now = utc(2024, 5, 15, 12, 0);
        let videos = vec![
            video(utc(2024, 5, 12, 0, 0), 7.0),
            video(utc(2024, 5, 11, 23, 59), 9.0),
        ];
        let stats = compute_stats(&videos, &now, Weekday::Sun);
        assert_eq!(stats.total_weekly, 7.0);
        assert_eq!(stats.total_monthly, 16.0);
    }

    #[test]
    fn week_crossing_month_boundary() {
        // Friday 3 May; the week began in April.
        let now = utc(2024, 5, 3, 8, 0);
        let videos = vec![
            video(utc(2024, 4, 29, 10, 0), 50.0),
            video(utc(2024, 5, 2, 10, 0), 5.0),
            video(utc(2024, 4, 25, 10, 0), 1.0),
        ];
        let stats = compute_stats(&videos, &now, Weekday::Mon);
        assert_eq!(stats.total_weekly, 55.0);
        assert_eq!(stats.total_monthly, 5.0);
    }

    #[test]
    fn boundaries_follow_the_clock_time_zone() {
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        // Local Monday midnight is 03:00 UTC.
        let now = offset.with_ymd_and_hms(2024, 5, 13, 0, 30, 0).unwrap();
        let videos = vec![
            video(utc(2024, 5, 13, 3, 10), 11.0),
            video(utc(2024, 5, 13, 2, 50), 13.0),
        ];
        let stats = compute_stats(&videos, &now, Weekday::Mon);
        assert_eq!(stats.total_weekly, 11.0);
    }

    #[test]
    fn unparseable_timestamps_are_ignored() {
        let mut broken = video(utc(2024, 5, 14, 0, 0), 10.0);
        broken.timestamp = "yesterday".into();
        let stats = compute_stats(&[broken.clone()], &utc(2024, 5, 15, 0, 0), Weekday::Mon);
        assert_eq!(stats, AggregateStats::default());
        assert!(daily_totals(&[broken]).is_empty());
    }

    #[test]
    fn daily_totals_group_by_utc_day() {
        let videos = vec![
            video(utc(2024, 5, 14, 1, 0), 10.0),
            video(utc(2024, 5, 14, 23, 0), 5.0),
            video(utc(2024, 5, 15, 0, 0), 1.0),
        ];
        let days = daily_totals(&videos);
        assert_eq!(days.len(), 2);
        assert_eq!(days["2024-05-14"].total_seconds, 15.0);
        assert_eq!(days["2024-05-14"].entries.len(), 2);
        assert_eq!(days["2024-05-15"].total_seconds, 1.0);
    }
}
