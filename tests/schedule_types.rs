//! tests/schedule_types.rs
//! Fire-time calculation for every schedule type, and job definition defaults.

mod common;

use common::counting_handler;
use cronkeeper::{ExecutionStatus, JobDefinition, JobPriority, Schedule, TriggerSource};

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

#[test]
fn test_cron_five_field_in_utc() {
  let schedule = Schedule::Cron("0 9 * * *".into());
  let reference = Utc.with_ymd_and_hms(2024, 3, 10, 8, 30, 0).unwrap();

  let next = schedule.next_fire(reference, Tz::UTC).unwrap();
  assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());

  // Strictly after the reference.
  let after = schedule.next_fire(next, Tz::UTC).unwrap();
  assert_eq!(after, Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap());
}

#[test]
fn test_cron_evaluated_in_job_timezone() {
  // 09:00 in Riyadh (UTC+3, no DST) is 06:00 UTC.
  let schedule = Schedule::Cron("0 9 * * *".into());
  let reference = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
  let next = schedule.next_fire(reference, chrono_tz::Asia::Riyadh).unwrap();
  assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap());

  // Same expression in New York follows daylight saving time.
  let summer = schedule.next_fire(reference, chrono_tz::America::New_York).unwrap();
  assert_eq!(summer, Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
  let winter_reference = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
  let winter = schedule
    .next_fire(winter_reference, chrono_tz::America::New_York)
    .unwrap();
  assert_eq!(winter, Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap());
}

#[test]
fn test_cron_extended_form_accepted() {
  // Seconds field present: every 30 seconds.
  let schedule = Schedule::Cron("*/30 * * * * *".into());
  assert!(schedule.validate().is_ok());
  let reference = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
  assert_eq!(
    schedule.next_fire(reference, Tz::UTC),
    Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap())
  );
}

#[test]
fn test_invalid_cron_has_no_fire() {
  let schedule = Schedule::Cron("61 * * * *".into());
  assert!(schedule.validate().is_err());
  assert_eq!(schedule.next_fire(Utc::now(), Tz::UTC), None);
}

#[test]
fn test_fixed_interval_once_and_never() {
  let reference = Utc.with_ymd_and_hms(2024, 5, 5, 12, 0, 0).unwrap();

  let interval = Schedule::FixedInterval(Duration::from_secs(90));
  assert_eq!(
    interval.next_fire(reference, Tz::UTC),
    Some(Utc.with_ymd_and_hms(2024, 5, 5, 12, 1, 30).unwrap())
  );
  assert!(Schedule::FixedInterval(Duration::ZERO).validate().is_err());

  let at = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
  let once = Schedule::Once(at);
  assert_eq!(once.next_fire(reference, Tz::UTC), Some(at));
  assert_eq!(once.next_fire(at, Tz::UTC), None);

  assert_eq!(Schedule::Never.next_fire(reference, Tz::UTC), None);
  assert!(Schedule::Never.validate().is_ok());
}

#[test]
fn test_schedule_display() {
  assert_eq!(Schedule::Cron("0 9 * * *".into()).to_string(), "cron(0 9 * * *)");
  assert_eq!(Schedule::Never.to_string(), "never");
  assert_eq!(Schedule::FixedInterval(Duration::from_secs(5)).to_string(), "every 5s");
}

#[test]
fn test_job_definition_defaults() {
  let job = JobDefinition::new(
    "defaults",
    Schedule::Never,
    counting_handler(Arc::new(AtomicUsize::new(0))),
  );
  assert!(job.enabled);
  assert_eq!(job.priority, JobPriority::Medium);
  assert_eq!(job.timezone, Tz::UTC);
  assert_eq!(job.timeout, Duration::from_secs(300));
  assert_eq!(job.retry_attempts, 3);
  assert_eq!(job.retry_delay, Duration::from_secs(60));
  assert!(job.description.is_empty());

  let job = job.with_timezone_name("Europe/Berlin").unwrap();
  assert_eq!(job.timezone, chrono_tz::Europe::Berlin);
  assert!(job.with_timezone_name("Mars/Olympus_Mons").is_err());
}

#[test]
fn test_job_next_fire_uses_its_timezone() {
  let job = JobDefinition::new(
    "riyadh-morning",
    Schedule::Cron("0 9 * * *".into()),
    counting_handler(Arc::new(AtomicUsize::new(0))),
  )
  .with_timezone(chrono_tz::Asia::Riyadh);
  let reference = Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap();
  assert_eq!(
    job.next_fire_after(reference),
    Some(Utc.with_ymd_and_hms(2024, 6, 2, 6, 0, 0).unwrap())
  );
}

#[test]
fn test_priority_ordering() {
  assert!(JobPriority::Critical > JobPriority::High);
  assert!(JobPriority::High > JobPriority::Medium);
  assert!(JobPriority::Medium > JobPriority::Low);
}

#[test]
fn test_trigger_and_status_strings() {
  assert_eq!(TriggerSource::Schedule.to_string(), "schedule");
  assert_eq!(TriggerSource::Manual.to_string(), "manual");
  assert_eq!(TriggerSource::Retry { attempt: 2 }.to_string(), "retry#2");

  for status in [
    ExecutionStatus::Running,
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
    ExecutionStatus::Timeout,
  ] {
    assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
  }
  assert!("exploded".parse::<ExecutionStatus>().is_err());
  assert!(!ExecutionStatus::Running.is_final());
  assert!(ExecutionStatus::Timeout.is_failure());
  assert!(!ExecutionStatus::Completed.is_failure());
}
