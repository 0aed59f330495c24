use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, Participant, Role, StatusCounts,
};

/// Students below this attendance rate are flagged as at risk.
pub const AT_RISK_THRESHOLD: f64 = 70.0;

/// Percentage of days attended, rounded to one decimal.
pub fn attendance_rate(present_days: u32, total_days: u32) -> f64 {
    if total_days == 0 {
        return 0.0;
    }

    let attended = present_days.min(total_days) as f64;
    (attended * 1000.0 / total_days as f64).round() / 10.0
}

pub fn is_at_risk(record: &AttendanceRecord) -> bool {
    record.role == Role::Student && record.attendance_rate() < AT_RISK_THRESHOLD
}

pub fn status_counts(records: &[AttendanceRecord]) -> StatusCounts {
    let mut counts = StatusCounts::default();

    for record in records {
        match record.status {
            AttendanceStatus::Present => counts.present += 1,
            AttendanceStatus::Absent => counts.absent += 1,
            AttendanceStatus::Late => counts.late += 1,
            AttendanceStatus::Excused => counts.excused += 1,
        }
    }

    counts
}

pub fn average_rate(records: &[AttendanceRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }

    let total: f64 = records.iter().map(AttendanceRecord::attendance_rate).sum();
    (total / records.len() as f64 * 10.0).round() / 10.0
}

/// At-risk students, lowest rate first.
pub fn at_risk(records: &[AttendanceRecord]) -> Vec<&AttendanceRecord> {
    let mut flagged: Vec<&AttendanceRecord> = records.iter().filter(|r| is_at_risk(r)).collect();
    flagged.sort_by(|a, b| {
        a.attendance_rate()
            .partial_cmp(&b.attendance_rate())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    flagged
}

/// Builds one record per roster entry from the raw per-session rows.
///
/// `session_dates` are the dates the program met in the window; each date
/// counts once towards `total_days` no matter how many sessions ran on it.
pub fn roll_up(
    roster: &[Participant],
    session_dates: &[NaiveDate],
    entries: &[AttendanceEntry],
) -> Vec<AttendanceRecord> {
    let days: BTreeSet<NaiveDate> = session_dates.iter().copied().collect();
    let latest_day = days.iter().next_back().copied();

    let mut by_person: HashMap<Uuid, Vec<&AttendanceEntry>> = HashMap::new();
    for entry in entries {
        if days.contains(&entry.session_date) {
            by_person.entry(entry.person_id).or_default().push(entry);
        }
    }

    roster
        .iter()
        .map(|person| {
            let mine = by_person.get(&person.id).map(Vec::as_slice).unwrap_or(&[]);

            let attended: BTreeSet<NaiveDate> = mine
                .iter()
                .filter(|e| e.status.attended())
                .map(|e| e.session_date)
                .collect();

            let total_hours: f64 = mine
                .iter()
                .filter(|e| e.status.attended())
                .filter_map(|e| match (e.check_in, e.check_out) {
                    (Some(start), Some(end)) if end > start => {
                        Some((end - start).num_seconds() as f64 / 3600.0)
                    }
                    _ => None,
                })
                .sum();

            let latest = latest_day.and_then(|day| {
                mine.iter()
                    .filter(|e| e.session_date == day)
                    .max_by_key(|e| e.check_in)
            });
            let attended_latest = latest.filter(|e| e.status.attended());

            AttendanceRecord {
                person_id: person.id,
                name: person.name.clone(),
                email: person.email.clone(),
                role: person.role,
                program: person.program.clone(),
                sub_group: person.sub_group.clone(),
                status: latest.map_or(AttendanceStatus::Absent, |e| e.status),
                method: latest.map(|e| e.method),
                check_in: attended_latest.and_then(|e| e.check_in),
                check_out: attended_latest.and_then(|e| e.check_out),
                total_hours: (total_hours * 10.0).round() / 10.0,
                present_days: attended.len() as u32,
                total_days: days.len() as u32,
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::CheckInMethod;
    use chrono::{Duration, TimeZone, Utc};

    pub(crate) fn sample_record(
        name: &str,
        role: Role,
        present: u32,
        total: u32,
    ) -> AttendanceRecord {
        let email = format!("{}@example.com", name.to_lowercase().replace(' ', "."));
        AttendanceRecord {
            person_id: Uuid::new_v4(),
            name: name.to_string(),
            email,
            role,
            program: "Data Engineering".to_string(),
            sub_group: "Cohort A".to_string(),
            status: AttendanceStatus::Present,
            method: None,
            check_in: None,
            check_out: None,
            total_hours: 0.0,
            present_days: present,
            total_days: total,
        }
    }

    pub(crate) fn participant(name: &str) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            role: Role::Student,
            program_id: Uuid::nil(),
            program: "Data Engineering".to_string(),
            sub_group: "Cohort A".to_string(),
        }
    }

    fn entry(
        person: &Participant,
        day: NaiveDate,
        status: AttendanceStatus,
        hours: i64,
    ) -> AttendanceEntry {
        let check_in = Utc.from_utc_datetime(&day.and_hms_opt(9, 0, 0).unwrap());
        AttendanceEntry {
            person_id: person.id,
            session_date: day,
            status,
            method: CheckInMethod::Manual,
            check_in: Some(check_in),
            check_out: Some(check_in + Duration::hours(hours)),
        }
    }

    #[test]
    fn zero_total_days_yields_zero_rate() {
        assert_eq!(attendance_rate(0, 0), 0.0);
        assert_eq!(attendance_rate(5, 0), 0.0);
        assert!(attendance_rate(0, 0).is_finite());
    }

    #[test]
    fn rate_is_clamped_when_present_exceeds_total() {
        assert_eq!(attendance_rate(12, 10), 100.0);
    }

    #[test]
    fn rates_and_risk_flags_for_two_students() {
        let records = vec![
            sample_record("Avery Lee", Role::Student, 17, 20),
            sample_record("Jules Moreno", Role::Student, 10, 15),
        ];

        let rates: Vec<f64> = records.iter().map(|r| r.attendance_rate()).collect();
        let flags: Vec<bool> = records.iter().map(is_at_risk).collect();

        assert_eq!(rates, vec![85.0, 66.7]);
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn facilitators_are_never_at_risk() {
        let record = sample_record("Kiara Patel", Role::Facilitator, 1, 20);
        assert!(!is_at_risk(&record));
    }

    #[test]
    fn exactly_threshold_is_not_at_risk() {
        let record = sample_record("Avery Lee", Role::Student, 7, 10);
        assert_eq!(record.attendance_rate(), 70.0);
        assert!(!is_at_risk(&record));
    }

    #[test]
    fn counts_by_status() {
        let mut late = sample_record("Late Larry", Role::Student, 1, 2);
        late.status = AttendanceStatus::Late;
        let mut absent = sample_record("Absent Ann", Role::Student, 0, 2);
        absent.status = AttendanceStatus::Absent;
        let records = vec![sample_record("Avery Lee", Role::Student, 2, 2), late, absent];

        let counts = status_counts(&records);
        assert_eq!(
            counts,
            StatusCounts {
                present: 1,
                absent: 1,
                late: 1,
                excused: 0
            }
        );
    }

    #[test]
    fn average_of_empty_is_zero() {
        assert_eq!(average_rate(&[]), 0.0);
    }

    #[test]
    fn at_risk_sorted_lowest_first() {
        let records = vec![
            sample_record("Mid", Role::Student, 6, 10),
            sample_record("Low", Role::Student, 2, 10),
            sample_record("Fine", Role::Student, 9, 10),
        ];
        let names: Vec<&str> = at_risk(&records).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Low", "Mid"]);
    }

    #[test]
    fn roll_up_counts_distinct_days_and_latest_status() {
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        let day3 = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let avery = participant("Avery");
        let jules = participant("Jules");

        let entries = vec![
            entry(&avery, day1, AttendanceStatus::Present, 2),
            entry(&avery, day2, AttendanceStatus::Late, 1),
            entry(&avery, day3, AttendanceStatus::Excused, 0),
            entry(&jules, day1, AttendanceStatus::Present, 3),
        ];

        let records = roll_up(&[avery.clone(), jules.clone()], &[day1, day2, day3, day3], &entries);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Avery");
        assert_eq!(records[0].present_days, 2);
        assert_eq!(records[0].total_days, 3);
        assert_eq!(records[0].status, AttendanceStatus::Excused);
        assert!((records[0].total_hours - 3.0).abs() < 0.001);

        assert_eq!(records[1].present_days, 1);
        assert_eq!(records[1].status, AttendanceStatus::Absent);
        assert_eq!(records[1].check_in, None);
    }

    #[test]
    fn absent_rows_with_stale_times_add_no_hours_or_check_in() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let avery = participant("Avery");
        let stale = entry(&avery, day, AttendanceStatus::Absent, 2);

        let records = roll_up(&[avery], &[day], &[stale]);

        assert_eq!(records[0].status, AttendanceStatus::Absent);
        assert_eq!(records[0].check_in, None);
        assert_eq!(records[0].check_out, None);
        assert_eq!(records[0].total_hours, 0.0);
    }

    #[test]
    fn roll_up_without_sessions_reports_zero_days() {
        let avery = participant("Avery");
        let records = roll_up(&[avery], &[], &[]);
        assert_eq!(records[0].total_days, 0);
        assert_eq!(records[0].attendance_rate(), 0.0);
    }
}
