use std::fmt::Write;

use chrono::NaiveDate;

use crate::aggregate;
use crate::models::AttendanceRecord;

pub fn build_report(label: &str, since: NaiveDate, records: &[AttendanceRecord]) -> String {
    let counts = aggregate::status_counts(records);
    let flagged = aggregate::at_risk(records);

    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Report");
    let _ = writeln!(output, "Generated for {} (sessions since {})", label, since);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Mix");

    if records.is_empty() {
        let _ = writeln!(output, "No participants in this window.");
    } else {
        let _ = writeln!(output, "- present: {}", counts.present);
        let _ = writeln!(output, "- late: {}", counts.late);
        let _ = writeln!(output, "- absent: {}", counts.absent);
        let _ = writeln!(output, "- excused: {}", counts.excused);
        let _ = writeln!(
            output,
            "- average attendance: {:.1}%",
            aggregate::average_rate(records)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## At-Risk Students");

    if flagged.is_empty() {
        let _ = writeln!(
            output,
            "No students below {:.0}% attendance.",
            aggregate::AT_RISK_THRESHOLD
        );
    } else {
        for record in flagged.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}, {} / {}) {:.1}% over {}/{} days",
                record.name,
                record.email,
                record.program,
                record.sub_group,
                record.attendance_rate(),
                record.present_days,
                record.total_days
            );
        }
    }

    let open: Vec<&AttendanceRecord> = records
        .iter()
        .filter(|r| r.check_in.is_some() && r.check_out.is_none())
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Check-ins");

    if open.is_empty() {
        let _ = writeln!(output, "Everyone who checked in has checked out.");
    } else {
        for record in open {
            if let Some(check_in) = record.check_in {
                let _ = writeln!(
                    output,
                    "- {} since {}",
                    record.name,
                    check_in.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::sample_record;
    use crate::models::Role;

    #[test]
    fn lists_at_risk_students_only() {
        let records = vec![
            sample_record("Avery Lee", Role::Student, 17, 20),
            sample_record("Jules Moreno", Role::Student, 10, 15),
            sample_record("Sam Okafor", Role::Facilitator, 1, 15),
        ];
        let since = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        let report = build_report("Data Engineering", since, &records);

        assert!(report.contains("sessions since 2026-03-01"));
        assert!(report.contains("- present: 3"));
        assert!(report.contains("Jules Moreno"));
        assert!(report.contains("66.7% over 10/15 days"));
        let at_risk = report.split("## At-Risk Students").nth(1).unwrap();
        assert!(!at_risk.contains("Avery Lee"));
        assert!(!at_risk.contains("Sam Okafor"));
    }

    #[test]
    fn empty_window_renders_empty_states() {
        let since = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let report = build_report("all programs", since, &[]);
        assert!(report.contains("No participants in this window."));
        assert!(report.contains("No students below 70% attendance."));
    }
}
