use std::io::Write;

use chrono::{DateTime, Utc};
use csv::{QuoteStyle, WriterBuilder};

use crate::models::AttendanceRecord;

pub const COLUMNS: [&str; 10] = [
    "Name",
    "Email",
    "Type",
    "Program",
    "Status",
    "Check-in",
    "Check-out",
    "Hours",
    "Attendance Rate",
    "Present/Total Days",
];

fn clock(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn row(record: &AttendanceRecord) -> [String; 10] {
    [
        record.name.clone(),
        record.email.clone(),
        record.role.to_string(),
        record.program.clone(),
        record.status.to_string(),
        clock(record.check_in),
        clock(record.check_out),
        format!("{:.1}", record.total_hours),
        format!("{:.1}%", record.attendance_rate()),
        format!("{}/{}", record.present_days, record.total_days),
    ]
}

/// Writes the records as CSV with every field quoted. Returns the row count.
pub fn write_csv<'a, W, I>(writer: W, records: I) -> anyhow::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a AttendanceRecord>,
{
    let mut csv = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(writer);

    csv.write_record(COLUMNS)?;

    let mut written = 0usize;
    for record in records {
        csv.write_record(row(record))?;
        written += 1;
    }

    csv.flush()?;
    Ok(written)
}
