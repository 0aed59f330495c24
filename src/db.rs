use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    AttendanceEntry, AttendanceStatus, CheckInMethod, Participant, Program, Role, Session,
};
use crate::qr::{self, QrError, QrPayload, QrTicket};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn upsert_program(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO attendance_monitor.programs (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_participant(
    pool: &PgPool,
    program_id: Uuid,
    name: &str,
    email: &str,
    role: Role,
    sub_group: &str,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO attendance_monitor.participants
        (id, program_id, full_name, email, role, sub_group)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (email) DO UPDATE
        SET program_id = EXCLUDED.program_id,
            full_name = EXCLUDED.full_name,
            role = EXCLUDED.role,
            sub_group = EXCLUDED.sub_group
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(program_id)
    .bind(name)
    .bind(email)
    .bind(role.as_str())
    .bind(sub_group)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let programs = vec![
        (
            "Data Engineering",
            vec![("Cohort A", "Pipelines"), ("Cohort A", "Analytics"), ("Cohort B", "Platform")],
        ),
        ("Product Design", vec![("Studio 1", "Research"), ("Studio 1", "Prototyping")]),
    ];

    for (name, sub_groups) in &programs {
        let program_id = upsert_program(pool, name).await?;
        for (group, track) in sub_groups {
            sqlx::query(
                r#"
                INSERT INTO attendance_monitor.program_sub_groups (program_id, name, track)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(program_id)
            .bind(*group)
            .bind(*track)
            .execute(pool)
            .await?;
        }
    }

    let people = vec![
        ("Avery Lee", Role::Student, "Data Engineering", "Cohort A"),
        ("Jules Moreno", Role::Student, "Data Engineering", "Cohort A"),
        ("Kiara Patel", Role::Student, "Data Engineering", "Cohort B"),
        ("Sam Okafor", Role::Facilitator, "Data Engineering", "Cohort A"),
        ("Mina Cho", Role::Student, "Product Design", "Studio 1"),
        ("Theo Grant", Role::Facilitator, "Product Design", "Studio 1"),
    ];

    for (name, role, program, sub_group) in &people {
        let email = format!("{}@example.org", name.to_lowercase().replace(' ', "."));
        let program_id = upsert_program(pool, program).await?;
        upsert_participant(pool, program_id, name, &email, *role, sub_group).await?;
    }

    let today = Utc::now().date_naive();
    for (program, _) in &programs {
        let program_id = upsert_program(pool, program).await?;
        let existing: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM attendance_monitor.sessions WHERE program_id = $1",
        )
        .bind(program_id)
        .fetch_one(pool)
        .await?
        .get("n");
        if existing > 0 {
            debug!(program = *program, "sessions already seeded");
            continue;
        }

        let roster = fetch_roster(pool, Some(*program)).await?;
        for day in 1..=10i64 {
            let date = today - Duration::days(day);
            let starts_at = Utc.from_utc_datetime(
                &date
                    .and_hms_opt(9, 0, 0)
                    .context("invalid session start")?,
            );
            let session_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO attendance_monitor.sessions (id, program_id, starts_at, ends_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(session_id)
            .bind(program_id)
            .bind(starts_at)
            .bind(starts_at + Duration::hours(3))
            .execute(pool)
            .await?;

            for (index, person) in roster.iter().enumerate() {
                let status = seeded_status(day, index as i64);
                let (check_in, check_out) = match status {
                    AttendanceStatus::Present => {
                        (Some(starts_at), Some(starts_at + Duration::hours(3)))
                    }
                    AttendanceStatus::Late => (
                        Some(starts_at + Duration::minutes(25)),
                        Some(starts_at + Duration::hours(3)),
                    ),
                    _ => (None, None),
                };
                sqlx::query(
                    r#"
                    INSERT INTO attendance_monitor.attendance_entries
                    (session_id, participant_id, status, method, check_in, check_out)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(session_id)
                .bind(person.id)
                .bind(status.as_str())
                .bind(CheckInMethod::Manual.as_str())
                .bind(check_in)
                .bind(check_out)
                .execute(pool)
                .await?;
            }
        }
    }

    Ok(())
}

/// Mostly present, with every third participant missing often enough to
/// show up as at risk.
fn seeded_status(day: i64, index: i64) -> AttendanceStatus {
    if index % 3 == 2 && day % 2 == 0 {
        return AttendanceStatus::Absent;
    }
    match (day + index * 3) % 7 {
        0 => AttendanceStatus::Absent,
        1 => AttendanceStatus::Late,
        4 if index % 2 == 1 => AttendanceStatus::Excused,
        _ => AttendanceStatus::Present,
    }
}

pub async fn import_roster(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        role: String,
        program: String,
        #[serde(default)]
        sub_group: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut imported = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad roster row {}", line + 2))?;
        let role: Role = row
            .role
            .parse()
            .with_context(|| format!("bad roster row {}", line + 2))?;
        let program_id = upsert_program(pool, row.program.trim()).await?;
        upsert_participant(
            pool,
            program_id,
            row.full_name.trim(),
            row.email.trim(),
            role,
            row.sub_group.trim(),
        )
        .await?;
        imported += 1;
    }

    info!(imported, path = %csv_path.display(), "roster imported");
    Ok(imported)
}

pub async fn fetch_programs(pool: &PgPool) -> anyhow::Result<Vec<Program>> {
    let rows = sqlx::query(
        r#"
        SELECT p.id, p.name, g.name AS sub_group, g.track
        FROM attendance_monitor.programs p
        LEFT JOIN attendance_monitor.program_sub_groups g ON g.program_id = p.id
        ORDER BY p.name, g.name, g.track
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut programs: Vec<Program> = Vec::new();
    for row in rows {
        let id: Uuid = row.get("id");
        if programs.last().map(|p| p.id) != Some(id) {
            programs.push(Program {
                id,
                name: row.get("name"),
                sub_groups: BTreeMap::new(),
            });
        }

        let group: Option<String> = row.get("sub_group");
        let track: Option<String> = row.get("track");
        if let (Some(program), Some(group), Some(track)) = (programs.last_mut(), group, track) {
            program.sub_groups.entry(group).or_default().push(track);
        }
    }

    Ok(programs)
}

fn participant_from_row(row: &PgRow) -> anyhow::Result<Participant> {
    Ok(Participant {
        id: row.get("id"),
        name: row.get("full_name"),
        email: row.get("email"),
        role: row.get::<String, _>("role").parse()?,
        program_id: row.get("program_id"),
        program: row.get("program"),
        sub_group: row.get("sub_group"),
    })
}

pub async fn fetch_roster(
    pool: &PgPool,
    program: Option<&str>,
) -> anyhow::Result<Vec<Participant>> {
    let mut query = String::from(
        "SELECT pa.id, pa.full_name, pa.email, pa.role, pa.sub_group, pa.program_id, \
         pr.name AS program \
         FROM attendance_monitor.participants pa \
         JOIN attendance_monitor.programs pr ON pr.id = pa.program_id",
    );

    if program.is_some() {
        query.push_str(" WHERE pr.name = $1");
    }
    query.push_str(" ORDER BY pr.name, pa.full_name");

    let mut rows = sqlx::query(&query);
    if let Some(value) = program {
        rows = rows.bind(value);
    }

    rows.fetch_all(pool)
        .await?
        .iter()
        .map(participant_from_row)
        .collect()
}

pub async fn find_participant<'e, E>(
    executor: E,
    email: &str,
) -> anyhow::Result<Option<Participant>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        SELECT pa.id, pa.full_name, pa.email, pa.role, pa.sub_group, pa.program_id,
               pr.name AS program
        FROM attendance_monitor.participants pa
        JOIN attendance_monitor.programs pr ON pr.id = pa.program_id
        WHERE lower(pa.email) = lower($1)
        "#,
    )
    .bind(email.trim())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(participant_from_row).transpose()
}

/// Distinct UTC calendar days on which `program` had a session.
pub async fn fetch_session_dates(
    pool: &PgPool,
    program: &str,
    since: NaiveDate,
    until: NaiveDate,
) -> anyhow::Result<Vec<NaiveDate>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT (s.starts_at AT TIME ZONE 'UTC')::date AS day
        FROM attendance_monitor.sessions s
        JOIN attendance_monitor.programs p ON p.id = s.program_id
        WHERE p.name = $1
          AND (s.starts_at AT TIME ZONE 'UTC')::date BETWEEN $2 AND $3
        ORDER BY day
        "#,
    )
    .bind(program)
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|row| row.get("day")).collect())
}

pub async fn fetch_entries(
    pool: &PgPool,
    program: &str,
    since: NaiveDate,
    until: NaiveDate,
) -> anyhow::Result<Vec<AttendanceEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT e.participant_id, e.status, e.method, e.check_in, e.check_out,
               (s.starts_at AT TIME ZONE 'UTC')::date AS day
        FROM attendance_monitor.attendance_entries e
        JOIN attendance_monitor.sessions s ON s.id = e.session_id
        JOIN attendance_monitor.programs p ON p.id = s.program_id
        WHERE p.name = $1
          AND (s.starts_at AT TIME ZONE 'UTC')::date BETWEEN $2 AND $3
        "#,
    )
    .bind(program)
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(AttendanceEntry {
            person_id: row.get("participant_id"),
            session_date: row.get("day"),
            status: row.get::<String, _>("status").parse()?,
            method: row.get::<String, _>("method").parse()?,
            check_in: row.get("check_in"),
            check_out: row.get("check_out"),
        });
    }

    Ok(entries)
}

fn session_from_row(row: &PgRow) -> Session {
    Session {
        session_id: row.get("id"),
        program_id: row.get("program_id"),
        start_time: row.get("starts_at"),
        end_time: row.get("ends_at"),
    }
}

pub async fn fetch_session(pool: &PgPool, session_id: Uuid) -> anyhow::Result<Option<Session>> {
    let row = sqlx::query(
        "SELECT id, program_id, starts_at, ends_at FROM attendance_monitor.sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(session_from_row))
}

pub async fn start_session(pool: &PgPool, program: &str) -> anyhow::Result<Session> {
    let row = sqlx::query(
        r#"
        INSERT INTO attendance_monitor.sessions (id, program_id, starts_at)
        SELECT $1, p.id, now()
        FROM attendance_monitor.programs p
        WHERE p.name = $2
        RETURNING id, program_id, starts_at, ends_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(program)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("program {program:?} not found"))?;

    let session = session_from_row(&row);
    info!(session = %session.session_id, program, "session started");
    Ok(session)
}

pub async fn end_session(pool: &PgPool, session_id: Uuid) -> anyhow::Result<Session> {
    let row = sqlx::query(
        r#"
        UPDATE attendance_monitor.sessions
        SET ends_at = now()
        WHERE id = $1 AND (ends_at IS NULL OR ends_at > now())
        RETURNING id, program_id, starts_at, ends_at
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("session {session_id} not found or already ended"))?;

    info!(session = %session_id, "session ended");
    Ok(session_from_row(&row))
}

pub async fn program_name(pool: &PgPool, program_id: Uuid) -> anyhow::Result<String> {
    let name: String = sqlx::query("SELECT name FROM attendance_monitor.programs WHERE id = $1")
        .bind(program_id)
        .fetch_one(pool)
        .await?
        .get("name");
    Ok(name)
}

pub async fn store_qr_ticket(pool: &PgPool, ticket: &QrTicket) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO attendance_monitor.qr_tokens (token, session_id, issued_at, expires_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(ticket.payload.token)
    .bind(ticket.payload.session_id)
    .bind(ticket.issued_at)
    .bind(ticket.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks `email` present for the payload's session, or rejects the scan
/// without touching any attendance row.
pub async fn redeem_qr(
    pool: &PgPool,
    payload: &QrPayload,
    email: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Participant> {
    let mut tx = pool.begin().await?;

    let ticket = sqlx::query(
        r#"
        SELECT token, session_id, issued_at, expires_at
        FROM attendance_monitor.qr_tokens
        WHERE token = $1
        "#,
    )
    .bind(payload.token)
    .fetch_optional(&mut *tx)
    .await?
    .map(|row| QrTicket {
        payload: QrPayload {
            session_id: row.get("session_id"),
            token: row.get("token"),
        },
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
    });

    let session = sqlx::query(
        "SELECT id, program_id, starts_at, ends_at FROM attendance_monitor.sessions WHERE id = $1",
    )
    .bind(payload.session_id)
    .fetch_optional(&mut *tx)
    .await?
    .map(|row| session_from_row(&row))
    .ok_or(QrError::WrongSession)?;

    let scanner = find_participant(&mut *tx, email).await?;
    qr::check_redemption(
        ticket.as_ref(),
        payload,
        &session,
        scanner.as_ref(),
        email,
        now,
    )?;
    let participant = scanner.ok_or_else(|| QrError::NotEnrolled(email.to_string()))?;

    upsert_entry(
        &mut tx,
        session.session_id,
        participant.id,
        AttendanceStatus::Present,
        CheckInMethod::Qr,
        now,
    )
    .await?;
    tx.commit().await?;

    info!(session = %session.session_id, email = %participant.email, "qr check-in accepted");
    Ok(participant)
}

async fn upsert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: Uuid,
    participant_id: Uuid,
    status: AttendanceStatus,
    method: CheckInMethod,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let existing = sqlx::query(
        r#"
        SELECT check_in, check_out
        FROM attendance_monitor.attendance_entries
        WHERE session_id = $1 AND participant_id = $2
        FOR UPDATE
        "#,
    )
    .bind(session_id)
    .bind(participant_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(|row| (row.get("check_in"), row.get("check_out")));

    let (check_in, check_out) = entry_times(status, existing, now);
    sqlx::query(
        r#"
        INSERT INTO attendance_monitor.attendance_entries
        (session_id, participant_id, status, method, check_in, check_out)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (session_id, participant_id) DO UPDATE
        SET status = EXCLUDED.status,
            method = EXCLUDED.method,
            check_in = EXCLUDED.check_in,
            check_out = EXCLUDED.check_out
        "#,
    )
    .bind(session_id)
    .bind(participant_id)
    .bind(status.as_str())
    .bind(method.as_str())
    .bind(check_in)
    .bind(check_out)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

type EntryTimes = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

/// Check-in and check-out to store when an entry is (re)marked as `status`.
/// Only attended statuses carry times; the first check-in of the day wins.
fn entry_times(
    status: AttendanceStatus,
    existing: Option<EntryTimes>,
    now: DateTime<Utc>,
) -> EntryTimes {
    if !status.attended() {
        return (None, None);
    }

    match existing {
        Some((Some(check_in), check_out)) => (Some(check_in), check_out),
        _ => (Some(now), None),
    }
}

/// Manual check-in by a facilitator.
pub async fn mark_attendance(
    pool: &PgPool,
    session_id: Uuid,
    email: &str,
    status: AttendanceStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<Participant> {
    let session = fetch_session(pool, session_id)
        .await?
        .with_context(|| format!("session {session_id} not found"))?;
    let participant = find_participant(pool, email)
        .await?
        .with_context(|| format!("no participant with email {email}"))?;
    if participant.program_id != session.program_id {
        let program = program_name(pool, session.program_id).await?;
        anyhow::bail!("{} is not enrolled in {program}", participant.email);
    }

    let mut tx = pool.begin().await?;
    upsert_entry(
        &mut tx,
        session_id,
        participant.id,
        status,
        CheckInMethod::Manual,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(participant)
}

pub async fn check_out(
    pool: &PgPool,
    session_id: Uuid,
    email: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE attendance_monitor.attendance_entries e
        SET check_out = $3
        FROM attendance_monitor.participants pa
        WHERE pa.id = e.participant_id
          AND e.session_id = $1
          AND lower(pa.email) = lower($2)
          AND e.check_in IS NOT NULL
          AND e.check_out IS NULL
        "#,
    )
    .bind(session_id)
    .bind(email.trim())
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        anyhow::bail!("no open check-in for {email} in session {session_id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_pattern_leaves_one_student_at_risk() {
        let attended = |index: i64| {
            (1..=10)
                .filter(|day| seeded_status(*day, index).attended())
                .count()
        };

        assert!(attended(0) >= 7);
        assert!(attended(2) < 7);
    }

    #[test]
    fn remarking_absent_clears_earlier_check_in_and_out() {
        let morning = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let existing = Some((Some(morning), Some(noon)));

        assert_eq!(
            entry_times(AttendanceStatus::Absent, existing, noon),
            (None, None)
        );
        assert_eq!(
            entry_times(AttendanceStatus::Excused, existing, noon),
            (None, None)
        );
    }

    #[test]
    fn remarking_attended_keeps_first_check_in() {
        let morning = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 9, 40, 0).unwrap();

        assert_eq!(
            entry_times(AttendanceStatus::Late, Some((Some(morning), None)), later),
            (Some(morning), None)
        );
        assert_eq!(
            entry_times(AttendanceStatus::Present, Some((None, None)), later),
            (Some(later), None)
        );
        assert_eq!(
            entry_times(AttendanceStatus::Present, None, later),
            (Some(later), None)
        );
    }
}
