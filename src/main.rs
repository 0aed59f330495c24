use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

mod aggregate;
mod config;
mod db;
mod export;
mod filter;
mod models;
mod poller;
mod qr;
mod report;
mod source;

use config::Config;
use filter::AttendanceFilter;
use models::{AttendanceRecord, AttendanceStatus, Role};
use poller::{PollTarget, RecordStore, SessionPoller, Snapshot};
use qr::{QrError, QrPayload};
use source::PgAttendanceSource;

#[derive(Parser)]
#[command(name = "attendance-monitor")]
#[command(about = "Attendance tracking for training programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Case-insensitive match on name or email
    #[arg(long)]
    search: Option<String>,
    /// Program name, or "all"
    #[arg(long)]
    program: Option<String>,
    #[arg(long)]
    sub_group: Option<String>,
    #[arg(long, value_enum)]
    role: Option<Role>,
    #[arg(long, value_enum)]
    status: Option<AttendanceStatus>,
    #[arg(long, default_value_t = 30)]
    since_days: i64,
}

impl FilterArgs {
    fn to_filter(&self) -> AttendanceFilter {
        AttendanceFilter::new(
            self.search.as_deref(),
            self.program.as_deref(),
            self.sub_group.as_deref(),
            self.role,
            self.status,
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import participants from a roster CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List programs with their sub-groups
    Programs,
    /// Show attendance for participants matching the filters
    List {
        #[command(flatten)]
        filters: FilterArgs,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Status counts and at-risk students
    Summary {
        #[arg(long)]
        program: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        program: Option<String>,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        #[arg(long, default_value = "attendance.md")]
        out: PathBuf,
    },
    /// Export the filtered attendance view as CSV
    Export {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "attendance.csv")]
        out: PathBuf,
    },
    /// Start or end a live session
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Issue or redeem QR check-in codes
    Qr {
        #[command(subcommand)]
        command: QrCommand,
    },
    /// Record a manual check-in
    CheckIn {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        email: String,
        #[arg(long, value_enum, default_value_t = AttendanceStatus::Present)]
        status: AttendanceStatus,
    },
    /// Record a check-out
    CheckOut {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        email: String,
    },
    /// Follow today's attendance for a live session until it ends
    Watch {
        #[arg(long)]
        session: Uuid,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    Start {
        #[arg(long)]
        program: String,
    },
    End {
        #[arg(long)]
        session: Uuid,
    },
}

#[derive(Subcommand)]
enum QrCommand {
    /// Issue a new code for an open session
    Issue {
        #[arg(long)]
        session: Uuid,
    },
    /// Redeem a scanned code for a participant
    Scan {
        #[arg(long)]
        payload: String,
        #[arg(long)]
        email: String,
    },
}

fn cutoff_date(since_days: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(since_days.max(1))
}

async fn load_records(
    pool: &PgPool,
    program: Option<&str>,
    since: NaiveDate,
) -> anyhow::Result<Vec<AttendanceRecord>> {
    let today = Utc::now().date_naive();
    let programs = match filter::parse_scope(program) {
        Some(name) => vec![name],
        None => db::fetch_programs(pool)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect(),
    };

    let mut records = Vec::new();
    for name in programs {
        let roster = db::fetch_roster(pool, Some(name.as_str())).await?;
        let dates = db::fetch_session_dates(pool, &name, since, today).await?;
        let entries = db::fetch_entries(pool, &name, since, today).await?;
        records.extend(aggregate::roll_up(&roster, &dates, &entries));
    }

    Ok(records)
}

fn print_record(record: &AttendanceRecord) {
    let flag = if record.is_at_risk() { "  AT RISK" } else { "" };
    println!(
        "- {} <{}> {} {} / {}: {} | {:.1}% ({}/{} days, {:.1}h){}",
        record.name,
        record.email,
        record.role,
        record.program,
        record.sub_group,
        record.status,
        record.attendance_rate(),
        record.present_days,
        record.total_days,
        record.total_hours,
        flag
    );
}

fn print_snapshot(snapshot: &Snapshot) {
    let counts = aggregate::status_counts(&snapshot.records);
    let at = snapshot
        .refreshed_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{at}] present {} | late {} | absent {} | excused {}",
        counts.present, counts.late, counts.absent, counts.excused
    );
    for record in &snapshot.records {
        let since = record
            .check_in
            .map(|t| format!(" since {}", t.format("%H:%M")))
            .unwrap_or_default();
        let via = record
            .method
            .map(|m| format!(" via {}", m.as_str()))
            .unwrap_or_default();
        println!("    {} ({}{}){}", record.name, record.status, via, since);
    }
}

async fn watch(pool: &PgPool, config: &Config, session_id: Uuid) -> anyhow::Result<()> {
    let session = db::fetch_session(pool, session_id)
        .await?
        .with_context(|| format!("session {session_id} not found"))?;
    if !session.is_open(Utc::now()) {
        anyhow::bail!("session {session_id} has already ended");
    }
    let program = db::program_name(pool, session.program_id).await?;

    let store = RecordStore::new();
    let mut updates = store.subscribe();
    let mut poller = SessionPoller::start(
        Arc::new(PgAttendanceSource::new(pool.clone())),
        PollTarget {
            program: program.clone(),
            session_id,
        },
        store.clone(),
        config.poll_interval,
    );

    println!("Watching {program} (session {session_id}). Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            _ = poller.finished() => {
                println!("Session ended.");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping.");
                break;
            }
        }
    }

    poller.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(config::log_level())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    info!(max_connections = config.max_connections, "connected to Postgres");

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let imported = db::import_roster(&pool, &csv).await?;
            println!("Imported {imported} participants from {}.", csv.display());
        }
        Commands::Programs => {
            let programs = db::fetch_programs(&pool).await?;
            if programs.is_empty() {
                println!("No programs yet.");
            }
            for program in programs {
                println!("{}", program.name);
                for (group, tracks) in &program.sub_groups {
                    println!("  {}: {}", group, tracks.join(", "));
                }
            }
        }
        Commands::List { filters, json } => {
            let since = cutoff_date(filters.since_days);
            let records = load_records(&pool, filters.program.as_deref(), since).await?;
            let matched = filters.to_filter().apply(&records);

            if json {
                println!("{}", serde_json::to_string_pretty(&matched)?);
            } else if matched.is_empty() {
                println!("No participants match these filters.");
            } else {
                for record in matched {
                    print_record(record);
                }
            }
        }
        Commands::Summary {
            program,
            since_days,
        } => {
            let since = cutoff_date(since_days);
            let records = load_records(&pool, program.as_deref(), since).await?;

            if records.is_empty() {
                println!("No participants found for this window.");
                return Ok(());
            }

            let counts = aggregate::status_counts(&records);
            println!(
                "Latest session: {} present, {} late, {} absent, {} excused",
                counts.present, counts.late, counts.absent, counts.excused
            );
            println!(
                "Average attendance since {since}: {:.1}%",
                aggregate::average_rate(&records)
            );

            let flagged = aggregate::at_risk(&records);
            if flagged.is_empty() {
                println!("No at-risk students.");
            } else {
                println!("At-risk students:");
                for record in flagged {
                    print_record(record);
                }
            }
        }
        Commands::Report {
            program,
            since_days,
            out,
        } => {
            let since = cutoff_date(since_days);
            let records = load_records(&pool, program.as_deref(), since).await?;
            let label = filter::parse_scope(program.as_deref())
                .unwrap_or_else(|| "all programs".to_string());
            let report = report::build_report(&label, since, &records);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { filters, out } => {
            let since = cutoff_date(filters.since_days);
            let records = load_records(&pool, filters.program.as_deref(), since).await?;
            let filter = filters.to_filter();
            let matched = filter.apply(&records);
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let written = export::write_csv(file, matched)?;
            let scope = if filter.is_empty() { "" } else { " (filtered)" };
            println!("Exported {written} rows{scope} to {}.", out.display());
        }
        Commands::Session { command } => match command {
            SessionCommand::Start { program } => {
                let session = db::start_session(&pool, &program).await?;
                let ticket = qr::issue(&session, config.qr_ttl, Utc::now())?;
                db::store_qr_ticket(&pool, &ticket).await?;
                println!(
                    "Session {} started at {}.",
                    session.session_id,
                    session.start_time.format("%H:%M:%S UTC")
                );
                println!(
                    "Check-in code (valid until {}): {}",
                    ticket.expires_at.format("%H:%M:%S UTC"),
                    ticket.payload
                );
            }
            SessionCommand::End { session } => {
                let session = db::end_session(&pool, session).await?;
                println!("Session {} ended.", session.session_id);
            }
        },
        Commands::Qr { command } => match command {
            QrCommand::Issue { session } => {
                let session = db::fetch_session(&pool, session)
                    .await?
                    .with_context(|| format!("session {session} not found"))?;
                let ticket = qr::issue(&session, config.qr_ttl, Utc::now())?;
                db::store_qr_ticket(&pool, &ticket).await?;
                println!(
                    "Check-in code (valid until {}): {}",
                    ticket.expires_at.format("%H:%M:%S UTC"),
                    ticket.payload
                );
            }
            QrCommand::Scan { payload, email } => {
                let payload: QrPayload = payload.parse()?;
                match db::redeem_qr(&pool, &payload, &email, Utc::now()).await {
                    Ok(participant) => {
                        println!("{} checked in.", participant.name);
                    }
                    Err(e) if e.is::<QrError>() => {
                        anyhow::bail!("check-in rejected: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        },
        Commands::CheckIn {
            session,
            email,
            status,
        } => {
            let participant =
                db::mark_attendance(&pool, session, &email, status, Utc::now()).await?;
            println!("{} marked {}.", participant.name, status);
        }
        Commands::CheckOut { session, email } => {
            db::check_out(&pool, session, &email, Utc::now()).await?;
            println!("{email} checked out.");
        }
        Commands::Watch { session } => {
            watch(&pool, &config, session).await?;
        }
    }

    Ok(())
}
