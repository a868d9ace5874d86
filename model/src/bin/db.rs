use chrono::Utc;
use clap::Parser;
use qc_model::{
    calibration::{self, DEFAULT_WARNING_DAYS},
    db, init_logging,
    report::{self, Report, ReportKind},
};
use std::fs::File;
use std::io::{stdout, BufWriter};
use std::path::PathBuf;

/// Administer the QC tracker database.
#[derive(Parser)]
enum Command {
    /// Perform one-time setup of the database.
    Init {
        #[clap(flatten)]
        db: db::Options,
    },
    /// List instruments which are overdue, due soon, or have never been calibrated.
    Due {
        /// Report instruments due within DAYS days.
        #[clap(short, long, value_name = "DAYS", default_value_t = DEFAULT_WARNING_DAYS)]
        within_days: i64,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Export a CSV report.
    Export {
        /// The report to export: inspections, chemical-tests, hardness-tests, instruments,
        /// calibrations, kpis or audit.
        kind: ReportKind,

        /// Write the report to FILE instead of stdout.
        #[clap(short, long, value_name = "FILE")]
        out: Option<PathBuf>,

        #[clap(flatten)]
        db: db::Options,
    },
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();
    let today = Utc::now().date_naive();

    match Command::parse() {
        Command::Init { db } => {
            let conn = db.connect().await?;
            db::setup(&conn).await?;
        }
        Command::Due { within_days, db } => {
            let conn = db.connect().await?;
            let due = calibration::due(&conn, today, within_days).await?;
            tracing::info!("{} instruments need attention", due.len());
            for view in due {
                let next_due = view
                    .next_due
                    .map(|date| date.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<16} {:<32} {:<16} {}",
                    view.instrument.code,
                    view.instrument.name,
                    view.due_state.to_string(),
                    next_due
                );
            }
        }
        Command::Export { kind, out, db } => {
            let conn = db.connect().await?;
            let report = Report::unfiltered(kind);
            let rows = match out {
                Some(path) => {
                    report::write(&conn, &report, today, BufWriter::new(File::create(path)?))
                        .await?
                }
                None => report::write(&conn, &report, today, stdout().lock()).await?,
            };
            tracing::info!("exported {rows} rows");
        }
    }

    Ok(())
}
