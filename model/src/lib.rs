//! Data model for quality-control records in a steel-parts plant.
//!
//! The model covers receiving inspection of incoming material, chemical composition testing,
//! hardness testing, calibration of the instruments used for those tests, and the KPIs the plant
//! tracks over all of it. Records are persisted through the abstract [`sql::db`] interface, which
//! has PostgreSQL and in-memory instantiations.

use tracing_subscriber::EnvFilter;

/// Run a block of statements in a transaction.
///
/// `atomically!(conn, |tx| { ... })` begins a transaction on `conn`, evaluates the block (which
/// may use `tx` as an [`Executor`](sql::db::Executor) and `?` to bail out), and commits if the
/// block returns `Ok`. If it returns `Err` the transaction is rolled back and the error returned.
macro_rules! atomically {
    ($conn:expr, |$tx:ident| $body:expr) => {{
        let $tx = $crate::sql::db::Connection::begin($conn)
            .await
            .map_err($crate::Error::db)?;
        let result: $crate::Result<_> = async { $body }.await;
        match result {
            Ok(value) => {
                $crate::sql::db::Transaction::commit($tx)
                    .await
                    .map_err($crate::Error::db)?;
                Ok::<_, $crate::Error>(value)
            }
            Err(err) => {
                if let Err(rollback) = $crate::sql::db::Transaction::rollback($tx).await {
                    tracing::error!("rollback failed: {rollback}");
                }
                Err(err)
            }
        }
    }};
}

pub mod attachment;
pub mod audit;
pub mod calibration;
pub mod chemistry;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod hardness;
pub mod inspection;
pub mod kpi;
pub mod page;
pub mod record;
pub mod report;
pub mod schema;
pub mod sql;
pub mod stats;

pub use error::{Error, Result};

/// Install a global `tracing` subscriber configured from `RUST_LOG`.
///
/// This can safely be called more than once; only the first call has any effect.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
