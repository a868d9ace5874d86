use clap::Parser;
use qc_model::{attachment::AttachmentStore, db, init_logging, sql::db::memory};
use std::path::PathBuf;

mod routes;
mod test_runner;

/// Start the QC tracker server.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the app should be served.
    #[clap(short, long, env = "QC_TRACKER_PORT", default_value = "80")]
    port: u16,

    /// Directory in which attachment files are stored.
    #[clap(long, env = "QC_TRACKER_UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    /// The largest attachment, in bytes, which will be accepted.
    #[clap(long, env = "QC_TRACKER_MAX_UPLOAD_BYTES", default_value = "10485760")]
    max_upload_bytes: usize,

    /// Keep all records in memory instead of connecting to Postgres.
    ///
    /// Everything is lost when the server exits. Useful for demos and tests.
    #[clap(long, env = "QC_TRACKER_IN_MEMORY")]
    in_memory: bool,

    #[clap(flatten)]
    db: db::Options,
}

impl Options {
    async fn serve(&self) -> tide::Result<()> {
        let store = AttachmentStore::open(self.upload_dir.clone(), self.max_upload_bytes).await?;
        let addr = format!("0.0.0.0:{}", self.port);
        if self.in_memory {
            tracing::warn!("using an in-memory database; records will not be persisted");
            let conn = memory::Connection::create();
            db::setup(&conn).await?;
            routes::app(conn, store).listen(addr).await?;
        } else {
            let conn = self.db.connect().await?;
            db::setup(&conn).await?;
            routes::app(conn, store).listen(addr).await?;
        }
        Ok(())
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    init_logging();
    Options::parse().serve().await
}
