//! The Postgres database used by the QC tracker application.

use crate::{
    schema,
    sql::db::{postgres, Executor},
    Result,
};
use clap::Args;

/// Database connection options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Host running the Postgres database.
    #[clap(long, env = "QC_TRACKER_DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Port on which the Postgres database listens.
    #[clap(long, env = "QC_TRACKER_DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Name of the database to use.
    #[clap(long, env = "QC_TRACKER_DB_NAME", default_value = "qc_tracker")]
    pub db_name: String,

    /// User as which to connect to the database.
    #[clap(long, env = "QC_TRACKER_DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Password for connecting to the Postgres database.
    #[clap(long, env = "QC_TRACKER_DB_PASSWORD", default_value = "password")]
    pub db_password: String,
}

impl Options {
    /// Connect to the database.
    pub async fn connect(&self) -> Result<Connection, anyhow::Error> {
        let mut config = postgres::Config::default();
        config
            .host(&self.db_host)
            .port(self.db_port)
            .dbname(&self.db_name)
            .user(&self.db_user)
            .password(&self.db_password);
        tracing::info!(
            host = %self.db_host,
            port = self.db_port,
            db = %self.db_name,
            "connecting to database"
        );
        Ok(postgres::Connection::new(config).await?)
    }
}

/// A connection to the database.
pub type Connection = postgres::Connection;

/// Perform one-time setup of the database.
///
/// This creates every table the application uses. Tables which already exist are left alone, so
/// it is safe to run this against a database which has already been set up.
pub async fn setup<E: Executor>(exec: &E) -> Result<()> {
    schema::create_tables(exec).await
}
