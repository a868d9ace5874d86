//! Instantiation of the abstract [`db`](super) interface for PostgreSQL.
//!
//! This instantiation is built on [`async-postgres`]. All statements on a [`Connection`] are
//! serialized through a single client. A [`Transaction`] holds the client for its whole lifetime,
//! so statements issued through other handles wait until the transaction finishes.

use super::{Clause, Delete, Insert, Op, Order, Row, Select, Table, Update, Value};
use async_std::{
    sync::{Arc, Mutex, MutexGuard},
    task::spawn,
};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::From;
use futures::TryStreamExt;
use itertools::Itertools;
use snafu::Snafu;
use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_postgres::{
    error::SqlState,
    types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type},
    Client,
};

pub use async_postgres::Config;

/// Errors returned by a PostgreSQL database.
#[derive(Debug, Snafu, From)]
pub enum Error {
    #[from]
    #[snafu(display("SQL error: {source}"))]
    Sql { source: async_postgres::Error },
    #[snafu(display("unable to connect: {source}"))]
    Connect { source: std::io::Error },
    #[snafu(display("unsupported column type {ty}"))]
    UnsupportedType { ty: Type },
    #[snafu(display("{message}"))]
    Custom { message: String },
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self::Custom {
            message: msg.to_string(),
        }
    }

    fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sql { source } => source.code() == Some(&SqlState::UNIQUE_VIOLATION),
            _ => false,
        }
    }
}

/// A connection to a PostgreSQL database.
#[derive(Clone)]
pub struct Connection {
    client: Arc<Mutex<Client>>,
    /// Set when a transaction is dropped without being finished.
    abandoned: Arc<AtomicBool>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Establish a new connection with the given [`Config`].
    pub async fn new(config: Config) -> Result<Self, Error> {
        let (client, conn) = async_postgres::connect(config)
            .await
            .map_err(|source| Error::Connect { source })?;
        spawn(conn);
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            abandoned: Default::default(),
        })
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Client>, Error> {
        let client = self.client.lock().await;
        if self.abandoned.swap(false, Ordering::SeqCst) {
            tracing::warn!("rolling back abandoned transaction");
            client.batch_execute("ROLLBACK").await?;
        }
        Ok(client)
    }
}

#[async_trait]
impl super::Executor for Connection {
    type Error = Error;

    async fn create_table(&self, table: &Table<'_>) -> Result<(), Error> {
        create_table(&*self.lock().await?, table).await
    }

    async fn fetch(&self, select: &Select) -> Result<Vec<Row>, Error> {
        fetch(&*self.lock().await?, select).await
    }

    async fn count(&self, select: &Select) -> Result<u64, Error> {
        count(&*self.lock().await?, select).await
    }

    async fn insert(&self, insert: &Insert) -> Result<Vec<i64>, Error> {
        self::insert(&*self.lock().await?, insert).await
    }

    async fn update(&self, update: &Update) -> Result<u64, Error> {
        self::update(&*self.lock().await?, update).await
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, Error> {
        self::delete(&*self.lock().await?, delete).await
    }
}

#[async_trait]
impl super::Connection for Connection {
    type Transaction<'a> = Transaction<'a>;

    async fn begin(&self) -> Result<Self::Transaction<'_>, Error> {
        let client = self.lock().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Transaction {
            client,
            abandoned: &self.abandoned,
            finished: false,
        })
    }
}

/// A transaction on a PostgreSQL [`Connection`].
pub struct Transaction<'a> {
    client: MutexGuard<'a, Client>,
    abandoned: &'a AtomicBool,
    finished: bool,
}

impl<'a> Transaction<'a> {
    async fn finish(mut self, statement: &str) -> Result<(), Error> {
        self.client.batch_execute(statement).await?;
        self.finished = true;
        Ok(())
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            // The client is still inside the transaction. Make sure the next user of the
            // connection rolls it back before doing anything else.
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl<'a> super::Executor for Transaction<'a> {
    type Error = Error;

    async fn create_table(&self, table: &Table<'_>) -> Result<(), Error> {
        create_table(&self.client, table).await
    }

    async fn fetch(&self, select: &Select) -> Result<Vec<Row>, Error> {
        fetch(&self.client, select).await
    }

    async fn count(&self, select: &Select) -> Result<u64, Error> {
        count(&self.client, select).await
    }

    async fn insert(&self, insert: &Insert) -> Result<Vec<i64>, Error> {
        self::insert(&self.client, insert).await
    }

    async fn update(&self, update: &Update) -> Result<u64, Error> {
        self::update(&self.client, update).await
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, Error> {
        self::delete(&self.client, delete).await
    }
}

#[async_trait]
impl<'a> super::Transaction for Transaction<'a> {
    async fn commit(self) -> Result<(), Error> {
        self.finish("COMMIT").await
    }

    async fn rollback(self) -> Result<(), Error> {
        self.finish("ROLLBACK").await
    }
}

async fn query(
    client: &Client,
    statement: &str,
    params: &[Value],
) -> Result<Vec<tokio_postgres::Row>, Error> {
    tracing::info!(?params, "{}", statement);
    let params = params.iter().map(|param| {
        let param: &dyn ToSql = param;
        param
    });
    let rows = client.query_raw(statement, params).await?;
    Ok(rows.try_collect().await?)
}

async fn execute(client: &Client, statement: &str, params: &[Value]) -> Result<u64, Error> {
    tracing::info!(?params, "{}", statement);
    let params = params.iter().map(|param| {
        let param: &dyn ToSql = param;
        param
    });
    Ok(client.execute_raw(statement, params).await?)
}

async fn create_table(client: &Client, table: &Table<'_>) -> Result<(), Error> {
    let columns = table
        .columns
        .iter()
        .map(|col| {
            let mut def = format!("{} {}", col.name(), col.ty());
            if !col.is_nullable() {
                def.push_str(" NOT NULL");
            }
            if col.is_unique() {
                def.push_str(" UNIQUE");
            }
            if let Some(foreign) = col.foreign_table() {
                def.push_str(&format!(" REFERENCES {foreign} (id) ON DELETE CASCADE"));
            }
            def
        })
        .join(", ");
    let statement = format!(
        "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, {columns})",
        table.name
    );
    execute(client, &statement, &[]).await?;
    Ok(())
}

/// Render `clauses` as a `WHERE` clause, appending their parameters to `params`.
fn where_clause(clauses: &[Clause], params: &mut Vec<Value>) -> String {
    if clauses.is_empty() {
        return String::new();
    }
    let conditions = clauses
        .iter()
        .map(|clause| condition(clause, params))
        .join(" AND ");
    format!(" WHERE {conditions}")
}

fn condition(clause: &Clause, params: &mut Vec<Value>) -> String {
    match clause {
        Clause::Where { column, op, param } => {
            // In the query itself, just reference a parameter by number. We will pass the value
            // itself into the query as a parameter to prevent SQL injection.
            let (op, param) = match op {
                Op::Eq => ("=", param.clone()),
                Op::Ne => ("<>", param.clone()),
                Op::Lt => ("<", param.clone()),
                Op::Le => ("<=", param.clone()),
                Op::Gt => (">", param.clone()),
                Op::Ge => (">=", param.clone()),
                Op::Contains => ("ILIKE", Value::Text(format!("%{}%", escape_like(param)))),
            };
            params.push(param);
            // Params are 1-indexed.
            format!("{column} {op} ${}", params.len())
        }
        Clause::Any(clauses) if clauses.is_empty() => "FALSE".into(),
        Clause::Any(clauses) => format!(
            "({})",
            clauses
                .iter()
                .map(|clause| condition(clause, params))
                .join(" OR ")
        ),
    }
}

fn escape_like(param: &Value) -> String {
    param
        .to_string()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

async fn fetch(client: &Client, select: &Select) -> Result<Vec<Row>, Error> {
    let mut params = vec![];
    let clauses = where_clause(&select.clauses, &mut params);
    let order = if select.order.is_empty() {
        " ORDER BY id".to_string()
    } else {
        format!(
            " ORDER BY {}",
            select
                .order
                .iter()
                .map(|(col, order)| match order {
                    Order::Asc => format!("{col} ASC"),
                    Order::Desc => format!("{col} DESC"),
                })
                .join(", ")
        )
    };
    let mut statement = format!("SELECT * FROM {}{clauses}{order}", select.table);
    if let Some(limit) = select.limit {
        statement.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = select.offset {
        statement.push_str(&format!(" OFFSET {offset}"));
    }

    query(client, &statement, &params)
        .await?
        .into_iter()
        .map(|row| {
            let columns = row
                .columns()
                .iter()
                .enumerate()
                .map(|(i, col)| Ok((col.name().to_string(), row.try_get::<_, Value>(i)?)))
                .collect::<Result<Vec<_>, Error>>()?;
            Ok(Row::new(columns))
        })
        .collect()
}

async fn count(client: &Client, select: &Select) -> Result<u64, Error> {
    let mut params = vec![];
    let clauses = where_clause(&select.clauses, &mut params);
    let statement = format!("SELECT COUNT(*) AS count FROM {}{clauses}", select.table);
    let rows = query(client, &statement, &params).await?;
    let row = rows.first().ok_or_else(|| Error::Custom {
        message: "COUNT returned no rows".into(),
    })?;
    let count: i64 = row.try_get("count")?;
    Ok(count as u64)
}

async fn insert(client: &Client, insert: &Insert) -> Result<Vec<i64>, Error> {
    if insert.rows.is_empty() {
        return Ok(vec![]);
    }
    let width = insert.columns.len();
    let mut params = Vec::with_capacity(insert.rows.len() * width);
    let rows = insert
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != width {
                return Err(Error::Custom {
                    message: format!(
                        "row {i} has {} values but {width} columns were given",
                        row.len()
                    ),
                });
            }
            params.extend(row.iter().cloned());
            let values = (0..width)
                .map(|j| format!("${}", i * width + j + 1))
                .join(",");
            Ok(format!("({values})"))
        })
        .collect::<Result<Vec<_>, Error>>()?
        .join(",");
    let statement = format!(
        "INSERT INTO {} ({}) VALUES {rows} RETURNING id",
        insert.table,
        insert.columns.iter().join(",")
    );
    query(client, &statement, &params)
        .await?
        .into_iter()
        .map(|row| Ok(row.try_get("id")?))
        .collect()
}

async fn update(client: &Client, update: &Update) -> Result<u64, Error> {
    if update.assignments.is_empty() {
        return Ok(0);
    }
    let mut params = vec![];
    let assignments = update
        .assignments
        .iter()
        .map(|(col, value)| {
            params.push(value.clone());
            format!("{col} = ${}", params.len())
        })
        .join(", ");
    let clauses = where_clause(&update.clauses, &mut params);
    let statement = format!("UPDATE {} SET {assignments}{clauses}", update.table);
    execute(client, &statement, &params).await
}

async fn delete(client: &Client, delete: &Delete) -> Result<u64, Error> {
    let mut params = vec![];
    let clauses = where_clause(&delete.clauses, &mut params);
    let statement = format!("DELETE FROM {}{clauses}", delete.table);
    execute(client, &statement, &params).await
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>
    where
        Self: Sized,
    {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(x) => x.to_sql(ty, out),
            Self::Int8(x) => x.to_sql(ty, out),
            Self::Float8(x) => x.to_sql(ty, out),
            Self::Text(x) => x.to_sql(ty, out),
            Self::Date(x) => x.to_sql(ty, out),
            Self::Timestamp(x) => x.to_sql(ty, out),
        }
    }

    accepts!(BOOL, INT8, FLOAT8, TEXT, DATE, TIMESTAMPTZ);
    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        match ty {
            &Type::BOOL => Ok(Self::Bool(bool::from_sql(ty, raw)?)),
            &Type::INT4 => Ok(Self::Int8(i32::from_sql(ty, raw)?.into())),
            &Type::INT8 => Ok(Self::Int8(i64::from_sql(ty, raw)?)),
            &Type::FLOAT8 => Ok(Self::Float8(f64::from_sql(ty, raw)?)),
            &Type::TEXT => Ok(Self::Text(String::from_sql(ty, raw)?)),
            &Type::DATE => Ok(Self::Date(NaiveDate::from_sql(ty, raw)?)),
            &Type::TIMESTAMPTZ => Ok(Self::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?)),
            ty => Err(Box::new(Error::UnsupportedType { ty: ty.clone() })),
        }
    }

    fn from_sql_null(
        _ty: &Type,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(Self::Null)
    }

    accepts!(BOOL, INT4, INT8, FLOAT8, TEXT, DATE, TIMESTAMPTZ);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        init_logging,
        sql::db::{Connection as _, Executor, SchemaColumn, Transaction as _, Type as ColumnType},
    };
    use rand::RngCore;
    use std::env;
    use std::process::Command;
    use std::str;

    struct Db {
        name: String,
        port: u16,
    }

    impl Db {
        fn create() -> Option<Self> {
            if env::var("POSTGRES_TESTS").is_err() {
                tracing::warn!("skipping postgres test since POSTGRES_TESTS are not enabled");
                return None;
            }

            let name = format!("db{}", rand::thread_rng().next_u64());
            let port = env::var("POSTGRES_TESTS_PORT")
                .map(|port| port.parse().unwrap())
                .unwrap_or(5432);

            tracing::info!("Creating test DB {name} on port {port}");
            let output = Command::new("createdb")
                .arg("-p")
                .arg(&port.to_string())
                .arg(&name)
                .output()
                .unwrap();
            if !output.status.success() {
                panic!(
                    "createdb failed: {}",
                    str::from_utf8(&output.stderr).unwrap()
                );
            }

            Some(Self { name, port })
        }

        async fn connect(&self) -> Connection {
            let mut config = Config::default();
            config
                .dbname(&self.name)
                .user("test")
                .host("localhost")
                .port(self.port);
            Connection::new(config).await.unwrap()
        }
    }

    impl Drop for Db {
        fn drop(&mut self) {
            tracing::info!("Dropping test DB {}", self.name);
            let output = Command::new("dropdb")
                .arg("-p")
                .arg(&self.port.to_string())
                .arg(&self.name)
                .output()
                .unwrap();
            if !output.status.success() {
                tracing::error!("dropdb failed: {}", str::from_utf8(&output.stderr).unwrap());
            }
        }
    }

    macro_rules! postgres_test {
        () => {
            match Db::create() {
                Some(db) => db,
                None => return,
            }
        };
    }

    const GAUGES: Table = Table {
        name: "gauges",
        columns: &[
            SchemaColumn::new("code", ColumnType::Text).unique(),
            SchemaColumn::new("reading", ColumnType::Float8).nullable(),
        ],
    };

    #[test]
    fn test_where_clause() {
        let mut params = vec![];
        let clauses = where_clause(
            &[
                Clause::Where {
                    column: "code".into(),
                    op: Op::Contains,
                    param: "50%".into(),
                },
                Clause::Where {
                    column: "reading".into(),
                    op: Op::Ge,
                    param: 1.5.into(),
                },
            ],
            &mut params,
        );
        assert_eq!(clauses, " WHERE code ILIKE $1 AND reading >= $2");
        assert_eq!(params, [Value::Text("%50\\%%".into()), Value::Float8(1.5)]);

        let mut params = vec![];
        let select = Select::from("gauges")
            .filter_any(["code", "name"], Op::Contains, "hrc")
            .filter("reading", Op::Lt, 2.0);
        assert_eq!(
            where_clause(&select.clauses, &mut params),
            " WHERE (code ILIKE $1 OR name ILIKE $2) AND reading < $3"
        );
        assert_eq!(params.len(), 3);
    }

    #[async_std::test]
    async fn test_postgres_round_trip() {
        init_logging();
        let db = postgres_test!();
        let conn = db.connect().await;

        conn.create_table(&GAUGES).await.unwrap();
        let ids = conn
            .insert(
                &Insert::into_table(GAUGES.name, ["code", "reading"])
                    .row(vec!["G-1".into(), 1.5.into()])
                    .row(vec!["G-2".into(), Value::Null]),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let rows = conn
            .fetch(&Select::from(GAUGES.name).filter("code", Op::Eq, "G-2"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<Option<f64>>("reading").unwrap(), None);

        // Duplicate codes are rejected.
        let err = conn
            .insert(&Insert::into_table(GAUGES.name, ["code"]).row(vec!["G-1".into()]))
            .await
            .unwrap_err();
        assert!(super::super::Error::is_unique_violation(&err));

        // Rolled back writes disappear.
        let tx = conn.begin().await.unwrap();
        tx.delete(&Delete::from(GAUGES.name)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(conn.count(&Select::from(GAUGES.name)).await.unwrap(), 2);
    }
}
