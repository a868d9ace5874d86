//! Abstract interface to a SQL database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::{Display, From};
use snafu::Snafu;
use std::fmt::{self, Display, Formatter};

pub mod memory;
pub mod postgres;

/// Errors returned by the database.
pub trait Error: Sized + Send + Sync + std::error::Error + 'static {
    /// Wrap a custom message into this error type.
    fn custom(msg: impl Display) -> Self;

    /// An error indicating that a query returned more than the `expected` number of rows.
    fn too_many_rows(expected: usize) -> Self {
        Self::custom(format!(
            "query result has more rows than the expected {expected}"
        ))
    }

    /// An error indicating that a query which was expected to return some rows did not.
    fn empty_rows() -> Self {
        Self::custom("query result is empty")
    }

    /// Whether this error was caused by a write violating a `UNIQUE` constraint.
    fn is_unique_violation(&self) -> bool {
        false
    }
}

/// The type of a column.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Type {
    /// An 8-byte signed integer.
    #[display(fmt = "int8")]
    Int8,
    /// An 8-byte floating point number.
    #[display(fmt = "float8")]
    Float8,
    /// A text string.
    #[display(fmt = "text")]
    Text,
    /// A boolean.
    #[display(fmt = "bool")]
    Bool,
    /// A calendar date without a time zone.
    #[display(fmt = "date")]
    Date,
    /// A UTC timestamp.
    #[display(fmt = "timestamptz")]
    Timestamp,
}

/// A column in a table schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaColumn<'a> {
    name: &'a str,
    ty: Type,
    nullable: bool,
    unique: bool,
    references: Option<&'a str>,
}

impl<'a> SchemaColumn<'a> {
    /// A non-nullable column.
    pub const fn new(name: &'a str, ty: Type) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            unique: false,
            references: None,
        }
    }

    /// Allow `NULL` in this column.
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Forbid two rows from sharing a value in this column.
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Make this column a foreign key into the `id` column of `table`.
    pub const fn references(mut self, table: &'a str) -> Self {
        self.references = Some(table);
        self
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn foreign_table(&self) -> Option<&'a str> {
        self.references
    }
}

/// A table schema.
///
/// Every table has an implicit `id` column, an 8-byte integer primary key which is assigned by
/// the database when a row is inserted.
#[derive(Clone, Copy, Debug)]
pub struct Table<'a> {
    pub name: &'a str,
    pub columns: &'a [SchemaColumn<'a>],
}

impl<'a> Table<'a> {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&SchemaColumn<'a>> {
        self.columns.iter().find(|col| col.name == name)
    }
}

/// A primitive value supported by a SQL database.
#[derive(Clone, Debug, PartialEq, PartialOrd, From)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    Bool(bool),
    Int8(i64),
    Float8(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// The SQL type of this value, or [`None`] for `NULL`.
    pub fn ty(&self) -> Option<Type> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(Type::Bool),
            Self::Int8(_) => Some(Type::Int8),
            Self::Float8(_) => Some(Type::Float8),
            Self::Text(_) => Some(Type::Text),
            Self::Date(_) => Some(Type::Date),
            Self::Timestamp(_) => Some(Type::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(x) => write!(f, "{x}"),
            Self::Int8(x) => write!(f, "{x}"),
            Self::Float8(x) => write!(f, "{x}"),
            Self::Text(x) => write!(f, "{x}"),
            Self::Date(x) => write!(f, "{}", x.format("%Y-%m-%d")),
            Self::Timestamp(x) => write!(f, "{}", x.to_rfc3339()),
        }
    }
}

/// Conversion from a [`Value`] to a Rust type.
pub trait FromValue: Sized {
    /// Convert `value`, returning the name of the expected type on mismatch.
    fn from_value(value: Value) -> Result<Self, &'static str>;
}

macro_rules! from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, &'static str> {
                    match value {
                        Value::$variant(x) => Ok(x),
                        _ => Err(stringify!($variant)),
                    }
                }
            }
        )*
    };
}

from_value! {
    bool => Bool,
    i64 => Int8,
    f64 => Float8,
    String => Text,
    NaiveDate => Date,
    DateTime<Utc> => Timestamp,
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::Null => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }
}

/// A comparison operator used to filter rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Case-insensitive substring match on a text column.
    Contains,
}

/// A clause modifying a SQL statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Clause {
    /// A `WHERE` clause.
    Where {
        /// The column to filter.
        column: String,
        /// The operation used to filter values of `column`.
        op: Op,
        /// Parameter to `op`.
        param: Value,
    },
    /// Matches rows satisfying at least one of the nested clauses.
    Any(Vec<Clause>),
}

/// Direction of an `ORDER BY` term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A `SELECT` query.
///
/// This represents a statement of the form `SELECT * FROM table`, refined by `WHERE` clauses
/// (combined with `AND`), an ordering and a window of rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub table: String,
    pub clauses: Vec<Clause>,
    pub order: Vec<(String, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            clauses: vec![],
            order: vec![],
            limit: None,
            offset: None,
        }
    }

    /// Add a `WHERE` clause to the query.
    pub fn filter(mut self, column: impl Into<String>, op: Op, param: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Where {
            column: column.into(),
            op,
            param: param.into(),
        });
        self
    }

    /// Add a `WHERE` clause only if `param` is present.
    pub fn filter_opt<T: Into<Value>>(
        self,
        column: impl Into<String>,
        op: Op,
        param: Option<T>,
    ) -> Self {
        match param {
            Some(param) => self.filter(column, op, param),
            None => self,
        }
    }

    /// Match rows where at least one of `columns` satisfies `op` with `param`.
    pub fn filter_any<C: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = C>,
        op: Op,
        param: impl Into<Value>,
    ) -> Self {
        let param = param.into();
        self.clauses.push(Clause::Any(
            columns
                .into_iter()
                .map(|column| Clause::Where {
                    column: column.into(),
                    op,
                    param: param.clone(),
                })
                .collect(),
        ));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// An `INSERT` statement.
///
/// Columns not listed are set to `NULL`.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Insert {
    pub fn into_table<C: Into<String>>(
        table: impl Into<String>,
        columns: impl IntoIterator<Item = C>,
    ) -> Self {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: vec![],
        }
    }

    /// Add rows to insert.
    ///
    /// Each row must have one value per column.
    pub fn rows<R>(mut self, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<Value>>,
    {
        self.rows.extend(rows);
        self
    }

    pub fn row(self, row: Vec<Value>) -> Self {
        self.rows([row])
    }
}

/// An `UPDATE` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub clauses: Vec<Clause>,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: vec![],
            clauses: vec![],
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: Op, param: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Where {
            column: column.into(),
            op,
            param: param.into(),
        });
        self
    }
}

/// A `DELETE` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub table: String,
    pub clauses: Vec<Clause>,
}

impl Delete {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            clauses: vec![],
        }
    }

    pub fn filter(mut self, column: impl Into<String>, op: Op, param: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Where {
            column: column.into(),
            op,
            param: param.into(),
        });
        self
    }
}

/// Failure to extract a column from a [`Row`].
#[derive(Clone, Debug, Snafu)]
pub enum ColumnError {
    #[snafu(display("no column named {column}"))]
    Missing { column: String },
    #[snafu(display("column {column} is not of type {expected}"))]
    Mismatch {
        column: String,
        expected: &'static str,
    },
}

/// A row returned by a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new(columns: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// The raw value of `column` in this row.
    pub fn value(&self, column: &str) -> Result<&Value, ColumnError> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
            .ok_or_else(|| ColumnError::Missing {
                column: column.into(),
            })
    }

    /// Get the value of `column` in this row, converted to `T`.
    ///
    /// # Errors
    ///
    /// This method will fail if the specified column does not exist or has the wrong type.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, ColumnError> {
        T::from_value(self.value(column)?.clone()).map_err(|expected| ColumnError::Mismatch {
            column: column.into(),
            expected,
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Something which can execute statements: a connection or a transaction.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Errors returned from queries.
    type Error: Error;

    /// Create `table` if it does not already exist.
    async fn create_table(&self, table: &Table<'_>) -> Result<(), Self::Error>;

    /// Run a query and collect the resulting rows.
    async fn fetch(&self, select: &Select) -> Result<Vec<Row>, Self::Error>;

    /// Count the rows matching the clauses of `select`, ignoring its ordering and window.
    async fn count(&self, select: &Select) -> Result<u64, Self::Error>;

    /// Insert rows, returning the generated `id` of each in order.
    ///
    /// # Errors
    ///
    /// This method will fail if any of the rows conflict with an existing row at a column which
    /// is defined as unique.
    async fn insert(&self, insert: &Insert) -> Result<Vec<i64>, Self::Error>;

    /// Update rows, returning the number of rows affected.
    async fn update(&self, update: &Update) -> Result<u64, Self::Error>;

    /// Delete rows, returning the number of rows affected.
    async fn delete(&self, delete: &Delete) -> Result<u64, Self::Error>;
}

/// An extension trait for [`Executor`] that provides some higher-level functions.
#[async_trait]
pub trait ExecutorExt: Executor {
    /// Run a query which is expected to return either 0 or 1 rows.
    ///
    /// # Errors
    ///
    /// This method will fail if the query returns more than 1 row.
    async fn opt(&self, select: &Select) -> Result<Option<Row>, Self::Error> {
        let mut rows = self.fetch(select).await?;
        if rows.len() > 1 {
            return Err(Self::Error::too_many_rows(1));
        }
        Ok(rows.pop())
    }

    /// Run a query which is expected to return a single row.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly one row.
    async fn one(&self, select: &Select) -> Result<Row, Self::Error> {
        self.opt(select).await?.ok_or_else(Self::Error::empty_rows)
    }
}

impl<T: Executor> ExecutorExt for T {}

/// A connection to the database.
#[async_trait]
pub trait Connection: Executor + Clone + 'static {
    /// A transaction on this connection.
    type Transaction<'a>: Transaction<Error = Self::Error>
    where
        Self: 'a;

    /// Start a transaction.
    ///
    /// Statements executed through the transaction are invisible to other users of the database
    /// until [`commit`](Transaction::commit) is called, and are discarded by
    /// [`rollback`](Transaction::rollback).
    async fn begin(&self) -> Result<Self::Transaction<'_>, Self::Error>;
}

/// A transaction in progress.
#[async_trait]
pub trait Transaction: Executor + Sized {
    async fn commit(self) -> Result<(), Self::Error>;
    async fn rollback(self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_row_get() {
        let row = Row::new([
            ("id".to_string(), Value::Int8(7)),
            ("name".to_string(), Value::Text("caliper".into())),
            ("last".to_string(), Value::Null),
        ]);
        assert_eq!(row.get::<i64>("id").unwrap(), 7);
        assert_eq!(row.get::<String>("name").unwrap(), "caliper");
        assert_eq!(row.get::<Option<NaiveDate>>("last").unwrap(), None);
        assert!(matches!(
            row.get::<f64>("id"),
            Err(ColumnError::Mismatch { .. })
        ));
        assert!(matches!(
            row.get::<i64>("nope"),
            Err(ColumnError::Missing { .. })
        ));
    }

    #[test]
    fn test_value_display() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(Value::from(date).to_string(), "2024-03-09");
        assert_eq!(Value::from(Some(1.5)).to_string(), "1.5");
        assert_eq!(Value::from(None::<i64>).to_string(), "NULL");
    }
}
