//! In-memory instantiation of the abstract [`db`](super) interface.
//!
//! This instantiation is built on a simple in-memory database. It is useful for testing in
//! isolation from an actual database, and for running the service without PostgreSQL.

use super::{
    Clause, Delete, Insert, Op, Order, Row, SchemaColumn, Select, Table, Type, Update, Value,
};
use async_std::sync::{Arc, RwLock, RwLockWriteGuard};
use async_trait::async_trait;
use snafu::Snafu;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Mutex;

/// Errors returned by the in-memory database.
#[derive(Debug, Snafu)]
#[snafu(display("memory DB error: {}", message))]
pub struct Error {
    message: String,
    unique_violation: bool,
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self {
            message,
            unique_violation: false,
        }
    }
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self::from(msg.to_string())
    }

    fn is_unique_violation(&self) -> bool {
        self.unique_violation
    }
}

/// The in-memory database.
#[derive(Clone, Debug, Default)]
struct Db {
    tables: HashMap<String, MemTable>,
}

/// An in-memory table.
#[derive(Clone, Debug)]
struct MemTable {
    schema: Vec<(String, Type, bool, bool)>,
    next_id: i64,
    rows: BTreeMap<i64, Vec<Value>>,
}

impl MemTable {
    fn new(columns: &[SchemaColumn<'_>]) -> Self {
        Self {
            schema: columns
                .iter()
                .map(|col| {
                    (
                        col.name().to_string(),
                        col.ty(),
                        col.is_nullable(),
                        col.is_unique(),
                    )
                })
                .collect(),
            next_id: 1,
            rows: Default::default(),
        }
    }

    fn index_of(&self, column: &str) -> Result<usize, Error> {
        self.schema
            .iter()
            .position(|(name, ..)| name == column)
            .ok_or_else(|| Error::from(format!("no column named {column}")))
    }

    /// The value of `column` in the row with `id`, treating `id` itself as a column.
    fn value(&self, id: &i64, row: &[Value], column: &str) -> Result<Value, Error> {
        if column == "id" {
            Ok(Value::Int8(*id))
        } else {
            Ok(row[self.index_of(column)?].clone())
        }
    }

    fn matches(&self, id: &i64, row: &[Value], clauses: &[Clause]) -> Result<bool, Error> {
        for clause in clauses {
            if !self.satisfies(id, row, clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn satisfies(&self, id: &i64, row: &[Value], clause: &Clause) -> Result<bool, Error> {
        match clause {
            Clause::Where { column, op, param } => {
                Ok(compare(&self.value(id, row, column)?, *op, param))
            }
            Clause::Any(clauses) => {
                for clause in clauses {
                    if self.satisfies(id, row, clause)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn to_row(&self, id: i64, row: &[Value]) -> Row {
        Row::new(
            std::iter::once(("id".to_string(), Value::Int8(id))).chain(
                self.schema
                    .iter()
                    .zip(row)
                    .map(|((name, ..), value)| (name.clone(), value.clone())),
            ),
        )
    }

    /// Check that `row` (to be stored at `id`) satisfies the column constraints.
    fn check(&self, id: i64, row: &[Value]) -> Result<(), Error> {
        for (i, ((name, ty, nullable, unique), value)) in self.schema.iter().zip(row).enumerate() {
            match value.ty() {
                None if !nullable => {
                    return Err(Error::from(format!("column {name} cannot be NULL")));
                }
                Some(actual) if actual != *ty => {
                    return Err(Error::from(format!(
                        "column {name} has type {ty} but value has type {actual}"
                    )));
                }
                _ => {}
            }
            if *unique
                && !value.is_null()
                && self
                    .rows
                    .iter()
                    .any(|(other_id, other)| *other_id != id && other[i] == *value)
            {
                return Err(Error {
                    message: format!("duplicate value {value} in unique column {name}"),
                    unique_violation: true,
                });
            }
        }
        Ok(())
    }
}

fn compare(value: &Value, op: Op, param: &Value) -> bool {
    if value.is_null() || param.is_null() {
        return false;
    }
    let ord = value.partial_cmp(param);
    match op {
        Op::Eq => ord == Some(Ordering::Equal),
        Op::Ne => matches!(ord, Some(Ordering::Less | Ordering::Greater)),
        Op::Lt => ord == Some(Ordering::Less),
        Op::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        Op::Gt => ord == Some(Ordering::Greater),
        Op::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        Op::Contains => match (value, param) {
            (Value::Text(value), Value::Text(param)) => {
                value.to_lowercase().contains(&param.to_lowercase())
            }
            _ => false,
        },
    }
}

/// Order values the way PostgreSQL does in ascending order, with `NULL` last.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}

impl Db {
    fn table(&self, name: &str) -> Result<&MemTable, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::from(format!("no table named {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::from(format!("no table named {name}")))
    }

    fn create_table(&mut self, table: &Table<'_>) {
        self.tables
            .entry(table.name.to_string())
            .or_insert_with(|| MemTable::new(table.columns));
    }

    fn matching(&self, select: &Select) -> Result<Vec<(i64, &Vec<Value>)>, Error> {
        let table = self.table(&select.table)?;
        let mut rows = vec![];
        for (id, row) in &table.rows {
            if table.matches(id, row, &select.clauses)? {
                rows.push((*id, row));
            }
        }
        Ok(rows)
    }

    fn fetch(&self, select: &Select) -> Result<Vec<Row>, Error> {
        let table = self.table(&select.table)?;
        let mut rows = self.matching(select)?;

        // Validate the ordering columns up front so the sort comparator cannot fail.
        for (column, _) in &select.order {
            if column != "id" {
                table.index_of(column)?;
            }
        }
        rows.sort_by(|(a_id, a), (b_id, b)| {
            for (column, order) in &select.order {
                let a = table.value(a_id, a, column).unwrap_or(Value::Null);
                let b = table.value(b_id, b, column).unwrap_or(Value::Null);
                let ord = match order {
                    Order::Asc => cmp_values(&a, &b),
                    Order::Desc => cmp_values(&b, &a),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a_id.cmp(b_id)
        });

        let offset = usize::try_from(select.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = select
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, row)| table.to_row(id, row))
            .collect())
    }

    fn count(&self, select: &Select) -> Result<u64, Error> {
        Ok(self.matching(select)?.len() as u64)
    }

    fn insert(&mut self, insert: &Insert) -> Result<Vec<i64>, Error> {
        let table = self.table_mut(&insert.table)?;
        let indices = insert
            .columns
            .iter()
            .map(|col| table.index_of(col))
            .collect::<Result<Vec<_>, _>>()?;

        // Stage the new rows so that a failure part way through leaves the table untouched.
        let mut staged = table.clone();
        let mut ids = vec![];
        for values in &insert.rows {
            if values.len() != indices.len() {
                return Err(Error::from(format!(
                    "row has {} values but {} columns were given",
                    values.len(),
                    indices.len()
                )));
            }
            let mut row = vec![Value::Null; staged.schema.len()];
            for (i, value) in indices.iter().zip(values) {
                row[*i] = value.clone();
            }
            let id = staged.next_id;
            staged.check(id, &row)?;
            staged.rows.insert(id, row);
            staged.next_id += 1;
            ids.push(id);
        }
        *table = staged;
        Ok(ids)
    }

    fn update(&mut self, update: &Update) -> Result<u64, Error> {
        let table = self.table_mut(&update.table)?;
        let assignments = update
            .assignments
            .iter()
            .map(|(col, value)| Ok((table.index_of(col)?, value.clone())))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut staged = table.clone();
        let mut count = 0;
        for (id, row) in &table.rows {
            if !table.matches(id, row, &update.clauses)? {
                continue;
            }
            let mut row = row.clone();
            for (i, value) in &assignments {
                row[*i] = value.clone();
            }
            staged.rows.insert(*id, row);
            count += 1;
        }
        for (id, row) in &staged.rows {
            staged.check(*id, row)?;
        }
        *table = staged;
        Ok(count)
    }

    fn delete(&mut self, delete: &Delete) -> Result<u64, Error> {
        let table = self.table_mut(&delete.table)?;
        let mut doomed = vec![];
        for (id, row) in &table.rows {
            if table.matches(id, row, &delete.clauses)? {
                doomed.push(*id);
            }
        }
        for id in &doomed {
            table.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

/// A connection to the in-memory database.
#[derive(Clone, Debug, Default)]
pub struct Connection(Arc<RwLock<Db>>);

impl Connection {
    /// Create a new database and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. It will not be connected or
    /// related to any previous connection or database. Once the database is created, this
    /// connection can be [cloned](Clone) in order to create multiple simultaneous connections to
    /// the same database.
    pub fn create() -> Self {
        Self::default()
    }
}

#[async_trait]
impl super::Executor for Connection {
    type Error = Error;

    async fn create_table(&self, table: &Table<'_>) -> Result<(), Error> {
        self.0.write().await.create_table(table);
        Ok(())
    }

    async fn fetch(&self, select: &Select) -> Result<Vec<Row>, Error> {
        self.0.read().await.fetch(select)
    }

    async fn count(&self, select: &Select) -> Result<u64, Error> {
        self.0.read().await.count(select)
    }

    async fn insert(&self, insert: &Insert) -> Result<Vec<i64>, Error> {
        self.0.write().await.insert(insert)
    }

    async fn update(&self, update: &Update) -> Result<u64, Error> {
        self.0.write().await.update(update)
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, Error> {
        self.0.write().await.delete(delete)
    }
}

#[async_trait]
impl super::Connection for Connection {
    type Transaction<'a> = Transaction<'a>;

    async fn begin(&self) -> Result<Self::Transaction<'_>, Error> {
        let db = self.0.write().await;
        let snapshot = Mutex::new(db.clone());
        Ok(Transaction { db, snapshot })
    }
}

/// A transaction on the in-memory database.
///
/// The transaction works on a private copy of the database, which replaces the shared database
/// on commit. The shared database is locked for the lifetime of the transaction.
pub struct Transaction<'a> {
    db: RwLockWriteGuard<'a, Db>,
    snapshot: Mutex<Db>,
}

impl<'a> Transaction<'a> {
    fn with<T>(&self, f: impl FnOnce(&mut Db) -> Result<T, Error>) -> Result<T, Error> {
        let mut snapshot = self
            .snapshot
            .lock()
            .map_err(|_| Error::from("transaction state poisoned".to_string()))?;
        f(&mut snapshot)
    }
}

#[async_trait]
impl<'a> super::Executor for Transaction<'a> {
    type Error = Error;

    async fn create_table(&self, table: &Table<'_>) -> Result<(), Error> {
        self.with(|db| {
            db.create_table(table);
            Ok(())
        })
    }

    async fn fetch(&self, select: &Select) -> Result<Vec<Row>, Error> {
        self.with(|db| db.fetch(select))
    }

    async fn count(&self, select: &Select) -> Result<u64, Error> {
        self.with(|db| db.count(select))
    }

    async fn insert(&self, insert: &Insert) -> Result<Vec<i64>, Error> {
        self.with(|db| db.insert(insert))
    }

    async fn update(&self, update: &Update) -> Result<u64, Error> {
        self.with(|db| db.update(update))
    }

    async fn delete(&self, delete: &Delete) -> Result<u64, Error> {
        self.with(|db| db.delete(delete))
    }
}

#[async_trait]
impl<'a> super::Transaction for Transaction<'a> {
    async fn commit(mut self) -> Result<(), Error> {
        let snapshot = self
            .snapshot
            .into_inner()
            .map_err(|_| Error::from("transaction state poisoned".to_string()))?;
        *self.db = snapshot;
        Ok(())
    }

    async fn rollback(self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::db::{Connection as _, Executor, ExecutorExt, Transaction as _};

    const PARTS: Table = Table {
        name: "parts",
        columns: &[
            SchemaColumn::new("number", Type::Text).unique(),
            SchemaColumn::new("hardness", Type::Float8).nullable(),
        ],
    };

    async fn parts() -> Connection {
        let db = Connection::create();
        db.create_table(&PARTS).await.unwrap();
        db.insert(
            &Insert::into_table(PARTS.name, ["number", "hardness"])
                .row(vec!["P-100".into(), 52.0.into()])
                .row(vec!["P-200".into(), Value::Null])
                .row(vec!["Q-300".into(), 58.5.into()]),
        )
        .await
        .unwrap();
        db
    }

    #[async_std::test]
    async fn test_select_filters_and_orders() {
        let db = parts().await;

        let rows = db
            .fetch(
                &Select::from(PARTS.name)
                    .filter("number", Op::Contains, "p-")
                    .order_by("hardness", Order::Desc),
            )
            .await
            .unwrap();
        let numbers = rows
            .iter()
            .map(|row| row.get::<String>("number").unwrap())
            .collect::<Vec<_>>();
        // NULL sorts first when descending, as in PostgreSQL.
        assert_eq!(numbers, ["P-200", "P-100"]);

        let row = db
            .one(&Select::from(PARTS.name).filter("hardness", Op::Gt, 55.0))
            .await
            .unwrap();
        assert_eq!(row.get::<i64>("id").unwrap(), 3);

        assert_eq!(
            db.count(&Select::from(PARTS.name).limit(1)).await.unwrap(),
            3
        );
        let page = db
            .fetch(&Select::from(PARTS.name).offset(1).limit(1))
            .await
            .unwrap();
        assert_eq!(page[0].get::<String>("number").unwrap(), "P-200");

        let count = db
            .count(&Select::from(PARTS.name).filter_any(["number"], Op::Contains, "q-").filter_any(
                ["number", "hardness"],
                Op::Eq,
                52.0,
            ))
            .await
            .unwrap();
        assert_eq!(count, 0);
        let count = db
            .count(&Select::from(PARTS.name).filter_any(["number", "number"], Op::Contains, "00"))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[async_std::test]
    async fn test_constraints() {
        let db = parts().await;

        let err = db
            .insert(
                &Insert::into_table(PARTS.name, ["number"])
                    .row(vec!["P-400".into()])
                    .row(vec!["P-100".into()]),
            )
            .await
            .unwrap_err();
        assert!(super::super::Error::is_unique_violation(&err));
        // The failed statement inserted nothing.
        assert_eq!(db.count(&Select::from(PARTS.name)).await.unwrap(), 3);

        let err = db
            .insert(&Insert::into_table(PARTS.name, ["hardness"]).row(vec![50.0.into()]))
            .await
            .unwrap_err();
        assert!(!super::super::Error::is_unique_violation(&err));

        let err = db
            .update(&Update::table(PARTS.name).set("number", "P-100"))
            .await
            .unwrap_err();
        assert!(super::super::Error::is_unique_violation(&err));
    }

    #[async_std::test]
    async fn test_update_delete() {
        let db = parts().await;
        let updated = db
            .update(
                &Update::table(PARTS.name)
                    .set("hardness", 60.0)
                    .filter("number", Op::Eq, "P-200"),
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let deleted = db
            .delete(&Delete::from(PARTS.name).filter("hardness", Op::Ge, 58.5))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.count(&Select::from(PARTS.name)).await.unwrap(), 1);
    }

    #[async_std::test]
    async fn test_transactions() {
        let db = parts().await;

        let tx = db.begin().await.unwrap();
        tx.delete(&Delete::from(PARTS.name)).await.unwrap();
        assert_eq!(tx.count(&Select::from(PARTS.name)).await.unwrap(), 0);
        tx.rollback().await.unwrap();
        assert_eq!(db.count(&Select::from(PARTS.name)).await.unwrap(), 3);

        let tx = db.begin().await.unwrap();
        tx.insert(&Insert::into_table(PARTS.name, ["number"]).row(vec!["R-1".into()]))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.count(&Select::from(PARTS.name)).await.unwrap(), 4);
    }
}
