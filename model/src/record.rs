//! Generic persistence of records which map one-to-one onto table rows.

use crate::{
    audit::{self, Change},
    error::Problems,
    sql::db::{Delete, Executor, ExecutorExt, Insert, Op, Order, Row, Select, Table, Update, Value},
    Error, Result,
};
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// A record stored as a row in a table.
pub trait Record: Sized + Send + Sync {
    /// The table holding records of this type.
    const TABLE: Table<'static>;

    /// Human-readable name of the record type, used in error messages.
    const ENTITY: &'static str;

    /// The database ID of this record, or 0 if it has not been inserted yet.
    fn id(&self) -> i64;

    /// The values of every column except `id`, in the order of [`TABLE`](Self::TABLE).
    fn columns(&self) -> Vec<(&'static str, Value)>;

    fn from_row(row: &Row) -> Result<Self>;
}

/// Insert `records`, returning their new IDs.
pub async fn insert_all<E: Executor, R: Record>(exec: &E, records: &[R]) -> Result<Vec<i64>> {
    if records.is_empty() {
        return Ok(vec![]);
    }
    let columns = records[0]
        .columns()
        .into_iter()
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
    let rows = records.iter().map(|record| {
        record
            .columns()
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    });
    exec.insert(&Insert::into_table(R::TABLE.name, columns).rows(rows))
        .await
        .map_err(Error::db)
}

/// Insert a single record, returning its new ID.
pub async fn insert<E: Executor, R: Record>(exec: &E, record: &R) -> Result<i64> {
    insert_all(exec, std::slice::from_ref(record))
        .await?
        .pop()
        .ok_or_else(|| Error::Corrupt {
            message: format!("insert into {} returned no ID", R::TABLE.name),
        })
}

/// Load the record with `id`, if there is one.
pub async fn find<E: Executor, R: Record>(exec: &E, id: i64) -> Result<Option<R>> {
    exec.opt(&Select::from(R::TABLE.name).filter("id", Op::Eq, id))
        .await
        .map_err(Error::db)?
        .map(|row| R::from_row(&row))
        .transpose()
}

/// Load the record with `id`.
///
/// # Errors
///
/// Fails with [`Error::NotFound`] if there is no such record.
pub async fn fetch<E: Executor, R: Record>(exec: &E, id: i64) -> Result<R> {
    find(exec, id)
        .await?
        .ok_or_else(|| Error::not_found(R::ENTITY, id))
}

/// Check that a record with `id` exists in `table`.
pub async fn exists<E: Executor>(exec: &E, table: &Table<'_>, id: i64) -> Result<bool> {
    let count = exec
        .count(&Select::from(table.name).filter("id", Op::Eq, id))
        .await
        .map_err(Error::db)?;
    Ok(count > 0)
}

/// Load every record whose `parent` column equals `parent_id`, in insertion order.
pub async fn children<E: Executor, R: Record>(
    exec: &E,
    parent: &str,
    parent_id: i64,
) -> Result<Vec<R>> {
    load_all(
        exec,
        Select::from(R::TABLE.name)
            .filter(parent, Op::Eq, parent_id)
            .order_by("id", Order::Asc),
    )
    .await
}

/// Load every record selected by `select`.
pub async fn load_all<E: Executor, R: Record>(exec: &E, select: Select) -> Result<Vec<R>> {
    exec.fetch(&select)
        .await
        .map_err(Error::db)?
        .iter()
        .map(R::from_row)
        .collect()
}

/// Persist the differences between `old` and `new`, which must be versions of the same record.
///
/// Only changed columns are written. Each changed field is recorded in the audit log as a change
/// made by `user`, and `updated_at` is refreshed if the table has it. Returns the changes.
pub async fn save<E: Executor, R: Record>(
    exec: &E,
    old: &R,
    new: &R,
    user: &str,
) -> Result<Vec<Change>> {
    let changes = audit::diff(&old.columns(), &new.columns());
    if changes.is_empty() {
        return Ok(changes);
    }
    let mut update = Update::table(R::TABLE.name).filter("id", Op::Eq, old.id());
    for change in &changes {
        update = update.set(change.field.clone(), change.new.clone());
    }
    if R::TABLE.column("updated_at").is_some() {
        update = update.set("updated_at", Utc::now());
    }
    let updated = exec.update(&update).await.map_err(Error::db)?;
    if updated == 0 {
        return Err(Error::not_found(R::ENTITY, old.id()));
    }
    audit::record_changes(exec, R::TABLE.name, old.id(), &changes, user).await?;
    Ok(changes)
}

/// Refresh `updated_at` on the record with `id`, after changing rows which belong to it.
pub async fn touch<E: Executor, R: Record>(exec: &E, id: i64) -> Result<()> {
    let update = Update::table(R::TABLE.name)
        .filter("id", Op::Eq, id)
        .set("updated_at", Utc::now());
    if exec.update(&update).await.map_err(Error::db)? == 0 {
        return Err(Error::not_found(R::ENTITY, id));
    }
    Ok(())
}

/// Delete the record with `id`.
///
/// # Errors
///
/// Fails with [`Error::NotFound`] if there is no such record.
pub async fn remove<E: Executor, R: Record>(exec: &E, id: i64) -> Result<()> {
    let deleted = exec
        .delete(&Delete::from(R::TABLE.name).filter("id", Op::Eq, id))
        .await
        .map_err(Error::db)?;
    if deleted == 0 {
        return Err(Error::not_found(R::ENTITY, id));
    }
    Ok(())
}

/// Delete every row of `table` whose `parent` column equals `parent_id`.
pub async fn remove_children<E: Executor>(
    exec: &E,
    table: &Table<'_>,
    parent: &str,
    parent_id: i64,
) -> Result<u64> {
    exec.delete(&Delete::from(table.name).filter(parent, Op::Eq, parent_id))
        .await
        .map_err(Error::db)
}

/// Set an optional text field from a patch, where an empty string means `None`.
pub(crate) fn patch_opt(field: &mut Option<String>, patch: &Option<String>) {
    if let Some(value) = patch {
        let value = value.trim();
        *field = (!value.is_empty()).then(|| value.to_string());
    }
}

/// Deserialize a patch field which may be explicitly `null`.
///
/// With `#[serde(default)]`, an absent field is `None` and a `null` one is `Some(None)`.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Set a required text field from a patch.
pub(crate) fn patch_text(
    problems: &mut Problems,
    name: &str,
    field: &mut String,
    patch: &Option<String>,
) {
    if let Some(value) = patch {
        problems.required(name, value);
        *field = value.trim().into();
    }
}

/// Read a column holding the text form of an enum.
pub fn parse_column<T: FromStr>(row: &Row, column: &str) -> Result<T> {
    let text = row.get::<String>(column)?;
    text.parse().map_err(|_| Error::Corrupt {
        message: format!("invalid value {text:?} in column {column}"),
    })
}
