//! The audit trail: who created, changed or deleted which record, and when.

use crate::{
    page::{self, Page, PageRequest},
    record::{self, parse_column, Record},
    schema::AUDIT_LOG,
    sql::db::{Executor, Op, Order, Row, Select, Table, Value},
    Result,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Columns maintained automatically, which are not audited.
const UNAUDITED: [&str; 2] = ["created_at", "updated_at"];

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// An entry in the audit log.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: i64,
    pub action: Action,
    /// The changed field, for updates.
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

impl Record for AuditEntry {
    const TABLE: Table<'static> = AUDIT_LOG;
    const ENTITY: &'static str = "audit entry";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("table_name", self.table_name.as_str().into()),
            ("record_id", self.record_id.into()),
            ("action", self.action.to_string().into()),
            ("field", self.field.clone().into()),
            ("old_value", self.old_value.clone().into()),
            ("new_value", self.new_value.clone().into()),
            ("changed_by", self.changed_by.as_str().into()),
            ("changed_at", self.changed_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            table_name: row.get("table_name")?,
            record_id: row.get("record_id")?,
            action: parse_column(row, "action")?,
            field: row.get("field")?,
            old_value: row.get("old_value")?,
            new_value: row.get("new_value")?,
            changed_by: row.get("changed_by")?,
            changed_at: row.get("changed_at")?,
        })
    }
}

/// A change to one field of a record.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

impl Change {
    pub fn new(field: impl Into<String>, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            old: old.into(),
            new: new.into(),
        }
    }
}

/// The fields which differ between two versions of a record.
pub fn diff(old: &[(&'static str, Value)], new: &[(&'static str, Value)]) -> Vec<Change> {
    old.iter()
        .zip(new)
        .filter(|((field, old), (_, new))| !UNAUDITED.contains(field) && old != new)
        .map(|((field, old), (_, new))| Change::new(*field, old.clone(), new.clone()))
        .collect()
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        value => Some(value.to_string()),
    }
}

fn entry(table: &str, record_id: i64, action: Action, user: &str) -> AuditEntry {
    AuditEntry {
        id: 0,
        table_name: table.into(),
        record_id,
        action,
        field: None,
        old_value: None,
        new_value: None,
        changed_by: user.into(),
        changed_at: Utc::now(),
    }
}

pub async fn record_create<E: Executor>(
    exec: &E,
    table: &str,
    record_id: i64,
    user: &str,
) -> Result<()> {
    tracing::info!(table, record_id, user, "record created");
    record::insert(exec, &entry(table, record_id, Action::Create, user)).await?;
    Ok(())
}

pub async fn record_delete<E: Executor>(
    exec: &E,
    table: &str,
    record_id: i64,
    user: &str,
) -> Result<()> {
    tracing::info!(table, record_id, user, "record deleted");
    record::insert(exec, &entry(table, record_id, Action::Delete, user)).await?;
    Ok(())
}

/// Record one audit entry per change.
pub async fn record_changes<E: Executor>(
    exec: &E,
    table: &str,
    record_id: i64,
    changes: &[Change],
    user: &str,
) -> Result<()> {
    let entries = changes
        .iter()
        .map(|change| {
            tracing::info!(
                table,
                record_id,
                user,
                field = %change.field,
                "{} -> {}",
                change.old,
                change.new
            );
            AuditEntry {
                field: Some(change.field.clone()),
                old_value: text(&change.old),
                new_value: text(&change.new),
                ..entry(table, record_id, Action::Update, user)
            }
        })
        .collect::<Vec<_>>();
    record::insert_all(exec, &entries).await?;
    Ok(())
}

/// Filters for the audit log.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditFilter {
    pub table: Option<String>,
    pub record_id: Option<i64>,
    pub changed_by: Option<String>,
    pub action: Option<Action>,
    /// First day (inclusive) of the range to show.
    pub from: Option<NaiveDate>,
    /// Last day (inclusive) of the range to show.
    pub to: Option<NaiveDate>,
}

/// Midnight UTC at the start of `date`.
pub(crate) fn start_of(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&NaiveDateTime::new(date, NaiveTime::default()))
}

/// Restrict a timestamp `column` to the days `from..=to`.
pub(crate) fn within_days(
    select: Select,
    column: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Select {
    select
        .filter_opt(column, Op::Ge, from.map(start_of))
        .filter_opt(column, Op::Lt, to.and_then(|d| d.succ_opt()).map(start_of))
}

fn select(filter: &AuditFilter) -> Select {
    let select = Select::from(AUDIT_LOG.name)
        .filter_opt("table_name", Op::Eq, filter.table.clone())
        .filter_opt("record_id", Op::Eq, filter.record_id)
        .filter_opt("changed_by", Op::Eq, filter.changed_by.clone())
        .filter_opt("action", Op::Eq, filter.action.map(|a| a.to_string()));
    within_days(select, "changed_at", filter.from, filter.to)
}

/// List audit entries, newest first.
pub async fn list<E: Executor>(
    exec: &E,
    filter: &AuditFilter,
    page: PageRequest,
) -> Result<Page<AuditEntry>> {
    let select = select(filter)
        .order_by("changed_at", Order::Desc)
        .order_by("id", Order::Desc);
    page::load(exec, select, page, AuditEntry::from_row).await
}

/// Every audit entry matching `filter`, oldest first.
pub async fn all<E: Executor>(exec: &E, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
    record::load_all(exec, select(filter).order_by("id", Order::Asc)).await
}

/// The full history of one record, oldest first.
pub async fn history<E: Executor>(
    exec: &E,
    table: &str,
    record_id: i64,
) -> Result<Vec<AuditEntry>> {
    all(
        exec,
        &AuditFilter {
            table: Some(table.into()),
            record_id: Some(record_id),
            ..Default::default()
        },
    )
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{schema, sql::db::memory};
    use chrono::Duration;

    #[test]
    fn test_diff_skips_unchanged_and_bookkeeping() {
        let now = Utc::now();
        let old = vec![
            ("supplier", Value::from("Acme")),
            ("quantity", Value::from(10.0)),
            ("updated_at", Value::from(now)),
        ];
        let new = vec![
            ("supplier", Value::from("Acme")),
            ("quantity", Value::from(12.5)),
            ("updated_at", Value::from(now + Duration::seconds(5))),
        ];
        assert_eq!(diff(&old, &new), [Change::new("quantity", 10.0, 12.5)]);
    }

    #[async_std::test]
    async fn test_history() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();

        record_create(&db, "inspections", 1, "alice").await.unwrap();
        record_changes(
            &db,
            "inspections",
            1,
            &[
                Change::new("status", "pending", "accepted"),
                Change::new("remarks", Value::Null, "ok"),
            ],
            "bob",
        )
        .await
        .unwrap();
        record_create(&db, "inspections", 2, "alice").await.unwrap();

        let history = history(&db, "inspections", 1).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].action, Action::Create);
        assert_eq!(history[1].field.as_deref(), Some("status"));
        assert_eq!(history[1].old_value.as_deref(), Some("pending"));
        assert_eq!(history[2].old_value, None);
        assert_eq!(history[2].new_value.as_deref(), Some("ok"));

        let page = list(
            &db,
            &AuditFilter {
                changed_by: Some("alice".into()),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 2);
        // Newest first.
        assert_eq!(page.items[0].record_id, 2);

        let today = Utc::now().date_naive();
        let page = list(
            &db,
            &AuditFilter {
                from: Some(today + Duration::days(1)),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 0);

        let page = list(
            &db,
            &AuditFilter {
                from: Some(NaiveDate::MIN),
                to: Some(NaiveDate::MAX),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 4);
    }
}
