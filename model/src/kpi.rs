//! Plant KPIs: figures entered per period, and KPIs derived from the QC records themselves.

use crate::{
    audit,
    calibration::{self, DueState, InstrumentFilter, InstrumentStatus},
    chemistry::{self, ChemicalTestFilter},
    error::Problems,
    hardness::{self, HardnessTestFilter},
    inspection::{self, InspectionFilter, Status},
    page::{self, Page, PageRequest},
    record::{self, patch_opt, patch_text, Record},
    schema::KPI_ENTRIES,
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    stats::{self, Verdict},
    Error, Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The value of a KPI for one period.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct KpiEntry {
    pub id: i64,
    pub metric: String,
    /// The first day of the period the figure covers.
    pub period: NaiveDate,
    pub target: f64,
    pub actual: f64,
    pub unit: String,
    /// Whether the target is a minimum (`true`) or a maximum (`false`).
    pub higher_is_better: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KpiEntry {
    /// Whether the actual value meets the target.
    pub fn met(&self) -> bool {
        if self.higher_is_better {
            self.actual >= self.target
        } else {
            self.actual <= self.target
        }
    }

    /// Deviation of the actual value from the target, as a percentage of the target.
    ///
    /// [`None`] if the target is 0.
    pub fn deviation_pct(&self) -> Option<f64> {
        if self.target == 0.0 {
            None
        } else {
            Some(100.0 * (self.actual - self.target) / self.target.abs())
        }
    }
}

impl Record for KpiEntry {
    const TABLE: Table<'static> = KPI_ENTRIES;
    const ENTITY: &'static str = "KPI entry";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("metric", self.metric.as_str().into()),
            ("period", self.period.into()),
            ("target", self.target.into()),
            ("actual", self.actual.into()),
            ("unit", self.unit.as_str().into()),
            ("higher_is_better", self.higher_is_better.into()),
            ("notes", self.notes.clone().into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            metric: row.get("metric")?,
            period: row.get("period")?,
            target: row.get("target")?,
            actual: row.get("actual")?,
            unit: row.get("unit")?,
            higher_is_better: row.get("higher_is_better")?,
            notes: row.get("notes")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A KPI entry with its derived fields.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct KpiView {
    #[serde(flatten)]
    pub entry: KpiEntry,
    pub met: bool,
    pub deviation_pct: Option<f64>,
}

impl From<KpiEntry> for KpiView {
    fn from(entry: KpiEntry) -> Self {
        Self {
            met: entry.met(),
            deviation_pct: entry.deviation_pct(),
            entry,
        }
    }
}

fn default_higher_is_better() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewKpi {
    pub metric: String,
    pub period: NaiveDate,
    pub target: f64,
    pub actual: f64,
    pub unit: String,
    #[serde(default = "default_higher_is_better")]
    pub higher_is_better: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewKpi {
    pub fn validate(&self) -> Problems {
        let mut problems = Problems::default();
        problems.required("metric", &self.metric);
        problems.required("unit", &self.unit);
        problems.finite("target", self.target);
        problems.finite("actual", self.actual);
        problems
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KpiPatch {
    pub metric: Option<String>,
    pub period: Option<NaiveDate>,
    pub target: Option<f64>,
    pub actual: Option<f64>,
    pub unit: Option<String>,
    pub higher_is_better: Option<bool>,
    pub notes: Option<String>,
}

impl KpiPatch {
    fn apply(&self, entry: &mut KpiEntry) -> Problems {
        let mut problems = Problems::default();
        patch_text(&mut problems, "metric", &mut entry.metric, &self.metric);
        patch_text(&mut problems, "unit", &mut entry.unit, &self.unit);
        patch_opt(&mut entry.notes, &self.notes);
        if let Some(target) = self.target {
            problems.finite("target", target);
            entry.target = target;
        }
        if let Some(actual) = self.actual {
            problems.finite("actual", actual);
            entry.actual = actual;
        }
        entry.period = self.period.unwrap_or(entry.period);
        entry.higher_is_better = self.higher_is_better.unwrap_or(entry.higher_is_better);
        problems
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KpiFilter {
    pub metric: Option<String>,
    /// Earliest period (inclusive).
    pub from: Option<NaiveDate>,
    /// Latest period (inclusive).
    pub to: Option<NaiveDate>,
}

impl KpiFilter {
    fn select(&self) -> Select {
        Select::from(KPI_ENTRIES.name)
            .filter_opt("metric", Op::Eq, self.metric.clone())
            .filter_opt("period", Op::Ge, self.from)
            .filter_opt("period", Op::Le, self.to)
            .order_by("period", Order::Desc)
            .order_by("id", Order::Desc)
    }
}

/// Fail with [`Error::Conflict`] if another entry exists for the same metric and period.
async fn check_unique<E: Executor>(exec: &E, entry: &KpiEntry) -> Result<()> {
    let others = exec
        .count(
            &Select::from(KPI_ENTRIES.name)
                .filter("metric", Op::Eq, entry.metric.as_str())
                .filter("period", Op::Eq, entry.period)
                .filter("id", Op::Ne, entry.id),
        )
        .await
        .map_err(Error::db)?;
    if others > 0 {
        return Err(Error::conflict(format!(
            "{} already has an entry for {}",
            entry.metric, entry.period
        )));
    }
    Ok(())
}

pub async fn create<C: Connection>(conn: &C, new: NewKpi, user: &str) -> Result<KpiView> {
    new.validate().finish()?;
    let now = Utc::now();
    let mut entry = KpiEntry {
        id: 0,
        metric: new.metric.trim().into(),
        period: new.period,
        target: new.target,
        actual: new.actual,
        unit: new.unit.trim().into(),
        higher_is_better: new.higher_is_better,
        notes: new.notes,
        created_at: now,
        updated_at: now,
    };
    let id = atomically!(conn, |tx| {
        check_unique(&tx, &entry).await?;
        let id = record::insert(&tx, &entry).await?;
        audit::record_create(&tx, KPI_ENTRIES.name, id, user).await?;
        Ok(id)
    })?;
    entry.id = id;
    tracing::info!(
        id = entry.id,
        metric = %entry.metric,
        period = %entry.period,
        "created KPI entry"
    );
    Ok(entry.into())
}

pub async fn get<E: Executor>(exec: &E, id: i64) -> Result<KpiView> {
    Ok(record::fetch::<_, KpiEntry>(exec, id).await?.into())
}

/// List KPI entries, latest period first.
pub async fn list<E: Executor>(
    exec: &E,
    filter: &KpiFilter,
    page: PageRequest,
) -> Result<Page<KpiView>> {
    page::load(exec, filter.select(), page, |row| {
        Ok(KpiEntry::from_row(row)?.into())
    })
    .await
}

/// Every KPI entry matching `filter`, latest period first.
pub async fn all<E: Executor>(exec: &E, filter: &KpiFilter) -> Result<Vec<KpiView>> {
    Ok(record::load_all::<_, KpiEntry>(exec, filter.select())
        .await?
        .into_iter()
        .map(KpiView::from)
        .collect())
}

pub async fn update<C: Connection>(
    conn: &C,
    id: i64,
    patch: KpiPatch,
    user: &str,
) -> Result<KpiView> {
    atomically!(conn, |tx| {
        let old: KpiEntry = record::fetch(&tx, id).await?;
        let mut new = old.clone();
        patch.apply(&mut new).finish()?;
        check_unique(&tx, &new).await?;
        record::save(&tx, &old, &new, user).await?;
        Ok(())
    })?;
    get(conn, id).await
}

pub async fn delete<C: Connection>(conn: &C, id: i64, user: &str) -> Result<()> {
    atomically!(conn, |tx| {
        record::remove::<_, KpiEntry>(&tx, id).await?;
        audit::record_delete(&tx, KPI_ENTRIES.name, id, user).await
    })
}

/// The names of every metric with at least one entry.
pub async fn metrics<E: Executor>(exec: &E) -> Result<Vec<String>> {
    let mut metrics = all(exec, &KpiFilter::default())
        .await?
        .into_iter()
        .map(|view| view.entry.metric)
        .collect::<Vec<_>>();
    metrics.sort();
    metrics.dedup();
    Ok(metrics)
}

/// The latest entry of each metric, ordered by metric name.
pub async fn latest<E: Executor>(exec: &E) -> Result<Vec<KpiView>> {
    let mut latest = Vec::<KpiView>::new();
    // Entries come latest period first, so the first entry of each metric wins.
    for view in all(exec, &KpiFilter::default()).await? {
        if !latest.iter().any(|l| l.entry.metric == view.entry.metric) {
            latest.push(view);
        }
    }
    latest.sort_by(|a, b| a.entry.metric.cmp(&b.entry.metric));
    Ok(latest)
}

/// One point of a KPI trend.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TrendPoint {
    pub period: NaiveDate,
    pub target: f64,
    pub actual: f64,
    pub met: bool,
}

/// The entries of `metric` in chronological order.
pub async fn trend<E: Executor>(
    exec: &E,
    metric: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<TrendPoint>> {
    let filter = KpiFilter {
        metric: Some(metric.into()),
        from,
        to,
    };
    let mut points = all(exec, &filter)
        .await?
        .into_iter()
        .map(|view| TrendPoint {
            period: view.entry.period,
            target: view.entry.target,
            actual: view.entry.actual,
            met: view.met,
        })
        .collect::<Vec<_>>();
    points.reverse();
    Ok(points)
}

/// A proportion of records meeting some criterion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Rate {
    pub count: usize,
    pub total: usize,
    /// `count` as a percentage of `total`, if `total` is not 0.
    pub percent: Option<f64>,
}

impl Rate {
    pub fn new(count: usize, total: usize) -> Self {
        Self {
            count,
            total,
            percent: stats::pass_rate(count, total),
        }
    }
}

/// KPIs computed from the QC records.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DerivedKpis {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Inspections accepted (outright or conditionally) out of those decided.
    pub receiving_acceptance: Rate,
    /// Chemical tests passing out of those with checked readings.
    pub chemical_pass: Rate,
    /// Hardness tests passing out of all tests.
    pub hardness_pass: Rate,
    /// Instruments in service which are within their calibration interval on `as_of`.
    pub calibration_compliance: Rate,
    pub as_of: NaiveDate,
}

fn verdict_rate(verdicts: impl IntoIterator<Item = Verdict>) -> Rate {
    let (passed, checked) = verdicts
        .into_iter()
        .fold((0, 0), |(passed, checked), verdict| match verdict {
            Verdict::Pass => (passed + 1, checked + 1),
            Verdict::Fail => (passed, checked + 1),
            Verdict::Unchecked => (passed, checked),
        });
    Rate::new(passed, checked)
}

/// Compute plant KPIs from the records dated in `from..=to`.
///
/// Calibration compliance is measured on `to`, or on `today` if there is no end date.
pub async fn derived<E: Executor>(
    exec: &E,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<DerivedKpis> {
    let inspections = inspection::all(
        exec,
        &InspectionFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?;
    let decided = inspections
        .iter()
        .filter(|i| i.status != Status::Pending)
        .count();
    let accepted = inspections
        .iter()
        .filter(|i| matches!(i.status, Status::Accepted | Status::Conditional))
        .count();

    let chemical = chemistry::all(
        exec,
        &ChemicalTestFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?;
    let hardness = hardness::all(
        exec,
        &HardnessTestFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?;

    let as_of = to.unwrap_or(today);
    let instruments = calibration::all_instruments(exec, &InstrumentFilter::default(), as_of)
        .await?
        .into_iter()
        .filter(|view| view.instrument.status != InstrumentStatus::Retired)
        .collect::<Vec<_>>();
    let compliant = instruments
        .iter()
        .filter(|view| matches!(view.due_state, DueState::Ok | DueState::DueSoon))
        .count();

    Ok(DerivedKpis {
        from,
        to,
        receiving_acceptance: Rate::new(accepted, decided),
        chemical_pass: verdict_rate(chemical.iter().map(|t| t.verdict)),
        hardness_pass: verdict_rate(hardness.iter().map(|t| t.tally.verdict)),
        calibration_compliance: Rate::new(compliant, instruments.len()),
        as_of,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        attachment::test::temp_store,
        calibration::{create_instrument, test::new_instrument},
        chemistry::test::{new_test as new_chemical_test, reading},
        hardness::test::new_test as new_hardness_test,
        inspection::test::{measurement, new_inspection},
        schema,
        sql::db::memory,
    };
    use chrono::Duration;

    fn new_kpi(metric: &str, period: NaiveDate, target: f64, actual: f64) -> NewKpi {
        NewKpi {
            metric: metric.into(),
            period,
            target,
            actual,
            unit: "%".into(),
            higher_is_better: true,
            notes: None,
        }
    }

    fn month(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, 1).unwrap()
    }

    async fn setup() -> memory::Connection {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        db
    }

    #[test]
    fn test_derived_fields() {
        let mut entry = KpiEntry {
            id: 1,
            metric: "scrap rate".into(),
            period: month(1),
            target: 2.0,
            actual: 2.5,
            unit: "%".into(),
            higher_is_better: false,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!entry.met());
        assert_eq!(entry.deviation_pct(), Some(25.0));
        entry.higher_is_better = true;
        assert!(entry.met());
        entry.target = 0.0;
        assert_eq!(entry.deviation_pct(), None);
    }

    #[async_std::test]
    async fn test_metric_period_unique() {
        let db = setup().await;
        create(&db, new_kpi("first pass yield", month(1), 95.0, 96.0), "gina")
            .await
            .unwrap();
        let err = create(&db, new_kpi("first pass yield", month(1), 95.0, 90.0), "gina")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }), "{err}");

        let feb = create(&db, new_kpi("first pass yield", month(2), 95.0, 90.0), "gina")
            .await
            .unwrap();
        assert!(!feb.met);
        let err = update(
            &db,
            feb.entry.id,
            KpiPatch {
                period: Some(month(1)),
                ..Default::default()
            },
            "gina",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }), "{err}");

        // Updating an entry without moving it does not conflict with itself.
        let updated = update(
            &db,
            feb.entry.id,
            KpiPatch {
                actual: Some(97.0),
                ..Default::default()
            },
            "gina",
        )
        .await
        .unwrap();
        assert!(updated.met);
    }

    #[async_std::test]
    async fn test_trend_and_latest() {
        let db = setup().await;
        for (m, actual) in [(3, 97.0), (1, 94.0), (2, 95.5)] {
            create(&db, new_kpi("first pass yield", month(m), 95.0, actual), "gina")
                .await
                .unwrap();
        }
        create(&db, new_kpi("on-time delivery", month(1), 98.0, 99.0), "gina")
            .await
            .unwrap();

        let trend = trend(&db, "first pass yield", None, None).await.unwrap();
        assert_eq!(
            trend.iter().map(|p| p.period).collect::<Vec<_>>(),
            [month(1), month(2), month(3)]
        );
        assert_eq!(
            trend.iter().map(|p| p.met).collect::<Vec<_>>(),
            [false, true, true]
        );

        let latest = latest(&db).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].entry.period, month(3));
        assert_eq!(latest[1].entry.metric, "on-time delivery");
        assert_eq!(
            metrics(&db).await.unwrap(),
            ["first pass yield", "on-time delivery"]
        );

        let page = list(
            &db,
            &KpiFilter {
                metric: Some("first pass yield".into()),
                from: Some(month(2)),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].entry.period, month(3));

        let id = page.items[0].entry.id;
        delete(&db, id, "gina").await.unwrap();
        assert!(matches!(get(&db, id).await, Err(Error::NotFound { .. })));
    }

    #[async_std::test]
    async fn test_derived() {
        let db = setup().await;
        let store = temp_store().await;
        let today = Utc::now().date_naive();

        let empty = derived(&db, None, None, today).await.unwrap();
        assert_eq!(empty.receiving_acceptance, Rate::default());
        assert_eq!(empty.calibration_compliance.percent, None);

        for measured in [50.0, 50.0, 50.0, 51.0] {
            inspection::create(
                &db,
                &store,
                new_inspection("Acme", vec![measurement("OD", 49.9, 50.1, measured)]),
                "alice",
            )
            .await
            .unwrap();
        }
        inspection::create(&db, &store, new_inspection("Acme", vec![]), "alice")
            .await
            .unwrap();

        chemistry::create(
            &db,
            &store,
            new_chemical_test("4140", vec![reading("C", 0.40)]),
            "carol",
        )
        .await
        .unwrap();
        chemistry::create(
            &db,
            &store,
            new_chemical_test("4140", vec![reading("C", 0.60)]),
            "carol",
        )
        .await
        .unwrap();

        hardness::create(&db, &store, new_hardness_test(vec![60.0], None), "frank")
            .await
            .unwrap();

        create_instrument(&db, new_instrument("OK", Some(today)), "eve")
            .await
            .unwrap();
        create_instrument(
            &db,
            new_instrument("LATE", Some(today - Duration::days(365))),
            "eve",
        )
        .await
        .unwrap();

        let kpis = derived(&db, None, None, today).await.unwrap();
        // The inspection without measurements is still pending.
        assert_eq!(kpis.receiving_acceptance, Rate::new(3, 4));
        assert_eq!(kpis.receiving_acceptance.percent, Some(75.0));
        assert_eq!(kpis.chemical_pass, Rate::new(1, 2));
        assert_eq!(kpis.hardness_pass, Rate::new(1, 1));
        assert_eq!(kpis.calibration_compliance, Rate::new(1, 2));
        assert_eq!(kpis.as_of, today);

        let past = derived(&db, None, Some(today - Duration::days(1)), today)
            .await
            .unwrap();
        assert_eq!(past.receiving_acceptance.total, 0);
    }
}
