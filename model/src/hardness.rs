//! Hardness testing of production batches.

use crate::{
    attachment::{self, Attachment, AttachmentStore, NewAttachment, Owner, OwnerKind},
    audit::{self, Change},
    calibration,
    error::Problems,
    page::{self, Page, PageRequest},
    record::{self, nullable, parse_column, patch_opt, Record},
    schema::{HARDNESS_READINGS, HARDNESS_TESTS},
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    stats::{self, Capability, Checked, Limits, Summary, Tally, Verdict},
    Error, Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A hardness scale.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scale {
    /// Rockwell C.
    Hrc,
    /// Rockwell B.
    Hrb,
    /// Brinell.
    Hb,
    /// Vickers.
    Hv,
}

impl Scale {
    /// The values which can physically be measured on this scale.
    pub fn range(&self) -> (f64, f64) {
        match self {
            Self::Hrc => (20.0, 70.0),
            Self::Hrb => (0.0, 100.0),
            Self::Hb => (8.0, 650.0),
            Self::Hv => (1.0, 2000.0),
        }
    }

    fn check(&self, problems: &mut Problems, field: &str, value: f64) {
        let (lower, upper) = self.range();
        problems.check(value.is_finite() && (lower..=upper).contains(&value), || {
            format!("{field} {value} is outside the {self} range {lower}-{upper}")
        });
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HardnessTest {
    pub id: i64,
    pub part_number: String,
    pub batch: String,
    pub scale: Scale,
    pub spec_min: f64,
    pub spec_max: f64,
    pub tested_on: NaiveDate,
    pub operator: String,
    pub instrument_id: Option<i64>,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HardnessTest {
    pub fn limits(&self) -> Limits {
        Limits::between(self.spec_min, self.spec_max)
    }
}

impl Record for HardnessTest {
    const TABLE: Table<'static> = HARDNESS_TESTS;
    const ENTITY: &'static str = "hardness test";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("part_number", self.part_number.as_str().into()),
            ("batch", self.batch.as_str().into()),
            ("scale", self.scale.to_string().into()),
            ("spec_min", self.spec_min.into()),
            ("spec_max", self.spec_max.into()),
            ("tested_on", self.tested_on.into()),
            ("operator", self.operator.as_str().into()),
            ("instrument_id", self.instrument_id.into()),
            ("remarks", self.remarks.clone().into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            part_number: row.get("part_number")?,
            batch: row.get("batch")?,
            scale: parse_column(row, "scale")?,
            spec_min: row.get("spec_min")?,
            spec_max: row.get("spec_max")?,
            tested_on: row.get("tested_on")?,
            operator: row.get("operator")?,
            instrument_id: row.get("instrument_id")?,
            remarks: row.get("remarks")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// One indentation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Reading {
    pub id: i64,
    pub test_id: i64,
    /// 1-based order of the reading within its test.
    pub position: i64,
    pub value: f64,
}

impl Record for Reading {
    const TABLE: Table<'static> = HARDNESS_READINGS;
    const ENTITY: &'static str = "hardness reading";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("test_id", self.test_id.into()),
            ("position", self.position.into()),
            ("value", self.value.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            test_id: row.get("test_id")?,
            position: row.get("position")?,
            value: row.get("value")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewHardnessTest {
    pub part_number: String,
    pub batch: String,
    pub scale: Scale,
    pub spec_min: f64,
    pub spec_max: f64,
    pub tested_on: NaiveDate,
    pub operator: String,
    #[serde(default)]
    pub instrument_id: Option<i64>,
    #[serde(default)]
    pub remarks: Option<String>,
    /// Reading values in the order they were taken.
    pub readings: Vec<f64>,
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
}

impl NewHardnessTest {
    fn header(&self) -> HardnessTest {
        let now = Utc::now();
        HardnessTest {
            id: 0,
            part_number: self.part_number.trim().into(),
            batch: self.batch.trim().into(),
            scale: self.scale,
            spec_min: self.spec_min,
            spec_max: self.spec_max,
            tested_on: self.tested_on,
            operator: self.operator.trim().into(),
            instrument_id: self.instrument_id,
            remarks: self.remarks.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Check a test header and its readings, including the instrument it was performed with.
async fn validate<E: Executor>(
    exec: &E,
    test: &HardnessTest,
    readings: &[f64],
) -> Result<Problems> {
    let mut problems = Problems::default();
    problems.required("part number", &test.part_number);
    problems.required("batch", &test.batch);
    problems.required("operator", &test.operator);
    problems.check(test.tested_on <= Utc::now().date_naive(), || {
        format!("test date {} is in the future", test.tested_on)
    });
    test.scale.check(&mut problems, "spec minimum", test.spec_min);
    test.scale.check(&mut problems, "spec maximum", test.spec_max);
    problems.ordered("spec", Some(test.spec_min), Some(test.spec_max));
    problems.check(!readings.is_empty(), || {
        "at least one reading is required".into()
    });
    for (i, value) in readings.iter().enumerate() {
        test.scale
            .check(&mut problems, &format!("reading {}", i + 1), *value);
    }
    if let Some(instrument_id) = test.instrument_id {
        if let Err(problem) =
            calibration::check_usable(exec, instrument_id, test.tested_on).await?
        {
            problems.push(problem);
        }
    }
    Ok(problems)
}

/// Changes to a hardness test. Absent fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardnessTestPatch {
    pub part_number: Option<String>,
    pub batch: Option<String>,
    pub scale: Option<Scale>,
    pub spec_min: Option<f64>,
    pub spec_max: Option<f64>,
    pub tested_on: Option<NaiveDate>,
    pub operator: Option<String>,
    /// `null` unlinks the instrument.
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub instrument_id: Option<Option<i64>>,
    pub remarks: Option<String>,
    /// Replaces every existing reading.
    pub readings: Option<Vec<f64>>,
}

impl HardnessTestPatch {
    /// Apply the header changes. The result still has to be validated.
    fn apply(&self, test: &mut HardnessTest) {
        for (field, patch) in [
            (&mut test.part_number, &self.part_number),
            (&mut test.batch, &self.batch),
            (&mut test.operator, &self.operator),
        ] {
            if let Some(value) = patch {
                *field = value.trim().into();
            }
        }
        patch_opt(&mut test.remarks, &self.remarks);
        test.scale = self.scale.unwrap_or(test.scale);
        test.spec_min = self.spec_min.unwrap_or(test.spec_min);
        test.spec_max = self.spec_max.unwrap_or(test.spec_max);
        test.tested_on = self.tested_on.unwrap_or(test.tested_on);
        test.instrument_id = self.instrument_id.unwrap_or(test.instrument_id);
    }
}

/// A hardness test with its readings and statistics.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HardnessTestDetail {
    #[serde(flatten)]
    pub test: HardnessTest,
    pub readings: Vec<Checked<Reading>>,
    pub attachments: Vec<Attachment>,
    /// Statistics of the reading values.
    pub summary: Option<Summary>,
    pub tally: Tally,
    pub capability: Option<Capability>,
}

/// Statistics of a test's readings against its spec limits.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Analysis {
    pub readings: Vec<Checked<Reading>>,
    pub summary: Option<Summary>,
    pub tally: Tally,
    pub capability: Option<Capability>,
}

pub(crate) fn analyze(test: &HardnessTest, readings: Vec<Reading>) -> Analysis {
    let limits = test.limits();
    let values = readings.iter().map(|r| r.value).collect::<Vec<_>>();
    let summary = stats::summarize(&values);
    let readings = readings
        .into_iter()
        .map(|item| Checked {
            verdict: limits.check(item.value),
            item,
        })
        .collect::<Vec<_>>();
    Analysis {
        tally: readings.iter().map(|r| r.verdict).collect(),
        capability: summary.and_then(|s| stats::capability(&s, &limits)),
        summary,
        readings,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HardnessTestFilter {
    pub part_number: Option<String>,
    pub batch: Option<String>,
    pub scale: Option<Scale>,
    /// Only tests with this overall verdict.
    pub verdict: Option<Verdict>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl HardnessTestFilter {
    fn select(&self) -> Select {
        Select::from(HARDNESS_TESTS.name)
            .filter_opt("part_number", Op::Eq, self.part_number.clone())
            .filter_opt("batch", Op::Eq, self.batch.clone())
            .filter_opt("scale", Op::Eq, self.scale.map(|s| s.to_string()))
            .filter_opt("tested_on", Op::Ge, self.from)
            .filter_opt("tested_on", Op::Le, self.to)
            .order_by("tested_on", Order::Desc)
            .order_by("id", Order::Desc)
    }
}

/// A hardness test as listed, with the statistics of its readings.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HardnessTestSummary {
    #[serde(flatten)]
    pub test: HardnessTest,
    pub summary: Option<Summary>,
    pub tally: Tally,
    pub capability: Option<Capability>,
}

fn owner(id: i64) -> Owner {
    Owner::new(OwnerKind::HardnessTest, id)
}

fn reading_rows(test_id: i64, values: &[f64]) -> Vec<Reading> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| Reading {
            id: 0,
            test_id,
            position: i as i64 + 1,
            value: *value,
        })
        .collect()
}

/// Record a new hardness test with its readings and attachments.
pub async fn create<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    new: NewHardnessTest,
    user: &str,
) -> Result<HardnessTestDetail> {
    let header = new.header();
    let mut problems = validate(conn, &header, &new.readings).await?;
    for attachment in &new.attachments {
        problems.extend(&attachment.file_name, attachment.validate(store));
    }
    problems.finish()?;

    let id = store
        .with_files(&new.attachments, |stored| {
            insert(conn, &header, &new, stored, user)
        })
        .await?;
    tracing::info!(id, part = %header.part_number, batch = %header.batch, "created hardness test");
    get(conn, id).await
}

async fn insert<C: Connection>(
    conn: &C,
    header: &HardnessTest,
    new: &NewHardnessTest,
    stored: Vec<String>,
    user: &str,
) -> Result<i64> {
    atomically!(conn, |tx| {
        // The instrument may have changed status since it was checked.
        if let Some(instrument_id) = header.instrument_id {
            if let Err(problem) =
                calibration::check_usable(&tx, instrument_id, header.tested_on).await?
            {
                return Err(Error::invalid(problem));
            }
        }
        let id = record::insert(&tx, header).await?;
        audit::record_create(&tx, HARDNESS_TESTS.name, id, user).await?;
        record::insert_all(&tx, &reading_rows(id, &new.readings)).await?;
        attachment::insert_rows(&tx, owner(id), &new.attachments, &stored, user).await?;
        Ok(id)
    })
}

async fn readings<E: Executor>(exec: &E, id: i64) -> Result<Vec<Reading>> {
    record::load_all(
        exec,
        Select::from(HARDNESS_READINGS.name)
            .filter("test_id", Op::Eq, id)
            .order_by("position", Order::Asc),
    )
    .await
}

/// Load a hardness test with its readings, attachments and statistics.
pub async fn get<E: Executor>(exec: &E, id: i64) -> Result<HardnessTestDetail> {
    let test: HardnessTest = record::fetch(exec, id).await?;
    let analysis = analyze(&test, readings(exec, id).await?);
    let attachments = attachment::list_for(exec, owner(id)).await?;
    Ok(HardnessTestDetail {
        test,
        readings: analysis.readings,
        attachments,
        summary: analysis.summary,
        tally: analysis.tally,
        capability: analysis.capability,
    })
}

async fn summarize<E: Executor>(
    exec: &E,
    tests: Vec<HardnessTest>,
) -> Result<Vec<HardnessTestSummary>> {
    let mut summaries = Vec::with_capacity(tests.len());
    for test in tests {
        let analysis = analyze(&test, readings(exec, test.id).await?);
        summaries.push(HardnessTestSummary {
            test,
            summary: analysis.summary,
            tally: analysis.tally,
            capability: analysis.capability,
        });
    }
    Ok(summaries)
}

/// List hardness tests, most recent first.
pub async fn list<E: Executor>(
    exec: &E,
    filter: &HardnessTestFilter,
    page: PageRequest,
) -> Result<Page<HardnessTestSummary>> {
    match filter.verdict {
        // The verdict is derived from the readings, so it has to be filtered here.
        Some(_) => Ok(Page::from_items(all(exec, filter).await?, page)),
        None => {
            let Page {
                items,
                page,
                per_page,
                total,
                total_pages,
            } = page::load(exec, filter.select(), page, HardnessTest::from_row).await?;
            Ok(Page {
                items: summarize(exec, items).await?,
                page,
                per_page,
                total,
                total_pages,
            })
        }
    }
}

/// Every hardness test matching `filter`, most recent first.
pub async fn all<E: Executor>(
    exec: &E,
    filter: &HardnessTestFilter,
) -> Result<Vec<HardnessTestSummary>> {
    let tests = record::load_all(exec, filter.select()).await?;
    let mut summaries = summarize(exec, tests).await?;
    if let Some(verdict) = filter.verdict {
        summaries.retain(|summary| summary.tally.verdict == verdict);
    }
    Ok(summaries)
}

/// Apply `patch` to a hardness test.
///
/// The patched test is validated as a whole: changing the scale re-checks the spec limits and
/// readings, and changing the date or instrument re-checks the instrument's calibration.
pub async fn update<C: Connection>(
    conn: &C,
    id: i64,
    patch: HardnessTestPatch,
    user: &str,
) -> Result<HardnessTestDetail> {
    atomically!(conn, |tx| {
        let old: HardnessTest = record::fetch(&tx, id).await?;
        let mut new = old.clone();
        patch.apply(&mut new);

        let existing = readings(&tx, id)
            .await?
            .into_iter()
            .map(|r| r.value)
            .collect::<Vec<_>>();
        let values = patch.readings.as_ref().unwrap_or(&existing);
        // An instrument which has since gone out of service does not invalidate existing tests.
        let recheck_instrument =
            new.instrument_id != old.instrument_id || new.tested_on != old.tested_on;
        let checked = HardnessTest {
            instrument_id: new.instrument_id.filter(|_| recheck_instrument),
            ..new.clone()
        };
        validate(&tx, &checked, values).await?.finish()?;
        let changes = record::save(&tx, &old, &new, user).await?;

        if let Some(replacement) = &patch.readings {
            if existing != *replacement {
                record::remove_children(&tx, &HARDNESS_READINGS, "test_id", id).await?;
                record::insert_all(&tx, &reading_rows(id, replacement)).await?;
                let change = Change::new(
                    "readings",
                    existing.iter().join(", "),
                    replacement.iter().join(", "),
                );
                audit::record_changes(&tx, HARDNESS_TESTS.name, id, &[change], user).await?;
                if changes.is_empty() {
                    record::touch::<_, HardnessTest>(&tx, id).await?;
                }
            }
        }
        Ok(())
    })?;
    get(conn, id).await
}

/// Delete a hardness test, its readings and its attachments.
pub async fn delete<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    id: i64,
    user: &str,
) -> Result<()> {
    let stored = atomically!(conn, |tx| {
        record::remove_children(&tx, &HARDNESS_READINGS, "test_id", id).await?;
        let stored = attachment::remove_rows_for(&tx, owner(id), user).await?;
        record::remove::<_, HardnessTest>(&tx, id).await?;
        audit::record_delete(&tx, HARDNESS_TESTS.name, id, user).await?;
        Ok(stored)
    })?;
    store.remove_all(&stored).await;
    tracing::info!(id, "deleted hardness test");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        attachment::test::temp_store,
        calibration::{
            create_instrument, test::new_instrument, update_instrument, InstrumentPatch,
            InstrumentStatus,
        },
        schema,
        sql::db::memory,
    };
    use chrono::Duration;

    pub(crate) fn new_test(readings: Vec<f64>, instrument_id: Option<i64>) -> NewHardnessTest {
        NewHardnessTest {
            part_number: "SH-100".into(),
            batch: "B-7".into(),
            scale: Scale::Hrc,
            spec_min: 58.0,
            spec_max: 62.0,
            tested_on: Utc::now().date_naive(),
            operator: "frank".into(),
            instrument_id,
            remarks: None,
            readings,
            attachments: vec![],
        }
    }

    async fn setup() -> (memory::Connection, AttachmentStore) {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        (db, temp_store().await)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_scale_names() {
        assert_eq!(Scale::Hrc.to_string(), "HRC");
        assert_eq!("hv".parse::<Scale>().unwrap(), Scale::Hv);
        assert_eq!(serde_json::to_string(&Scale::Hb).unwrap(), r#""HB""#);
    }

    #[async_std::test]
    async fn test_create_and_get() {
        let (db, store) = setup().await;
        let detail = create(&db, &store, new_test(vec![59.0, 60.0, 61.0], None), "frank")
            .await
            .unwrap();
        assert_eq!(
            detail.readings.iter().map(|r| r.item.position).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        let summary = detail.summary.unwrap();
        assert!(close(summary.mean, 60.0));
        assert!(close(summary.std_dev, 1.0));
        assert_eq!(detail.tally.verdict, Verdict::Pass);
        let capability = detail.capability.unwrap();
        assert!(close(capability.cp, 4.0 / 6.0));
        assert_eq!(get(&db, detail.test.id).await.unwrap(), detail);
    }

    #[async_std::test]
    async fn test_validation() {
        let (db, store) = setup().await;
        let mut new = new_test(vec![59.0, 85.0], None);
        new.spec_min = 63.0;
        let Err(Error::Invalid { problems }) = create(&db, &store, new, "frank").await else {
            panic!("expected validation failure");
        };
        // Spec limits out of order, reading outside the HRC range.
        assert_eq!(problems.len(), 2, "{problems:?}");

        let err = create(&db, &store, new_test(vec![], None), "frank")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
    }

    #[async_std::test]
    async fn test_instrument_must_be_calibrated() {
        let (db, store) = setup().await;
        let today = Utc::now().date_naive();

        let err = create(&db, &store, new_test(vec![60.0], Some(42)), "frank")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");

        let overdue = create_instrument(
            &db,
            new_instrument("RT-OLD", Some(today - Duration::days(365))),
            "eve",
        )
        .await
        .unwrap();
        let err = create(
            &db,
            &store,
            new_test(vec![60.0], Some(overdue.instrument.id)),
            "frank",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");

        let good = create_instrument(
            &db,
            new_instrument("RT-NEW", Some(today - Duration::days(1))),
            "eve",
        )
        .await
        .unwrap();
        let test = create(
            &db,
            &store,
            new_test(vec![60.0], Some(good.instrument.id)),
            "frank",
        )
        .await
        .unwrap();

        // Taking the instrument out of service later does not block edits to the test.
        update_instrument(
            &db,
            good.instrument.id,
            InstrumentPatch {
                status: Some(InstrumentStatus::OutOfService),
                ..Default::default()
            },
            "eve",
        )
        .await
        .unwrap();
        update(
            &db,
            test.test.id,
            HardnessTestPatch {
                remarks: Some("retested".into()),
                ..Default::default()
            },
            "frank",
        )
        .await
        .unwrap();

        // But the instrument cannot be used for new tests.
        let err = create(
            &db,
            &store,
            new_test(vec![60.0], Some(good.instrument.id)),
            "frank",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");
    }

    #[async_std::test]
    async fn test_list_by_verdict() {
        let (db, store) = setup().await;
        create(&db, &store, new_test(vec![60.0, 61.0], None), "frank")
            .await
            .unwrap();
        let failing = create(&db, &store, new_test(vec![60.0, 63.5], None), "frank")
            .await
            .unwrap();

        let page = list(
            &db,
            &HardnessTestFilter {
                verdict: Some(Verdict::Fail),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].test.id, failing.test.id);
        assert_eq!(page.items[0].tally.failed, 1);

        let page = list(&db, &Default::default(), PageRequest::new(1, 1))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].test.id, failing.test.id);
    }

    #[async_std::test]
    async fn test_update_readings() {
        let (db, store) = setup().await;
        let created = create(&db, &store, new_test(vec![60.0, 63.5], None), "frank")
            .await
            .unwrap();
        let id = created.test.id;

        let updated = update(
            &db,
            id,
            HardnessTestPatch {
                readings: Some(vec![60.0, 61.5, 59.5]),
                ..Default::default()
            },
            "frank",
        )
        .await
        .unwrap();
        assert_eq!(updated.readings.len(), 3);
        assert_eq!(updated.tally.verdict, Verdict::Pass);
        assert!(updated.test.updated_at > created.test.updated_at);
        assert_eq!(updated.test.created_at, created.test.created_at);

        let history = audit::history(&db, HARDNESS_TESTS.name, id).await.unwrap();
        let change = history.last().unwrap();
        assert_eq!(change.field.as_deref(), Some("readings"));
        assert_eq!(change.old_value.as_deref(), Some("60, 63.5"));
        assert_eq!(change.new_value.as_deref(), Some("60, 61.5, 59.5"));

        // Limits beyond the physical range of the scale are rejected.
        let err = update(
            &db,
            id,
            HardnessTestPatch {
                spec_max: Some(75.0),
                ..Default::default()
            },
            "frank",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");

        delete(&db, &store, id, "frank").await.unwrap();
        assert!(readings(&db, id).await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_unlink_instrument() {
        let (db, store) = setup().await;
        let today = Utc::now().date_naive();
        let instrument = create_instrument(&db, new_instrument("RT-1", Some(today)), "eve")
            .await
            .unwrap()
            .instrument
            .id;
        let id = create(&db, &store, new_test(vec![60.0], Some(instrument)), "frank")
            .await
            .unwrap()
            .test
            .id;

        // An absent field leaves the link alone.
        let patch: HardnessTestPatch = serde_json::from_str(r#"{"remarks": "ok"}"#).unwrap();
        assert_eq!(patch.instrument_id, None);
        let updated = update(&db, id, patch, "frank").await.unwrap();
        assert_eq!(updated.test.instrument_id, Some(instrument));

        let patch: HardnessTestPatch =
            serde_json::from_str(r#"{"instrument_id": null}"#).unwrap();
        assert_eq!(patch.instrument_id, Some(None));
        let updated = update(&db, id, patch, "frank").await.unwrap();
        assert_eq!(updated.test.instrument_id, None);

        let history = audit::history(&db, HARDNESS_TESTS.name, id).await.unwrap();
        let change = history.last().unwrap();
        assert_eq!(change.field.as_deref(), Some("instrument_id"));
        assert_eq!(change.new_value, None);
    }
}
