//! Chemical composition testing of heats.
//!
//! Each test records the weight percentage of a set of elements in a sample of a heat, and
//! checks each against minimum and maximum limits. Limits left out by the caller are filled in
//! from the built-in [grade catalogue](grades).

use crate::{
    attachment::{self, Attachment, AttachmentStore, NewAttachment, Owner, OwnerKind},
    audit::{self, Change},
    error::Problems,
    page::{self, Page, PageRequest},
    record::{self, patch_opt, patch_text, Record},
    schema::{CHEMICAL_READINGS, CHEMICAL_TESTS},
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    stats::{Checked, Limits, Tally, Verdict},
    Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Symbols of the alloying and residual elements which may be reported.
pub const ELEMENTS: &[&str] = &[
    "C", "Si", "Mn", "P", "S", "Cr", "Ni", "Mo", "Cu", "V", "Al", "Ti", "Nb", "W", "Co", "B", "N",
    "Sn", "Pb", "Ca",
];

/// The canonical spelling of an element symbol, if it is a known element.
pub fn element(symbol: &str) -> Option<&'static str> {
    let symbol = symbol.trim();
    ELEMENTS
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(symbol))
}

/// Composition limits for one element of a grade, in weight percent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ElementLimit {
    pub element: &'static str,
    pub min_pct: Option<f64>,
    pub max_pct: Option<f64>,
}

const fn range(element: &'static str, min: f64, max: f64) -> ElementLimit {
    ElementLimit {
        element,
        min_pct: Some(min),
        max_pct: Some(max),
    }
}

const fn max(element: &'static str, max: f64) -> ElementLimit {
    ElementLimit {
        element,
        min_pct: None,
        max_pct: Some(max),
    }
}

/// A steel grade and its composition limits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Grade {
    pub name: &'static str,
    pub description: &'static str,
    pub limits: &'static [ElementLimit],
}

impl Grade {
    pub fn limit(&self, element: &str) -> Option<&ElementLimit> {
        self.limits.iter().find(|l| l.element == element)
    }
}

const GRADES: &[Grade] = &[
    Grade {
        name: "AISI 1020",
        description: "Low-carbon steel",
        limits: &[
            range("C", 0.17, 0.23),
            range("Mn", 0.30, 0.60),
            max("P", 0.040),
            max("S", 0.050),
        ],
    },
    Grade {
        name: "AISI 1045",
        description: "Medium-carbon steel",
        limits: &[
            range("C", 0.42, 0.50),
            range("Mn", 0.60, 0.90),
            max("P", 0.040),
            max("S", 0.050),
        ],
    },
    Grade {
        name: "AISI 4140",
        description: "Chromium-molybdenum alloy steel",
        limits: &[
            range("C", 0.38, 0.43),
            range("Si", 0.15, 0.35),
            range("Mn", 0.75, 1.00),
            max("P", 0.035),
            max("S", 0.040),
            range("Cr", 0.80, 1.10),
            range("Mo", 0.15, 0.25),
        ],
    },
    Grade {
        name: "AISI 4340",
        description: "Nickel-chromium-molybdenum alloy steel",
        limits: &[
            range("C", 0.38, 0.43),
            range("Si", 0.15, 0.35),
            range("Mn", 0.60, 0.80),
            max("P", 0.035),
            max("S", 0.040),
            range("Cr", 0.70, 0.90),
            range("Ni", 1.65, 2.00),
            range("Mo", 0.20, 0.30),
        ],
    },
    Grade {
        name: "AISI 52100",
        description: "High-carbon chromium bearing steel",
        limits: &[
            range("C", 0.98, 1.10),
            range("Si", 0.15, 0.35),
            range("Mn", 0.25, 0.45),
            max("P", 0.025),
            max("S", 0.025),
            range("Cr", 1.30, 1.60),
        ],
    },
    Grade {
        name: "AISI 8620",
        description: "Nickel-chromium-molybdenum carburizing steel",
        limits: &[
            range("C", 0.18, 0.23),
            range("Si", 0.15, 0.35),
            range("Mn", 0.70, 0.90),
            max("P", 0.035),
            max("S", 0.040),
            range("Cr", 0.40, 0.60),
            range("Ni", 0.40, 0.70),
            range("Mo", 0.15, 0.25),
        ],
    },
    Grade {
        name: "AISI 304",
        description: "Austenitic stainless steel",
        limits: &[
            max("C", 0.08),
            max("Si", 0.75),
            max("Mn", 2.00),
            max("P", 0.045),
            max("S", 0.030),
            range("Cr", 18.0, 20.0),
            range("Ni", 8.0, 10.5),
            max("N", 0.10),
        ],
    },
    Grade {
        name: "AISI 316",
        description: "Austenitic molybdenum-bearing stainless steel",
        limits: &[
            max("C", 0.08),
            max("Si", 0.75),
            max("Mn", 2.00),
            max("P", 0.045),
            max("S", 0.030),
            range("Cr", 16.0, 18.0),
            range("Ni", 10.0, 14.0),
            range("Mo", 2.0, 3.0),
            max("N", 0.10),
        ],
    },
];

/// The grade catalogue.
pub fn grades() -> &'static [Grade] {
    GRADES
}

/// Look up a grade by name, ignoring case and an optional `AISI` prefix.
pub fn grade(name: &str) -> Option<&'static Grade> {
    let key = |name: &str| {
        let name = name.trim().to_ascii_uppercase();
        name.strip_prefix("AISI").unwrap_or(name.as_str()).trim().to_string()
    };
    let wanted = key(name);
    GRADES.iter().find(|grade| key(grade.name) == wanted)
}

/// The header of a chemical composition test.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChemicalTest {
    pub id: i64,
    pub heat_number: String,
    pub grade: String,
    pub sample_id: Option<String>,
    pub laboratory: String,
    pub tested_on: NaiveDate,
    pub analyst: String,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ChemicalTest {
    const TABLE: Table<'static> = CHEMICAL_TESTS;
    const ENTITY: &'static str = "chemical test";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("heat_number", self.heat_number.as_str().into()),
            ("grade", self.grade.as_str().into()),
            ("sample_id", self.sample_id.clone().into()),
            ("laboratory", self.laboratory.as_str().into()),
            ("tested_on", self.tested_on.into()),
            ("analyst", self.analyst.as_str().into()),
            ("remarks", self.remarks.clone().into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            heat_number: row.get("heat_number")?,
            grade: row.get("grade")?,
            sample_id: row.get("sample_id")?,
            laboratory: row.get("laboratory")?,
            tested_on: row.get("tested_on")?,
            analyst: row.get("analyst")?,
            remarks: row.get("remarks")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// The measured concentration of one element.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Reading {
    pub id: i64,
    pub test_id: i64,
    #[serde(flatten)]
    pub data: NewReading,
}

impl Record for Reading {
    const TABLE: Table<'static> = CHEMICAL_READINGS;
    const ENTITY: &'static str = "chemical reading";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("test_id", self.test_id.into()),
            ("element", self.data.element.as_str().into()),
            ("measured_pct", self.data.measured_pct.into()),
            ("min_pct", self.data.min_pct.into()),
            ("max_pct", self.data.max_pct.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            test_id: row.get("test_id")?,
            data: NewReading {
                element: row.get("element")?,
                measured_pct: row.get("measured_pct")?,
                min_pct: row.get("min_pct")?,
                max_pct: row.get("max_pct")?,
            },
        })
    }
}

/// A reading to record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewReading {
    pub element: String,
    pub measured_pct: f64,
    #[serde(default)]
    pub min_pct: Option<f64>,
    #[serde(default)]
    pub max_pct: Option<f64>,
}

impl NewReading {
    pub fn limits(&self) -> Limits {
        Limits::new(self.min_pct, self.max_pct)
    }

    pub fn verdict(&self) -> Verdict {
        self.limits().check(self.measured_pct)
    }
}

fn percentage(problems: &mut Problems, field: &str, value: f64) {
    problems.check((0.0..=100.0).contains(&value), || {
        format!("{field} must be between 0 and 100%")
    });
}

/// Canonicalize element symbols and fill in limits from the grade catalogue, reporting any
/// invalid readings.
fn prepare_readings(grade: &str, readings: &[NewReading]) -> (Vec<NewReading>, Problems) {
    let mut problems = Problems::default();
    let grade = self::grade(grade);
    let mut seen = HashSet::new();
    let mut prepared = Vec::with_capacity(readings.len());

    for reading in readings {
        let mut reading = reading.clone();
        let Some(symbol) = element(&reading.element) else {
            problems.push(format!("unknown element {:?}", reading.element));
            continue;
        };
        reading.element = symbol.into();
        problems.check(seen.insert(symbol), || {
            format!("element {symbol} is reported more than once")
        });

        if let Some(limit) = grade.and_then(|grade| grade.limit(symbol)) {
            reading.min_pct = reading.min_pct.or(limit.min_pct);
            reading.max_pct = reading.max_pct.or(limit.max_pct);
        }

        let mut own = Problems::default();
        percentage(&mut own, "measured value", reading.measured_pct);
        for (field, value) in [("minimum", reading.min_pct), ("maximum", reading.max_pct)] {
            if let Some(value) = value {
                percentage(&mut own, field, value);
            }
        }
        own.ordered("limits", reading.min_pct, reading.max_pct);
        problems.extend(symbol, own);
        prepared.push(reading);
    }

    let total = readings
        .iter()
        .map(|r| r.measured_pct)
        .filter(|pct| pct.is_finite())
        .sum::<f64>();
    problems.check(total <= 100.0, || {
        format!("readings add up to {total:.3}%, more than 100%")
    });
    (prepared, problems)
}

/// A new chemical test, with its readings and attachments.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewChemicalTest {
    pub heat_number: String,
    pub grade: String,
    #[serde(default)]
    pub sample_id: Option<String>,
    pub laboratory: String,
    pub tested_on: NaiveDate,
    pub analyst: String,
    #[serde(default)]
    pub remarks: Option<String>,
    pub readings: Vec<NewReading>,
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
}

fn validate_tested(problems: &mut Problems, tested_on: NaiveDate) {
    problems.check(tested_on <= Utc::now().date_naive(), || {
        format!("test date {tested_on} is in the future")
    });
}

impl NewChemicalTest {
    /// Check the test, returning its readings with canonical symbols and filled-in limits.
    fn prepare(&self, store: &AttachmentStore) -> Result<Vec<NewReading>> {
        let mut problems = Problems::default();
        problems.required("heat number", &self.heat_number);
        problems.required("grade", &self.grade);
        problems.required("laboratory", &self.laboratory);
        problems.required("analyst", &self.analyst);
        validate_tested(&mut problems, self.tested_on);
        problems.check(!self.readings.is_empty(), || {
            "at least one reading is required".into()
        });
        let (readings, reading_problems) = prepare_readings(&self.grade, &self.readings);
        problems.extend("readings", reading_problems);
        for attachment in &self.attachments {
            problems.extend(&attachment.file_name, attachment.validate(store));
        }
        problems.finish()?;
        Ok(readings)
    }

    fn header(&self) -> ChemicalTest {
        let now = Utc::now();
        ChemicalTest {
            id: 0,
            heat_number: self.heat_number.trim().into(),
            grade: canonical_grade(&self.grade),
            sample_id: self.sample_id.clone(),
            laboratory: self.laboratory.trim().into(),
            tested_on: self.tested_on,
            analyst: self.analyst.trim().into(),
            remarks: self.remarks.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Catalogue grades are stored under their catalogue name.
fn canonical_grade(name: &str) -> String {
    grade(name)
        .map(|grade| grade.name.to_string())
        .unwrap_or_else(|| name.trim().to_string())
}

/// Move readings from grade `from` to grade `to`.
///
/// Limits which came from the catalogue entry of `from` are replaced by those of `to`; limits
/// given with the reading are kept.
fn regrade(from: &str, to: &str, readings: &[NewReading]) -> (Vec<NewReading>, Problems) {
    let from = grade(from);
    let stripped = readings
        .iter()
        .cloned()
        .map(|mut reading| {
            if let Some(limit) = from.and_then(|grade| grade.limit(&reading.element)) {
                if reading.min_pct == limit.min_pct {
                    reading.min_pct = None;
                }
                if reading.max_pct == limit.max_pct {
                    reading.max_pct = None;
                }
            }
            reading
        })
        .collect::<Vec<_>>();
    prepare_readings(to, &stripped)
}

/// Changes to a chemical test. Absent fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChemicalTestPatch {
    pub heat_number: Option<String>,
    pub grade: Option<String>,
    pub sample_id: Option<String>,
    pub laboratory: Option<String>,
    pub tested_on: Option<NaiveDate>,
    pub analyst: Option<String>,
    pub remarks: Option<String>,
    /// Replaces every existing reading.
    pub readings: Option<Vec<NewReading>>,
}

impl ChemicalTestPatch {
    fn apply(&self, test: &mut ChemicalTest) -> Problems {
        let mut problems = Problems::default();
        for (name, field, patch) in [
            ("heat number", &mut test.heat_number, &self.heat_number),
            ("laboratory", &mut test.laboratory, &self.laboratory),
            ("analyst", &mut test.analyst, &self.analyst),
        ] {
            patch_text(&mut problems, name, field, patch);
        }
        if let Some(grade) = &self.grade {
            problems.required("grade", grade);
            test.grade = canonical_grade(grade);
        }
        patch_opt(&mut test.sample_id, &self.sample_id);
        patch_opt(&mut test.remarks, &self.remarks);
        if let Some(tested_on) = self.tested_on {
            validate_tested(&mut problems, tested_on);
            test.tested_on = tested_on;
        }
        problems
    }
}

/// A chemical test with its readings and verdicts.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChemicalTestDetail {
    #[serde(flatten)]
    pub test: ChemicalTest,
    pub readings: Vec<Checked<Reading>>,
    pub attachments: Vec<Attachment>,
    pub tally: Tally,
}

/// Filters for the list of chemical tests.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChemicalTestFilter {
    pub heat_number: Option<String>,
    pub grade: Option<String>,
    pub laboratory: Option<String>,
    /// Only tests with this overall verdict.
    pub verdict: Option<Verdict>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl ChemicalTestFilter {
    fn select(&self) -> Select {
        Select::from(CHEMICAL_TESTS.name)
            .filter_opt("heat_number", Op::Eq, self.heat_number.clone())
            .filter_opt("grade", Op::Eq, self.grade.as_deref().map(canonical_grade))
            .filter_opt("laboratory", Op::Eq, self.laboratory.clone())
            .filter_opt("tested_on", Op::Ge, self.from)
            .filter_opt("tested_on", Op::Le, self.to)
            .order_by("tested_on", Order::Desc)
            .order_by("id", Order::Desc)
    }
}

fn owner(id: i64) -> Owner {
    Owner::new(OwnerKind::ChemicalTest, id)
}

fn reading_rows(test_id: i64, readings: &[NewReading]) -> Vec<Reading> {
    readings
        .iter()
        .map(|data| Reading {
            id: 0,
            test_id,
            data: data.clone(),
        })
        .collect()
}

/// Record a new chemical test with its readings and attachments.
pub async fn create<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    new: NewChemicalTest,
    user: &str,
) -> Result<ChemicalTestDetail> {
    let readings = new.prepare(store)?;
    let id = store
        .with_files(&new.attachments, |stored| {
            insert(conn, &new, &readings, stored, user)
        })
        .await?;
    tracing::info!(id, heat = %new.heat_number, grade = %new.grade, "created chemical test");
    get(conn, id).await
}

async fn insert<C: Connection>(
    conn: &C,
    new: &NewChemicalTest,
    readings: &[NewReading],
    stored: Vec<String>,
    user: &str,
) -> Result<i64> {
    atomically!(conn, |tx| {
        let id = record::insert(&tx, &new.header()).await?;
        audit::record_create(&tx, CHEMICAL_TESTS.name, id, user).await?;
        record::insert_all(&tx, &reading_rows(id, readings)).await?;
        attachment::insert_rows(&tx, owner(id), &new.attachments, &stored, user).await?;
        Ok(id)
    })
}

pub(crate) async fn readings<E: Executor>(exec: &E, id: i64) -> Result<Vec<Reading>> {
    record::children(exec, "test_id", id).await
}

fn check(readings: Vec<Reading>) -> (Vec<Checked<Reading>>, Tally) {
    let checked = readings
        .into_iter()
        .map(|item| Checked {
            verdict: item.data.verdict(),
            item,
        })
        .collect::<Vec<_>>();
    let tally = checked.iter().map(|r| r.verdict).collect();
    (checked, tally)
}

/// The verdict tally of a test.
pub(crate) async fn tally<E: Executor>(exec: &E, id: i64) -> Result<Tally> {
    Ok(check(readings(exec, id).await?).1)
}

/// Load a chemical test with its readings, attachments and verdicts.
pub async fn get<E: Executor>(exec: &E, id: i64) -> Result<ChemicalTestDetail> {
    let test = record::fetch::<_, ChemicalTest>(exec, id).await?;
    let (readings, tally) = check(readings(exec, id).await?);
    let attachments = attachment::list_for(exec, owner(id)).await?;
    Ok(ChemicalTestDetail {
        test,
        readings,
        attachments,
        tally,
    })
}

/// A chemical test with its overall verdict, as listed.
pub type ChemicalTestSummary = Checked<ChemicalTest>;

async fn summarize<E: Executor>(
    exec: &E,
    tests: Vec<ChemicalTest>,
) -> Result<Vec<ChemicalTestSummary>> {
    let mut summaries = Vec::with_capacity(tests.len());
    for test in tests {
        let verdict = tally(exec, test.id).await?.verdict;
        summaries.push(Checked { item: test, verdict });
    }
    Ok(summaries)
}

/// List chemical tests, most recent first.
pub async fn list<E: Executor>(
    exec: &E,
    filter: &ChemicalTestFilter,
    page: PageRequest,
) -> Result<Page<ChemicalTestSummary>> {
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
            } = page::load(exec, filter.select(), page, ChemicalTest::from_row).await?;
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

/// Every chemical test matching `filter`, most recent first.
pub async fn all<E: Executor>(
    exec: &E,
    filter: &ChemicalTestFilter,
) -> Result<Vec<ChemicalTestSummary>> {
    let tests = record::load_all(exec, filter.select()).await?;
    let mut summaries = summarize(exec, tests).await?;
    if let Some(verdict) = filter.verdict {
        summaries.retain(|summary| summary.verdict == verdict);
    }
    Ok(summaries)
}

fn describe(readings: &[NewReading]) -> Value {
    readings
        .iter()
        .map(|r| format!("{}={}", r.element, r.measured_pct))
        .collect::<Vec<_>>()
        .join(", ")
        .into()
}

/// Apply `patch` to a chemical test.
///
/// Replacement readings are checked against the test's grade after the patch is applied. Changing
/// the grade alone re-checks the existing readings against the new grade.
pub async fn update<C: Connection>(
    conn: &C,
    id: i64,
    patch: ChemicalTestPatch,
    user: &str,
) -> Result<ChemicalTestDetail> {
    atomically!(conn, |tx| {
        let old: ChemicalTest = record::fetch(&tx, id).await?;
        let mut new = old.clone();
        let mut problems = patch.apply(&mut new);
        let existing = readings(&tx, id)
            .await?
            .into_iter()
            .map(|r| r.data)
            .collect::<Vec<_>>();
        let replacement = match &patch.readings {
            Some(readings) => {
                problems.check(!readings.is_empty(), || {
                    "at least one reading is required".into()
                });
                let (readings, reading_problems) = prepare_readings(&new.grade, readings);
                problems.extend("readings", reading_problems);
                Some(readings)
            }
            None if new.grade != old.grade => {
                let (readings, reading_problems) = regrade(&old.grade, &new.grade, &existing);
                problems.extend("readings", reading_problems);
                Some(readings)
            }
            None => None,
        };
        problems.finish()?;
        let changes = record::save(&tx, &old, &new, user).await?;

        if let Some(replacement) = replacement {
            if existing != replacement {
                record::remove_children(&tx, &CHEMICAL_READINGS, "test_id", id).await?;
                record::insert_all(&tx, &reading_rows(id, &replacement)).await?;
                let change =
                    Change::new("readings", describe(&existing), describe(&replacement));
                audit::record_changes(&tx, CHEMICAL_TESTS.name, id, &[change], user).await?;
                if changes.is_empty() {
                    record::touch::<_, ChemicalTest>(&tx, id).await?;
                }
            }
        }
        Ok(())
    })?;
    get(conn, id).await
}

/// Delete a chemical test, its readings and its attachments.
pub async fn delete<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    id: i64,
    user: &str,
) -> Result<()> {
    let stored = atomically!(conn, |tx| {
        record::remove_children(&tx, &CHEMICAL_READINGS, "test_id", id).await?;
        let stored = attachment::remove_rows_for(&tx, owner(id), user).await?;
        record::remove::<_, ChemicalTest>(&tx, id).await?;
        audit::record_delete(&tx, CHEMICAL_TESTS.name, id, user).await?;
        Ok(stored)
    })?;
    store.remove_all(&stored).await;
    tracing::info!(id, "deleted chemical test");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{attachment::test::temp_store, schema, sql::db::memory, Error};

    pub(crate) fn reading(element: &str, measured_pct: f64) -> NewReading {
        NewReading {
            element: element.into(),
            measured_pct,
            min_pct: None,
            max_pct: None,
        }
    }

    pub(crate) fn new_test(grade: &str, readings: Vec<NewReading>) -> NewChemicalTest {
        NewChemicalTest {
            heat_number: "H12345".into(),
            grade: grade.into(),
            sample_id: Some("S-1".into()),
            laboratory: "In-house".into(),
            tested_on: Utc::now().date_naive(),
            analyst: "carol".into(),
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

    #[test]
    fn test_grade_lookup() {
        assert_eq!(grade("4140").unwrap().name, "AISI 4140");
        assert_eq!(grade("aisi 316").unwrap().name, "AISI 316");
        assert!(grade("1018").is_none());
        assert_eq!(grades().len(), 8);
        for grade in grades() {
            for limit in grade.limits {
                assert!(element(limit.element).is_some(), "{}", limit.element);
                if let (Some(min), Some(max)) = (limit.min_pct, limit.max_pct) {
                    assert!(min <= max);
                }
            }
        }
    }

    #[test]
    fn test_prepare_fills_limits() {
        let mut custom = reading("mn", 0.95);
        custom.max_pct = Some(0.90);
        let (readings, problems) =
            prepare_readings("4140", &[reading("C", 0.40), custom, reading("Cu", 0.1)]);
        assert!(problems.is_empty());
        assert_eq!(readings[0].limits(), Limits::between(0.38, 0.43));
        // The caller's own limit wins over the catalogue.
        assert_eq!(readings[1].element, "Mn");
        assert_eq!(readings[1].limits(), Limits::between(0.75, 0.90));
        assert_eq!(readings[1].verdict(), Verdict::Fail);
        // Elements the grade does not constrain stay unchecked.
        assert_eq!(readings[2].verdict(), Verdict::Unchecked);
    }

    #[test]
    fn test_prepare_rejects_bad_readings() {
        let (_, problems) = prepare_readings(
            "AISI 304",
            &[
                reading("Cr", 60.0),
                reading("Ni", 50.0),
                reading("cr", 1.0),
                reading("Xx", 1.0),
                reading("C", -0.1),
            ],
        );
        let Err(Error::Invalid { problems }) = problems.finish() else {
            panic!("expected validation failure");
        };
        // Duplicate Cr, unknown Xx, negative C, total over 100%.
        assert_eq!(problems.len(), 4, "{problems:?}");
    }

    #[async_std::test]
    async fn test_create_get_list() {
        let (db, store) = setup().await;
        let passing = create(
            &db,
            &store,
            new_test("4140", vec![reading("C", 0.40), reading("Cr", 0.95)]),
            "carol",
        )
        .await
        .unwrap();
        assert_eq!(passing.test.grade, "AISI 4140");
        assert_eq!(passing.tally.verdict, Verdict::Pass);

        let failing = create(
            &db,
            &store,
            new_test("AISI 1045", vec![reading("C", 0.55)]),
            "carol",
        )
        .await
        .unwrap();
        assert_eq!(failing.tally.verdict, Verdict::Fail);
        assert_eq!(failing.readings[0].verdict, Verdict::Fail);

        let page = list(&db, &Default::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].item.id, failing.test.id);

        let page = list(
            &db,
            &ChemicalTestFilter {
                verdict: Some(Verdict::Pass),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].item.id, passing.test.id);

        let page = list(
            &db,
            &ChemicalTestFilter {
                grade: Some("1045".into()),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
    }

    #[async_std::test]
    async fn test_update_and_delete() {
        let (db, store) = setup().await;
        let created = create(
            &db,
            &store,
            new_test("4140", vec![reading("C", 0.50)]),
            "carol",
        )
        .await
        .unwrap();
        let id = created.test.id;
        assert_eq!(created.tally.verdict, Verdict::Fail);

        // Regrading the test re-checks the replacement readings against the new grade.
        let updated = update(
            &db,
            id,
            ChemicalTestPatch {
                grade: Some("1045".into()),
                readings: Some(vec![reading("C", 0.45)]),
                ..Default::default()
            },
            "dave",
        )
        .await
        .unwrap();
        assert_eq!(updated.test.grade, "AISI 1045");
        assert_eq!(updated.tally.verdict, Verdict::Pass);
        let fields = audit::history(&db, CHEMICAL_TESTS.name, id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| e.field)
            .collect::<Vec<_>>();
        assert_eq!(fields, ["grade", "readings"]);

        let err = update(
            &db,
            id,
            ChemicalTestPatch {
                readings: Some(vec![]),
                ..Default::default()
            },
            "dave",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));

        delete(&db, &store, id, "dave").await.unwrap();
        assert!(matches!(get(&db, id).await, Err(Error::NotFound { .. })));
        assert!(readings(&db, id).await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_regrade_without_readings() {
        let (db, store) = setup().await;
        let mut custom = reading("Cr", 0.95);
        custom.min_pct = Some(0.90);
        custom.max_pct = Some(1.00);
        let created = create(
            &db,
            &store,
            new_test("4140", vec![reading("C", 0.45), custom]),
            "carol",
        )
        .await
        .unwrap();
        let id = created.test.id;
        assert_eq!(created.readings[0].verdict, Verdict::Fail);

        let updated = update(
            &db,
            id,
            ChemicalTestPatch {
                grade: Some("1045".into()),
                ..Default::default()
            },
            "dave",
        )
        .await
        .unwrap();
        assert_eq!(updated.test.grade, "AISI 1045");
        assert_eq!(
            updated.readings[0].item.data.limits(),
            Limits::between(0.42, 0.50)
        );
        assert_eq!(updated.readings[0].verdict, Verdict::Pass);
        // Limits given with the reading are kept.
        assert_eq!(
            updated.readings[1].item.data.limits(),
            Limits::between(0.90, 1.00)
        );
        assert_eq!(updated.tally.verdict, Verdict::Pass);

        let fields = audit::history(&db, CHEMICAL_TESTS.name, id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| e.field)
            .collect::<Vec<_>>();
        assert_eq!(fields, ["grade", "readings"]);
    }

    #[async_std::test]
    async fn test_replacing_readings_bumps_updated_at() {
        let (db, store) = setup().await;
        let created = create(&db, &store, new_test("4140", vec![reading("C", 0.40)]), "carol")
            .await
            .unwrap();
        let updated = update(
            &db,
            created.test.id,
            ChemicalTestPatch {
                readings: Some(vec![reading("C", 0.41)]),
                ..Default::default()
            },
            "dave",
        )
        .await
        .unwrap();
        assert_eq!(updated.test.grade, created.test.grade);
        assert!(updated.test.updated_at > created.test.updated_at);

        // Resubmitting the same readings changes nothing.
        let same = update(
            &db,
            created.test.id,
            ChemicalTestPatch {
                readings: Some(vec![reading("C", 0.41)]),
                ..Default::default()
            },
            "dave",
        )
        .await
        .unwrap();
        assert_eq!(same.test.updated_at, updated.test.updated_at);
    }
}
