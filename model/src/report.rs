//! CSV exports of the QC records.

use crate::{
    audit::{self, Action, AuditFilter},
    calibration::{self, CalibrationResult, DueState, InstrumentFilter, InstrumentStatus},
    chemistry::{self, ChemicalTestFilter},
    dashboard::DateRange,
    error::ReportSnafu,
    hardness::{self, HardnessTestFilter, Scale},
    inspection::{self, InspectionFilter, Status},
    kpi::{self, KpiFilter},
    sql::db::Executor,
    stats::Verdict,
    Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::io::Write;
use strum::{Display, EnumIter, EnumString};

/// The kinds of report which can be exported.
#[derive(Clone, Copy, Debug, Display, EnumString, EnumIter, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum ReportKind {
    Inspections,
    ChemicalTests,
    HardnessTests,
    Instruments,
    Calibrations,
    Kpis,
    Audit,
}

/// A report together with the filters selecting its records.
#[derive(Clone, Debug)]
pub enum Report {
    Inspections(InspectionFilter),
    ChemicalTests(ChemicalTestFilter),
    HardnessTests(HardnessTestFilter),
    Instruments(InstrumentFilter),
    Calibrations(DateRange),
    Kpis(KpiFilter),
    Audit(AuditFilter),
}

impl Report {
    /// A report of `kind` covering every record.
    pub fn unfiltered(kind: ReportKind) -> Self {
        match kind {
            ReportKind::Inspections => Self::Inspections(Default::default()),
            ReportKind::ChemicalTests => Self::ChemicalTests(Default::default()),
            ReportKind::HardnessTests => Self::HardnessTests(Default::default()),
            ReportKind::Instruments => Self::Instruments(Default::default()),
            ReportKind::Calibrations => Self::Calibrations(Default::default()),
            ReportKind::Kpis => Self::Kpis(Default::default()),
            ReportKind::Audit => Self::Audit(Default::default()),
        }
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Inspections(_) => ReportKind::Inspections,
            Self::ChemicalTests(_) => ReportKind::ChemicalTests,
            Self::HardnessTests(_) => ReportKind::HardnessTests,
            Self::Instruments(_) => ReportKind::Instruments,
            Self::Calibrations(_) => ReportKind::Calibrations,
            Self::Kpis(_) => ReportKind::Kpis,
            Self::Audit(_) => ReportKind::Audit,
        }
    }

    /// A file name for the report generated on `today`.
    pub fn file_name(&self, today: NaiveDate) -> String {
        format!("{}-{today}.csv", self.kind())
    }
}

#[derive(Serialize)]
struct InspectionRow<'a> {
    id: i64,
    received_on: NaiveDate,
    material_code: &'a str,
    material_name: &'a str,
    supplier: &'a str,
    heat_number: &'a str,
    purchase_order: Option<&'a str>,
    quantity: f64,
    unit: &'a str,
    inspector: &'a str,
    status: Status,
    measurements: usize,
    passed: usize,
    failed: usize,
    pass_rate: Option<f64>,
    remarks: Option<&'a str>,
}

#[derive(Serialize)]
struct ChemicalRow<'a> {
    test_id: i64,
    tested_on: NaiveDate,
    heat_number: &'a str,
    grade: &'a str,
    sample_id: Option<&'a str>,
    laboratory: &'a str,
    analyst: &'a str,
    element: &'a str,
    measured_pct: f64,
    min_pct: Option<f64>,
    max_pct: Option<f64>,
    verdict: Verdict,
}

#[derive(Serialize)]
struct HardnessRow<'a> {
    id: i64,
    tested_on: NaiveDate,
    part_number: &'a str,
    batch: &'a str,
    scale: Scale,
    spec_min: f64,
    spec_max: f64,
    operator: &'a str,
    instrument_id: Option<i64>,
    readings: usize,
    mean: Option<f64>,
    std_dev: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    cp: Option<f64>,
    cpk: Option<f64>,
    failed: usize,
    verdict: Verdict,
}

#[derive(Serialize)]
struct InstrumentRow<'a> {
    id: i64,
    code: &'a str,
    name: &'a str,
    kind: &'a str,
    location: &'a str,
    interval_days: i64,
    last_calibrated: Option<NaiveDate>,
    next_due: Option<NaiveDate>,
    status: InstrumentStatus,
    due_state: DueState,
}

#[derive(Serialize)]
struct CalibrationRow<'a> {
    id: i64,
    instrument_id: i64,
    instrument_code: Option<&'a str>,
    calibrated_on: NaiveDate,
    performed_by: &'a str,
    result: CalibrationResult,
    certificate_no: Option<&'a str>,
    next_due: NaiveDate,
    notes: Option<&'a str>,
}

#[derive(Serialize)]
struct KpiRow<'a> {
    id: i64,
    metric: &'a str,
    period: NaiveDate,
    target: f64,
    actual: f64,
    unit: &'a str,
    higher_is_better: bool,
    met: bool,
    deviation_pct: Option<f64>,
    notes: Option<&'a str>,
}

#[derive(Serialize)]
struct AuditRow<'a> {
    id: i64,
    changed_at: DateTime<Utc>,
    changed_by: &'a str,
    table_name: &'a str,
    record_id: i64,
    action: Action,
    field: Option<&'a str>,
    old_value: Option<&'a str>,
    new_value: Option<&'a str>,
}

/// Write `report` as CSV to `out`, returning the number of data rows written.
///
/// Instrument due states are computed on `today`.
pub async fn write<E: Executor, W: Write>(
    exec: &E,
    report: &Report,
    today: NaiveDate,
    out: W,
) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(out);
    let mut rows = 0;
    match report {
        Report::Inspections(filter) => {
            for inspection in inspection::all(exec, filter).await? {
                let detail = inspection::detail(exec, inspection).await?;
                let (i, tally) = (&detail.inspection, &detail.tally);
                csv.serialize(InspectionRow {
                    id: i.id,
                    received_on: i.received_on,
                    material_code: &i.material_code,
                    material_name: &i.material_name,
                    supplier: &i.supplier,
                    heat_number: &i.heat_number,
                    purchase_order: i.purchase_order.as_deref(),
                    quantity: i.quantity,
                    unit: &i.unit,
                    inspector: &i.inspector,
                    status: i.status,
                    measurements: tally.total,
                    passed: tally.passed,
                    failed: tally.failed,
                    pass_rate: tally.pass_rate,
                    remarks: i.remarks.as_deref(),
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
        Report::ChemicalTests(filter) => {
            for summary in chemistry::all(exec, filter).await? {
                let test = &summary.item;
                for reading in chemistry::readings(exec, test.id).await? {
                    csv.serialize(ChemicalRow {
                        test_id: test.id,
                        tested_on: test.tested_on,
                        heat_number: &test.heat_number,
                        grade: &test.grade,
                        sample_id: test.sample_id.as_deref(),
                        laboratory: &test.laboratory,
                        analyst: &test.analyst,
                        element: &reading.data.element,
                        measured_pct: reading.data.measured_pct,
                        min_pct: reading.data.min_pct,
                        max_pct: reading.data.max_pct,
                        verdict: reading.data.verdict(),
                    })
                    .context(ReportSnafu)?;
                    rows += 1;
                }
            }
        }
        Report::HardnessTests(filter) => {
            for summary in hardness::all(exec, filter).await? {
                let t = &summary.test;
                let stats = summary.summary.as_ref();
                csv.serialize(HardnessRow {
                    id: t.id,
                    tested_on: t.tested_on,
                    part_number: &t.part_number,
                    batch: &t.batch,
                    scale: t.scale,
                    spec_min: t.spec_min,
                    spec_max: t.spec_max,
                    operator: &t.operator,
                    instrument_id: t.instrument_id,
                    readings: stats.map_or(0, |s| s.count),
                    mean: stats.map(|s| s.mean),
                    std_dev: stats.map(|s| s.std_dev),
                    min: stats.map(|s| s.min),
                    max: stats.map(|s| s.max),
                    cp: summary.capability.map(|c| c.cp),
                    cpk: summary.capability.map(|c| c.cpk),
                    failed: summary.tally.failed,
                    verdict: summary.tally.verdict,
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
        Report::Instruments(filter) => {
            for view in calibration::all_instruments(exec, filter, today).await? {
                let i = &view.instrument;
                csv.serialize(InstrumentRow {
                    id: i.id,
                    code: &i.code,
                    name: &i.name,
                    kind: &i.kind,
                    location: &i.location,
                    interval_days: i.interval_days,
                    last_calibrated: i.last_calibrated,
                    next_due: view.next_due,
                    status: i.status,
                    due_state: view.due_state,
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
        Report::Calibrations(range) => {
            let codes = calibration::all_instruments(exec, &InstrumentFilter::default(), today)
                .await?
                .into_iter()
                .map(|view| (view.instrument.id, view.instrument.code))
                .collect::<HashMap<_, _>>();
            for c in calibration::all_calibrations(exec, range.from, range.to).await? {
                csv.serialize(CalibrationRow {
                    id: c.id,
                    instrument_id: c.instrument_id,
                    instrument_code: codes.get(&c.instrument_id).map(String::as_str),
                    calibrated_on: c.calibrated_on,
                    performed_by: &c.performed_by,
                    result: c.result,
                    certificate_no: c.certificate_no.as_deref(),
                    next_due: c.next_due,
                    notes: c.notes.as_deref(),
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
        Report::Kpis(filter) => {
            for view in kpi::all(exec, filter).await? {
                let e = &view.entry;
                csv.serialize(KpiRow {
                    id: e.id,
                    metric: &e.metric,
                    period: e.period,
                    target: e.target,
                    actual: e.actual,
                    unit: &e.unit,
                    higher_is_better: e.higher_is_better,
                    met: view.met,
                    deviation_pct: view.deviation_pct,
                    notes: e.notes.as_deref(),
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
        Report::Audit(filter) => {
            for entry in audit::all(exec, filter).await? {
                csv.serialize(AuditRow {
                    id: entry.id,
                    changed_at: entry.changed_at,
                    changed_by: &entry.changed_by,
                    table_name: &entry.table_name,
                    record_id: entry.record_id,
                    action: entry.action,
                    field: entry.field.as_deref(),
                    old_value: entry.old_value.as_deref(),
                    new_value: entry.new_value.as_deref(),
                })
                .context(ReportSnafu)?;
                rows += 1;
            }
        }
    }
    csv.flush().map_err(csv::Error::from).context(ReportSnafu)?;
    tracing::info!(kind = %report.kind(), rows, "exported report");
    Ok(rows)
}

/// Render `report` as CSV in memory.
pub async fn render<E: Executor>(exec: &E, report: &Report, today: NaiveDate) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write(exec, report, today, &mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        attachment::test::temp_store,
        calibration::{
            create_instrument, record_calibration, test::new_instrument, NewCalibration,
        },
        chemistry::test::{new_test as new_chemical_test, reading},
        hardness::test::new_test as new_hardness_test,
        inspection::test::{measurement, new_inspection},
        kpi::NewKpi,
        schema,
        sql::db::memory,
    };
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn lines(csv: &[u8]) -> Vec<String> {
        String::from_utf8(csv.to_vec())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_report_kinds() {
        for kind in ReportKind::iter() {
            assert_eq!(ReportKind::from_str(&kind.to_string()).unwrap(), kind);
            assert_eq!(Report::unfiltered(kind).kind(), kind);
        }
        assert_eq!(ReportKind::ChemicalTests.to_string(), "chemical-tests");
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            Report::unfiltered(ReportKind::Kpis).file_name(day),
            "kpis-2024-03-01.csv"
        );
    }

    #[async_std::test]
    async fn test_reports() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        let store = temp_store().await;
        let today = Utc::now().date_naive();

        // The header is written with the first row.
        let empty = render(&db, &Report::unfiltered(ReportKind::Inspections), today)
            .await
            .unwrap();
        assert!(empty.is_empty());

        inspection::create(
            &db,
            &store,
            new_inspection(
                "Acme, Inc.",
                vec![
                    measurement("OD", 49.9, 50.1, 50.0),
                    measurement("ID", 19.9, 20.1, 20.5),
                ],
            ),
            "alice",
        )
        .await
        .unwrap();
        inspection::create(&db, &store, new_inspection("Globex", vec![]), "alice")
            .await
            .unwrap();

        let csv = render(&db, &Report::unfiltered(ReportKind::Inspections), today)
            .await
            .unwrap();
        let rows = lines(&csv);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("id,received_on,material_code"));
        // Values containing commas are quoted.
        let acme = rows.iter().find(|r| r.contains("Acme")).unwrap();
        assert!(acme.contains("\"Acme, Inc.\""));
        assert!(acme.contains(",rejected,2,1,1,50.0,"));

        let filtered = Report::Inspections(InspectionFilter {
            supplier: Some("Globex".into()),
            ..Default::default()
        });
        assert_eq!(lines(&render(&db, &filtered, today).await.unwrap()).len(), 2);

        chemistry::create(
            &db,
            &store,
            new_chemical_test("4140", vec![reading("C", 0.40), reading("Cr", 0.5)]),
            "carol",
        )
        .await
        .unwrap();
        let mut out = Vec::new();
        let written = write(&db, &Report::unfiltered(ReportKind::ChemicalTests), today, &mut out)
            .await
            .unwrap();
        assert_eq!(written, 2);
        let rows = lines(&out);
        assert!(rows.iter().any(|r| r.contains(",C,0.4,") && r.ends_with(",pass")));
        assert!(rows.iter().any(|r| r.contains(",Cr,0.5,") && r.ends_with(",fail")));

        hardness::create(&db, &store, new_hardness_test(vec![59.0, 61.0], None), "frank")
            .await
            .unwrap();
        let rows = lines(
            &render(&db, &Report::unfiltered(ReportKind::HardnessTests), today)
                .await
                .unwrap(),
        );
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains(",HRC,"));
        assert!(rows[1].ends_with(",0,pass"));

        let instrument = create_instrument(&db, new_instrument("RT-1", None), "eve")
            .await
            .unwrap();
        let rows = lines(
            &render(&db, &Report::unfiltered(ReportKind::Instruments), today)
                .await
                .unwrap(),
        );
        assert!(rows[1].ends_with(",active,never_calibrated"));

        record_calibration(
            &db,
            &store,
            instrument.instrument.id,
            NewCalibration {
                calibrated_on: today,
                performed_by: "Metrology Inc".into(),
                result: CalibrationResult::Pass,
                certificate_no: None,
                notes: None,
                attachments: vec![],
            },
            "eve",
        )
        .await
        .unwrap();
        let rows = lines(
            &render(&db, &Report::unfiltered(ReportKind::Calibrations), today)
                .await
                .unwrap(),
        );
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains(",RT-1,"));

        let audit = lines(
            &render(
                &db,
                &Report::Audit(AuditFilter {
                    changed_by: Some("alice".into()),
                    ..Default::default()
                }),
                today,
            )
            .await
            .unwrap(),
        );
        assert_eq!(audit.len(), 3);
        assert!(audit[1].contains(",alice,inspections,"));
    }

    #[async_std::test]
    async fn test_kpi_report() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        let today = Utc::now().date_naive();
        for (metric, period, target, actual, higher_is_better) in [
            ("Scrap rate", (2024, 1, 1), 2.0, 1.5, false),
            ("On-time delivery", (2024, 2, 1), 95.0, 76.0, true),
        ] {
            kpi::create(
                &db,
                NewKpi {
                    metric: metric.into(),
                    period: NaiveDate::from_ymd_opt(period.0, period.1, period.2).unwrap(),
                    target,
                    actual,
                    unit: "%".into(),
                    higher_is_better,
                    notes: None,
                },
                "gina",
            )
            .await
            .unwrap();
        }

        let rows = lines(
            &render(&db, &Report::unfiltered(ReportKind::Kpis), today)
                .await
                .unwrap(),
        );
        assert_eq!(
            rows[0],
            "id,metric,period,target,actual,unit,higher_is_better,met,deviation_pct,notes"
        );
        // Latest period first.
        assert_eq!(rows.len(), 3);
        assert!(rows[1].contains(",On-time delivery,2024-02-01,95.0,76.0,%,true,false,-20.0,"));
        assert!(rows[2].contains(",Scrap rate,2024-01-01,2.0,1.5,%,false,true,-25.0,"));

        let filtered = Report::Kpis(KpiFilter {
            metric: Some("Scrap rate".into()),
            ..Default::default()
        });
        assert_eq!(lines(&render(&db, &filtered, today).await.unwrap()).len(), 2);
    }
}
