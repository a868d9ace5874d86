//! Aggregate figures for the QC dashboard.

use crate::{
    calibration::{self, InstrumentFilter, InstrumentStatus},
    chemistry::{self, ChemicalTestFilter},
    hardness::{self, HardnessTestFilter},
    inspection::{self, InspectionFilter, Status},
    kpi::{self, DerivedKpis, KpiView, Rate},
    sql::db::Executor,
    stats::Tally,
    Result,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The date range a dashboard covers. Either end may be open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct InspectionStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Accepted (outright or conditionally) out of those decided.
    pub acceptance: Rate,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct InstrumentStats {
    /// Instruments not retired.
    pub in_service: usize,
    pub out_of_service: usize,
    pub by_due_state: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Dashboard {
    pub range: DateRange,
    pub inspections: InspectionStats,
    pub chemical_tests: Tally,
    pub hardness_tests: Tally,
    pub instruments: InstrumentStats,
    /// The latest entry of each KPI metric.
    pub kpis: Vec<KpiView>,
    pub derived: DerivedKpis,
}

/// Build the dashboard for records dated within `range`.
///
/// Instrument due states are computed on the end of the range, or `today` if it is open.
pub async fn dashboard<E: Executor>(
    exec: &E,
    range: DateRange,
    today: NaiveDate,
) -> Result<Dashboard> {
    let DateRange { from, to } = range;

    let inspections = inspection::all(
        exec,
        &InspectionFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?;
    let mut by_status = BTreeMap::new();
    for inspection in &inspections {
        *by_status.entry(inspection.status.to_string()).or_default() += 1;
    }
    let decided = inspections
        .iter()
        .filter(|i| i.status != Status::Pending)
        .count();
    let accepted = inspections
        .iter()
        .filter(|i| matches!(i.status, Status::Accepted | Status::Conditional))
        .count();

    let chemical_tests: Tally = chemistry::all(
        exec,
        &ChemicalTestFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?
    .into_iter()
    .map(|t| t.verdict)
    .collect();
    let hardness_tests: Tally = hardness::all(
        exec,
        &HardnessTestFilter {
            from,
            to,
            ..Default::default()
        },
    )
    .await?
    .into_iter()
    .map(|t| t.tally.verdict)
    .collect();

    let as_of = to.unwrap_or(today);
    let mut instruments = InstrumentStats::default();
    for view in calibration::all_instruments(exec, &InstrumentFilter::default(), as_of).await? {
        match view.instrument.status {
            InstrumentStatus::Retired => continue,
            InstrumentStatus::OutOfService => instruments.out_of_service += 1,
            InstrumentStatus::Active => {}
        }
        instruments.in_service += 1;
        *instruments
            .by_due_state
            .entry(view.due_state.to_string())
            .or_default() += 1;
    }

    Ok(Dashboard {
        range,
        inspections: InspectionStats {
            total: inspections.len(),
            by_status,
            acceptance: Rate::new(accepted, decided),
        },
        chemical_tests,
        hardness_tests,
        instruments,
        kpis: kpi::latest(exec).await?,
        derived: kpi::derived(exec, from, to, today).await?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        attachment::test::temp_store,
        calibration::{create_instrument, test::new_instrument},
        hardness::test::new_test as new_hardness_test,
        inspection::test::{measurement, new_inspection},
        kpi::NewKpi,
        schema,
        sql::db::memory,
    };
    use chrono::{Duration, Utc};

    #[async_std::test]
    async fn test_dashboard() {
        let db = memory::Connection::create();
        schema::create_tables(&db).await.unwrap();
        let store = temp_store().await;
        let today = Utc::now().date_naive();

        let empty = dashboard(&db, DateRange::default(), today).await.unwrap();
        assert_eq!(empty.inspections.total, 0);
        assert_eq!(empty.chemical_tests.pass_rate, None);
        assert!(empty.kpis.is_empty());

        for measured in [50.0, 51.0] {
            inspection::create(
                &db,
                &store,
                new_inspection("Acme", vec![measurement("OD", 49.9, 50.1, measured)]),
                "alice",
            )
            .await
            .unwrap();
        }
        for readings in [vec![60.0], vec![57.0, 60.0], vec![59.0]] {
            hardness::create(&db, &store, new_hardness_test(readings, None), "frank")
                .await
                .unwrap();
        }
        create_instrument(&db, new_instrument("RT-1", Some(today)), "eve")
            .await
            .unwrap();
        create_instrument(&db, new_instrument("RT-2", None), "eve")
            .await
            .unwrap();
        kpi::create(
            &db,
            NewKpi {
                metric: "scrap rate".into(),
                period: today,
                target: 2.0,
                actual: 1.5,
                unit: "%".into(),
                higher_is_better: false,
                notes: None,
            },
            "gina",
        )
        .await
        .unwrap();

        let dashboard = dashboard(&db, DateRange::default(), today).await.unwrap();
        assert_eq!(dashboard.inspections.total, 2);
        assert_eq!(dashboard.inspections.by_status["accepted"], 1);
        assert_eq!(dashboard.inspections.by_status["rejected"], 1);
        assert_eq!(dashboard.inspections.acceptance.percent, Some(50.0));
        assert_eq!(dashboard.hardness_tests.total, 3);
        assert_eq!(dashboard.hardness_tests.failed, 1);
        assert_eq!(dashboard.instruments.in_service, 2);
        assert_eq!(dashboard.instruments.by_due_state["ok"], 1);
        assert_eq!(dashboard.instruments.by_due_state["never_calibrated"], 1);
        assert_eq!(dashboard.kpis.len(), 1);
        assert!(dashboard.kpis[0].met);
        assert_eq!(dashboard.derived.hardness_pass, Rate::new(2, 3));

        let future = DateRange {
            from: Some(today + Duration::days(1)),
            to: None,
        };
        let filtered = super::dashboard(&db, future, today).await.unwrap();
        assert_eq!(filtered.inspections.total, 0);
        assert_eq!(filtered.hardness_tests.total, 0);
    }
}
