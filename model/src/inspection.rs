//! Receiving inspection of incoming material lots.

use crate::{
    attachment::{self, Attachment, AttachmentStore, NewAttachment, Owner, OwnerKind},
    audit::{self, Change},
    error::Problems,
    page::{self, Page, PageRequest},
    record::{self, parse_column, patch_opt, patch_text, Record},
    schema::{INSPECTIONS, INSPECTION_MEASUREMENTS},
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    stats::{Checked, Limits, Tally, Verdict},
    Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Accepted,
    Rejected,
    /// Accepted under a concession despite deviations.
    Conditional,
}

impl Status {
    /// The status implied by the verdicts of an inspection's measurements.
    pub fn derive(tally: &Tally) -> Self {
        match tally.verdict {
            Verdict::Fail => Self::Rejected,
            Verdict::Pass if tally.unchecked == 0 => Self::Accepted,
            _ => Self::Pending,
        }
    }
}

/// The header of a receiving inspection.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Inspection {
    pub id: i64,
    pub material_code: String,
    pub material_name: String,
    pub supplier: String,
    pub heat_number: String,
    pub purchase_order: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub received_on: NaiveDate,
    pub inspector: String,
    pub status: Status,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for Inspection {
    const TABLE: Table<'static> = INSPECTIONS;
    const ENTITY: &'static str = "inspection";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("material_code", self.material_code.as_str().into()),
            ("material_name", self.material_name.as_str().into()),
            ("supplier", self.supplier.as_str().into()),
            ("heat_number", self.heat_number.as_str().into()),
            ("purchase_order", self.purchase_order.clone().into()),
            ("quantity", self.quantity.into()),
            ("unit", self.unit.as_str().into()),
            ("received_on", self.received_on.into()),
            ("inspector", self.inspector.as_str().into()),
            ("status", self.status.to_string().into()),
            ("remarks", self.remarks.clone().into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            material_code: row.get("material_code")?,
            material_name: row.get("material_name")?,
            supplier: row.get("supplier")?,
            heat_number: row.get("heat_number")?,
            purchase_order: row.get("purchase_order")?,
            quantity: row.get("quantity")?,
            unit: row.get("unit")?,
            received_on: row.get("received_on")?,
            inspector: row.get("inspector")?,
            status: parse_column(row, "status")?,
            remarks: row.get("remarks")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A measured characteristic of an inspected lot.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Measurement {
    pub id: i64,
    pub inspection_id: i64,
    #[serde(flatten)]
    pub data: NewMeasurement,
}

impl Record for Measurement {
    const TABLE: Table<'static> = INSPECTION_MEASUREMENTS;
    const ENTITY: &'static str = "measurement";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("inspection_id", self.inspection_id.into()),
            ("characteristic", self.data.characteristic.as_str().into()),
            ("unit", self.data.unit.clone().into()),
            ("nominal", self.data.nominal.into()),
            ("lower_limit", self.data.lower_limit.into()),
            ("upper_limit", self.data.upper_limit.into()),
            ("measured", self.data.measured.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            inspection_id: row.get("inspection_id")?,
            data: NewMeasurement {
                characteristic: row.get("characteristic")?,
                unit: row.get("unit")?,
                nominal: row.get("nominal")?,
                lower_limit: row.get("lower_limit")?,
                upper_limit: row.get("upper_limit")?,
                measured: row.get("measured")?,
            },
        })
    }
}

/// A measurement to record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewMeasurement {
    pub characteristic: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub nominal: Option<f64>,
    #[serde(default)]
    pub lower_limit: Option<f64>,
    #[serde(default)]
    pub upper_limit: Option<f64>,
    pub measured: f64,
}

impl NewMeasurement {
    pub fn limits(&self) -> Limits {
        Limits::new(self.lower_limit, self.upper_limit)
    }

    pub fn verdict(&self) -> Verdict {
        self.limits().check(self.measured)
    }

    fn validate(&self) -> Problems {
        let mut problems = Problems::default();
        problems.required("characteristic", &self.characteristic);
        problems.finite("measured value", self.measured);
        for (field, value) in [
            ("nominal", self.nominal),
            ("lower limit", self.lower_limit),
            ("upper limit", self.upper_limit),
        ] {
            if let Some(value) = value {
                problems.finite(field, value);
            }
        }
        problems.ordered("limits", self.lower_limit, self.upper_limit);
        problems
    }
}

fn validate_measurements(problems: &mut Problems, measurements: &[NewMeasurement]) {
    for (i, measurement) in measurements.iter().enumerate() {
        problems.extend(format!("measurement {}", i + 1), measurement.validate());
    }
}

fn tally(measurements: &[NewMeasurement]) -> Tally {
    measurements.iter().map(NewMeasurement::verdict).collect()
}

/// A new receiving inspection, with its measurements and attachments.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewInspection {
    pub material_code: String,
    pub material_name: String,
    pub supplier: String,
    pub heat_number: String,
    #[serde(default)]
    pub purchase_order: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub received_on: NaiveDate,
    pub inspector: String,
    /// Derived from the measurements when absent.
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub measurements: Vec<NewMeasurement>,
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
}

fn validate_quantity(problems: &mut Problems, quantity: f64) {
    problems.check(quantity.is_finite() && quantity > 0.0, || {
        "quantity must be greater than 0".into()
    });
}

fn validate_received(problems: &mut Problems, received_on: NaiveDate) {
    problems.check(received_on <= Utc::now().date_naive(), || {
        format!("received date {received_on} is in the future")
    });
}

impl NewInspection {
    pub fn validate(&self, store: &AttachmentStore) -> Problems {
        let mut problems = Problems::default();
        problems.required("material code", &self.material_code);
        problems.required("material name", &self.material_name);
        problems.required("supplier", &self.supplier);
        problems.required("heat number", &self.heat_number);
        problems.required("unit", &self.unit);
        problems.required("inspector", &self.inspector);
        validate_quantity(&mut problems, self.quantity);
        validate_received(&mut problems, self.received_on);
        validate_measurements(&mut problems, &self.measurements);
        for attachment in &self.attachments {
            problems.extend(&attachment.file_name, attachment.validate(store));
        }
        problems
    }

    fn header(&self) -> Inspection {
        let now = Utc::now();
        Inspection {
            id: 0,
            material_code: self.material_code.trim().into(),
            material_name: self.material_name.trim().into(),
            supplier: self.supplier.trim().into(),
            heat_number: self.heat_number.trim().into(),
            purchase_order: self.purchase_order.clone(),
            quantity: self.quantity,
            unit: self.unit.trim().into(),
            received_on: self.received_on,
            inspector: self.inspector.trim().into(),
            status: self
                .status
                .unwrap_or_else(|| Status::derive(&tally(&self.measurements))),
            remarks: self.remarks.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Changes to an inspection. Absent fields are left unchanged.
///
/// An empty string clears an optional text field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InspectionPatch {
    pub material_code: Option<String>,
    pub material_name: Option<String>,
    pub supplier: Option<String>,
    pub heat_number: Option<String>,
    pub purchase_order: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub received_on: Option<NaiveDate>,
    pub inspector: Option<String>,
    pub status: Option<Status>,
    pub remarks: Option<String>,
    /// Replaces every existing measurement.
    pub measurements: Option<Vec<NewMeasurement>>,
}

impl InspectionPatch {
    /// Apply the header changes to `inspection`, reporting any invalid values.
    fn apply(&self, inspection: &mut Inspection) -> Problems {
        let mut problems = Problems::default();
        for (name, field, patch) in [
            ("material code", &mut inspection.material_code, &self.material_code),
            ("material name", &mut inspection.material_name, &self.material_name),
            ("supplier", &mut inspection.supplier, &self.supplier),
            ("heat number", &mut inspection.heat_number, &self.heat_number),
            ("unit", &mut inspection.unit, &self.unit),
            ("inspector", &mut inspection.inspector, &self.inspector),
        ] {
            patch_text(&mut problems, name, field, patch);
        }
        patch_opt(&mut inspection.purchase_order, &self.purchase_order);
        patch_opt(&mut inspection.remarks, &self.remarks);
        if let Some(quantity) = self.quantity {
            validate_quantity(&mut problems, quantity);
            inspection.quantity = quantity;
        }
        if let Some(received_on) = self.received_on {
            validate_received(&mut problems, received_on);
            inspection.received_on = received_on;
        }
        if let Some(status) = self.status {
            inspection.status = status;
        }
        if let Some(measurements) = &self.measurements {
            validate_measurements(&mut problems, measurements);
            if self.status.is_none() {
                inspection.status = Status::derive(&tally(measurements));
            }
        }
        problems
    }
}

/// An inspection with everything recorded against it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InspectionDetail {
    #[serde(flatten)]
    pub inspection: Inspection,
    pub measurements: Vec<Checked<Measurement>>,
    pub attachments: Vec<Attachment>,
    pub tally: Tally,
}

/// Filters for the list of inspections.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InspectionFilter {
    pub supplier: Option<String>,
    pub material_code: Option<String>,
    pub heat_number: Option<String>,
    pub status: Option<Status>,
    /// Earliest received date (inclusive).
    pub from: Option<NaiveDate>,
    /// Latest received date (inclusive).
    pub to: Option<NaiveDate>,
    /// Text to look for in the material name, material code or supplier.
    pub search: Option<String>,
}

impl InspectionFilter {
    pub(crate) fn select(&self) -> Select {
        let mut select = Select::from(INSPECTIONS.name)
            .filter_opt("supplier", Op::Eq, self.supplier.clone())
            .filter_opt("material_code", Op::Eq, self.material_code.clone())
            .filter_opt("heat_number", Op::Eq, self.heat_number.clone())
            .filter_opt("status", Op::Eq, self.status.map(|s| s.to_string()))
            .filter_opt("received_on", Op::Ge, self.from)
            .filter_opt("received_on", Op::Le, self.to);
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            select = select.filter_any(
                ["material_name", "material_code", "supplier"],
                Op::Contains,
                search,
            );
        }
        select
            .order_by("received_on", Order::Desc)
            .order_by("id", Order::Desc)
    }
}

fn owner(id: i64) -> Owner {
    Owner::new(OwnerKind::Inspection, id)
}

fn measurement_rows(inspection_id: i64, measurements: &[NewMeasurement]) -> Vec<Measurement> {
    measurements
        .iter()
        .map(|data| Measurement {
            id: 0,
            inspection_id,
            data: data.clone(),
        })
        .collect()
}

/// Record a new inspection with its measurements and attachments.
pub async fn create<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    new: NewInspection,
    user: &str,
) -> Result<InspectionDetail> {
    new.validate(store).finish()?;
    let id = store
        .with_files(&new.attachments, |stored| insert(conn, &new, stored, user))
        .await?;
    tracing::info!(id, heat = %new.heat_number, "created inspection");
    get(conn, id).await
}

async fn insert<C: Connection>(
    conn: &C,
    new: &NewInspection,
    stored: Vec<String>,
    user: &str,
) -> Result<i64> {
    atomically!(conn, |tx| {
        let id = record::insert(&tx, &new.header()).await?;
        audit::record_create(&tx, INSPECTIONS.name, id, user).await?;
        record::insert_all(&tx, &measurement_rows(id, &new.measurements)).await?;
        attachment::insert_rows(&tx, owner(id), &new.attachments, &stored, user).await?;
        Ok(id)
    })
}

async fn measurements<E: Executor>(exec: &E, id: i64) -> Result<Vec<Measurement>> {
    record::children(exec, "inspection_id", id).await
}

/// Load an inspection with its measurements, attachments and verdicts.
pub async fn get<E: Executor>(exec: &E, id: i64) -> Result<InspectionDetail> {
    let inspection = record::fetch(exec, id).await?;
    detail(exec, inspection).await
}

pub(crate) async fn detail<E: Executor>(
    exec: &E,
    inspection: Inspection,
) -> Result<InspectionDetail> {
    let measurements = measurements(exec, inspection.id)
        .await?
        .into_iter()
        .map(|item| Checked {
            verdict: item.data.verdict(),
            item,
        })
        .collect::<Vec<_>>();
    let tally = measurements.iter().map(|m| m.verdict).collect();
    let attachments = attachment::list_for(exec, owner(inspection.id)).await?;
    Ok(InspectionDetail {
        inspection,
        measurements,
        attachments,
        tally,
    })
}

/// List inspections, most recently received first.
pub async fn list<E: Executor>(
    exec: &E,
    filter: &InspectionFilter,
    page: PageRequest,
) -> Result<Page<Inspection>> {
    page::load(exec, filter.select(), page, Inspection::from_row).await
}

/// Every inspection matching `filter`, most recently received first.
pub async fn all<E: Executor>(exec: &E, filter: &InspectionFilter) -> Result<Vec<Inspection>> {
    record::load_all(exec, filter.select()).await
}

fn describe(measurements: &[NewMeasurement]) -> Value {
    match serde_json::to_string(measurements) {
        Ok(json) => json.into(),
        Err(err) => format!("{} measurements ({err})", measurements.len()).into(),
    }
}

/// Apply `patch` to an inspection.
pub async fn update<C: Connection>(
    conn: &C,
    id: i64,
    patch: InspectionPatch,
    user: &str,
) -> Result<InspectionDetail> {
    atomically!(conn, |tx| {
        let old: Inspection = record::fetch(&tx, id).await?;
        let mut new = old.clone();
        patch.apply(&mut new).finish()?;
        let changes = record::save(&tx, &old, &new, user).await?;

        if let Some(replacement) = &patch.measurements {
            let existing = measurements(&tx, id)
                .await?
                .into_iter()
                .map(|m| m.data)
                .collect::<Vec<_>>();
            if existing != *replacement {
                record::remove_children(&tx, &INSPECTION_MEASUREMENTS, "inspection_id", id)
                    .await?;
                record::insert_all(&tx, &measurement_rows(id, replacement)).await?;
                let change =
                    Change::new("measurements", describe(&existing), describe(replacement));
                audit::record_changes(&tx, INSPECTIONS.name, id, &[change], user).await?;
                if changes.is_empty() {
                    record::touch::<_, Inspection>(&tx, id).await?;
                }
            }
        }
        Ok(())
    })?;
    get(conn, id).await
}

/// Delete an inspection, its measurements and its attachments.
pub async fn delete<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    id: i64,
    user: &str,
) -> Result<()> {
    let stored = atomically!(conn, |tx| {
        record::remove_children(&tx, &INSPECTION_MEASUREMENTS, "inspection_id", id).await?;
        let stored = attachment::remove_rows_for(&tx, owner(id), user).await?;
        record::remove::<_, Inspection>(&tx, id).await?;
        audit::record_delete(&tx, INSPECTIONS.name, id, user).await?;
        Ok(stored)
    })?;
    store.remove_all(&stored).await;
    tracing::info!(id, "deleted inspection");
    Ok(())
}
