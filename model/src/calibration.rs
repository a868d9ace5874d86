//! Measuring instruments and their calibration history.

use crate::{
    attachment::{self, Attachment, AttachmentStore, NewAttachment, Owner, OwnerKind},
    audit,
    error::Problems,
    page::{self, Page, PageRequest},
    record::{self, parse_column, patch_text, Record},
    schema::{CALIBRATIONS, HARDNESS_TESTS, INSTRUMENTS},
    sql::db::{Connection, Executor, Op, Order, Row, Select, Table, Value},
    Error, Result,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Days before the due date from which an instrument is reported as due soon.
pub const DEFAULT_WARNING_DAYS: i64 = 14;

/// The longest calibration interval, and the furthest ahead a due check may look.
pub const MAX_DAYS: i64 = 36_500;

/// `days` after `date`, or `None` if that is not a representable date.
fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_add_days(Days::new(u64::try_from(days).ok()?))
}

#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    #[default]
    Active,
    OutOfService,
    Retired,
}

/// Where an instrument stands with respect to its calibration schedule.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DueState {
    NeverCalibrated,
    Overdue,
    DueSoon,
    Ok,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CalibrationResult {
    Pass,
    /// Out of tolerance as found, brought back into tolerance.
    Adjusted,
    Fail,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Instrument {
    pub id: i64,
    /// Asset tag, unique across instruments.
    pub code: String,
    pub name: String,
    pub kind: String,
    pub location: String,
    /// Calibration interval.
    pub interval_days: i64,
    pub last_calibrated: Option<NaiveDate>,
    pub status: InstrumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instrument {
    /// The date the next calibration is due, if the instrument has ever been calibrated.
    pub fn next_due(&self) -> Option<NaiveDate> {
        self.last_calibrated
            .and_then(|last| add_days(last, self.interval_days))
    }

    /// The calibration state of the instrument on `today`.
    pub fn due_state(&self, today: NaiveDate, warning_days: i64) -> DueState {
        match self.next_due() {
            None => DueState::NeverCalibrated,
            Some(due) if due < today => DueState::Overdue,
            Some(due) if due <= add_days(today, warning_days).unwrap_or(NaiveDate::MAX) => {
                DueState::DueSoon
            }
            Some(_) => DueState::Ok,
        }
    }

    /// Whether tests may be performed with this instrument on `date`.
    pub fn usable_on(&self, date: NaiveDate) -> std::result::Result<(), String> {
        if self.status != InstrumentStatus::Active {
            return Err(format!("instrument {} is {}", self.code, self.status));
        }
        match self.next_due() {
            None => Err(format!("instrument {} has never been calibrated", self.code)),
            Some(due) if due < date => Err(format!(
                "instrument {} was due for calibration on {due}",
                self.code
            )),
            Some(_) => Ok(()),
        }
    }
}

impl Record for Instrument {
    const TABLE: Table<'static> = INSTRUMENTS;
    const ENTITY: &'static str = "instrument";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("code", self.code.as_str().into()),
            ("name", self.name.as_str().into()),
            ("kind", self.kind.as_str().into()),
            ("location", self.location.as_str().into()),
            ("interval_days", self.interval_days.into()),
            ("last_calibrated", self.last_calibrated.into()),
            ("status", self.status.to_string().into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            name: row.get("name")?,
            kind: row.get("kind")?,
            location: row.get("location")?,
            interval_days: row.get("interval_days")?,
            last_calibrated: row.get("last_calibrated")?,
            status: parse_column(row, "status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// An instrument together with its calibration schedule on a given day.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InstrumentView {
    #[serde(flatten)]
    pub instrument: Instrument,
    pub next_due: Option<NaiveDate>,
    pub due_state: DueState,
}

impl InstrumentView {
    pub fn new(instrument: Instrument, today: NaiveDate, warning_days: i64) -> Self {
        Self {
            next_due: instrument.next_due(),
            due_state: instrument.due_state(today, warning_days),
            instrument,
        }
    }

    fn today(instrument: Instrument) -> Self {
        Self::new(instrument, Utc::now().date_naive(), DEFAULT_WARNING_DAYS)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewInstrument {
    pub code: String,
    pub name: String,
    pub kind: String,
    pub location: String,
    pub interval_days: i64,
    #[serde(default)]
    pub last_calibrated: Option<NaiveDate>,
    #[serde(default)]
    pub status: InstrumentStatus,
}

fn validate_interval(problems: &mut Problems, interval_days: i64) {
    problems.check((1..=MAX_DAYS).contains(&interval_days), || {
        format!("calibration interval must be between 1 and {MAX_DAYS} days")
    });
}

fn validate_not_future(problems: &mut Problems, field: &str, date: NaiveDate) {
    problems.check(date <= Utc::now().date_naive(), || {
        format!("{field} {date} is in the future")
    });
}

impl NewInstrument {
    pub fn validate(&self) -> Problems {
        let mut problems = Problems::default();
        problems.required("code", &self.code);
        problems.required("name", &self.name);
        problems.required("kind", &self.kind);
        problems.required("location", &self.location);
        validate_interval(&mut problems, self.interval_days);
        if let Some(date) = self.last_calibrated {
            validate_not_future(&mut problems, "last calibration date", date);
        }
        problems
    }
}

/// Changes to an instrument. Absent fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentPatch {
    pub code: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub location: Option<String>,
    pub interval_days: Option<i64>,
    pub status: Option<InstrumentStatus>,
}

impl InstrumentPatch {
    fn apply(&self, instrument: &mut Instrument) -> Problems {
        let mut problems = Problems::default();
        for (name, field, patch) in [
            ("code", &mut instrument.code, &self.code),
            ("name", &mut instrument.name, &self.name),
            ("kind", &mut instrument.kind, &self.kind),
            ("location", &mut instrument.location, &self.location),
        ] {
            patch_text(&mut problems, name, field, patch);
        }
        if let Some(interval_days) = self.interval_days {
            validate_interval(&mut problems, interval_days);
            instrument.interval_days = interval_days;
        }
        if let Some(status) = self.status {
            instrument.status = status;
        }
        problems
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentFilter {
    pub status: Option<InstrumentStatus>,
    pub kind: Option<String>,
    pub location: Option<String>,
    /// Text to look for in the code or name.
    pub search: Option<String>,
}

impl InstrumentFilter {
    fn select(&self) -> Select {
        let mut select = Select::from(INSTRUMENTS.name)
            .filter_opt("status", Op::Eq, self.status.map(|s| s.to_string()))
            .filter_opt("kind", Op::Eq, self.kind.clone())
            .filter_opt("location", Op::Eq, self.location.clone());
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            select = select.filter_any(["code", "name"], Op::Contains, search);
        }
        select.order_by("id", Order::Desc)
    }
}

pub async fn create_instrument<C: Connection>(
    conn: &C,
    new: NewInstrument,
    user: &str,
) -> Result<InstrumentView> {
    new.validate().finish()?;
    let now = Utc::now();
    let instrument = Instrument {
        id: 0,
        code: new.code.trim().into(),
        name: new.name.trim().into(),
        kind: new.kind.trim().into(),
        location: new.location.trim().into(),
        interval_days: new.interval_days,
        last_calibrated: new.last_calibrated,
        status: new.status,
        created_at: now,
        updated_at: now,
    };
    let id = atomically!(conn, |tx| {
        let id = record::insert(&tx, &instrument).await?;
        audit::record_create(&tx, INSTRUMENTS.name, id, user).await?;
        Ok(id)
    })
    .map_err(|err| match err {
        Error::Conflict { .. } => {
            Error::conflict(format!("an instrument with code {} already exists", instrument.code))
        }
        err => err,
    })?;
    tracing::info!(id, code = %instrument.code, "created instrument");
    Ok(InstrumentView::today(Instrument { id, ..instrument }))
}

pub async fn get_instrument<E: Executor>(exec: &E, id: i64) -> Result<InstrumentView> {
    Ok(InstrumentView::today(record::fetch(exec, id).await?))
}

/// List instruments, most recently added first.
pub async fn list_instruments<E: Executor>(
    exec: &E,
    filter: &InstrumentFilter,
    page: PageRequest,
) -> Result<Page<InstrumentView>> {
    let today = Utc::now().date_naive();
    page::load(exec, filter.select(), page, |row| {
        Ok(InstrumentView::new(
            Instrument::from_row(row)?,
            today,
            DEFAULT_WARNING_DAYS,
        ))
    })
    .await
}

/// Every instrument matching `filter` with its state on `today`.
pub async fn all_instruments<E: Executor>(
    exec: &E,
    filter: &InstrumentFilter,
    today: NaiveDate,
) -> Result<Vec<InstrumentView>> {
    Ok(record::load_all(exec, filter.select())
        .await?
        .into_iter()
        .map(|instrument| InstrumentView::new(instrument, today, DEFAULT_WARNING_DAYS))
        .collect())
}

pub async fn update_instrument<C: Connection>(
    conn: &C,
    id: i64,
    patch: InstrumentPatch,
    user: &str,
) -> Result<InstrumentView> {
    atomically!(conn, |tx| {
        let old: Instrument = record::fetch(&tx, id).await?;
        let mut new = old.clone();
        patch.apply(&mut new).finish()?;
        record::save(&tx, &old, &new, user).await?;
        Ok(())
    })?;
    get_instrument(conn, id).await
}

/// Delete an instrument and its calibration history.
///
/// # Errors
///
/// Fails with [`Error::Conflict`] if any hardness test was performed with the instrument; such
/// instruments should be retired instead.
pub async fn delete_instrument<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    id: i64,
    user: &str,
) -> Result<()> {
    let stored = atomically!(conn, |tx| {
        let tests = tx
            .count(&Select::from(HARDNESS_TESTS.name).filter("instrument_id", Op::Eq, id))
            .await
            .map_err(Error::db)?;
        if tests > 0 {
            return Err(Error::conflict(format!(
                "instrument {id} was used for {tests} hardness tests; retire it instead"
            )));
        }
        let mut stored = vec![];
        for calibration in calibrations(&tx, id).await? {
            stored.extend(
                attachment::remove_rows_for(&tx, owner(calibration.id), user).await?,
            );
            record::remove::<_, Calibration>(&tx, calibration.id).await?;
            audit::record_delete(&tx, CALIBRATIONS.name, calibration.id, user).await?;
        }
        record::remove::<_, Instrument>(&tx, id).await?;
        audit::record_delete(&tx, INSTRUMENTS.name, id, user).await?;
        Ok(stored)
    })?;
    store.remove_all(&stored).await;
    tracing::info!(id, "deleted instrument");
    Ok(())
}

/// One calibration of an instrument.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Calibration {
    pub id: i64,
    pub instrument_id: i64,
    pub calibrated_on: NaiveDate,
    pub performed_by: String,
    pub result: CalibrationResult,
    pub certificate_no: Option<String>,
    /// The date the following calibration is due.
    pub next_due: NaiveDate,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for Calibration {
    const TABLE: Table<'static> = CALIBRATIONS;
    const ENTITY: &'static str = "calibration";

    fn id(&self) -> i64 {
        self.id
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("instrument_id", self.instrument_id.into()),
            ("calibrated_on", self.calibrated_on.into()),
            ("performed_by", self.performed_by.as_str().into()),
            ("result", self.result.to_string().into()),
            ("certificate_no", self.certificate_no.clone().into()),
            ("next_due", self.next_due.into()),
            ("notes", self.notes.clone().into()),
            ("created_at", self.created_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            instrument_id: row.get("instrument_id")?,
            calibrated_on: row.get("calibrated_on")?,
            performed_by: row.get("performed_by")?,
            result: parse_column(row, "result")?,
            certificate_no: row.get("certificate_no")?,
            next_due: row.get("next_due")?,
            notes: row.get("notes")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewCalibration {
    pub calibrated_on: NaiveDate,
    pub performed_by: String,
    pub result: CalibrationResult,
    #[serde(default)]
    pub certificate_no: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Calibration certificates and similar.
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
}

impl NewCalibration {
    pub fn validate(&self, store: &AttachmentStore) -> Problems {
        let mut problems = Problems::default();
        problems.required("performed by", &self.performed_by);
        validate_not_future(&mut problems, "calibration date", self.calibrated_on);
        for attachment in &self.attachments {
            problems.extend(&attachment.file_name, attachment.validate(store));
        }
        problems
    }
}

/// A calibration with its attachments and the resulting state of the instrument.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CalibrationDetail {
    #[serde(flatten)]
    pub calibration: Calibration,
    pub attachments: Vec<Attachment>,
    pub instrument: InstrumentView,
}

fn owner(id: i64) -> Owner {
    Owner::new(OwnerKind::Calibration, id)
}

/// Record a calibration of an instrument, updating the instrument's status.
///
/// If the calibration is the most recent one, a failure takes the instrument out of service,
/// while a pass or adjustment sets its last calibration date and returns it to service.
///
/// # Errors
///
/// Fails with [`Error::Conflict`] if the instrument is retired.
pub async fn record_calibration<C: Connection>(
    conn: &C,
    store: &AttachmentStore,
    instrument_id: i64,
    new: NewCalibration,
    user: &str,
) -> Result<CalibrationDetail> {
    new.validate(store).finish()?;
    let id = store
        .with_files(&new.attachments, |stored| {
            insert_calibration(conn, instrument_id, &new, stored, user)
        })
        .await?;
    tracing::info!(
        id,
        instrument_id,
        result = %new.result,
        "recorded calibration"
    );
    Ok(CalibrationDetail {
        calibration: record::fetch(conn, id).await?,
        attachments: attachment::list_for(conn, owner(id)).await?,
        instrument: get_instrument(conn, instrument_id).await?,
    })
}

async fn insert_calibration<C: Connection>(
    conn: &C,
    instrument_id: i64,
    new: &NewCalibration,
    stored: Vec<String>,
    user: &str,
) -> Result<i64> {
    atomically!(conn, |tx| {
        let old: Instrument = record::fetch(&tx, instrument_id).await?;
        if old.status == InstrumentStatus::Retired {
            return Err(Error::conflict(format!(
                "instrument {} is retired and cannot be calibrated",
                old.code
            )));
        }
        let next_due = add_days(new.calibrated_on, old.interval_days).ok_or_else(|| {
            Error::invalid(format!(
                "calibration interval of {} days from {} is out of range",
                old.interval_days, new.calibrated_on
            ))
        })?;
        let latest = calibrations(&tx, instrument_id)
            .await?
            .into_iter()
            .map(|c| c.calibrated_on)
            .max();

        let calibration = Calibration {
            id: 0,
            instrument_id,
            calibrated_on: new.calibrated_on,
            performed_by: new.performed_by.trim().into(),
            result: new.result,
            certificate_no: new.certificate_no.clone(),
            next_due,
            notes: new.notes.clone(),
            created_at: Utc::now(),
        };
        let id = record::insert(&tx, &calibration).await?;
        audit::record_create(&tx, CALIBRATIONS.name, id, user).await?;
        attachment::insert_rows(&tx, owner(id), &new.attachments, &stored, user).await?;

        // Back-dated calibrations are history only.
        if latest.map_or(true, |latest| new.calibrated_on >= latest) {
            let mut instrument = old.clone();
            match new.result {
                CalibrationResult::Fail => instrument.status = InstrumentStatus::OutOfService,
                CalibrationResult::Pass | CalibrationResult::Adjusted => {
                    instrument.last_calibrated = Some(new.calibrated_on);
                    instrument.status = InstrumentStatus::Active;
                }
            }
            record::save(&tx, &old, &instrument, user).await?;
        }
        Ok(id)
    })
}

/// The calibration history of an instrument, most recent first.
pub async fn calibrations<E: Executor>(exec: &E, instrument_id: i64) -> Result<Vec<Calibration>> {
    record::load_all(
        exec,
        Select::from(CALIBRATIONS.name)
            .filter("instrument_id", Op::Eq, instrument_id)
            .order_by("calibrated_on", Order::Desc)
            .order_by("id", Order::Desc),
    )
    .await
}

/// Calibrations performed in the days `from..=to`, most recent first.
pub async fn all_calibrations<E: Executor>(
    exec: &E,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<Calibration>> {
    record::load_all(
        exec,
        Select::from(CALIBRATIONS.name)
            .filter_opt("calibrated_on", Op::Ge, from)
            .filter_opt("calibrated_on", Op::Le, to)
            .order_by("calibrated_on", Order::Desc)
            .order_by("id", Order::Desc),
    )
    .await
}

/// Instruments in service which are overdue, never calibrated, or due within `within_days` of
/// `today`, the most urgent first.
///
/// # Errors
///
/// Fails with [`Error::Invalid`] unless `within_days` is between 0 and [`MAX_DAYS`].
pub async fn due<E: Executor>(
    exec: &E,
    today: NaiveDate,
    within_days: i64,
) -> Result<Vec<InstrumentView>> {
    if !(0..=MAX_DAYS).contains(&within_days) {
        return Err(Error::invalid(format!(
            "within_days must be between 0 and {MAX_DAYS}"
        )));
    }
    let instruments = record::load_all::<_, Instrument>(
        exec,
        Select::from(INSTRUMENTS.name).filter(
            "status",
            Op::Ne,
            InstrumentStatus::Retired.to_string(),
        ),
    )
    .await?;
    let mut due = instruments
        .into_iter()
        .map(|instrument| InstrumentView::new(instrument, today, within_days))
        .filter(|view| view.due_state != DueState::Ok)
        .collect::<Vec<_>>();
    due.sort_by_key(|view| (view.due_state, view.next_due, view.instrument.id));
    Ok(due)
}

/// Check that the instrument with `id` may be used for a test on `date`.
pub(crate) async fn check_usable<E: Executor>(
    exec: &E,
    id: i64,
    date: NaiveDate,
) -> Result<std::result::Result<(), String>> {
    Ok(match record::find::<_, Instrument>(exec, id).await? {
        Some(instrument) => instrument.usable_on(date),
        None => Err(format!("instrument {id} does not exist")),
    })
}
