//! The HTTP API.
//!
//! Every endpoint speaks JSON except attachment upload and download, which carry the raw file,
//! and report export, which responds with CSV. Errors are reported with an appropriate status and
//! a body of the form `{"error": "<message>"}`.

use async_std::io::ReadExt;
use chrono::{NaiveDate, Utc};
use qc_model::{
    attachment::{self, AttachmentStore, NewAttachment, Owner, OwnerKind},
    audit::{self, AuditFilter},
    calibration::{
        self, InstrumentFilter, InstrumentPatch, NewCalibration, NewInstrument,
        DEFAULT_WARNING_DAYS,
    },
    chemistry::{self, ChemicalTestFilter, ChemicalTestPatch, NewChemicalTest},
    dashboard::{self, DateRange},
    hardness::{self, HardnessTestFilter, HardnessTestPatch, NewHardnessTest},
    inspection::{self, InspectionFilter, InspectionPatch, NewInspection},
    kpi::{self, KpiFilter, KpiPatch, NewKpi},
    page::PageRequest,
    report::{self, Report, ReportKind},
    sql::db::Connection,
    Error,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use tide::{
    http::{mime, Mime},
    utils::After,
    Body, Request, Response, StatusCode,
};

/// Header naming the user on whose behalf a request is made.
pub const USER_HEADER: &str = "X-QC-User";

/// The user recorded in the audit trail when a request does not name one.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Clone, Debug)]
pub struct State<C> {
    db: C,
    store: AttachmentStore,
}

type Req<C> = Request<State<C>>;

/// Build the application over a database connection and attachment store.
pub fn app<C: Connection>(db: C, store: AttachmentStore) -> tide::Server<State<C>> {
    let mut app = tide::with_state(State { db, store });
    app.with(After(|mut res: Response| async move {
        if let Some(body) = res.error().map(error_body) {
            res.set_body(Body::from_json(&body)?);
        }
        Ok(res)
    }));

    app.at("/health")
        .get(|_: Req<C>| async { respond(StatusCode::Ok, &json!({ "status": "ok" })) });

    app.at("/inspections")
        .get(list_inspections::<C>)
        .post(create_inspection::<C>);
    app.at("/inspections/:id")
        .get(get_inspection::<C>)
        .put(update_inspection::<C>)
        .delete(delete_inspection::<C>);

    app.at("/chemical-tests")
        .get(list_chemical_tests::<C>)
        .post(create_chemical_test::<C>);
    app.at("/chemical-tests/:id")
        .get(get_chemical_test::<C>)
        .put(update_chemical_test::<C>)
        .delete(delete_chemical_test::<C>);
    app.at("/grades")
        .get(|_: Req<C>| async { respond(StatusCode::Ok, &chemistry::grades()) });

    app.at("/hardness-tests")
        .get(list_hardness_tests::<C>)
        .post(create_hardness_test::<C>);
    app.at("/hardness-tests/:id")
        .get(get_hardness_test::<C>)
        .put(update_hardness_test::<C>)
        .delete(delete_hardness_test::<C>);

    app.at("/instruments")
        .get(list_instruments::<C>)
        .post(create_instrument::<C>);
    app.at("/instruments/due").get(due_instruments::<C>);
    app.at("/instruments/:id")
        .get(get_instrument::<C>)
        .put(update_instrument::<C>)
        .delete(delete_instrument::<C>);
    app.at("/instruments/:id/calibrations")
        .get(list_calibrations::<C>)
        .post(record_calibration::<C>);

    app.at("/kpis").get(list_kpis::<C>).post(create_kpi::<C>);
    app.at("/kpis/derived").get(derived_kpis::<C>);
    app.at("/kpis/trend/:metric").get(kpi_trend::<C>);
    app.at("/kpis/:id")
        .get(get_kpi::<C>)
        .put(update_kpi::<C>)
        .delete(delete_kpi::<C>);

    for (path, kind) in [
        ("/inspections/:id/attachments", OwnerKind::Inspection),
        ("/chemical-tests/:id/attachments", OwnerKind::ChemicalTest),
        ("/hardness-tests/:id/attachments", OwnerKind::HardnessTest),
        ("/calibrations/:id/attachments", OwnerKind::Calibration),
    ] {
        app.at(path)
            .get(move |req: Req<C>| list_attachments(req, kind))
            .post(move |req: Req<C>| upload_attachment(req, kind));
    }
    app.at("/attachments/:id")
        .get(download_attachment::<C>)
        .delete(delete_attachment::<C>);

    app.at("/audit").get(list_audit::<C>);
    app.at("/dashboard").get(get_dashboard::<C>);
    app.at("/reports/:kind").get(export_report::<C>);

    app
}

fn error_body(err: &tide::Error) -> Value {
    if err.status().is_server_error() {
        tracing::error!("request failed: {err}");
    }
    match err.downcast_ref::<Error>() {
        Some(Error::Invalid { problems }) => json!({
            "error": err.to_string(),
            "problems": problems,
        }),
        _ => json!({ "error": err.to_string() }),
    }
}

/// Convert an error from the model into a response with the matching status.
fn http_error(err: Error) -> tide::Error {
    let status = match &err {
        Error::NotFound { .. } => StatusCode::NotFound,
        Error::Invalid { .. } => StatusCode::BadRequest,
        Error::Conflict { .. } => StatusCode::Conflict,
        _ => StatusCode::InternalServerError,
    };
    tide::Error::new(status, err)
}

fn bad_request(msg: impl Into<String>) -> tide::Error {
    tide::Error::from_str(StatusCode::BadRequest, msg.into())
}

fn respond<T: Serialize>(status: StatusCode, body: &T) -> tide::Result {
    let mut res = Response::new(status);
    res.set_body(Body::from_json(body)?);
    Ok(res)
}

fn no_content() -> tide::Result {
    Ok(Response::new(StatusCode::NoContent))
}

fn user<C>(req: &Req<C>) -> String {
    req.header(USER_HEADER)
        .map(|values| values.as_str().trim().to_string())
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| ANONYMOUS.into())
}

fn id<C>(req: &Req<C>) -> tide::Result<i64> {
    let id = req.param("id")?;
    id.parse()
        .map_err(|_| tide::Error::from_str(StatusCode::NotFound, format!("invalid id {id}")))
}

async fn body<C, T: DeserializeOwned>(req: &mut Req<C>) -> tide::Result<T> {
    req.body_json()
        .await
        .map_err(|err| bad_request(format!("invalid request body: {err}")))
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

async fn list_inspections<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: InspectionFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = inspection::list(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn create_inspection<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewInspection = body(&mut req).await?;
    let State { db, store } = req.state();
    let inspection = inspection::create(db, store, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &inspection)
}

async fn get_inspection<C: Connection>(req: Req<C>) -> tide::Result {
    let inspection = inspection::get(&req.state().db, id(&req)?)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &inspection)
}

async fn update_inspection<C: Connection>(mut req: Req<C>) -> tide::Result {
    let patch: InspectionPatch = body(&mut req).await?;
    let inspection = inspection::update(&req.state().db, id(&req)?, patch, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &inspection)
}

async fn delete_inspection<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    inspection::delete(db, store, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_chemical_tests<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: ChemicalTestFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = chemistry::list(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn create_chemical_test<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewChemicalTest = body(&mut req).await?;
    let State { db, store } = req.state();
    let test = chemistry::create(db, store, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &test)
}

async fn get_chemical_test<C: Connection>(req: Req<C>) -> tide::Result {
    let test = chemistry::get(&req.state().db, id(&req)?)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &test)
}

async fn update_chemical_test<C: Connection>(mut req: Req<C>) -> tide::Result {
    let patch: ChemicalTestPatch = body(&mut req).await?;
    let test = chemistry::update(&req.state().db, id(&req)?, patch, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &test)
}

async fn delete_chemical_test<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    chemistry::delete(db, store, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_hardness_tests<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: HardnessTestFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = hardness::list(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn create_hardness_test<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewHardnessTest = body(&mut req).await?;
    let State { db, store } = req.state();
    let test = hardness::create(db, store, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &test)
}

async fn get_hardness_test<C: Connection>(req: Req<C>) -> tide::Result {
    let test = hardness::get(&req.state().db, id(&req)?)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &test)
}

async fn update_hardness_test<C: Connection>(mut req: Req<C>) -> tide::Result {
    let patch: HardnessTestPatch = body(&mut req).await?;
    let test = hardness::update(&req.state().db, id(&req)?, patch, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &test)
}

async fn delete_hardness_test<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    hardness::delete(db, store, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_instruments<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: InstrumentFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = calibration::list_instruments(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn create_instrument<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewInstrument = body(&mut req).await?;
    let instrument = calibration::create_instrument(&req.state().db, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &instrument)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DueQuery {
    within_days: Option<i64>,
}

async fn due_instruments<C: Connection>(req: Req<C>) -> tide::Result {
    let DueQuery { within_days } = req.query()?;
    let within_days = within_days.unwrap_or(DEFAULT_WARNING_DAYS);
    let due = calibration::due(&req.state().db, today(), within_days)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &due)
}

async fn get_instrument<C: Connection>(req: Req<C>) -> tide::Result {
    let instrument = calibration::get_instrument(&req.state().db, id(&req)?)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &instrument)
}

async fn update_instrument<C: Connection>(mut req: Req<C>) -> tide::Result {
    let patch: InstrumentPatch = body(&mut req).await?;
    let instrument = calibration::update_instrument(&req.state().db, id(&req)?, patch, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &instrument)
}

async fn delete_instrument<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    calibration::delete_instrument(db, store, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_calibrations<C: Connection>(req: Req<C>) -> tide::Result {
    let db = &req.state().db;
    let id = id(&req)?;
    // Distinguish an unknown instrument from one which has never been calibrated.
    calibration::get_instrument(db, id)
        .await
        .map_err(http_error)?;
    let calibrations = calibration::calibrations(db, id).await.map_err(http_error)?;
    respond(StatusCode::Ok, &calibrations)
}

async fn record_calibration<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewCalibration = body(&mut req).await?;
    let State { db, store } = req.state();
    let calibration = calibration::record_calibration(db, store, id(&req)?, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &calibration)
}

async fn list_kpis<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: KpiFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = kpi::list(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn create_kpi<C: Connection>(mut req: Req<C>) -> tide::Result {
    let new: NewKpi = body(&mut req).await?;
    let entry = kpi::create(&req.state().db, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &entry)
}

async fn derived_kpis<C: Connection>(req: Req<C>) -> tide::Result {
    let DateRange { from, to } = req.query()?;
    let kpis = kpi::derived(&req.state().db, from, to, today())
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &kpis)
}

async fn kpi_trend<C: Connection>(req: Req<C>) -> tide::Result {
    // Metric names may contain spaces, which arrive percent-encoded.
    let metric = form_urlencoded::parse(req.param("metric")?.as_bytes())
        .next()
        .map(|(metric, _)| metric.into_owned())
        .unwrap_or_default();
    let DateRange { from, to } = req.query()?;
    let trend = kpi::trend(&req.state().db, &metric, from, to)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &trend)
}

async fn get_kpi<C: Connection>(req: Req<C>) -> tide::Result {
    let entry = kpi::get(&req.state().db, id(&req)?)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &entry)
}

async fn update_kpi<C: Connection>(mut req: Req<C>) -> tide::Result {
    let patch: KpiPatch = body(&mut req).await?;
    let entry = kpi::update(&req.state().db, id(&req)?, patch, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &entry)
}

async fn delete_kpi<C: Connection>(req: Req<C>) -> tide::Result {
    kpi::delete(&req.state().db, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_attachments<C: Connection>(req: Req<C>, kind: OwnerKind) -> tide::Result {
    let db = &req.state().db;
    let owner = Owner::new(kind, id(&req)?);
    attachment::check_owner(db, owner)
        .await
        .map_err(http_error)?;
    let attachments = attachment::list_for(db, owner).await.map_err(http_error)?;
    respond(StatusCode::Ok, &attachments)
}

#[derive(Debug, Deserialize)]
struct Upload {
    file_name: String,
}

fn too_large(max: usize) -> tide::Error {
    tide::Error::from_str(
        StatusCode::PayloadTooLarge,
        format!("attachments may be at most {max} bytes"),
    )
}

async fn upload_attachment<C: Connection>(mut req: Req<C>, kind: OwnerKind) -> tide::Result {
    let owner = Owner::new(kind, id(&req)?);
    let Upload { file_name } = req.query()?;
    let content_type = req
        .content_type()
        .map(|mime| mime.essence().to_string())
        .unwrap_or_else(|| mime::BYTE_STREAM.essence().to_string());

    // Read at most one byte more than the limit, so oversized uploads are never buffered whole.
    let max = req.state().store.max_bytes();
    let mut data = Vec::new();
    req.take_body()
        .take(max as u64 + 1)
        .read_to_end(&mut data)
        .await?;
    if data.len() > max {
        return Err(too_large(max));
    }

    let State { db, store } = req.state();
    let new = NewAttachment {
        file_name,
        content_type,
        data,
    };
    let attachment = attachment::attach(db, store, owner, new, &user(&req))
        .await
        .map_err(http_error)?;
    respond(StatusCode::Created, &attachment)
}

async fn download_attachment<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    let (attachment, data) = attachment::download(db, store, id(&req)?)
        .await
        .map_err(http_error)?;
    let mut res = Response::new(StatusCode::Ok);
    res.set_body(Body::from_bytes(data));
    res.set_content_type(Mime::from_str(&attachment.content_type).unwrap_or(mime::BYTE_STREAM));
    res.insert_header(
        "Content-Disposition",
        format!(
            "attachment; filename=\"{}\"",
            attachment.file_name.replace('"', "'")
        ),
    );
    Ok(res)
}

async fn delete_attachment<C: Connection>(req: Req<C>) -> tide::Result {
    let State { db, store } = req.state();
    attachment::delete(db, store, id(&req)?, &user(&req))
        .await
        .map_err(http_error)?;
    no_content()
}

async fn list_audit<C: Connection>(req: Req<C>) -> tide::Result {
    let filter: AuditFilter = req.query()?;
    let page: PageRequest = req.query()?;
    let page = audit::list(&req.state().db, &filter, page)
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &page)
}

async fn get_dashboard<C: Connection>(req: Req<C>) -> tide::Result {
    let range: DateRange = req.query()?;
    let dashboard = dashboard::dashboard(&req.state().db, range, today())
        .await
        .map_err(http_error)?;
    respond(StatusCode::Ok, &dashboard)
}

async fn export_report<C: Connection>(req: Req<C>) -> tide::Result {
    let kind = req.param("kind")?;
    let kind = ReportKind::from_str(kind).map_err(|_| {
        tide::Error::from_str(StatusCode::NotFound, format!("no such report: {kind}"))
    })?;
    let report = match kind {
        ReportKind::Inspections => Report::Inspections(req.query()?),
        ReportKind::ChemicalTests => Report::ChemicalTests(req.query()?),
        ReportKind::HardnessTests => Report::HardnessTests(req.query()?),
        ReportKind::Instruments => Report::Instruments(req.query()?),
        ReportKind::Calibrations => Report::Calibrations(req.query()?),
        ReportKind::Kpis => Report::Kpis(req.query()?),
        ReportKind::Audit => Report::Audit(req.query()?),
    };
    let today = today();
    let csv = report::render(&req.state().db, &report, today)
        .await
        .map_err(http_error)?;
    let mut res = Response::new(StatusCode::Ok);
    res.set_body(Body::from_bytes(csv));
    res.insert_header("Content-Type", "text/csv; charset=utf-8");
    res.insert_header(
        "Content-Disposition",
        format!("attachment; filename=\"{}\"", report.file_name(today)),
    );
    Ok(res)
}
