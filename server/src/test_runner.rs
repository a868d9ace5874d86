#![cfg(test)]

//! End-to-end tests of the HTTP API.
//!
//! Each test starts a server on an unused port, backed by an in-memory database and a scratch
//! upload directory, and drives it over HTTP with a `surf` client.

use super::Options;
use crate::routes::USER_HEADER;
use anyhow::Error;
use async_std::task::{sleep, spawn};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use portpicker::pick_unused_port;
use qc_model::{db, init_logging};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use surf::{
    http::{Method, StatusCode},
    Body, Client,
};

const MAX_UPLOAD_BYTES: usize = 1024;

struct Api {
    client: Client,
    user: &'static str,
}

impl Api {
    /// Start a server and connect a client to it.
    async fn start() -> Result<Self, Error> {
        init_logging();

        let port = pick_unused_port().unwrap();
        let opt = Options {
            port,
            upload_dir: env::temp_dir().join(format!("qc-server-test-{port}")),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            in_memory: true,
            db: db::Options {
                db_host: "localhost".into(),
                db_port: 5432,
                db_name: "qc_tracker".into(),
                db_user: "postgres".into(),
                db_password: "password".into(),
            },
        };
        spawn(async move {
            opt.serve().await.unwrap();
            tracing::warn!("server exited");
        });

        let client: Client = surf::Config::default()
            .set_base_url(format!("http://localhost:{port}").parse().unwrap())
            .try_into()
            .unwrap();
        let api = Self {
            client,
            user: "alice",
        };
        api.wait_for_server().await?;
        Ok(api)
    }

    async fn wait_for_server(&self) -> Result<(), Error> {
        const MAX_CONNECT_RETRIES: usize = 60;

        for _ in 0..MAX_CONNECT_RETRIES {
            match self.client.get("/health").send().await {
                Ok(res) if res.status() == StatusCode::Ok => return Ok(()),
                Ok(res) => tracing::warn!("waiting for server to start: {}", res.status()),
                Err(err) => tracing::warn!("waiting for server to start: {err}"),
            }
            sleep(Duration::from_secs(1)).await;
        }

        Err(Error::msg("timed out waiting for server"))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), Error> {
        let mut req = self.client.request(method, path).header(USER_HEADER, self.user);
        if let Some(body) = body {
            req = req.body_json(body).map_err(Error::msg)?;
        }
        let mut res = req.send().await.map_err(Error::msg)?;
        let bytes = res.body_bytes().await.map_err(Error::msg)?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|err| Error::msg(format!("cannot parse response body as JSON: {err}")))?
        };
        Ok((res.status(), value))
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Value), Error> {
        self.request(Method::Get, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<(StatusCode, Value), Error> {
        self.request(Method::Post, path, Some(&body)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<(StatusCode, Value), Error> {
        self.request(Method::Put, path, Some(&body)).await
    }

    async fn delete(&self, path: &str) -> Result<StatusCode, Error> {
        Ok(self.request(Method::Delete, path, None).await?.0)
    }

    async fn upload(
        &self,
        path: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<(StatusCode, Value), Error> {
        let mut res = self
            .client
            .post(path)
            .header(USER_HEADER, self.user)
            .header("Content-Type", content_type)
            .body(Body::from_bytes(data))
            .send()
            .await
            .map_err(Error::msg)?;
        let body = res.body_string().await.map_err(Error::msg)?;
        Ok((res.status(), serde_json::from_str(&body)?))
    }

    async fn download(&self, path: &str) -> Result<(StatusCode, Option<String>, Vec<u8>), Error> {
        let mut res = self.client.get(path).send().await.map_err(Error::msg)?;
        let content_type = res.header("Content-Type").map(|v| v.as_str().to_string());
        let bytes = res.body_bytes().await.map_err(Error::msg)?;
        Ok((res.status(), content_type, bytes))
    }

    async fn download_report(
        &self,
        kind: &str,
    ) -> Result<(StatusCode, Option<String>, Vec<u8>), Error> {
        self.download(&format!("/reports/{kind}")).await
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn new_inspection(supplier: &str, measured: f64) -> Value {
    json!({
        "material_code": "RB-4140-50",
        "material_name": "Round bar 4140 50mm",
        "supplier": supplier,
        "heat_number": "H12345",
        "quantity": 1200.0,
        "unit": "kg",
        "received_on": today(),
        "inspector": "alice",
        "measurements": [{
            "characteristic": "OD",
            "unit": "mm",
            "lower_limit": 49.9,
            "upper_limit": 50.1,
            "measured": measured,
        }],
    })
}

#[async_std::test]
async fn test_inspection_lifecycle() -> Result<(), Error> {
    let api = Api::start().await?;

    let (status, created) = api.post("/inspections", new_inspection("Acme", 50.0)).await?;
    assert_eq!(status, StatusCode::Created, "{created}");
    assert_eq!(created["status"], "accepted");
    assert_eq!(created["tally"]["passed"], 1);
    let id = created["id"].as_i64().unwrap();

    api.post("/inspections", new_inspection("Globex", 51.0)).await?;

    let (status, page) = api.get("/inspections?supplier=Acme&per_page=5").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(page["total"], 1);
    assert_eq!(page["per_page"], 5);
    assert_eq!(page["items"][0]["id"], id);

    let (_, page) = api.get("/inspections?status=rejected").await?;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["supplier"], "Globex");

    let (status, updated) = api
        .put(
            &format!("/inspections/{id}"),
            json!({ "status": "conditional", "remarks": "scale on surface" }),
        )
        .await?;
    assert_eq!(status, StatusCode::Ok, "{updated}");
    assert_eq!(updated["status"], "conditional");
    assert_eq!(updated["remarks"], "scale on surface");

    let (status, audit) = api
        .get(&format!("/audit?table=inspections&record_id={id}"))
        .await?;
    assert_eq!(status, StatusCode::Ok);
    let entries = audit["items"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|entry| entry["changed_by"] == "alice"));
    assert!(entries
        .iter()
        .any(|entry| entry["action"] == "update" && entry["field"] == "status"));

    assert_eq!(
        api.delete(&format!("/inspections/{id}")).await?,
        StatusCode::NoContent
    );
    let (status, body) = api.get(&format!("/inspections/{id}")).await?;
    assert_eq!(status, StatusCode::NotFound);
    assert!(body["error"].as_str().unwrap().contains("not found"), "{body}");

    Ok(())
}

#[async_std::test]
async fn test_invalid_requests() -> Result<(), Error> {
    let api = Api::start().await?;

    let mut bad = new_inspection(" ", 50.0);
    bad["quantity"] = json!(0.0);
    let (status, body) = api.post("/inspections", bad).await?;
    assert_eq!(status, StatusCode::BadRequest);
    let problems = body["problems"].as_array().unwrap();
    assert!(problems.len() >= 2, "{body}");
    assert!(problems.contains(&json!("supplier is required")), "{body}");

    // Nothing was written.
    let (_, page) = api.get("/inspections").await?;
    assert_eq!(page["total"], 0);

    let (status, body) = api
        .post("/inspections", json!({ "supplier": "Acme" }))
        .await?;
    assert_eq!(status, StatusCode::BadRequest);
    assert!(body["error"].is_string());

    let (status, _) = api.get("/inspections/not-a-number").await?;
    assert_eq!(status, StatusCode::NotFound);
    let (status, _) = api.get("/inspections?status=bogus").await?;
    assert_eq!(status, StatusCode::BadRequest);

    // Numbers at the edge of their range.
    let (status, page) = api.get("/inspections?page=18446744073709551615").await?;
    assert_eq!(status, StatusCode::Ok, "{page}");
    assert_eq!(page["items"], json!([]));
    let (status, _) = api
        .get("/instruments/due?within_days=9223372036854775807")
        .await?;
    assert_eq!(status, StatusCode::BadRequest);
    let (status, body) = api
        .post(
            "/instruments",
            json!({
                "code": "RT-1",
                "name": "Rockwell tester",
                "kind": "hardness tester",
                "location": "Lab 1",
                "interval_days": 100_000_000,
                "last_calibrated": today(),
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::BadRequest, "{body}");
    let (_, page) = api.get("/instruments").await?;
    assert_eq!(page["total"], 0);

    Ok(())
}

#[async_std::test]
async fn test_attachments() -> Result<(), Error> {
    let api = Api::start().await?;
    let (_, inspection) = api.post("/inspections", new_inspection("Acme", 50.0)).await?;
    let id = inspection["id"].as_i64().unwrap();
    let path = format!("/inspections/{id}/attachments");

    let pdf = b"%PDF-1.4 mill certificate".to_vec();
    let (status, attachment) = api
        .upload(&format!("{path}?file_name=cert.pdf"), "application/pdf", pdf.clone())
        .await?;
    assert_eq!(status, StatusCode::Created, "{attachment}");
    assert_eq!(attachment["file_name"], "cert.pdf");
    assert_eq!(attachment["size_bytes"], pdf.len());
    assert_eq!(attachment["uploaded_by"], "alice");
    let attachment_id = attachment["id"].as_i64().unwrap();

    let (status, list) = api.get(&path).await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, content_type, bytes) = api
        .download(&format!("/attachments/{attachment_id}"))
        .await?;
    assert_eq!(status, StatusCode::Ok);
    assert!(content_type.unwrap().starts_with("application/pdf"));
    assert_eq!(bytes, pdf);

    let (status, _) = api
        .upload(
            &format!("{path}?file_name=huge.pdf"),
            "application/pdf",
            vec![0; MAX_UPLOAD_BYTES + 1],
        )
        .await?;
    assert_eq!(status, StatusCode::PayloadTooLarge);

    let (status, _) = api
        .upload(
            "/inspections/999/attachments?file_name=cert.pdf",
            "application/pdf",
            pdf.clone(),
        )
        .await?;
    assert_eq!(status, StatusCode::NotFound);

    // Attachments may also be sent base64-encoded along with a new record.
    let (status, test) = api
        .post(
            "/chemical-tests",
            json!({
                "heat_number": "H12345",
                "grade": "4140",
                "laboratory": "Lab 1",
                "tested_on": today(),
                "analyst": "carol",
                "readings": [{ "element": "C", "measured_pct": 0.40 }],
                "attachments": [{
                    "file_name": "coa.pdf",
                    "content_type": "application/pdf",
                    "data": STANDARD.encode(&pdf),
                }],
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::Created, "{test}");
    assert_eq!(test["attachments"][0]["file_name"], "coa.pdf");

    assert_eq!(
        api.delete(&format!("/attachments/{attachment_id}")).await?,
        StatusCode::NoContent
    );
    let (status, _, _) = api
        .download(&format!("/attachments/{attachment_id}"))
        .await?;
    assert_eq!(status, StatusCode::NotFound);

    Ok(())
}

#[async_std::test]
async fn test_instruments_and_hardness() -> Result<(), Error> {
    let api = Api::start().await?;
    let instrument = json!({
        "code": "RT-1",
        "name": "Rockwell tester",
        "kind": "hardness tester",
        "location": "Lab 1",
        "interval_days": 180,
    });

    let (status, created) = api.post("/instruments", instrument.clone()).await?;
    assert_eq!(status, StatusCode::Created, "{created}");
    assert_eq!(created["due_state"], "never_calibrated");
    let id = created["id"].as_i64().unwrap();

    let (status, body) = api.post("/instruments", instrument).await?;
    assert_eq!(status, StatusCode::Conflict, "{body}");

    let (_, due) = api.get("/instruments/due").await?;
    assert_eq!(due[0]["code"], "RT-1");

    let hardness_test = json!({
        "part_number": "SH-100",
        "batch": "B-7",
        "scale": "HRC",
        "spec_min": 58.0,
        "spec_max": 62.0,
        "tested_on": today(),
        "operator": "frank",
        "instrument_id": id,
        "readings": [59.0, 60.0, 61.0],
    });
    let (status, body) = api.post("/hardness-tests", hardness_test.clone()).await?;
    assert_eq!(status, StatusCode::BadRequest, "{body}");

    let (status, calibration) = api
        .post(
            &format!("/instruments/{id}/calibrations"),
            json!({
                "calibrated_on": today(),
                "performed_by": "Metrology Inc",
                "result": "pass",
                "certificate_no": "C-1",
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::Created, "{calibration}");
    assert_eq!(calibration["next_due"], json!(today() + chrono::Duration::days(180)));
    let (_, history) = api.get(&format!("/instruments/{id}/calibrations")).await?;
    assert_eq!(history.as_array().unwrap().len(), 1);
    let (_, due) = api.get("/instruments/due").await?;
    assert_eq!(due, json!([]));

    let (status, test) = api.post("/hardness-tests", hardness_test).await?;
    assert_eq!(status, StatusCode::Created, "{test}");
    assert_eq!(test["tally"]["verdict"], "pass");
    assert_eq!(test["summary"]["mean"], 60.0);

    let (_, page) = api.get("/hardness-tests?verdict=pass").await?;
    assert_eq!(page["total"], 1);

    // The instrument is referenced by a test, so it can only be retired.
    assert_eq!(
        api.delete(&format!("/instruments/{id}")).await?,
        StatusCode::Conflict
    );
    let (status, retired) = api
        .put(&format!("/instruments/{id}"), json!({ "status": "retired" }))
        .await?;
    assert_eq!(status, StatusCode::Ok, "{retired}");
    assert_eq!(retired["status"], "retired");

    let (status, _) = api.get("/instruments/999").await?;
    assert_eq!(status, StatusCode::NotFound);
    let (status, _) = api.get("/instruments/999/calibrations").await?;
    assert_eq!(status, StatusCode::NotFound);

    Ok(())
}

#[async_std::test]
async fn test_kpis_dashboard_and_reports() -> Result<(), Error> {
    let api = Api::start().await?;
    let kpi = json!({
        "metric": "on time delivery",
        "period": today(),
        "target": 95.0,
        "actual": 97.0,
        "unit": "%",
    });

    let (status, created) = api.post("/kpis", kpi.clone()).await?;
    assert_eq!(status, StatusCode::Created, "{created}");
    assert_eq!(created["met"], true);
    let (status, _) = api.post("/kpis", kpi).await?;
    assert_eq!(status, StatusCode::Conflict);

    let (status, trend) = api.get("/kpis/trend/on%20time%20delivery").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(trend.as_array().unwrap().len(), 1);
    assert_eq!(trend[0]["actual"], 97.0);

    api.post("/inspections", new_inspection("Acme", 50.0)).await?;
    api.post("/inspections", new_inspection("Globex", 51.0)).await?;

    let (status, derived) = api.get("/kpis/derived").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(derived["receiving_acceptance"]["percent"], 50.0);

    let (status, dashboard) = api.get("/dashboard").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(dashboard["inspections"]["total"], 2);
    assert_eq!(dashboard["kpis"][0]["metric"], "on time delivery");

    let tomorrow = today() + chrono::Duration::days(1);
    let (_, dashboard) = api.get(&format!("/dashboard?from={tomorrow}")).await?;
    assert_eq!(dashboard["inspections"]["total"], 0);

    let (_, grades) = api.get("/grades").await?;
    assert_eq!(grades.as_array().unwrap().len(), 8);

    let reports = [
        "inspections",
        "chemical-tests",
        "hardness-tests",
        "instruments",
        "calibrations",
        "kpis",
        "audit",
    ];
    let responses = try_join_all(reports.iter().map(|kind| api.download_report(kind))).await?;
    for (kind, (status, content_type, _)) in reports.iter().zip(&responses) {
        assert_eq!(*status, StatusCode::Ok, "{kind}");
        assert!(content_type.as_deref().unwrap().starts_with("text/csv"), "{kind}");
    }

    let (_, _, csv) = api.download("/reports/inspections?supplier=Globex").await?;
    let csv = String::from_utf8(csv)?;
    let lines = csv.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2, "{csv}");
    assert!(lines[0].starts_with("id,received_on,"));
    assert!(lines[1].contains("Globex"));

    let (status, _, _) = api.download("/reports/bogus").await?;
    assert_eq!(status, StatusCode::NotFound);

    Ok(())
}
