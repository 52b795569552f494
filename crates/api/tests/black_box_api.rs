use chrono::{Duration as ChronoDuration, Utc};
use engage_api::config::ApiConfig;
use engage_auth::{JwtClaims, PrincipalId, Role};
use engage_core::{AggregateId, TenantId};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, in-memory stores, ephemeral port.
        let (app, _services) = engage_api::app::build_app(&ApiConfig::in_memory(SECRET))
            .await
            .expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, client: reqwest::Client::new(), handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, token: &str, path: &str) -> (StatusCode, Value) {
        let res = self.client.get(self.url(path)).bearer_auth(token).send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn send(&self, method: reqwest::Method, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self
            .client
            .request(method, self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
        self.send(reqwest::Method::POST, token, path, body).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(tenant_id: TenantId, role: &'static str, division_ids: Vec<AggregateId>, financer_ids: Vec<AggregateId>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: PrincipalId::new(),
        tenant_id,
        roles: vec![Role::new(role)],
        division_ids,
        financer_ids,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes()))
        .expect("failed to encode jwt")
}

fn god(tenant_id: TenantId) -> String {
    mint_jwt(tenant_id, Role::GOD, vec![], vec![])
}

/// Poll `path` until `done` accepts the body. Generation jobs and their
/// projections are eventually consistent.
async fn eventually(srv: &TestServer, token: &str, path: &str, done: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..200 {
        let (status, body) = srv.get(token, path).await;
        if status == StatusCode::OK && done(&body) {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("{path} did not reach the expected state within timeout");
}

/// Division, one financer under it and one beneficiary enrolled from March 11.
async fn seed_organization(srv: &TestServer, token: &str) -> (String, String) {
    let (status, division) = srv
        .post(
            token,
            "/divisions",
            json!({
                "name": "Benelux",
                "country": "BE",
                "currency": "EUR",
                "vat_rate": 21,
                "core_package_price": 1000,
                "contract_start_date": "2024-01-01"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let division_id = division["id"].as_str().unwrap().to_string();

    let (status, financer) = srv
        .post(
            token,
            "/financers",
            json!({ "name": "Acme", "division_id": division_id, "contract_start_date": "2024-01-01" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let financer_id = financer["id"].as_str().unwrap().to_string();

    let (status, _) = srv
        .post(
            token,
            &format!("/financers/{financer_id}/beneficiaries"),
            json!({ "user_id": AggregateId::new().to_string(), "from": "2025-03-11" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    (division_id, financer_id)
}

async fn create_division_invoice(srv: &TestServer, token: &str, division_id: &str) -> Value {
    let (status, invoice) = srv
        .post(
            token,
            "/invoices",
            json!({
                "recipient_type": "division",
                "recipient_id": division_id,
                "billing_period_start": "2025-03-01",
                "billing_period_end": "2025-03-31",
                "vat_rate": "21",
                "items": [
                    { "item_type": "custom", "label": "Onboarding", "unit_price": 10000, "quantity": 1 }
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{invoice}");
    invoice
}

#[tokio::test]
async fn health_is_public_and_everything_else_needs_a_token() {
    let srv = TestServer::spawn().await;

    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv.client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv.client.get(srv.url("/invoices")).bearer_auth("not-a-jwt").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn whoami_reports_tenant_roles_and_scope() {
    let srv = TestServer::spawn().await;
    let tenant_id = TenantId::new();
    let division = AggregateId::new();
    let token = mint_jwt(tenant_id, Role::DIVISION_ADMIN, vec![division], vec![]);

    let (status, body) = srv.get(&token, "/whoami").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], tenant_id.to_string());
    assert_eq!(body["roles"], json!(["division_admin"]));
    assert_eq!(body["scope"]["division_ids"], json!([division.to_string()]));
}

#[tokio::test]
async fn organizations_are_readable_right_after_writes() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, financer_id) = seed_organization(&srv, &token).await;

    let (status, division) = srv.get(&token, &format!("/divisions/{division_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(division["name"], "Benelux");
    assert_eq!(division["financer_ids"], json!([financer_id]));

    let (status, financer) = srv.get(&token, &format!("/financers/{financer_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(financer["beneficiaries"].as_object().unwrap().len(), 1);

    // Enrolled on the 11th of a 31-day month: 21 days, rounded to 0.68.
    let (status, prorata) = srv.get(&token, &format!("/financers/{financer_id}/beneficiaries/prorata?month=2025-03")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prorata["total_days"], 31);
    let share = prorata["beneficiaries"][0]["prorata"].as_f64().unwrap();
    assert!((share - 0.68).abs() < 1e-9, "unexpected share {share}");
}

#[tokio::test]
async fn financer_registration_requires_a_known_division() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());

    let (status, _) = srv
        .post(&token, "/financers", json!({ "name": "Acme", "division_id": AggregateId::new().to_string() }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = srv.post(&token, "/financers", json!({ "name": "Acme", "division_id": "nope" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");
}

#[tokio::test]
async fn monthly_run_completes_and_issues_invoices() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, financer_id) = seed_organization(&srv, &token).await;

    let (status, summary) = srv.post(&token, "/invoicing/batches", json!({ "month_year": "2025-03" })).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{summary}");
    assert_eq!(summary["divisions"], 1);
    let batch_id = summary["batch_id"].as_str().unwrap().to_string();

    let batch = eventually(&srv, &token, &format!("/invoicing/batches/{batch_id}"), |b| b["status"] == "completed").await;
    assert_eq!(batch["completed"], batch["total"]);
    assert_eq!(batch["failed"], 0);

    let invoices = eventually(&srv, &token, "/invoices", |page| page["meta"]["total"] == 2).await;
    let types: Vec<&str> = invoices["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["invoice_type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"hexeko_to_division"));
    assert!(types.contains(&"division_to_financer"));

    // Both ledgers picked up their invoice.
    eventually(&srv, &token, &format!("/divisions/{division_id}/balance"), |_| true).await;
    eventually(&srv, &token, &format!("/financers/{financer_id}/balance"), |_| true).await;

    let (status, stats) = srv.get(&token, "/invoicing/jobs/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(stats.is_object());
}

#[tokio::test]
async fn monthly_run_rejects_bad_months() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());

    let (status, _) = srv.post(&token, "/invoicing/batches", json!({ "month_year": "2025-13" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = srv
        .post(&token, "/invoicing/batches", json!({ "month_year": "2025-03", "division_id": AggregateId::new().to_string() }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_invoice_lifecycle() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, _) = seed_organization(&srv, &token).await;

    let invoice = create_division_invoice(&srv, &token, &division_id).await;
    assert_eq!(invoice["status"], "draft");
    assert_eq!(invoice["invoice_type"], "hexeko_to_division");
    assert_eq!(invoice["subtotal_htva"], 10000);
    assert_eq!(invoice["vat_amount"], 2100);
    assert_eq!(invoice["total_ttc"], 12100);
    let id = invoice["invoice_id"].as_str().unwrap().to_string();

    let (status, confirmed) = srv.post(&token, &format!("/invoices/{id}/confirm"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");

    // Only drafts can be deleted.
    let res = srv.client.delete(srv.url(&format!("/invoices/{id}"))).bearer_auth(&token).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let (status, paid) = srv.post(&token, &format!("/invoices/{id}/mark-paid"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["status"], "paid");
    assert_eq!(paid["amount_paid"], 12100);
}

#[tokio::test]
async fn draft_invoices_can_be_edited_and_deleted() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, _) = seed_organization(&srv, &token).await;
    let invoice = create_division_invoice(&srv, &token, &division_id).await;
    let id = invoice["invoice_id"].as_str().unwrap().to_string();

    let (status, updated) = srv
        .post(
            &token,
            &format!("/invoices/{id}/items"),
            json!({ "item_type": "custom", "label": "Training", "unit_price": 5000, "quantity": 2 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["items"].as_array().unwrap().len(), 2);
    assert_eq!(updated["subtotal_htva"], 20000);

    let (status, updated) =
        srv.send(reqwest::Method::PUT, &token, &format!("/invoices/{id}"), json!({ "notes": "March onboarding" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["notes"], "March onboarding");

    let res = srv.client.delete(srv.url(&format!("/invoices/{id}"))).bearer_auth(&token).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let (status, _) = srv.get(&token, &format!("/invoices/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invoice_access_follows_role_and_scope() {
    let srv = TestServer::spawn().await;
    let tenant_id = TenantId::new();
    let token = god(tenant_id);
    let (division_id, _) = seed_organization(&srv, &token).await;
    let invoice = create_division_invoice(&srv, &token, &division_id).await;
    let id = invoice["invoice_id"].as_str().unwrap().to_string();

    let division_agg: AggregateId = division_id.parse().unwrap();
    let own_admin = mint_jwt(tenant_id, Role::DIVISION_ADMIN, vec![division_agg], vec![]);
    let other_admin = mint_jwt(tenant_id, Role::DIVISION_ADMIN, vec![AggregateId::new()], vec![]);

    let (status, _) = srv.get(&own_admin, &format!("/invoices/{id}")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = srv.get(&other_admin, &format!("/invoices/{id}")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, page) = srv.get(&other_admin, "/invoices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["meta"]["total"], 0);

    // Division admins cannot bill their own division.
    let (status, _) = srv
        .post(
            &own_admin,
            "/invoices",
            json!({
                "recipient_type": "division",
                "recipient_id": division_id,
                "billing_period_start": "2025-03-01",
                "billing_period_end": "2025-03-31",
                "vat_rate": "21"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_ids_are_bad_requests() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());

    let (status, body) = srv.get(&token, "/invoices/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let (status, _) = srv.get(&token, &format!("/invoices/{}", AggregateId::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bulk_status_reports_each_invoice() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, _) = seed_organization(&srv, &token).await;

    let first = create_division_invoice(&srv, &token, &division_id).await;
    let second = create_division_invoice(&srv, &token, &division_id).await;
    let first_id = first["invoice_id"].as_str().unwrap().to_string();
    let second_id = second["invoice_id"].as_str().unwrap().to_string();
    assert_ne!(first["invoice_number"], second["invoice_number"]);

    // Sending a draft fails; confirming works for both.
    let (status, body) = srv
        .post(&token, "/invoices/bulk/status", json!({ "status": "sent", "invoice_ids": [first_id, second_id] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["failed"].as_array().unwrap().len(), 2);

    let (status, body) = srv
        .post(&token, "/invoices/bulk/status", json!({ "status": "confirmed", "invoice_ids": [first_id, second_id] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Invoices status updated");
    assert_eq!(body["data"]["updated"].as_array().unwrap().len(), 2);

    let (_, page) = srv.get(&token, "/invoices?status=confirmed").await;
    assert_eq!(page["meta"]["total"], 2);
}

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let srv = TestServer::spawn().await;
    let token_a = god(TenantId::new());
    let token_b = god(TenantId::new());
    let (division_id, _) = seed_organization(&srv, &token_a).await;
    let invoice = create_division_invoice(&srv, &token_a, &division_id).await;
    let id = invoice["invoice_id"].as_str().unwrap().to_string();

    let (status, _) = srv.get(&token_b, &format!("/divisions/{division_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = srv.get(&token_b, &format!("/invoices/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, page) = srv.get(&token_b, "/invoices").await;
    assert_eq!(page["meta"]["total"], 0);
}

#[tokio::test]
async fn projection_rebuild_runs_as_a_job() {
    let srv = TestServer::spawn().await;
    let token = god(TenantId::new());
    let (division_id, _) = seed_organization(&srv, &token).await;

    let (status, body) = srv.post(&token, "/invoicing/projections/rebuild", json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["job_id"].is_string());

    // Read models come back with the same data once the job ran.
    eventually(&srv, &token, &format!("/divisions/{division_id}"), |d| d["name"] == "Benelux").await;
}
