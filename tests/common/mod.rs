//! Common test utilities

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tower::util::ServiceExt;
use uuid::Uuid;

use kaus_ledger::audit::MemoryAuditLog;
use kaus_ledger::store::InMemoryLedgerStore;
use kaus_ledger::{api, AppState, Config};

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryLedgerStore>,
    pub audit: Arc<MemoryAuditLog>,
}

/// Router over in-memory collaborators with the full middleware stack
pub fn setup_app() -> TestApp {
    setup_app_with(Config::for_local())
}

pub fn setup_app_with(config: Config) -> TestApp {
    let store = Arc::new(InMemoryLedgerStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let state = AppState::new(store.clone(), audit.clone(), config);
    TestApp {
        router: api::build_router(state.clone()),
        state,
        store,
        audit,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestApp {
    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> TestResponse {
        self.request_from(method, uri, body, "198.51.100.1").await
    }

    /// Same as `request` with an explicit client address
    pub async fn request_from(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        client_ip: &str,
    ) -> TestResponse {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", client_ip);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn open_account(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        let response = self
            .request(
                "POST",
                "/api/v1/accounts",
                Some(serde_json::json!({ "userId": user_id })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        user_id
    }

    pub async fn balance(&self, user_id: Uuid) -> Decimal {
        let response = self
            .request("GET", &format!("/api/v1/accounts/{}/balance", user_id), None)
            .await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        decimal(&response.body, "kausBalance")
    }

    /// Create a starter order paid in USD and return its reference id
    pub async fn starter_order(&self, user_id: Uuid) -> String {
        let response = self
            .request(
                "POST",
                "/api/v1/purchases",
                Some(serde_json::json!({
                    "userId": user_id,
                    "packageId": "starter",
                    "currency": "USD",
                    "paymentMethod": "paypal"
                })),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        response.body["referenceId"].as_str().unwrap().to_string()
    }

    pub async fn pay(&self, reference_id: &str, payment_id: &str, amount: &str) -> TestResponse {
        self.request(
            "POST",
            "/api/v1/webhooks/payments",
            Some(serde_json::json!({
                "provider": "paypal",
                "paymentId": payment_id,
                "referenceId": reference_id,
                "amount": amount,
                "currency": "USD"
            })),
        )
        .await
    }
}

/// Decimal carried as a JSON string (or number) under `field`
pub fn decimal(body: &Value, field: &str) -> Decimal {
    match &body[field] {
        Value::String(s) => Decimal::from_str(s).unwrap(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).unwrap(),
        other => panic!("{} is not a decimal: {}", field, other),
    }
}
