//! API Integration Tests
//!
//! Drive the full router (middleware included) over in-memory collaborators.

use axum::http::StatusCode;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use kaus_ledger::Config;

mod common;

use common::{decimal, setup_app, setup_app_with};

#[tokio::test]
async fn test_health_and_packages() {
    let app = setup_app();

    let response = app.request("GET", "/health", None).await;
    assert_eq!(response.status, StatusCode::OK);

    let response = app.request("GET", "/api/v1/packages", None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["success"], true);
    let packages = response.body["packages"].as_array().unwrap();
    assert_eq!(packages.len(), 4);
    assert_eq!(packages[0]["id"], "starter");
}

#[tokio::test]
async fn test_purchase_webhook_e2e() {
    let app = setup_app();
    let user = app.open_account().await;
    let reference_id = app.starter_order(user).await;
    assert!(reference_id.starts_with("KAUS-"));

    // 1. First delivery credits the package
    let response = app.pay(&reference_id, "CAP-E2E-1", "75.00").await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.body["alreadyProcessed"], false);
    assert_eq!(response.body["referralBonus"]["status"], "NOT_REFERRED");
    assert_eq!(decimal(&response.body, "newBalance"), dec!(1000));
    let transaction_id = response.body["transactionId"].clone();

    // 2. Redelivery returns the original receipt
    let response = app.pay(&reference_id, "CAP-E2E-1", "75.00").await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.body["alreadyProcessed"], true);
    assert_eq!(response.body["transactionId"], transaction_id);
    assert_eq!(response.body["referralBonus"]["status"], "SKIPPED");

    assert_eq!(app.balance(user).await, dec!(1000));

    // 3. Order and history reflect one settlement
    let response = app
        .request("GET", &format!("/api/v1/purchases/{}", reference_id), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "COMPLETED");
    assert_eq!(response.body["transactionId"], transaction_id);

    let response = app
        .request("GET", &format!("/api/v1/accounts/{}/transactions", user), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let transactions = response.body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["type"], "PURCHASE");
    assert_eq!(transactions[0]["idempotencyKey"], "CAP-E2E-1");
}

#[tokio::test]
async fn test_underpaid_webhook_is_rejected() {
    let app = setup_app();
    let user = app.open_account().await;
    let reference_id = app.starter_order(user).await;

    let response = app.pay(&reference_id, "CAP-SHORT", "10.00").await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["success"], false);
    assert_eq!(response.body["code"], "PAYMENT_MISMATCH");
    assert_eq!(app.balance(user).await, dec!(0));
}

#[tokio::test]
async fn test_referral_flow() {
    let app = setup_app();
    let referrer = app.open_account().await;
    let referee = app.open_account().await;

    // 1. Referrer gets a code
    let response = app
        .request("POST", "/api/v1/referrals/codes", Some(json!({ "userId": referrer })))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    let code = response.body["code"].as_str().unwrap().to_string();
    assert!(code.starts_with("F9-"));

    let response = app
        .request("GET", &format!("/api/v1/referrals/codes/{}", code.to_lowercase()), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["code"], code.as_str());

    // 2. Referee claims the signup bonus once
    let claim = json!({ "userId": referee, "referralCode": code });
    let response = app
        .request("POST", "/api/v1/referrals/claim", Some(claim.clone()))
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(decimal(&response.body, "newBalance"), dec!(100));

    let response = app.request("POST", "/api/v1/referrals/claim", Some(claim)).await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.body["code"], "ALREADY_CLAIMED");

    assert_eq!(app.balance(referrer).await, dec!(100));
    assert_eq!(app.balance(referee).await, dec!(100));

    // 3. The referee's first purchase pays the purchase bonus
    let reference_id = app.starter_order(referee).await;
    let response = app.pay(&reference_id, "CAP-REF-1", "75").await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.body["referralBonus"]["status"], "GRANTED");
    assert_eq!(decimal(&response.body["referralBonus"], "referrerBonus"), dec!(100));
    assert_eq!(decimal(&response.body["referralBonus"], "refereeBonus"), dec!(50));

    assert_eq!(app.balance(referrer).await, dec!(200));
    assert_eq!(app.balance(referee).await, dec!(1150));

    // 4. Stats and reconciliation see a complete referral
    let response = app
        .request("GET", &format!("/api/v1/referrals/{}/stats", referrer), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["totalReferrals"], 1);
    assert_eq!(response.body["referralsWithPurchase"], 1);

    let response = app
        .request("POST", &format!("/api/v1/referrals/{}/reconcile", referee), None)
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    let legs = response.body["legs"].as_array().unwrap();
    assert_eq!(legs.len(), 2);
    assert!(legs.iter().all(|leg| leg["status"] == "ALREADY_APPLIED"));

    assert_eq!(app.balance(referee).await, dec!(1150));
}

#[tokio::test]
async fn test_self_referral_is_rejected() {
    let app = setup_app();
    let user = app.open_account().await;

    let response = app
        .request("POST", "/api/v1/referrals/codes", Some(json!({ "userId": user })))
        .await;
    let code = response.body["code"].as_str().unwrap().to_string();

    let response = app
        .request(
            "POST",
            "/api/v1/referrals/claim",
            Some(json!({ "userId": user, "referralCode": code })),
        )
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["code"], "SELF_REFERRAL");
}

#[tokio::test]
async fn test_withdrawal_lifecycle() {
    let app = setup_app();
    let user = app.open_account().await;
    let reference_id = app.starter_order(user).await;
    app.pay(&reference_id, "CAP-WD-1", "75").await;

    let bank = json!({
        "type": "bank",
        "bankName": "KB",
        "accountNumber": "123-456",
        "accountHolder": "Kim"
    });

    // 1. 12000 KRW reserves 100 KAUS; the bank minimum fee applies
    let response = app
        .request(
            "POST",
            "/api/v1/withdrawals",
            Some(json!({
                "userId": user,
                "amount": "12000",
                "currency": "KRW",
                "method": "bank",
                "destination": bank
            })),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["status"], "PENDING");
    assert_eq!(decimal(&response.body, "fee"), dec!(1000));
    assert_eq!(decimal(&response.body, "netAmount"), dec!(11000));
    assert_eq!(decimal(&response.body, "kausAmount"), dec!(100));
    let withdrawal_id = response.body["withdrawalId"].as_str().unwrap().to_string();

    let response = app
        .request("GET", &format!("/api/v1/accounts/{}/balance", user), None)
        .await;
    assert_eq!(decimal(&response.body, "kausBalance"), dec!(1000));
    assert_eq!(decimal(&response.body, "pendingKaus"), dec!(100));
    assert_eq!(decimal(&response.body, "availableBalance"), dec!(900));

    // 2. Payout succeeds
    let response = app
        .request(
            "POST",
            &format!("/api/v1/withdrawals/{}/complete", withdrawal_id),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.body["status"], "COMPLETED");

    let response = app
        .request("GET", &format!("/api/v1/accounts/{}/balance", user), None)
        .await;
    assert_eq!(decimal(&response.body, "kausBalance"), dec!(900));
    assert_eq!(decimal(&response.body, "pendingKaus"), dec!(0));

    // 3. A resolved withdrawal cannot be resolved again
    let response = app
        .request(
            "POST",
            &format!("/api/v1/withdrawals/{}/reject", withdrawal_id),
            Some(json!({ "reason": "late" })),
        )
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.body["code"], "INVALID_WITHDRAWAL_STATE");
}

#[tokio::test]
async fn test_withdrawal_rejection_releases_reservation() {
    let app = setup_app();
    let user = app.open_account().await;
    let reference_id = app.starter_order(user).await;
    app.pay(&reference_id, "CAP-WD-2", "75").await;

    let response = app
        .request(
            "POST",
            "/api/v1/withdrawals",
            Some(json!({
                "userId": user,
                "amount": "50",
                "currency": "USD",
                "method": "paypal",
                "destination": { "type": "paypal", "email": "kim@example.com" }
            })),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    let withdrawal_id = response.body["withdrawalId"].as_str().unwrap().to_string();

    let response = app
        .request(
            "POST",
            &format!("/api/v1/withdrawals/{}/reject", withdrawal_id),
            Some(json!({ "reason": "account closed" })),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.body);
    assert_eq!(response.body["status"], "REJECTED");
    assert_eq!(response.body["rejectionReason"], "account closed");

    let response = app
        .request("GET", &format!("/api/v1/accounts/{}/balance", user), None)
        .await;
    assert_eq!(decimal(&response.body, "kausBalance"), dec!(1000));
    assert_eq!(decimal(&response.body, "availableBalance"), dec!(1000));
}

#[tokio::test]
async fn test_withdrawal_validation_errors() {
    let app = setup_app();
    let user = app.open_account().await;

    let request = |amount: &str| {
        json!({
            "userId": user,
            "amount": amount,
            "currency": "KRW",
            "method": "crypto",
            "destination": { "type": "crypto", "address": "0xabc" }
        })
    };

    let response = app
        .request("POST", "/api/v1/withdrawals", Some(request("5000")))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "BELOW_MINIMUM");

    let response = app
        .request("POST", "/api/v1/withdrawals", Some(request("20000")))
        .await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["code"], "INSUFFICIENT_BALANCE");

    let response = app
        .request("POST", "/api/v1/withdrawals", Some(request("-1")))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "INVALID_AMOUNT");
}

#[tokio::test]
async fn test_malformed_requests() {
    let app = setup_app();

    let response = app
        .request("GET", "/api/v1/accounts/not-a-uuid/balance", None)
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "INVALID_REQUEST");

    let response = app
        .request("POST", "/api/v1/referrals/claim", Some(json!({ "userId": 5 })))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["success"], false);
    assert_eq!(response.body["code"], "INVALID_REQUEST");

    let response = app
        .request(
            "GET",
            &format!("/api/v1/accounts/{}/balance", Uuid::new_v4()),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.body["code"], "USER_NOT_FOUND");
}

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let app = setup_app();
    let response = app.request("GET", "/api/v1/packages", None).await;
    let header = response.headers["x-correlation-id"].to_str().unwrap();
    assert!(Uuid::parse_str(header).is_ok());
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let mut config = Config::for_local();
    config.rate_limit_per_minute = 2;
    let app = setup_app_with(config);

    for _ in 0..2 {
        let response = app.request("GET", "/api/v1/packages", None).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    let response = app.request("GET", "/api/v1/packages", None).await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.body["code"], "RATE_LIMIT_EXCEEDED");
    assert!(response.headers.contains_key("retry-after"));

    // Other clients keep their own window
    let response = app
        .request_from("GET", "/api/v1/packages", None, "203.0.113.9")
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_audit_chain_endpoints() {
    let app = setup_app();
    let user = app.open_account().await;
    let reference_id = app.starter_order(user).await;
    app.pay(&reference_id, "CAP-AUDIT-1", "75").await;

    let response = app.request("GET", "/api/v1/admin/audit/verify", None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["isValid"], true);
    assert_eq!(response.body["entriesChecked"], 2);
    assert_eq!(response.body["checkpoint"]["sequence"], 2);

    // Resuming from the returned checkpoint checks only newer entries
    let hash = response.body["checkpoint"]["hash"].as_str().unwrap().to_string();
    let uri = format!("/api/v1/admin/audit/verify?afterSequence=1&afterHash={}", "0".repeat(64));
    let response = app.request("GET", &uri, None).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["isValid"], false);

    let uri = format!("/api/v1/admin/audit/verify?afterSequence=2&afterHash={}", hash);
    let response = app.request("GET", &uri, None).await;
    assert_eq!(response.body["isValid"], true);
    assert_eq!(response.body["entriesChecked"], 0);

    let response = app
        .request("GET", &format!("/api/v1/admin/audit?userId={}", user), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["entries"].as_array().unwrap().len(), 2);
}
