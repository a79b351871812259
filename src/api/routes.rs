//! API Routes
//!
//! HTTP endpoint definitions. Each route parses its payload into a typed
//! command and hands it to an engine; no ledger logic lives here.

use axum::{
    extract::{Extension, FromRequest, FromRequestParts, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::{AuditEntry, ChainCheckpoint, ChainVerification};
use crate::domain::{
    AccountBalance, Amount, Currency, LedgerError, LedgerTransaction, OperationContext,
    OrderStatus, Package, PaymentMethod, PurchaseOrder, WithdrawalDestination, WithdrawalMethod,
    WithdrawalRequest, WithdrawalStatus, PURCHASE_PACKAGES,
};
use crate::error::AppError;
use crate::handlers::{
    ClaimSignupBonusCommand, FirstPurchaseBonusCommand, FirstPurchaseOutcome,
    InitiatePurchaseCommand, PaymentConfirmedEvent, PurchaseQuote, ReconciliationReport,
    ReferralBonusStatus, ReferralStats, WithdrawalCommand, WithdrawalReceipt,
};

use super::AppState;

// =========================================================================
// Extractors
// =========================================================================

/// `Json` whose rejection is rendered as an `AppError`
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

/// Successful response body: `{"success": true, ...}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn parse_amount(value: &str) -> Result<Amount, AppError> {
    Amount::from_str(value).map_err(|e| AppError::Ledger(LedgerError::from(e)))
}

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub kaus_balance: Decimal,
    pub pending_kaus: Decimal,
    pub available_balance: Decimal,
    pub total_earnings: Decimal,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountBalance> for BalanceResponse {
    fn from(account: AccountBalance) -> Self {
        Self {
            user_id: account.user_id,
            available_balance: account.available(),
            kaus_balance: account.kaus_balance,
            pending_kaus: account.pending_kaus,
            total_earnings: account.total_earnings,
            total_deposits: account.total_deposits,
            total_withdrawals: account.total_withdrawals,
            updated_at: account.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference_id: String,
    pub idempotency_key: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerTransaction> for TransactionView {
    fn from(tx: LedgerTransaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind.as_str().to_string(),
            amount: tx.amount,
            balance_before: tx.balance_before,
            balance_after: tx.balance_after,
            reference_id: tx.reference_id,
            idempotency_key: tx.idempotency_key,
            verified: tx.verified,
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsResponse {
    pub user_id: Uuid,
    pub transactions: Vec<TransactionView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageView {
    pub id: &'static str,
    pub label: &'static str,
    pub kaus_amount: Decimal,
    pub bonus_amount: Decimal,
    pub total_kaus: Decimal,
    pub price_krw: Decimal,
    pub price_usd: Decimal,
    pub popular: bool,
}

impl From<&Package> for PackageView {
    fn from(package: &Package) -> Self {
        Self {
            id: package.id,
            label: package.label,
            kaus_amount: package.kaus_amount,
            bonus_amount: package.bonus_amount(),
            total_kaus: package.total_kaus(),
            price_krw: package.price_krw,
            price_usd: package.price_usd,
            popular: package.popular,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PackagesResponse {
    pub packages: Vec<PackageView>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    pub package_id: String,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub reference_id: String,
    pub user_id: Uuid,
    pub package_id: String,
    pub total_kaus: Decimal,
    pub price: Decimal,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<PurchaseOrder> for OrderView {
    fn from(order: PurchaseOrder) -> Self {
        Self {
            reference_id: order.reference_id,
            user_id: order.user_id,
            package_id: order.package_id,
            total_kaus: order.total_kaus,
            price: order.price,
            currency: order.currency,
            payment_method: order.payment_method,
            status: order.status,
            transaction_id: order.transaction_id,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhookRequest {
    pub provider: PaymentMethod,
    pub payment_id: String,
    pub reference_id: String,
    pub amount: String,
    pub currency: Currency,
    #[serde(default)]
    pub payer_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhookResponse {
    pub reference_id: String,
    pub user_id: Uuid,
    pub transaction_id: Uuid,
    pub new_balance: Decimal,
    pub already_processed: bool,
    pub referral_bonus: ReferralBonusStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCodeRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCodeResponse {
    pub code: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub user_id: Uuid,
    pub referral_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub referral_id: Uuid,
    pub referrer_bonus: Decimal,
    pub referee_bonus: Decimal,
    pub transaction_id: Uuid,
    pub new_balance: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstPurchaseRequest {
    pub user_id: Uuid,
    pub purchase_amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstPurchaseResponse {
    pub bonus_granted: bool,
    #[serde(flatten)]
    pub status: ReferralBonusStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalApiRequest {
    pub user_id: Uuid,
    pub amount: String,
    pub currency: Currency,
    pub method: WithdrawalMethod,
    pub destination: WithdrawalDestination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
    pub method: WithdrawalMethod,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub kaus_amount: Decimal,
    pub status: WithdrawalStatus,
    pub estimated_arrival: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl From<WithdrawalRequest> for WithdrawalView {
    fn from(w: WithdrawalRequest) -> Self {
        Self {
            id: w.id,
            user_id: w.user_id,
            amount: w.amount,
            currency: w.currency,
            method: w.method,
            fee: w.fee,
            net_amount: w.net_amount,
            kaus_amount: w.kaus_amount,
            status: w.status,
            estimated_arrival: w.estimated_arrival,
            created_at: w.created_at,
            resolved_at: w.resolved_at,
            rejection_reason: w.rejection_reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyQuery {
    #[serde(default = "default_verify_limit")]
    pub limit: i64,
    /// Resume after a checkpoint returned by an earlier call
    pub after_sequence: Option<i64>,
    pub after_hash: Option<String>,
}

impl VerifyQuery {
    fn checkpoint(&self) -> ChainCheckpoint {
        match (self.after_sequence, &self.after_hash) {
            (Some(sequence), Some(hash)) => ChainCheckpoint {
                sequence,
                hash: hash.clone(),
            },
            _ => ChainCheckpoint::genesis(),
        }
    }
}

fn default_verify_limit() -> i64 {
    10_000
}

#[derive(Debug, Serialize)]
pub struct AuditEntriesResponse {
    pub entries: Vec<AuditEntry>,
}

// =========================================================================
// Router
// =========================================================================

/// Create the API router (mounted under `/api/v1`)
pub fn create_router() -> Router<AppState> {
    Router::new()
        // Accounts
        .route("/accounts", post(open_account))
        .route("/accounts/:user_id/balance", get(get_balance))
        .route("/accounts/:user_id/transactions", get(get_transactions))
        // Purchases
        .route("/packages", get(list_packages))
        .route("/purchases", post(initiate_purchase))
        .route("/purchases/:reference_id", get(get_order))
        .route("/webhooks/payments", post(payment_webhook))
        // Referrals
        .route("/referrals/codes", post(generate_code))
        .route("/referrals/codes/:code", get(validate_code))
        .route("/referrals/claim", post(claim_signup_bonus))
        .route("/referrals/first-purchase", post(first_purchase_bonus))
        .route("/referrals/:referee_id/reconcile", post(reconcile_signup_bonus))
        .route(
            "/referrals/:referee_id/reconcile-first-purchase",
            post(reconcile_first_purchase_bonus),
        )
        .route("/referrals/:user_id/stats", get(referral_stats))
        // Withdrawals
        .route("/withdrawals", post(request_withdrawal))
        .route("/withdrawals/:id", get(get_withdrawal))
        .route("/withdrawals/:id/complete", post(complete_withdrawal))
        .route("/withdrawals/:id/reject", post(reject_withdrawal))
        // Admin
        .route("/admin/audit", get(recent_audit_entries))
        .route("/admin/audit/verify", get(verify_audit_chain))
}

// =========================================================================
// Accounts
// =========================================================================

async fn open_account(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<OpenAccountRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BalanceResponse>>), AppError> {
    let account = state
        .store
        .open_account(request.user_id)
        .await
        .map_err(LedgerError::from)?;

    tracing::info!(user_id = %request.user_id, "Account opened");

    Ok((StatusCode::CREATED, ok(account.into())))
}

async fn get_balance(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<BalanceResponse>>, AppError> {
    let account = state
        .store
        .get_account(user_id)
        .await
        .map_err(LedgerError::from)?
        .ok_or(LedgerError::UserNotFound(user_id))?;

    Ok(ok(account.into()))
}

async fn get_transactions(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> Result<Json<ApiResponse<TransactionsResponse>>, AppError> {
    let limit = query.limit.clamp(1, 500);
    let transactions = state
        .store
        .list_transactions(user_id, limit)
        .await
        .map_err(LedgerError::from)?;

    Ok(ok(TransactionsResponse {
        user_id,
        transactions: transactions.into_iter().map(Into::into).collect(),
    }))
}

// =========================================================================
// Purchases
// =========================================================================

async fn list_packages() -> Json<ApiResponse<PackagesResponse>> {
    ok(PackagesResponse {
        packages: PURCHASE_PACKAGES.iter().map(PackageView::from).collect(),
    })
}

async fn initiate_purchase(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiJson(request): ApiJson<PurchaseRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PurchaseQuote>>), AppError> {
    let command = InitiatePurchaseCommand {
        user_id: request.user_id,
        package_id: request.package_id,
        currency: request.currency,
        payment_method: request.payment_method,
    };

    let quote = state.purchases.initiate_purchase(command, &context).await?;

    Ok((StatusCode::CREATED, ok(quote)))
}

async fn get_order(
    State(state): State<AppState>,
    ApiPath(reference_id): ApiPath<String>,
) -> Result<Json<ApiResponse<OrderView>>, AppError> {
    let order = state.purchases.get_order(&reference_id).await?;
    Ok(ok(order.into()))
}

async fn payment_webhook(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiJson(request): ApiJson<PaymentWebhookRequest>,
) -> Result<Json<ApiResponse<PaymentWebhookResponse>>, AppError> {
    let context = context.with_source(format!("webhook:{}", request.provider.as_str()));

    let mut event = PaymentConfirmedEvent::new(
        request.provider,
        request.payment_id,
        request.reference_id,
        parse_amount(&request.amount)?,
        request.currency,
    )?;
    if let Some(email) = request.payer_email {
        event = event.with_payer_email(email);
    }

    let settlement = state.purchases.handle_payment(event, &context).await?;
    let receipt = settlement.outcome.receipt();

    Ok(ok(PaymentWebhookResponse {
        reference_id: settlement.reference_id,
        user_id: settlement.user_id,
        transaction_id: receipt.transaction_id,
        new_balance: receipt.new_balance,
        already_processed: settlement.outcome.is_replay(),
        referral_bonus: settlement.referral_bonus,
    }))
}

// =========================================================================
// Referrals
// =========================================================================

async fn generate_code(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<GenerateCodeRequest>,
) -> Result<Json<ApiResponse<ReferralCodeResponse>>, AppError> {
    let code = state.referrals.generate_code(request.user_id).await?;
    Ok(ok(ReferralCodeResponse {
        code: code.code,
        valid: true,
        created_at: Some(code.created_at),
    }))
}

async fn validate_code(
    State(state): State<AppState>,
    ApiPath(code): ApiPath<String>,
) -> Result<Json<ApiResponse<ReferralCodeResponse>>, AppError> {
    let code = state.referrals.find_code(&code).await?;
    Ok(ok(ReferralCodeResponse {
        code: code.code,
        valid: true,
        created_at: None,
    }))
}

async fn claim_signup_bonus(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiJson(request): ApiJson<ClaimRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ClaimResponse>>), AppError> {
    let command = ClaimSignupBonusCommand::new(request.user_id, &request.referral_code)?;
    let result = state.referrals.claim_signup_bonus(command, &context).await?;

    let new_balance = state
        .store
        .get_account(result.referee_id)
        .await
        .map_err(LedgerError::from)?
        .map(|a| a.kaus_balance)
        .unwrap_or_default();

    Ok((
        StatusCode::CREATED,
        ok(ClaimResponse {
            referral_id: result.referral_id,
            referrer_bonus: result.referrer_bonus,
            referee_bonus: result.referee_bonus,
            transaction_id: result.referee_transaction_id,
            new_balance,
        }),
    ))
}

async fn first_purchase_bonus(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiJson(request): ApiJson<FirstPurchaseRequest>,
) -> Result<Json<ApiResponse<FirstPurchaseResponse>>, AppError> {
    let command = FirstPurchaseBonusCommand {
        referee_id: request.user_id,
        purchase_amount: parse_amount(&request.purchase_amount)?,
    };

    let outcome = state
        .referrals
        .grant_first_purchase_bonus(command, &context)
        .await?;

    let status = match outcome {
        FirstPurchaseOutcome::Granted(result) => ReferralBonusStatus::Granted {
            referrer_bonus: result.referrer_bonus,
            referee_bonus: result.referee_bonus,
        },
        FirstPurchaseOutcome::AlreadyGranted => ReferralBonusStatus::AlreadyGranted,
        FirstPurchaseOutcome::NotReferred => ReferralBonusStatus::NotReferred,
    };

    Ok(ok(FirstPurchaseResponse {
        bonus_granted: matches!(status, ReferralBonusStatus::Granted { .. }),
        status,
    }))
}

async fn reconcile_signup_bonus(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiPath(referee_id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<ReconciliationReport>>, AppError> {
    let context = context.with_source("reconcile");
    let report = state
        .referrals
        .reconcile_signup_bonus(referee_id, &context)
        .await?;
    Ok(ok(report))
}

async fn reconcile_first_purchase_bonus(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiPath(referee_id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<ReconciliationReport>>, AppError> {
    let context = context.with_source("reconcile");
    let report = state
        .referrals
        .reconcile_first_purchase_bonus(referee_id, &context)
        .await?;
    Ok(ok(report))
}

async fn referral_stats(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<ReferralStats>>, AppError> {
    let stats = state.referrals.stats(user_id).await?;
    Ok(ok(stats))
}

// =========================================================================
// Withdrawals
// =========================================================================

async fn request_withdrawal(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiJson(request): ApiJson<WithdrawalApiRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WithdrawalReceipt>>), AppError> {
    let command = WithdrawalCommand {
        user_id: request.user_id,
        amount: parse_amount(&request.amount)?,
        currency: request.currency,
        method: request.method,
        destination: request.destination,
    };

    let receipt = state.withdrawals.request_withdrawal(command, &context).await?;

    Ok((StatusCode::CREATED, ok(receipt)))
}

async fn get_withdrawal(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<WithdrawalView>>, AppError> {
    let withdrawal = state.withdrawals.get_withdrawal(id).await?;
    Ok(ok(withdrawal.into()))
}

async fn complete_withdrawal(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<WithdrawalView>>, AppError> {
    let context = context.with_source("payout");
    let withdrawal = state.withdrawals.complete_withdrawal(id, &context).await?;
    Ok(ok(withdrawal.into()))
}

async fn reject_withdrawal(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<RejectRequest>,
) -> Result<Json<ApiResponse<WithdrawalView>>, AppError> {
    if request.reason.trim().is_empty() {
        return Err(AppError::InvalidRequest("reason is required".to_string()));
    }
    let context = context.with_source("payout");
    let withdrawal = state
        .withdrawals
        .reject_withdrawal(id, request.reason, &context)
        .await?;
    Ok(ok(withdrawal.into()))
}

// =========================================================================
// Admin
// =========================================================================

async fn recent_audit_entries(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> Result<Json<ApiResponse<AuditEntriesResponse>>, AppError> {
    let entries = state
        .audit
        .recent(query.user_id, query.limit.clamp(1, 500))
        .await?;
    Ok(ok(AuditEntriesResponse { entries }))
}

async fn verify_audit_chain(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<VerifyQuery>,
) -> Result<Json<ApiResponse<ChainVerification>>, AppError> {
    let verification =
        crate::jobs::verify_audit_chain(state.audit.as_ref(), &query.checkpoint(), query.limit.max(1))
            .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(ok(verification))
}
