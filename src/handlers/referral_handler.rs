//! Referral Handler
//!
//! Signup and first-purchase bonuses between a referrer and a referee.
//! Every bonus leg is posted under its own deterministic idempotency key,
//! so a partially applied grant can be repaired without double credit.

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditRecord, AuditSink};
use crate::config::ReferralPolicy;
use crate::domain::precision::{add8, percent_of, round8};
use crate::domain::{
    fiat_from_kaus, Currency, LedgerError, OperationContext, ReferralCode, ReferralLink,
    ReferralStatus, TransactionType,
};
use crate::store::{LedgerStore, NewTransaction, PostOutcome, StoreError};

use super::{
    reconciliation_required, ClaimSignupBonusCommand, FirstPurchaseBonusCommand,
    FirstPurchaseBonusResult, FirstPurchaseOutcome, LegReport, LegStatus, ReconciliationReport,
    ReferralStats, SignupBonusResult,
};

const CODE_PREFIX: &str = "F9";
const BASE36: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const CODE_ATTEMPTS: usize = 3;

/// Which side of a referral a bonus leg credits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Referrer,
    Referee,
}

impl Leg {
    fn as_str(&self) -> &'static str {
        match self {
            Leg::Referrer => "REFERRER",
            Leg::Referee => "REFEREE",
        }
    }
}

/// Which bonus a set of legs belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BonusKind {
    Signup,
    FirstPurchase,
}

impl BonusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BonusKind::Signup => "SIGNUP",
            BonusKind::FirstPurchase => "FIRST_PURCHASE",
        }
    }
}

/// Idempotency key of a signup bonus leg
pub fn signup_leg_key(referee_id: Uuid, leg: Leg) -> String {
    format!("REF-SIGNUP-{}-{}", referee_id, leg.as_str())
}

/// Idempotency key of a first-purchase bonus leg
pub fn first_purchase_leg_key(referral_id: Uuid, leg: Leg) -> String {
    format!("REF-FIRST-{}-{}", referral_id, leg.as_str())
}

/// `F9-XXXX-<base36>-<base36>`, case-insensitive
pub fn is_valid_code(code: &str) -> bool {
    let parts: Vec<&str> = code.split('-').collect();
    let alnum = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
    parts.len() == 4
        && parts[0].eq_ignore_ascii_case(CODE_PREFIX)
        && parts[1].len() == 4
        && parts[1..].iter().all(|p| alnum(p))
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// `F9-<first 4 of user id>-<base36 millis>-<4 random>`
fn generate_code(user_id: Uuid) -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..4)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    let user_hash: String = user_id.simple().to_string().chars().take(4).collect();
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    format!("{}-{}-{}-{}", CODE_PREFIX, user_hash, to_base36(millis), random).to_uppercase()
}

// =========================================================================
// ReferralHandler
// =========================================================================

/// Handler for referral codes and bonuses
#[derive(Clone)]
pub struct ReferralHandler {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    policy: ReferralPolicy,
}

impl ReferralHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditSink>,
        policy: ReferralPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> &ReferralPolicy {
        &self.policy
    }

    /// Return the user's code, creating one on first use
    pub async fn generate_code(&self, user_id: Uuid) -> Result<ReferralCode, LedgerError> {
        if self.store.get_account(user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(user_id));
        }

        for _ in 0..CODE_ATTEMPTS {
            if let Some(existing) = self.store.find_referral_code_by_user(user_id).await? {
                return Ok(existing);
            }

            let code = ReferralCode {
                code: generate_code(user_id),
                user_id,
                created_at: Utc::now(),
            };
            match self.store.insert_referral_code(code.clone()).await {
                Ok(()) => {
                    tracing::info!(user_id = %user_id, code = %code.code, "Referral code created");
                    return Ok(code);
                }
                Err(StoreError::DuplicateReferralCode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::StoreUnavailable(
            "could not allocate a unique referral code".to_string(),
        ))
    }

    /// Resolve a code to its owner
    pub async fn find_code(&self, code: &str) -> Result<ReferralCode, LedgerError> {
        let code = code.trim().to_uppercase();
        if !is_valid_code(&code) {
            return Err(LedgerError::InvalidReferralCode(code));
        }
        self.store
            .find_referral_code(&code)
            .await?
            .ok_or(LedgerError::ReferralCodeNotFound(code))
    }

    // =========================================================================
    // claim_signup_bonus
    // =========================================================================

    pub async fn claim_signup_bonus(
        &self,
        command: ClaimSignupBonusCommand,
        context: &OperationContext,
    ) -> Result<SignupBonusResult, LedgerError> {
        let referee_id = command.referee_id;

        let code = self
            .store
            .find_referral_code(&command.referral_code)
            .await?
            .ok_or_else(|| LedgerError::ReferralCodeNotFound(command.referral_code.clone()))?;
        let referrer_id = code.user_id;

        if self.store.find_referral_by_referee(referee_id).await?.is_some() {
            return Err(LedgerError::AlreadyClaimed(referee_id));
        }

        if referrer_id == referee_id {
            return Err(LedgerError::SelfReferral);
        }

        for user_id in [referrer_id, referee_id] {
            if self.store.get_account(user_id).await?.is_none() {
                return Err(LedgerError::UserNotFound(user_id));
            }
        }

        let link = ReferralLink {
            id: Uuid::new_v4(),
            referrer_id,
            referee_id,
            referral_code: code.code.clone(),
            signup_bonus_referrer: round8(self.policy.signup_bonus_referrer),
            signup_bonus_referee: round8(self.policy.signup_bonus_referee),
            first_purchase_bonus_granted: false,
            purchase_bonus_referrer: None,
            purchase_bonus_referee: None,
            status: ReferralStatus::Active,
            created_at: Utc::now(),
        };

        // Unique on referee and capped per referrer: a concurrent claim loses here
        self.store
            .insert_referral(link.clone(), self.policy.max_referrals)
            .await?;

        let legs = [
            (Leg::Referrer, referrer_id, link.signup_bonus_referrer),
            (Leg::Referee, referee_id, link.signup_bonus_referee),
        ];
        let mut applied = Vec::new();
        let mut transaction_ids = [Uuid::nil(); 2];

        for (idx, (leg, user_id, amount)) in legs.into_iter().enumerate() {
            let key = signup_leg_key(referee_id, leg);
            match self.post_leg(user_id, amount, link.id, key).await {
                Ok(Some(outcome)) => {
                    transaction_ids[idx] = outcome.transaction().id;
                    applied.push(outcome.transaction().id);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(reconciliation_required(
                        "claim_signup_bonus",
                        format!(
                            "referral {} created but {} leg failed: {}",
                            link.id,
                            leg.as_str(),
                            e
                        ),
                        applied,
                    ));
                }
            }
        }

        let record = AuditRecord::kaus(
            AuditEventType::ReferralBonus,
            referee_id,
            add8(link.signup_bonus_referrer, link.signup_bonus_referee),
        )
        .detail("bonusType", BonusKind::Signup.as_str())
        .detail("referralId", link.id)
        .detail("referrerId", referrer_id)
        .detail("refereeId", referee_id)
        .detail("referrerBonus", link.signup_bonus_referrer)
        .detail("refereeBonus", link.signup_bonus_referee)
        .detail("transactionIds", &applied)
        .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            return Err(reconciliation_required(
                "claim_signup_bonus",
                format!("signup bonus for referral {} applied but audit failed: {}", link.id, e),
                applied,
            ));
        }

        tracing::info!(
            referral_id = %link.id,
            referrer_id = %referrer_id,
            referee_id = %referee_id,
            "Signup bonus granted"
        );

        Ok(SignupBonusResult {
            referral_id: link.id,
            referrer_id,
            referee_id,
            referrer_bonus: link.signup_bonus_referrer,
            referee_bonus: link.signup_bonus_referee,
            referrer_transaction_id: transaction_ids[0],
            referee_transaction_id: transaction_ids[1],
        })
    }

    // =========================================================================
    // grant_first_purchase_bonus
    // =========================================================================

    pub async fn grant_first_purchase_bonus(
        &self,
        command: FirstPurchaseBonusCommand,
        context: &OperationContext,
    ) -> Result<FirstPurchaseOutcome, LedgerError> {
        let link = match self.store.find_referral_by_referee(command.referee_id).await? {
            Some(link) if link.status == ReferralStatus::Active => link,
            _ => return Ok(FirstPurchaseOutcome::NotReferred),
        };

        if link.first_purchase_bonus_granted {
            return Ok(FirstPurchaseOutcome::AlreadyGranted);
        }

        for user_id in [link.referrer_id, link.referee_id] {
            if self.store.get_account(user_id).await?.is_none() {
                return Err(LedgerError::UserNotFound(user_id));
            }
        }

        let purchase = command.purchase_amount.value();
        let referrer_bonus = percent_of(purchase, self.policy.purchase_bonus_referrer_pct);
        let referee_bonus = percent_of(purchase, self.policy.purchase_bonus_referee_pct);

        // The flag flips exactly once; the loser of a race sees `false`
        if !self
            .store
            .mark_first_purchase_bonus(link.id, referrer_bonus, referee_bonus)
            .await?
        {
            return Ok(FirstPurchaseOutcome::AlreadyGranted);
        }

        let legs = [
            (Leg::Referrer, link.referrer_id, referrer_bonus),
            (Leg::Referee, link.referee_id, referee_bonus),
        ];
        let mut applied = Vec::new();

        for (leg, user_id, amount) in legs {
            let key = first_purchase_leg_key(link.id, leg);
            match self.post_leg(user_id, amount, link.id, key).await {
                Ok(Some(outcome)) => applied.push(outcome.transaction().id),
                Ok(None) => {}
                Err(e) => {
                    return Err(reconciliation_required(
                        "grant_first_purchase_bonus",
                        format!(
                            "bonus flag set on referral {} but {} leg failed: {}",
                            link.id,
                            leg.as_str(),
                            e
                        ),
                        applied,
                    ));
                }
            }
        }

        let record = AuditRecord::kaus(
            AuditEventType::ReferralBonus,
            link.referee_id,
            add8(referrer_bonus, referee_bonus),
        )
        .detail("bonusType", BonusKind::FirstPurchase.as_str())
        .detail("referralId", link.id)
        .detail("referrerId", link.referrer_id)
        .detail("refereeId", link.referee_id)
        .detail("purchaseAmount", purchase)
        .detail("referrerBonus", referrer_bonus)
        .detail("refereeBonus", referee_bonus)
        .detail("transactionIds", &applied)
        .with_context(context);

        if let Err(e) = self.audit.append(record).await {
            return Err(reconciliation_required(
                "grant_first_purchase_bonus",
                format!("first-purchase bonus for referral {} applied but audit failed: {}", link.id, e),
                applied,
            ));
        }

        tracing::info!(
            referral_id = %link.id,
            referrer_bonus = %referrer_bonus,
            referee_bonus = %referee_bonus,
            "First purchase bonus granted"
        );

        Ok(FirstPurchaseOutcome::Granted(FirstPurchaseBonusResult {
            referral_id: link.id,
            referrer_id: link.referrer_id,
            referee_id: link.referee_id,
            referrer_bonus,
            referee_bonus,
        }))
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Re-post both signup legs of `referee_id`'s referral under their
    /// original keys. Legs already present are reported, not re-applied.
    pub async fn reconcile_signup_bonus(
        &self,
        referee_id: Uuid,
        context: &OperationContext,
    ) -> Result<ReconciliationReport, LedgerError> {
        let link = self
            .store
            .find_referral_by_referee(referee_id)
            .await?
            .ok_or(LedgerError::ReferralNotFound(referee_id))?;

        let legs = [
            (Leg::Referrer, link.referrer_id, link.signup_bonus_referrer, signup_leg_key(referee_id, Leg::Referrer)),
            (Leg::Referee, link.referee_id, link.signup_bonus_referee, signup_leg_key(referee_id, Leg::Referee)),
        ];
        self.reconcile_legs(&link, BonusKind::Signup, legs, context).await
    }

    /// Same as `reconcile_signup_bonus` for a first-purchase bonus whose
    /// flag is already set
    pub async fn reconcile_first_purchase_bonus(
        &self,
        referee_id: Uuid,
        context: &OperationContext,
    ) -> Result<ReconciliationReport, LedgerError> {
        let link = self
            .store
            .find_referral_by_referee(referee_id)
            .await?
            .ok_or(LedgerError::ReferralNotFound(referee_id))?;

        let (Some(referrer_bonus), Some(referee_bonus)) =
            (link.purchase_bonus_referrer, link.purchase_bonus_referee)
        else {
            return Ok(ReconciliationReport {
                referral_id: link.id,
                legs: Vec::new(),
            });
        };

        let legs = [
            (Leg::Referrer, link.referrer_id, referrer_bonus, first_purchase_leg_key(link.id, Leg::Referrer)),
            (Leg::Referee, link.referee_id, referee_bonus, first_purchase_leg_key(link.id, Leg::Referee)),
        ];
        self.reconcile_legs(&link, BonusKind::FirstPurchase, legs, context).await
    }

    async fn reconcile_legs(
        &self,
        link: &ReferralLink,
        bonus: BonusKind,
        legs: [(Leg, Uuid, Decimal, String); 2],
        context: &OperationContext,
    ) -> Result<ReconciliationReport, LedgerError> {
        let mut report = ReconciliationReport {
            referral_id: link.id,
            legs: Vec::new(),
        };

        for (_, user_id, amount, key) in legs {
            let Some(outcome) = self.post_leg(user_id, amount, link.id, key.clone()).await? else {
                continue;
            };
            report.legs.push(LegReport {
                user_id,
                idempotency_key: key,
                transaction_id: outcome.transaction().id,
                status: if outcome.is_applied() {
                    LegStatus::Applied
                } else {
                    LegStatus::AlreadyApplied
                },
            });
        }

        let repaired: Vec<&LegReport> = report
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Applied)
            .collect();

        if !repaired.is_empty() {
            let total = repaired
                .iter()
                .fold(Decimal::ZERO, |acc, leg| acc + leg_amount(link, bonus, leg.user_id));
            let record = AuditRecord::kaus(AuditEventType::ReferralBonus, link.referee_id, round8(total))
                .detail("bonusType", bonus.as_str())
                .detail("referralId", link.id)
                .detail("reconciled", true)
                .detail(
                    "transactionIds",
                    repaired.iter().map(|l| l.transaction_id).collect::<Vec<_>>(),
                )
                .with_context(context);

            if let Err(e) = self.audit.append(record).await {
                return Err(reconciliation_required(
                    "reconcile_referral_bonus",
                    format!("legs re-posted for referral {} but audit failed: {}", link.id, e),
                    repaired.iter().map(|l| l.transaction_id).collect(),
                ));
            }
        }

        tracing::info!(
            referral_id = %link.id,
            bonus_type = bonus.as_str(),
            repaired = repaired.len(),
            "Referral bonus reconciled"
        );

        Ok(report)
    }

    /// Post one bonus leg; `None` when the amount is zero
    async fn post_leg(
        &self,
        user_id: Uuid,
        amount: Decimal,
        referral_id: Uuid,
        idempotency_key: String,
    ) -> Result<Option<PostOutcome>, LedgerError> {
        let amount = round8(amount);
        if amount <= Decimal::ZERO {
            return Ok(None);
        }

        let outcome = self
            .store
            .post_transaction(NewTransaction {
                user_id,
                kind: TransactionType::ReferralBonus,
                amount,
                reference_id: referral_id.to_string(),
                idempotency_key,
            })
            .await?;

        Ok(Some(outcome))
    }

    // =========================================================================
    // stats
    // =========================================================================

    pub async fn stats(&self, user_id: Uuid) -> Result<ReferralStats, LedgerError> {
        let code = self.store.find_referral_code_by_user(user_id).await?;
        let referrals = self.store.list_referrals_by_referrer(user_id).await?;

        let total = referrals.len();
        let active = referrals
            .iter()
            .filter(|r| r.status == ReferralStatus::Active)
            .count();
        let with_purchase = referrals
            .iter()
            .filter(|r| r.first_purchase_bonus_granted)
            .count();

        let earned_kaus = referrals.iter().fold(round8(Decimal::ZERO), |acc, r| {
            add8(
                acc,
                r.signup_bonus_referrer + r.purchase_bonus_referrer.unwrap_or_default(),
            )
        });

        let conversion_rate = if total > 0 {
            round8(Decimal::from(with_purchase as u64) * Decimal::ONE_HUNDRED / Decimal::from(total as u64))
        } else {
            round8(Decimal::ZERO)
        };

        Ok(ReferralStats {
            code: code.map(|c| c.code),
            total_referrals: total,
            active_referrals: active,
            referrals_with_purchase: with_purchase,
            conversion_rate,
            earned_kaus,
            earned_krw: fiat_from_kaus(earned_kaus, Currency::Krw),
        })
    }
}

/// Bonus amount of `user_id`'s leg on `link`
fn leg_amount(link: &ReferralLink, bonus: BonusKind, user_id: Uuid) -> Decimal {
    let is_referrer = user_id == link.referrer_id;
    match (bonus, is_referrer) {
        (BonusKind::Signup, true) => link.signup_bonus_referrer,
        (BonusKind::Signup, false) => link.signup_bonus_referee,
        (BonusKind::FirstPurchase, true) => link.purchase_bonus_referrer.unwrap_or_default(),
        (BonusKind::FirstPurchase, false) => link.purchase_bonus_referee.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_is_valid() {
        let user = Uuid::new_v4();
        let code = generate_code(user);
        assert!(is_valid_code(&code), "{}", code);
        assert!(code.starts_with("F9-"));
        assert_eq!(code, code.to_uppercase());
        let prefix: String = user.simple().to_string().to_uppercase().chars().take(4).collect();
        assert_eq!(&code[3..7], prefix);
    }

    #[test]
    fn test_is_valid_code() {
        assert!(is_valid_code("F9-AB12-LK3J9-X7Q2"));
        assert!(is_valid_code("f9-ab12-lk3j9-x7q2"));
        assert!(!is_valid_code("F9-AB1-LK3J9-X7Q2"));
        assert!(!is_valid_code("F9-AB12-LK3J9"));
        assert!(!is_valid_code("KAUSAB12CD"));
        assert!(!is_valid_code("F9-AB12--X7Q2"));
        assert!(!is_valid_code("F8-AB12-LK3J9-X7Q2"));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_leg_amount_by_bonus_kind() {
        let link = ReferralLink {
            id: Uuid::new_v4(),
            referrer_id: Uuid::new_v4(),
            referee_id: Uuid::new_v4(),
            referral_code: "F9-ABCD-1-XY".to_string(),
            signup_bonus_referrer: Decimal::from(100),
            signup_bonus_referee: Decimal::from(90),
            first_purchase_bonus_granted: true,
            purchase_bonus_referrer: Some(Decimal::from(10)),
            purchase_bonus_referee: Some(Decimal::from(5)),
            status: ReferralStatus::Active,
            created_at: Utc::now(),
        };

        assert_eq!(leg_amount(&link, BonusKind::Signup, link.referrer_id), Decimal::from(100));
        assert_eq!(leg_amount(&link, BonusKind::Signup, link.referee_id), Decimal::from(90));
        assert_eq!(
            leg_amount(&link, BonusKind::FirstPurchase, link.referrer_id),
            Decimal::from(10)
        );
        assert_eq!(
            leg_amount(&link, BonusKind::FirstPurchase, link.referee_id),
            Decimal::from(5)
        );
        assert_eq!(BonusKind::FirstPurchase.as_str(), "FIRST_PURCHASE");
    }

    #[test]
    fn test_leg_keys_are_deterministic() {
        let id = Uuid::nil();
        assert_eq!(
            signup_leg_key(id, Leg::Referee),
            "REF-SIGNUP-00000000-0000-0000-0000-000000000000-REFEREE"
        );
        assert_ne!(
            first_purchase_leg_key(id, Leg::Referrer),
            first_purchase_leg_key(id, Leg::Referee)
        );
        assert!(crate::idempotency::validate_key(&signup_leg_key(Uuid::new_v4(), Leg::Referrer)).is_ok());
    }
}
