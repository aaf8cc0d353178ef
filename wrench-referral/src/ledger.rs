use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use wrench_core::models::{normalize_email, CustomerAccount, Referral};
use wrench_core::repository::{CustomerRepository, ReferralRepository};
use wrench_core::settings::ReferralSettings;
use wrench_core::{CoreError, StoreError};
use wrench_shared::pii::masked;
use wrench_shared::Pence;

use crate::code::CodeGenerator;

#[derive(Debug, thiserror::Error)]
pub enum ReferralError {
    #[error("Unknown referral code: {0}")]
    InvalidCode(String),

    #[error("Already referred: {0}")]
    Duplicate(String),

    #[error("Customer not found: {0}")]
    NotFound(String),

    #[error("Could not allocate a unique referral code after {0} attempts")]
    CodeSpaceExhausted(u32),

    #[error("Ledger invariant violation: {0}")]
    LedgerInvariant(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ReferralError> for CoreError {
    fn from(err: ReferralError) -> Self {
        match err {
            ReferralError::InvalidCode(msg) => CoreError::ValidationError(msg),
            ReferralError::Duplicate(msg) => CoreError::Duplicate(msg),
            ReferralError::NotFound(msg) => CoreError::NotFound(msg),
            ReferralError::CodeSpaceExhausted(n) => {
                CoreError::Conflict(format!("referral code allocation failed after {} attempts", n))
            }
            ReferralError::LedgerInvariant(msg) => CoreError::LedgerInvariantViolation(msg),
            ReferralError::Store(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub account: CustomerAccount,
    pub referral_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusOutcome {
    pub applied: bool,
    pub referrer_email: Option<String>,
    pub amount: Pence,
}

impl BonusOutcome {
    fn none() -> Self {
        Self { applied: false, referrer_email: None, amount: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeValidation {
    pub valid: bool,
    pub referrer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralSummary {
    pub referral_code: String,
    pub referral_balance: Pence,
    pub total_earnings: Pence,
    pub services_booked: i64,
    pub referrals: Vec<Referral>,
}

/// Referral codes, referral relationships and per-customer earnings.
///
/// Every balance mutation is a single conditional statement in the store.
/// The bonus payout is gated on the referral's own `bonus_paid` flag, so
/// it is safe to call from any number of concurrent reconciliations.
pub struct ReferralLedger {
    customers: Arc<dyn CustomerRepository>,
    referrals: Arc<dyn ReferralRepository>,
    codes: CodeGenerator,
    settings: ReferralSettings,
}

impl ReferralLedger {
    pub fn new(
        customers: Arc<dyn CustomerRepository>,
        referrals: Arc<dyn ReferralRepository>,
        settings: ReferralSettings,
    ) -> Self {
        let codes = CodeGenerator::new(settings.code_prefix.clone(), settings.code_length);
        Self { customers, referrals, codes, settings }
    }

    pub fn bonus_amount(&self) -> Pence {
        self.settings.bonus_amount
    }

    /// A code not currently held by any customer
    pub async fn generate_code(&self) -> Result<String, ReferralError> {
        for _ in 0..self.settings.max_code_attempts {
            let candidate = self.codes.candidate();
            if self.customers.find_by_code(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            warn!("Referral code collision on {}, retrying", candidate);
        }
        Err(ReferralError::CodeSpaceExhausted(self.settings.max_code_attempts))
    }

    /// Create an account with its own code. A supplied referral code is a
    /// bonus path only: if it cannot be honoured the signup still succeeds.
    pub async fn register_customer(&self, registration: Registration) -> Result<RegistrationOutcome, ReferralError> {
        let email = normalize_email(&registration.email);
        if self.customers.get(&email).await?.is_some() {
            return Err(ReferralError::Duplicate(format!("account exists for {}", masked(&email))));
        }

        let mut account = None;
        for _ in 0..self.settings.max_code_attempts {
            let code = self.generate_code().await?;
            let candidate = CustomerAccount::new(email.clone(), registration.name.clone(), registration.phone.clone(), code);
            match self.customers.create(&candidate).await {
                Ok(()) => {
                    account = Some(candidate);
                    break;
                }
                // Lost the race for this code between the check and the insert
                Err(StoreError::UniqueViolation(constraint)) if constraint.contains("referral_code") => continue,
                Err(StoreError::UniqueViolation(_)) => {
                    return Err(ReferralError::Duplicate(format!("account exists for {}", masked(&email))));
                }
                Err(e) => return Err(e.into()),
            }
        }
        let mut account = account.ok_or(ReferralError::CodeSpaceExhausted(self.settings.max_code_attempts))?;
        info!("Registered customer {} with code {}", masked(&email), account.referral_code);

        let mut referral_applied = false;
        if let Some(code) = registration.referral_code.as_deref().filter(|c| !c.trim().is_empty()) {
            match self.create_referral(code, &email, &registration.name).await {
                Ok(referral) => {
                    account.referred_by = Some(referral.code);
                    referral_applied = true;
                }
                Err(e) => warn!("Ignoring referral code at signup for {}: {}", masked(&email), e),
            }
        }

        Ok(RegistrationOutcome { account, referral_applied })
    }

    /// Record that `referred_email` signed up with `code`. Fails if the
    /// referred identity already has any referral record.
    pub async fn create_referral(
        &self,
        code: &str,
        referred_email: &str,
        referred_name: &str,
    ) -> Result<Referral, ReferralError> {
        let code = CodeGenerator::normalize(code);
        let referred_email = normalize_email(referred_email);

        let referrer = self
            .customers
            .find_by_code(&code)
            .await?
            .ok_or_else(|| ReferralError::InvalidCode(code.clone()))?;

        if referrer.email == referred_email {
            return Err(ReferralError::InvalidCode(format!("{} is the customer's own code", code)));
        }

        if self.referrals.find_by_referred(&referred_email).await?.is_some() {
            return Err(ReferralError::Duplicate(masked(&referred_email).to_string()));
        }

        let referral = Referral::new(
            referrer.email.clone(),
            code.clone(),
            referred_email.clone(),
            referred_name.to_string(),
            self.settings.bonus_amount,
        );

        match self.referrals.insert(&referral).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) => {
                return Err(ReferralError::Duplicate(masked(&referred_email).to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        self.customers.set_referred_by(&referred_email, &code).await?;
        info!("Referral recorded: {} referred {}", masked(&referrer.email), masked(&referred_email));
        Ok(referral)
    }

    /// Pay the referrer of `referred_email`, at most once per referral.
    /// No eligible referral is not an error.
    pub async fn award_bonus(&self, referred_email: &str) -> Result<BonusOutcome, ReferralError> {
        let referred_email = normalize_email(referred_email);
        let referral = match self.referrals.find_by_referred(&referred_email).await? {
            Some(r) if r.is_payable() => r,
            _ => return Ok(BonusOutcome::none()),
        };

        match self.referrals.pay_bonus(&referral, Utc::now()).await {
            Ok(true) => {}
            // Another reconciliation got there first
            Ok(false) => return Ok(BonusOutcome::none()),
            Err(e) => {
                error!(
                    "Referral bonus for {} not paid, referral left payable: {}",
                    masked(&referral.referrer_email),
                    e
                );
                return Err(e.into());
            }
        }

        info!(
            "Referral bonus {} paid to {} for {}",
            wrench_shared::money::format_pounds(referral.bonus_amount),
            masked(&referral.referrer_email),
            masked(&referred_email)
        );

        Ok(BonusOutcome {
            applied: true,
            referrer_email: Some(referral.referrer_email),
            amount: referral.bonus_amount,
        })
    }

    pub async fn validate_code(&self, code: &str) -> Result<CodeValidation, ReferralError> {
        let code = CodeGenerator::normalize(code);
        if code.is_empty() {
            return Ok(CodeValidation { valid: false, referrer_name: None });
        }
        Ok(match self.customers.find_by_code(&code).await? {
            Some(referrer) => CodeValidation { valid: true, referrer_name: Some(referrer.name) },
            None => CodeValidation { valid: false, referrer_name: None },
        })
    }

    /// Spendable earnings; guests without an account have none
    pub async fn available_earnings(&self, email: &str) -> Result<Pence, ReferralError> {
        Ok(self
            .customers
            .get(&normalize_email(email))
            .await?
            .map(|c| c.total_earnings.max(0))
            .unwrap_or(0))
    }

    /// Spend `amount` of the customer's earnings. Refuses, rather than
    /// clamps, a debit that would take earnings below zero.
    pub async fn settle_discount(&self, email: &str, amount: Pence) -> Result<(), ReferralError> {
        if amount <= 0 {
            return Ok(());
        }
        let email = normalize_email(email);
        if !self.customers.debit_earnings(&email, amount).await? {
            error!(
                "Refused to debit {} from {}: earnings would go negative",
                wrench_shared::money::format_pounds(amount),
                masked(&email)
            );
            return Err(ReferralError::LedgerInvariant(format!(
                "debit of {} exceeds available earnings",
                amount
            )));
        }
        Ok(())
    }

    /// Count a completed booking; returns the count before this one, or
    /// `None` for guests.
    pub async fn record_booking(&self, email: &str) -> Result<Option<i64>, ReferralError> {
        Ok(self.customers.increment_services_booked(&normalize_email(email)).await?)
    }

    pub async fn summary(&self, email: &str) -> Result<ReferralSummary, ReferralError> {
        let email = normalize_email(email);
        let account = self
            .customers
            .get(&email)
            .await?
            .ok_or_else(|| ReferralError::NotFound(masked(&email).to_string()))?;
        let referrals = self.referrals.list_by_referrer(&email).await?;

        Ok(ReferralSummary {
            referral_code: account.referral_code,
            referral_balance: account.referral_balance,
            total_earnings: account.total_earnings,
            services_booked: account.services_booked,
            referrals,
        })
    }
}
