//! Every trigger shape is reduced to one canonical `ReconciliationIntent`
//! before any business logic runs.

use chrono::{DateTime, NaiveDate, NaiveTime};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use wrench_core::models::{
    normalize_email, normalize_registration, CustomerSnapshot, ServiceLine, TriggerSource, VehicleSnapshot,
};
use wrench_core::payment::CheckoutSession;
use wrench_core::{CoreError, CoreResult};
use wrench_shared::money::{parse_pounds, pounds_to_pence};
use wrench_shared::Pence;

/// Ceiling for any single amount on a checkout (£1,000,000). Keeps every
/// total well inside `Pence`.
pub const MAX_AMOUNT: Pence = 100_000_000;

/// A payment confirmation in canonical form
#[derive(Debug, Clone)]
pub struct ReconciliationIntent {
    pub source: TriggerSource,
    pub payment_session_id: Option<String>,
    pub customer: CustomerSnapshot,
    pub vehicle: VehicleSnapshot,
    pub services: Vec<ServiceLine>,
    pub vat: Pence,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    /// What the gateway reports it actually captured
    pub amount_captured: Option<Pence>,
}

impl ReconciliationIntent {
    pub fn subtotal(&self) -> Pence {
        self.checked_subtotal().unwrap_or(Pence::MAX)
    }

    /// Price before any referral earnings are spent
    pub fn nominal_total(&self) -> Pence {
        self.checked_nominal_total().unwrap_or(Pence::MAX)
    }

    fn checked_subtotal(&self) -> Option<Pence> {
        self.services.iter().try_fold(0 as Pence, |acc, s| acc.checked_add(s.price))
    }

    fn checked_nominal_total(&self) -> Option<Pence> {
        self.checked_subtotal()?.checked_add(self.vat)
    }

    pub fn primary_label(&self) -> Option<&str> {
        self.services.first().map(|s| s.label.as_str())
    }

    /// Build from a gateway checkout session and its metadata bag
    pub fn from_session(
        session: &CheckoutSession,
        source: TriggerSource,
        today: NaiveDate,
        default_time: NaiveTime,
    ) -> CoreResult<Self> {
        let meta = &session.metadata;
        let details = session.customer_details.as_ref();

        let email = meta_value(meta, "customerEmail")
            .or(session.customer_email.as_deref())
            .or_else(|| details.and_then(|d| d.email.as_deref()))
            .unwrap_or_default();
        let name = meta_value(meta, "customerName")
            .or_else(|| details.and_then(|d| d.name.as_deref()))
            .unwrap_or_default();
        let phone = meta_value(meta, "customerPhone")
            .or_else(|| details.and_then(|d| d.phone.as_deref()))
            .map(String::from);

        let year = match meta_value(meta, "vehicleYear") {
            Some(raw) => Some(
                raw.parse::<i32>()
                    .map_err(|_| CoreError::ValidationError(format!("invalid vehicle year: {}", raw)))?,
            ),
            None => None,
        };

        let services = match meta_value(meta, "services") {
            Some(raw) => {
                let inputs: Vec<ServiceInput> = serde_json::from_str(raw)
                    .map_err(|e| CoreError::ValidationError(format!("malformed services metadata: {}", e)))?;
                inputs
            }
            None => vec![single_line_from_metadata(meta)?],
        };

        let vat = match meta_value(meta, "vat") {
            Some(raw) => parse_pounds(raw).ok_or_else(|| CoreError::ValidationError(format!("invalid vat: {}", raw)))?,
            None => 0,
        };

        let intent = Self {
            source,
            payment_session_id: Some(session.id.clone()),
            customer: CustomerSnapshot {
                name: name.trim().to_string(),
                email: normalize_email(email),
                phone,
            },
            vehicle: VehicleSnapshot {
                make: meta_value(meta, "vehicleMake").unwrap_or_default().to_string(),
                model: meta_value(meta, "vehicleModel").unwrap_or_default().to_string(),
                year,
                registration: normalize_registration(meta_value(meta, "vehicleRegistration").unwrap_or_default()),
            },
            services: service_lines(services)?,
            vat,
            scheduled_date: parse_date(meta_value(meta, "date"), today)?,
            scheduled_time: parse_time(meta_value(meta, "time"), default_time)?,
            amount_captured: session.amount_total,
        };
        intent.validate()?;
        Ok(intent)
    }

    pub fn from_direct(request: DirectBookingRequest, today: NaiveDate, default_time: NaiveTime) -> CoreResult<Self> {
        let vat = match request.vat {
            Some(v) if v.is_finite() => pounds_to_pence(v),
            Some(_) => return Err(CoreError::ValidationError("invalid vat".to_string())),
            None => 0,
        };

        let intent = Self {
            source: TriggerSource::DirectCreate,
            payment_session_id: request.payment_session_id.filter(|s| !s.trim().is_empty()),
            customer: CustomerSnapshot {
                name: request.customer.name.trim().to_string(),
                email: normalize_email(&request.customer.email),
                phone: request.customer.phone,
            },
            vehicle: VehicleSnapshot {
                make: request.vehicle.make,
                model: request.vehicle.model,
                year: request.vehicle.year,
                registration: normalize_registration(&request.vehicle.registration),
            },
            services: service_lines(request.services)?,
            vat,
            scheduled_date: parse_date(request.date.as_deref(), today)?,
            scheduled_time: parse_time(request.time.as_deref(), default_time)?,
            amount_captured: request.amount_paid.filter(|v| v.is_finite()).map(pounds_to_pence),
        };
        intent.validate()?;
        Ok(intent)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.customer.email.is_empty() || !self.customer.email.contains('@') {
            return Err(CoreError::ValidationError("customer email is missing or malformed".to_string()));
        }
        if self.services.is_empty() {
            return Err(CoreError::ValidationError("at least one service line is required".to_string()));
        }
        for line in &self.services {
            if line.label.trim().is_empty() {
                return Err(CoreError::ValidationError("service line without a label".to_string()));
            }
            if line.price < 0 || line.labour_cost < 0 || line.parts_cost < 0 {
                return Err(CoreError::ValidationError(format!("negative price on '{}'", line.label)));
            }
            if line.price > MAX_AMOUNT || line.labour_cost > MAX_AMOUNT || line.parts_cost > MAX_AMOUNT {
                return Err(CoreError::ValidationError(format!("price out of range on '{}'", line.label)));
            }
        }
        if self.vat < 0 {
            return Err(CoreError::ValidationError("negative vat".to_string()));
        }
        if self.vat > MAX_AMOUNT {
            return Err(CoreError::ValidationError("vat out of range".to_string()));
        }
        if matches!(self.amount_captured, Some(c) if c < 0) {
            return Err(CoreError::ValidationError("negative captured amount".to_string()));
        }
        if self.checked_nominal_total().is_none() {
            return Err(CoreError::ValidationError("checkout total out of range".to_string()));
        }
        Ok(())
    }
}

/// Client JSON body for the direct-create entry point
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectBookingRequest {
    pub customer: CustomerInput,
    #[serde(default)]
    pub vehicle: VehicleInput,
    #[serde(default)]
    pub services: Vec<ServiceInput>,
    #[serde(default)]
    pub vat: Option<f64>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub payment_session_id: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInput {
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub registration: String,
}

/// One service line as clients and the `services` metadata key send it.
/// Amounts are in pounds.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "name")]
    pub label: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub labour_hours: f64,
    #[serde(default)]
    pub labour_cost: f64,
    #[serde(default)]
    pub parts_cost: f64,
}

fn meta_value<'a>(meta: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    meta.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn single_line_from_metadata(meta: &HashMap<String, String>) -> CoreResult<ServiceInput> {
    let amount = |key: &str| -> CoreResult<f64> {
        match meta_value(meta, key) {
            Some(raw) => parse_pounds(raw)
                .map(|p| p as f64 / 100.0)
                .ok_or_else(|| CoreError::ValidationError(format!("invalid {}: {}", key, raw))),
            None => Ok(0.0),
        }
    };
    let labour_hours = match meta_value(meta, "labourHours") {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| CoreError::ValidationError(format!("invalid labourHours: {}", raw)))?,
        None => 0.0,
    };

    if meta_value(meta, "servicePrice").is_none() {
        return Err(CoreError::ValidationError("service price missing from session metadata".to_string()));
    }

    Ok(ServiceInput {
        id: None,
        label: meta_value(meta, "serviceLabel").unwrap_or_default().to_string(),
        price: amount("servicePrice")?,
        labour_hours,
        labour_cost: amount("labourCost")?,
        parts_cost: amount("partsCost")?,
    })
}

/// Convert to priced lines with ids unique within the checkout. The first
/// use of a client id keeps it; missing and repeated ids get a positional
/// id that no other line uses.
fn service_lines(inputs: Vec<ServiceInput>) -> CoreResult<Vec<ServiceLine>> {
    let requested: Vec<Option<String>> = inputs
        .iter()
        .map(|input| {
            input
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
        })
        .collect();

    let mut seen = HashSet::new();
    let keeps: Vec<bool> = requested
        .iter()
        .map(|id| matches!(id, Some(id) if seen.insert(id.clone())))
        .collect();

    inputs
        .into_iter()
        .zip(requested.into_iter().zip(keeps))
        .enumerate()
        .map(|(index, (input, (requested, keep)))| {
            if !input.price.is_finite() || !input.labour_cost.is_finite() || !input.parts_cost.is_finite() {
                return Err(CoreError::ValidationError(format!("non-numeric price on '{}'", input.label)));
            }
            let line_id = match requested {
                Some(id) if keep => id,
                _ => free_line_id(index, &mut seen),
            };
            Ok(ServiceLine {
                line_id,
                label: input.label.trim().to_string(),
                price: pounds_to_pence(input.price),
                labour_hours: input.labour_hours,
                labour_cost: pounds_to_pence(input.labour_cost),
                parts_cost: pounds_to_pence(input.parts_cost),
            })
        })
        .collect()
}

fn free_line_id(index: usize, seen: &mut HashSet<String>) -> String {
    let mut candidate = format!("line{}", index);
    let mut suffix = 1;
    while !seen.insert(candidate.clone()) {
        candidate = format!("line{}-{}", index, suffix);
        suffix += 1;
    }
    candidate
}

/// `YYYY-MM-DD`, `DD/MM/YYYY` or RFC 3339; absent means today
pub fn parse_date(raw: Option<&str>, today: NaiveDate) -> CoreResult<NaiveDate> {
    let raw = match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => r,
        None => return Ok(today),
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()))
        .map_err(|_| CoreError::ValidationError(format!("unrecognised date: {}", raw)))
}

/// `HH:MM`, `HH:MM:SS` or `h:MM am/pm`; absent means the default slot
pub fn parse_time(raw: Option<&str>, default_time: NaiveTime) -> CoreResult<NaiveTime> {
    let raw = match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => r,
        None => return Ok(default_time),
    };
    let compact = raw.replace(' ', "").to_uppercase();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .or_else(|_| NaiveTime::parse_from_str(&compact, "%I:%M%p"))
        .map_err(|_| CoreError::ValidationError(format!("unrecognised time: {}", raw)))
}
