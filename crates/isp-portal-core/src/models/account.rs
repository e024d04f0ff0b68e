use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;

/// Remaining quota for the subscriber's current package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UsageSummary {
    pub username: String,
    pub service: String,
    pub package_gb: f64,
    pub used_gb: f64,
    pub remaining_gb: f64,
    /// `YYYY-MM-DD` or RFC 3339, depending on the billing backend
    pub expiration: String,
}

impl UsageSummary {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.expiration) {
            return Some(dt.with_timezone(&Utc));
        }
        let day = self.expiration.get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Whole days left on the package, rounded up, never negative
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let left = self.expires_at()? - now;
        let secs = left.num_seconds();
        Some(if secs <= 0 { 0 } else { (secs + 86_399) / 86_400 })
    }

    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.remaining_gb <= 0.0 || self.expires_at().map(|at| at < now).unwrap_or(false)
    }

    /// Line speed parsed from service names like `Home 20M`
    pub fn speed_mbps(&self) -> Option<u32> {
        let idx = self.service.find('M')?;
        let digits: String = self.service[..idx]
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Invoice {
    pub id: i64,
    pub date: String,
    pub price: String,
    #[serde(default)]
    pub paid: String,
    #[serde(default)]
    pub paymode: i32,
    pub service: String,
    #[serde(default)]
    pub managername: Option<String>,
}

impl Invoice {
    /// Paymode 0 and 1 are both outstanding in the billing system
    pub fn is_unpaid(&self) -> bool {
        self.paymode == 0 || self.paymode == 1
    }

    pub fn amount(&self) -> f64 {
        self.price.trim().parse().unwrap_or(0.0)
    }
}

/// Everything the dashboard shows, assembled from three concurrent calls.
/// Any part may be missing if its call failed for a non-auth reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Dashboard {
    pub identity: Option<Identity>,
    pub usage: Option<UsageSummary>,
    pub days_remaining: Option<i64>,
    pub invoices: Vec<Invoice>,
    pub unpaid_invoices: Vec<Invoice>,
    /// Parts that could not be fetched, for display
    pub warnings: Vec<String>,
}

impl Dashboard {
    pub fn assemble(
        identity: Option<Identity>,
        usage: Option<UsageSummary>,
        invoices: Vec<Invoice>,
        warnings: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let days_remaining = usage.as_ref().and_then(|u| u.days_remaining(now));
        let unpaid_invoices = invoices.iter().filter(|i| i.is_unpaid()).cloned().collect();
        Self {
            identity,
            usage,
            days_remaining,
            invoices,
            unpaid_invoices,
            warnings,
        }
    }

    pub fn has_unpaid_invoice(&self) -> bool {
        !self.unpaid_invoices.is_empty()
    }
}
