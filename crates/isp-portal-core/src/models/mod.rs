//! Data models for the portal's account endpoints.
//!
//! - `UsageSummary`: remaining quota and package expiry
//! - `Invoice`: billing history entries
//! - `Dashboard`: the aggregate view built from identity, usage and invoices

pub mod account;

pub use account::{Dashboard, Invoice, UsageSummary};
