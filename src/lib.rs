//! scriptguard - payment-page script authorization and integrity monitoring
//!
//! Implements the decision core behind PCI DSS v4.0 requirements 6.4.3 and
//! 11.6.1: an authorization lookup over operator-vetted script records, an
//! SRI comparison state machine with mismatch escalation, and an
//! alert-deduplication policy, fed by monitoring passes reported from
//! payment pages.

pub mod alerts;
pub mod auth;
pub mod config;
pub mod core;
pub mod db;
pub mod guard;
pub mod integrity;
pub mod monitor;
pub mod notify;
pub mod scan;
pub mod sri;
pub mod tasks;

/// Re-export commonly used types
pub use auth::AuthorizedScripts;
pub use config::Config;
pub use crate::core::{AuthorizedScript, ComplianceAlert, ScriptMonitoringLog};
pub use db::SharedDatabase;
pub use guard::GuardService;
pub use integrity::IntegrityValidator;
pub use monitor::SessionAggregator;
