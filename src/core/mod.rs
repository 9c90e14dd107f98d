pub mod pipeline;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type. Inbound operations never surface this to callers;
/// they map it into a degraded structured response instead.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("page fetch failed: {0}")]
    Fetch(String),
    #[error("validation failed: {0}")]
    Validation(FieldErrors),
}

/// Field-level validation errors, produced at the input boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldErrors(pub Vec<(&'static str, String)>);

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|(field, msg)| format!("{field}: {msg}"))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{joined}")
    }
}

/// Operator-assigned risk classification for an authorized script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl RiskLevel {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(RiskLevel::Low),
            2 => Some(RiskLevel::Medium),
            3 => Some(RiskLevel::High),
            _ => None,
        }
    }

    pub fn id(&self) -> i64 {
        *self as i64
    }
}

/// Where an authorized script comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptSource {
    Internal,
    ThirdParty,
    PaymentGateway,
    Analytics,
    Marketing,
}

impl ScriptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptSource::Internal => "internal",
            ScriptSource::ThirdParty => "third-party",
            ScriptSource::PaymentGateway => "payment-gateway",
            ScriptSource::Analytics => "analytics",
            ScriptSource::Marketing => "marketing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(ScriptSource::Internal),
            "third-party" => Some(ScriptSource::ThirdParty),
            "payment-gateway" => Some(ScriptSource::PaymentGateway),
            "analytics" => Some(ScriptSource::Analytics),
            "marketing" => Some(ScriptSource::Marketing),
            _ => None,
        }
    }
}

/// Alert categories. Persisted as text; values written by older or newer
/// builds map to `Unknown` rather than being silently re-branched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    UnauthorizedScript,
    CspViolation,
    IntegrityFailure,
    SecurityAlert,
    Unknown,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::UnauthorizedScript => "unauthorized-script",
            AlertType::CspViolation => "csp-violation",
            AlertType::IntegrityFailure => "integrity-failure",
            AlertType::SecurityAlert => "security-alert",
            AlertType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unauthorized-script" => AlertType::UnauthorizedScript,
            "csp-violation" => AlertType::CspViolation,
            "integrity-failure" => AlertType::IntegrityFailure,
            "security-alert" => AlertType::SecurityAlert,
            _ => AlertType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "info" => AlertLevel::Info,
            "warning" => AlertLevel::Warning,
            _ => AlertLevel::Critical,
        }
    }
}

/// What kind of monitoring pass produced a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckType {
    Scheduled,
    Manual,
    RealTime,
    /// AJAX-triggered re-scan, tagged with the triggering source.
    Ajax(String),
    /// Payment-method-selection re-scan, tagged with the method name.
    Payment(String),
    Other(String),
}

impl CheckType {
    pub fn tag(&self) -> String {
        match self {
            CheckType::Scheduled => "scheduled".to_string(),
            CheckType::Manual => "manual".to_string(),
            CheckType::RealTime => "real-time".to_string(),
            CheckType::Ajax(source) => format!("ajax-{source}"),
            CheckType::Payment(method) => format!("payment-{method}"),
            CheckType::Other(tag) => tag.clone(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => CheckType::Scheduled,
            "manual" => CheckType::Manual,
            "real-time" => CheckType::RealTime,
            _ => {
                if let Some(source) = s.strip_prefix("ajax-") {
                    CheckType::Ajax(source.to_string())
                } else if let Some(method) = s.strip_prefix("payment-") {
                    CheckType::Payment(method.to_string())
                } else {
                    CheckType::Other(s.to_string())
                }
            }
        }
    }
}

/// A script URL a store operator has vetted for execution on payment pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedScript {
    pub id: i64,
    pub script_url: String,
    /// Stored SRI digest in `"<algo>-<base64>"` form, once established.
    pub script_hash: Option<String>,
    pub hash_algorithm: String,
    pub purpose: String,
    /// Business justification, required for compliance records.
    pub justification: String,
    pub risk_level: RiskLevel,
    pub is_active: bool,
    pub source: ScriptSource,
    /// Host component derived from the script URL.
    pub domain: String,
    pub authorized_by: String,
    pub authorized_on: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
    pub store_id: i64,
}

impl AuthorizedScript {
    /// Boundary validation for operator submissions. Malformed input is
    /// rejected here and never reaches the decision logic.
    pub fn validate(&self) -> Result<(), GuardError> {
        let mut errors = Vec::new();

        if self.script_url.trim().is_empty() {
            errors.push(("script_url", "must not be empty".to_string()));
        } else if self.script_url.starts_with("http")
            && reqwest::Url::parse(&self.script_url).is_err()
        {
            errors.push(("script_url", "not a parseable URL".to_string()));
        }

        if self.justification.trim().is_empty() {
            errors.push(("justification", "required for compliance".to_string()));
        }

        if self.last_verified < self.authorized_on {
            errors.push((
                "last_verified",
                "must not precede the authorization timestamp".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GuardError::Validation(FieldErrors(errors)))
        }
    }
}

/// A persisted record of a detected anomaly requiring operator attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceAlert {
    pub id: i64,
    pub store_id: i64,
    pub alert_type: AlertType,
    pub alert_level: AlertLevel,
    pub message: String,
    /// Serialized [`AlertDetails`]; JSON only at the storage boundary.
    pub details: String,
    pub script_url: Option<String>,
    pub page_url: Option<String>,
    pub is_resolved: bool,
    pub created_on: DateTime<Utc>,
    pub resolved_on: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notified: bool,
    pub notified_on: Option<DateTime<Utc>>,
}

/// Immutable record of one monitoring pass over a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptMonitoringLog {
    pub id: i64,
    pub store_id: i64,
    pub page_url: String,
    pub detected_scripts: Vec<String>,
    pub http_headers: BTreeMap<String, String>,
    pub unauthorized_scripts: Vec<String>,
    pub has_unauthorized: bool,
    pub checked_on: DateTime<Utc>,
    pub check_type: CheckType,
    pub user_agent: Option<String>,
    pub total_scripts: usize,
    pub authorized_count: usize,
    pub unauthorized_count: usize,
    pub alert_sent: bool,
}

/// Typed per-alert-type payloads. Heterogeneous in storage (a JSON blob on
/// the alert row) but a closed union inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AlertDetails {
    UnauthorizedScript {
        session_id: Option<String>,
        check_type: String,
        detection: String,
    },
    MissingSri {
        script_id: i64,
        expected_digest: Option<String>,
    },
    DigestMissing {
        script_id: i64,
        browser_digest: String,
    },
    DigestAutoUpdated {
        script_id: i64,
        old_digest: Option<String>,
        new_digest: String,
    },
    ContentChanged {
        script_id: i64,
        stored_digest: String,
        browser_digest: String,
        /// `None` when the independent re-fetch failed and the verdict is
        /// inconclusive.
        content_digest: Option<String>,
    },
    SuspiciousMismatch {
        script_id: i64,
        stored_digest: String,
        browser_digest: String,
    },
    CspViolation {
        blocked_uri: Option<String>,
        violated_directive: Option<String>,
        effective_directive: Option<String>,
        source_file: Option<String>,
        line_number: Option<i64>,
        user_agent: Option<String>,
    },
    BlockedScript {
        block_reason: String,
        user_agent: Option<String>,
    },
}

impl AlertDetails {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of one SRI comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriOutcome {
    pub is_valid: bool,
    pub current_digest: Option<String>,
    pub expected_digest: Option<String>,
    pub error: Option<String>,
}

impl SriOutcome {
    pub fn valid(current: &str, expected: &str) -> Self {
        Self {
            is_valid: true,
            current_digest: Some(current.to_string()),
            expected_digest: Some(expected.to_string()),
            error: None,
        }
    }

    pub fn invalid(error: &str) -> Self {
        Self {
            is_valid: false,
            current_digest: None,
            expected_digest: None,
            error: Some(error.to_string()),
        }
    }
}

/// Full validation verdict for one observed script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptValidationResult {
    pub script_url: String,
    pub is_authorized: bool,
    pub has_valid_sri: bool,
    pub sri: SriOutcome,
}

impl ScriptValidationResult {
    pub fn unauthorized(script_url: &str) -> Self {
        Self {
            script_url: script_url.to_string(),
            is_authorized: false,
            has_valid_sri: false,
            sri: SriOutcome::invalid("script is not in authorized list"),
        }
    }
}
