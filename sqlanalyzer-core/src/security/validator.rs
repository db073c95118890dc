//! Connection string security validation.
//!
//! Validation is a pure function of the connection string. It never fails:
//! problems are reported as structured [`ValidationIssue`]s and the caller
//! decides whether to refuse the connection.

use super::connection::{ConnectionKeys, KeyParseError, keys};
use crate::factory::{DefaultEngineDetector, EngineDetector};
use crate::models::EngineKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Passwords rejected outright, compared case-insensitively.
const WEAK_PASSWORDS: &[&str] = &[
    "password",
    "123456",
    "password123",
    "admin",
    "letmein",
    "welcome",
    "monkey",
    "dragon",
    "baseball",
    "football",
    "qwerty",
    "abc123",
    "111111",
    "1234567",
    "12345678",
    "123456789",
    "1234567890",
    "sa",
    "root",
    "administrator",
    "guest",
    "user",
    "test",
];

const PRODUCTION_INDICATORS: &[&str] = &["prod", "production", "live", "prd"];

const SECRET_INDICATORS: &[&str] = &["secret", "key", "token", "api", "private"];

/// Connect timeouts above this many seconds are reported.
const HIGH_TIMEOUT_SECONDS: u64 = 60;

#[allow(clippy::expect_used)]
fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(ghp_|ghs_|gho_|github_pat_|xox[baprs]-|sk-|pk-|rk-|s3cr3t)")
            .expect("Invalid token pattern")
    })
}

/// Issue codes emitted by the validator.
pub mod codes {
    /// Input was empty or whitespace
    pub const EMPTY_CONNECTION_STRING: &str = "EMPTY_CONNECTION_STRING";
    /// Input could not be parsed at all
    pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
    /// Integrated security combined with a user id or password
    pub const MIXED_AUTHENTICATION: &str = "MIXED_AUTHENTICATION";
    /// Integrated security requested for an engine that does not support it
    pub const WINDOWS_AUTH_UNSUPPORTED: &str = "WINDOWS_AUTH_UNSUPPORTED";
    /// No user id for SQL authentication
    pub const MISSING_CREDENTIALS: &str = "MISSING_CREDENTIALS";
    /// Missing or empty password
    pub const EMPTY_PASSWORD: &str = "EMPTY_PASSWORD";
    /// Dictionary, short, numeric or sequential password
    pub const WEAK_PASSWORD: &str = "WEAK_PASSWORD";
    /// Password looks like it embeds a secret
    pub const POSSIBLE_SECRET: &str = "POSSIBLE_SECRET";
    /// Password looks like an API token
    pub const POSSIBLE_TOKEN: &str = "POSSIBLE_TOKEN";
    /// MARS switched on
    pub const MARS_ENABLED: &str = "MARS_ENABLED";
    /// Connect timeout above one minute
    pub const HIGH_TIMEOUT: &str = "HIGH_TIMEOUT";
    /// Certificate validation disabled
    pub const TRUST_SERVER_CERTIFICATE: &str = "TRUST_SERVER_CERTIFICATE";
    /// Production-looking server or database name
    pub const PRODUCTION_INDICATOR: &str = "PRODUCTION_INDICATOR";
}

/// Overall security posture of a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Errors, weak or empty password
    Low,
    /// SQL authentication with acceptable credentials
    Medium,
    /// Integrated security without conflicts
    High,
}

/// Authentication mechanism a connection string selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthenticationType {
    /// Integrated / SSPI / trusted connection
    Windows,
    /// User name and password
    SqlAuth,
    /// Not determined (input rejected before credential checks)
    Unknown,
}

/// Single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine-readable code, see [`codes`]
    pub code: String,
    /// Human-readable description
    pub message: String,
}

impl ValidationIssue {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating one connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// True when there are no errors
    pub is_valid: bool,
    /// Derived security level
    pub security_level: SecurityLevel,
    /// Authentication mechanism in use
    pub authentication_type: AuthenticationType,
    /// Engine the rules were evaluated against, when known
    pub engine: Option<EngineKind>,
    /// Blocking problems
    pub errors: Vec<ValidationIssue>,
    /// Non-blocking problems
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            security_level: SecurityLevel::Low,
            authentication_type: AuthenticationType::Unknown,
            engine: None,
            errors: vec![ValidationIssue::new(code, message)],
            warnings: Vec::new(),
        }
    }

    /// Returns true if a warning with the given code was raised.
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// Returns true if an error with the given code was raised.
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    /// Error messages, in order, for building a validation error.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    /// Remediation advice for every raised issue, errors first.
    pub fn recommendations(&self) -> Vec<String> {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .filter_map(|issue| recommendation_for(&issue.code))
            .map(str::to_string)
            .collect()
    }
}

fn recommendation_for(code: &str) -> Option<&'static str> {
    let text = match code {
        codes::EMPTY_CONNECTION_STRING => "Provide a connection string",
        codes::INVALID_FORMAT => "Use key=value;key=value pairs or a database URL",
        codes::MIXED_AUTHENTICATION => {
            "When using Integrated Security, User ID and Password should not be specified"
        }
        codes::WINDOWS_AUTH_UNSUPPORTED => {
            "Windows authentication is only supported for SQL Server"
        }
        codes::MISSING_CREDENTIALS => {
            "Specify a User ID or switch to Integrated Security"
        }
        codes::EMPTY_PASSWORD => "Empty passwords are a security risk",
        codes::WEAK_PASSWORD => "Use a long, randomly generated password",
        codes::POSSIBLE_SECRET => "Consider using secure credential storage",
        codes::POSSIBLE_TOKEN => "API tokens should not be used as database passwords",
        codes::MARS_ENABLED => {
            "MARS can have performance implications and should be used carefully"
        }
        codes::HIGH_TIMEOUT => "High timeouts may hide network issues; prefer 30 seconds or less",
        codes::TRUST_SERVER_CERTIFICATE => {
            "Install a trusted certificate instead of disabling certificate validation"
        }
        codes::PRODUCTION_INDICATOR => "Ensure production credentials are properly secured",
        _ => return None,
    };
    Some(text)
}

/// Stateless connection string validator.
///
/// # Example
/// ```rust
/// use sqlanalyzer_core::security::{ConnectionStringValidator, SecurityLevel};
///
/// let result = ConnectionStringValidator::validate(
///     "Server=db01;Database=Sales;Integrated Security=true",
/// );
/// assert!(result.is_valid);
/// assert_eq!(result.security_level, SecurityLevel::High);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStringValidator;

impl ConnectionStringValidator {
    /// Validates a connection string, detecting the engine from its content.
    pub fn validate(connection_string: &str) -> ValidationResult {
        Self::validate_for(connection_string, None)
    }

    /// Validates a connection string against an explicit engine.
    ///
    /// With `engine = None` the default detector is consulted; an
    /// undetectable engine simply disables the engine-specific rules.
    pub fn validate_for(connection_string: &str, engine: Option<EngineKind>) -> ValidationResult {
        let parsed = match ConnectionKeys::parse(connection_string) {
            Ok(parsed) => parsed,
            Err(KeyParseError::Empty) => {
                return ValidationResult::rejected(
                    codes::EMPTY_CONNECTION_STRING,
                    "Connection string is null or empty",
                );
            }
            Err(other) => {
                return ValidationResult::rejected(codes::INVALID_FORMAT, other.to_string());
            }
        };

        let engine = engine.or_else(|| DefaultEngineDetector.detect(connection_string).ok());

        let mut result = ValidationResult {
            is_valid: true,
            security_level: SecurityLevel::Medium,
            authentication_type: AuthenticationType::Unknown,
            engine,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        check_credentials(&parsed, &mut result);
        check_settings(&parsed, &mut result);
        check_sensitive_values(&parsed, &mut result);

        result.security_level = security_level(&result);
        result.is_valid = result.errors.is_empty();
        result
    }
}

fn check_credentials(parsed: &ConnectionKeys, result: &mut ValidationResult) {
    if parsed.is_enabled(keys::INTEGRATED_SECURITY) {
        result.authentication_type = AuthenticationType::Windows;

        if parsed.contains(keys::USER_ID) || parsed.contains(keys::PASSWORD) {
            result.warnings.push(ValidationIssue::new(
                codes::MIXED_AUTHENTICATION,
                "Both Windows and SQL authentication specified",
            ));
        }

        if let Some(engine) = result.engine
            && engine != EngineKind::SqlServer
        {
            result.warnings.push(ValidationIssue::new(
                codes::WINDOWS_AUTH_UNSUPPORTED,
                format!("Windows authentication not supported for {}", engine),
            ));
        }
        return;
    }

    result.authentication_type = AuthenticationType::SqlAuth;

    if parsed.get_non_empty(keys::USER_ID).is_none() {
        result.warnings.push(ValidationIssue::new(
            codes::MISSING_CREDENTIALS,
            "No user credentials specified",
        ));
    }

    match parsed.get_non_empty(keys::PASSWORD) {
        None => result.warnings.push(ValidationIssue::new(
            codes::EMPTY_PASSWORD,
            "Password is empty",
        )),
        Some(password) if is_weak_password(password) => result.warnings.push(
            ValidationIssue::new(codes::WEAK_PASSWORD, "Weak password detected"),
        ),
        Some(_) => {}
    }
}

fn check_settings(parsed: &ConnectionKeys, result: &mut ValidationResult) {
    if parsed.is_enabled(keys::MULTIPLE_ACTIVE_RESULT_SETS) {
        result.warnings.push(ValidationIssue::new(
            codes::MARS_ENABLED,
            "Multiple Active Result Sets is enabled",
        ));
    }

    if let Some(timeout) = parsed
        .get(keys::CONNECT_TIMEOUT)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|t| *t > HIGH_TIMEOUT_SECONDS)
    {
        result.warnings.push(ValidationIssue::new(
            codes::HIGH_TIMEOUT,
            format!("High connection timeout detected: {} seconds", timeout),
        ));
    }

    if parsed.is_enabled(keys::TRUST_SERVER_CERTIFICATE) {
        result.warnings.push(ValidationIssue::new(
            codes::TRUST_SERVER_CERTIFICATE,
            "Server certificate validation is disabled",
        ));
    }
}

fn check_sensitive_values(parsed: &ConnectionKeys, result: &mut ValidationResult) {
    let production = parsed
        .iter()
        .filter(|(key, _)| *key != keys::PASSWORD)
        .any(|(_, value)| {
            let lowered = value.to_lowercase();
            PRODUCTION_INDICATORS
                .iter()
                .any(|indicator| lowered.contains(indicator))
        });
    if production {
        result.warnings.push(ValidationIssue::new(
            codes::PRODUCTION_INDICATOR,
            "Connection string may contain production server reference",
        ));
    }

    let Some(password) = parsed.get_non_empty(keys::PASSWORD) else {
        return;
    };

    let lowered = password.to_lowercase();
    if SECRET_INDICATORS.iter().any(|s| lowered.contains(s)) {
        result.warnings.push(ValidationIssue::new(
            codes::POSSIBLE_SECRET,
            "Password may contain a secret or key",
        ));
    }

    if token_pattern().is_match(password) {
        result.warnings.push(ValidationIssue::new(
            codes::POSSIBLE_TOKEN,
            "Password appears to contain an API token",
        ));
    }
}

fn security_level(result: &ValidationResult) -> SecurityLevel {
    if result.authentication_type == AuthenticationType::Windows {
        let conflicted = result.has_warning(codes::MIXED_AUTHENTICATION)
            || result.has_warning(codes::WINDOWS_AUTH_UNSUPPORTED);
        return if conflicted {
            SecurityLevel::Medium
        } else {
            SecurityLevel::High
        };
    }

    if !result.errors.is_empty()
        || result.has_warning(codes::WEAK_PASSWORD)
        || result.has_warning(codes::EMPTY_PASSWORD)
    {
        return SecurityLevel::Low;
    }

    SecurityLevel::Medium
}

/// Returns true for dictionary, short, all-digit or sequential passwords.
pub fn is_weak_password(password: &str) -> bool {
    if password.is_empty() {
        return true;
    }

    let lowered = password.to_lowercase();
    if WEAK_PASSWORDS.contains(&lowered.as_str()) {
        return true;
    }

    if password.chars().count() < 8 {
        return true;
    }

    if password.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    has_sequential_run(password)
}

/// Three consecutive code points ascending or descending by one (`abc`, `321`).
fn has_sequential_run(password: &str) -> bool {
    let points: Vec<i64> = password.chars().map(|c| i64::from(u32::from(c))).collect();
    points.windows(3).any(|w| {
        (w[0] + 1 == w[1] && w[1] + 1 == w[2]) || (w[0] - 1 == w[1] && w[1] - 1 == w[2])
    })
}

#[cfg(test)]
mod tests;
