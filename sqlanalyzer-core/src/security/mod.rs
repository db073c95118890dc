//! Connection string parsing and security validation.
//!
//! # Security Guarantees
//! - Passwords are redacted from `Debug` output of parsed key maps
//! - Validation never echoes password values in issue messages
//! - Connect parameters built from a key map hold the password in `Zeroizing`
//!
//! # Module Structure
//! - `connection`: key/value and URL parsing into a normalized key map
//! - `validator`: rule-based validation producing a [`ValidationResult`]

mod connection;
mod validator;

pub use connection::{ConnectionKeys, KeyParseError, keys, normalize_key};
pub use validator::{
    AuthenticationType, ConnectionStringValidator, SecurityLevel, ValidationIssue,
    ValidationResult, codes, is_weak_password,
};
