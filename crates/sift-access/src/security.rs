//! Security checks applied before a data source is touched
//!
//! Provides:
//! - Identifier validation for data source ids and filter fields
//! - Endpoint URL scheme allow-listing
//! - Query text limits (length, control characters)
//! - The [`SecurityValidator`] hook the connector runs per source type
//!
//! Injection detection for concrete query languages belongs to the adapters.

use crate::connection::{DataSourceConfig, SearchQuery};
use crate::error::{Error, Result};

/// Longest accepted identifier
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate a data source id or filter field name.
///
/// Rules:
/// - Must not be empty or longer than [`MAX_IDENTIFIER_LEN`]
/// - Must start with an ASCII letter, digit or underscore
/// - May only contain ASCII alphanumerics, `_`, `-` and `.`
///
/// # Examples
///
/// ```
/// use sift_access::security::validate_identifier;
///
/// assert!(validate_identifier("products").is_ok());
/// assert!(validate_identifier("catalog.v2-eu").is_ok());
///
/// assert!(validate_identifier("").is_err());
/// assert!(validate_identifier("x; DROP TABLE users--").is_err());
/// ```
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::validation(format!(
            "identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => {
            return Err(Error::security(format!(
                "invalid identifier '{}': must start with a letter, digit or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '-' | '.')) {
        return Err(Error::security(format!(
            "invalid identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Validate an endpoint URL against a scheme allow-list.
///
/// # Examples
///
/// ```
/// use sift_access::security::validate_endpoint;
///
/// assert!(validate_endpoint("https://search.example.com", &["https"]).is_ok());
/// assert!(validate_endpoint("file:///etc/passwd", &["https"]).is_err());
/// ```
pub fn validate_endpoint<S: AsRef<str>>(endpoint: &str, allowed_schemes: &[S]) -> Result<()> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| Error::validation(format!("invalid endpoint: {}", e)))?;

    if allowed_schemes
        .iter()
        .any(|s| s.as_ref().eq_ignore_ascii_case(url.scheme()))
    {
        Ok(())
    } else {
        Err(Error::security(format!(
            "endpoint scheme '{}' is not allowed",
            url.scheme()
        )))
    }
}

/// Validate free-text query input.
///
/// Tabs and line breaks are fine; every other control character is rejected.
pub fn validate_query_text(text: &str, max_len: usize) -> Result<()> {
    if text.len() > max_len {
        return Err(Error::validation(format!(
            "query too long: {} bytes (max {})",
            text.len(),
            max_len
        )));
    }

    if let Some(c) = text
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(Error::security(format!(
            "query contains control character U+{:04X}",
            c as u32
        )));
    }

    Ok(())
}

/// Per-source-type security hook run by the connector
pub trait SecurityValidator: Send + Sync {
    /// Check a data source configuration before connecting
    fn validate_config(&self, config: &DataSourceConfig) -> Result<()>;

    /// Check a query before it reaches the adapter
    fn validate_query(&self, _config: &DataSourceConfig, _query: &SearchQuery) -> Result<()> {
        Ok(())
    }
}

/// Validator used when a source type registers none
#[derive(Debug, Clone)]
pub struct DefaultSecurityValidator {
    allowed_schemes: Vec<String>,
    max_query_length: usize,
}

impl Default for DefaultSecurityValidator {
    fn default() -> Self {
        Self {
            allowed_schemes: [
                "http",
                "https",
                "ws",
                "wss",
                "postgres",
                "postgresql",
                "mysql",
                "sqlite",
                "memory",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_query_length: 4_096,
        }
    }
}

impl DefaultSecurityValidator {
    /// Create a validator with the default allow-list
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the endpoint scheme allow-list
    pub fn with_allowed_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the longest accepted query text, in bytes
    pub fn with_max_query_length(mut self, max: usize) -> Self {
        self.max_query_length = max;
        self
    }
}

impl SecurityValidator for DefaultSecurityValidator {
    fn validate_config(&self, config: &DataSourceConfig) -> Result<()> {
        validate_identifier(&config.id)?;
        validate_identifier(config.source_type.as_str())?;
        if let Some(endpoint) = &config.endpoint {
            validate_endpoint(endpoint, &self.allowed_schemes)?;
        }
        Ok(())
    }

    fn validate_query(&self, _config: &DataSourceConfig, query: &SearchQuery) -> Result<()> {
        validate_query_text(&query.text, self.max_query_length)?;
        for field in query.filters.keys() {
            validate_identifier(field)?;
        }
        Ok(())
    }
}
