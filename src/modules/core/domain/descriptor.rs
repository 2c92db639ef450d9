//! Canonical connection descriptor

use std::fmt;
use std::time::Duration;

use crate::error::PluginError;

const REDACTED: &str = "***";

/// URI-form string fully describing how to reach the database.
///
/// `Display` and `Debug` redact credentials; use [`ConnectionDescriptor::as_str`] to get the
/// string handed to the driver.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    /// Wrap a descriptor, rejecting empty input
    pub fn new(descriptor: impl Into<String>) -> Result<Self, PluginError> {
        let descriptor = descriptor.into();
        if descriptor.trim().is_empty() {
            return Err(PluginError::Config(
                "connection descriptor must not be empty".to_string(),
            ));
        }
        Ok(Self(descriptor))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `connect_timeout` query parameter in seconds, if the descriptor carries one.
    /// Zero means no timeout and is reported as `None`.
    pub fn connect_timeout(&self) -> Option<Duration> {
        let url = url::Url::parse(&self.0).ok()?;
        let secs = url
            .query_pairs()
            .find(|(key, _)| key == "connect_timeout")
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())?;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// The descriptor with the userinfo password and any `password` parameter masked
    pub fn redacted(&self) -> String {
        let mut url = match url::Url::parse(&self.0) {
            Ok(url) => url,
            Err(_) => return REDACTED.to_string(),
        };

        if url.password().is_some() {
            let _ = url.set_password(Some(REDACTED));
        }

        if url.query_pairs().any(|(key, _)| key == "password") {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(key, value)| {
                    let value = if key == "password" {
                        REDACTED.to_string()
                    } else {
                        value.into_owned()
                    };
                    (key.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }

        url.to_string()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionDescriptor")
            .field(&self.redacted())
            .finish()
    }
}
