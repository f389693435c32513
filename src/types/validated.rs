//! Validated string types that enforce invariants at construction time

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Validation errors for configuration values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("namespace cannot be empty or contain whitespace: {0:?}")]
    InvalidNamespace(String),

    #[error("key prefix cannot be empty or contain whitespace: {0:?}")]
    InvalidKeyPrefix(String),

    #[error("port cannot be 0")]
    InvalidPort,

    #[error("invalid port number: {0}")]
    InvalidPortNumber(String),
}

fn is_key_safe(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

/// Macro to generate validated string newtypes.
///
/// Each type gets a validating `new()`, `as_str()`, `AsRef<str>`, `Deref`,
/// `Display`, `TryFrom<String>` and serde support that re-validates on
/// deserialization.
macro_rules! validated_string {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident(String) {
            validation: |$s_param:ident| $validation:expr,
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", stringify!($name), " after validation")]
            pub fn new($s_param: String) -> Result<Self, ValidationError> {
                let validate = || $validation;
                validate()?;
                Ok(Self($s_param))
            }

            #[doc = concat!("Get the ", stringify!($name), " as a string slice")]
            #[must_use]
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from($s_param: String) -> Result<Self, Self::Error> {
                Self::new($s_param)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

validated_string! {
    /// A key-space namespace prefix such as `full.` or `mini.`
    ///
    /// A series key is the namespace concatenated with the metric name, and
    /// the namespace's unique-metrics set lives at `<namespace>unique_metrics`.
    ///
    /// # Examples
    /// ```
    /// use driftwatch::types::Namespace;
    ///
    /// let ns = Namespace::new("full.".to_string()).unwrap();
    /// assert_eq!(ns.series_key("cpu.load"), "full.cpu.load");
    /// assert_eq!(ns.unique_metrics_key(), "full.unique_metrics");
    ///
    /// assert!(Namespace::new("".to_string()).is_err());
    /// ```
    pub struct Namespace(String) {
        validation: |s| {
            if is_key_safe(&s) {
                Ok(())
            } else {
                Err(ValidationError::InvalidNamespace(s.clone()))
            }
        },
    }
}

impl Namespace {
    /// Key of the series holding `metric` in this namespace
    #[must_use]
    pub fn series_key(&self, metric: &str) -> String {
        let mut key = String::with_capacity(self.0.len() + metric.len());
        key.push_str(&self.0);
        key.push_str(metric);
        key
    }

    /// Key of the set listing every series key in this namespace
    #[must_use]
    pub fn unique_metrics_key(&self) -> String {
        self.series_key("unique_metrics")
    }

    /// Strip this namespace from a series key, if present
    #[must_use]
    pub fn metric_name<'a>(&self, series_key: &'a str) -> &'a str {
        series_key.strip_prefix(self.as_str()).unwrap_or(series_key)
    }
}

validated_string! {
    /// Prefix for the service's own bookkeeping keys and Graphite metrics
    pub struct KeyPrefix(String) {
        validation: |s| {
            if is_key_safe(&s) {
                Ok(())
            } else {
                Err(ValidationError::InvalidKeyPrefix(s.clone()))
            }
        },
    }
}

impl KeyPrefix {
    /// Join the prefix with further dot-separated components
    #[must_use]
    pub fn join(&self, parts: &[&str]) -> String {
        let mut key = self.0.clone();
        for part in parts {
            key.push('.');
            key.push_str(part);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_valid() {
        let ns = Namespace::new("mini.".to_string()).unwrap();
        assert_eq!(ns.as_str(), "mini.");
        assert_eq!(format!("{}", ns), "mini.");
    }

    #[test]
    fn test_namespace_rejects_empty_and_whitespace() {
        assert!(matches!(
            Namespace::new(String::new()),
            Err(ValidationError::InvalidNamespace(_))
        ));
        assert!(Namespace::new("full .".to_string()).is_err());
        assert!(Namespace::new("\t".to_string()).is_err());
    }

    #[test]
    fn test_namespace_keys() {
        let ns = Namespace::new("full.".to_string()).unwrap();
        assert_eq!(ns.series_key("web.requests"), "full.web.requests");
        assert_eq!(ns.unique_metrics_key(), "full.unique_metrics");
    }

    #[test]
    fn test_namespace_metric_name() {
        let ns = Namespace::new("full.".to_string()).unwrap();
        assert_eq!(ns.metric_name("full.web.requests"), "web.requests");
        // only the leading occurrence is stripped
        assert_eq!(ns.metric_name("full.full.x"), "full.x");
        assert_eq!(ns.metric_name("mini.x"), "mini.x");
    }

    #[test]
    fn test_namespace_deserialize_validates() {
        #[derive(Deserialize)]
        struct Holder {
            ns: Namespace,
        }
        assert!(toml::from_str::<Holder>("ns = \"full.\"").is_ok());
        assert!(toml::from_str::<Holder>("ns = \"\"").is_err());
    }

    #[test]
    fn test_key_prefix_join() {
        let prefix = KeyPrefix::new("driftwatch".to_string()).unwrap();
        assert_eq!(
            prefix.join(&["analyzer", "host1", "3"]),
            "driftwatch.analyzer.host1.3"
        );
        assert_eq!(prefix.join(&[]), "driftwatch");
    }
}
