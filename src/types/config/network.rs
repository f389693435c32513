//! Network-related configuration types

use std::num::NonZeroU16;
use std::str::FromStr;

use crate::types::ValidationError;

nonzero_newtype! {
    /// A validated network port number that cannot be zero
    ///
    /// # Examples
    /// ```
    /// use driftwatch::types::Port;
    ///
    /// let port = Port::new(2024).unwrap();
    /// assert_eq!(port.get(), 2024);
    ///
    /// // Port 0 is invalid
    /// assert!(Port::new(0).is_none());
    /// ```
    #[doc(alias = "port_number")]
    pub struct Port(NonZeroU16: u16, serialize as serialize_u16);
}

impl Port {
    /// Default ingestion listen port
    pub const LISTEN: Self = Self(NonZeroU16::new(2024).unwrap());

    /// Graphite plaintext protocol port
    pub const GRAPHITE: Self = Self(NonZeroU16::new(2003).unwrap());

    /// Default Redis port
    pub const REDIS: Self = Self(NonZeroU16::new(6379).unwrap());
}

impl Default for Port {
    fn default() -> Self {
        Self::LISTEN
    }
}

impl FromStr for Port {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let port = s
            .parse::<u16>()
            .map_err(|_| ValidationError::InvalidPortNumber(s.to_string()))?;
        Self::new(port).ok_or(ValidationError::InvalidPort)
    }
}

impl TryFrom<u16> for Port {
    type Error = ValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(ValidationError::InvalidPort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_constants() {
        assert_eq!(Port::LISTEN.get(), 2024);
        assert_eq!(Port::GRAPHITE.get(), 2003);
        assert_eq!(Port::REDIS.get(), 6379);
        assert_eq!(Port::default(), Port::LISTEN);
    }

    #[test]
    fn test_port_from_str_valid() {
        let port: Port = "443".parse().unwrap();
        assert_eq!(port.get(), 443);
    }

    #[test]
    fn test_port_from_str_zero() {
        let result: Result<Port, _> = "0".parse();
        assert!(matches!(result.unwrap_err(), ValidationError::InvalidPort));
    }

    #[test]
    fn test_port_from_str_invalid() {
        let result: Result<Port, _> = "not_a_port".parse();
        assert!(matches!(
            result.unwrap_err(),
            ValidationError::InvalidPortNumber(_)
        ));
    }

    #[test]
    fn test_port_from_str_out_of_range() {
        let result: Result<Port, _> = "65536".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_port_try_from_zero() {
        assert!(matches!(
            Port::try_from(0).unwrap_err(),
            ValidationError::InvalidPort
        ));
    }
}
