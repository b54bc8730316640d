//! Serial port configuration

use smpmgr_core::TransportError;

/// Baud rate used when none is given
pub const DEFAULT_BAUD: u32 = 115_200;

/// Serial port settings for the UART transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
    /// Device path (e.g., "/dev/ttyACM0" or "COM3")
    pub port: String,
    /// Baud rate
    pub baud: u32,
}

impl UartConfig {
    /// Create a configuration for `port` at the default baud rate
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: DEFAULT_BAUD,
        }
    }

    /// Set the baud rate
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Parse a connection string
    ///
    /// Formats:
    /// - `dev=/dev/ttyACM0` - default baud
    /// - `dev=/dev/ttyACM0:115200` - specified baud
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let dev = s.strip_prefix("dev=").ok_or_else(|| {
            TransportError::InvalidConfiguration(format!(
                "Invalid UART connection string: {}. Use dev=...",
                s
            ))
        })?;

        let config = match dev.rsplit_once(':') {
            Some((port, baud_str)) => {
                let baud = baud_str.parse().map_err(|_| {
                    TransportError::InvalidConfiguration(format!("Invalid baud rate: {}", baud_str))
                })?;
                UartConfig::new(port).with_baud(baud)
            }
            None => UartConfig::new(dev),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the settings can be used to open a port
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "No serial port given".to_string(),
            ));
        }
        if self.baud == 0 {
            return Err(TransportError::InvalidConfiguration(
                "Baud rate must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_baud() {
        let config = UartConfig::parse("dev=/dev/ttyACM0:1000000").unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baud, 1_000_000);
    }

    #[test]
    fn test_parse_default_baud() {
        let config = UartConfig::parse("dev=COM3").unwrap();
        assert_eq!(config, UartConfig::new("COM3"));
        assert_eq!(config.baud, DEFAULT_BAUD);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            UartConfig::parse("ip=localhost:1337"),
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            UartConfig::parse("dev=/dev/ttyACM0:fast"),
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            UartConfig::parse("dev=/dev/ttyACM0:0"),
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            UartConfig::parse("dev="),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }
}
