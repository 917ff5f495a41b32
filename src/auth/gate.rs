//! §6 handshake-time origin gate. Missing-origin connections (native
//! clients, not browsers) are accepted; a present-but-unlisted origin is
//! rejected.

use crate::config::CorsSettings;
use crate::error::AppError;

pub struct OriginGate {
    allowed: Vec<String>,
}

impl OriginGate {
    #[must_use]
    pub fn new(settings: &CorsSettings) -> Self {
        Self {
            allowed: settings.origins.clone(),
        }
    }

    pub fn check(&self, origin: Option<&str>) -> Result<(), AppError> {
        match origin {
            None => Ok(()),
            Some(origin) => {
                if self.allowed.is_empty() || self.allowed.iter().any(|o| o == origin) {
                    Ok(())
                } else {
                    Err(AppError::OriginNotAllowed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_origin_is_accepted() {
        let gate = OriginGate::new(&CorsSettings {
            origins: vec!["https://example.com".to_string()],
        });
        assert!(gate.check(None).is_ok());
    }

    #[test]
    fn unlisted_origin_is_rejected() {
        let gate = OriginGate::new(&CorsSettings {
            origins: vec!["https://example.com".to_string()],
        });
        assert_eq!(
            gate.check(Some("https://evil.example")),
            Err(AppError::OriginNotAllowed)
        );
    }

    #[test]
    fn listed_origin_is_accepted() {
        let gate = OriginGate::new(&CorsSettings {
            origins: vec!["https://example.com".to_string()],
        });
        assert!(gate.check(Some("https://example.com")).is_ok());
    }
}
