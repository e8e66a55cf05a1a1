//! User records — the unit of registration and peer discovery.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Lowest TCP port a client may listen on. Ports below this are rejected at
/// registration and never probed during allocation.
pub const MIN_CLIENT_PORT: u16 = 1000;

/// A chat participant as exchanged with the directory.
///
/// `id` is derived from the externally reachable address and listen port, so
/// a client that restarts on a different port is a different user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl User {
    /// Admission validation, applied by the directory before a record is
    /// accepted. Empty fields are empty after whitespace trim.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        if self.port < MIN_CLIENT_PORT {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Derive the stable user id from the listen endpoint.
pub fn user_id(address: &str, port: u16) -> String {
    STANDARD.encode(format!("{address}_{port}"))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("client id empty")]
    EmptyId,
    #[error("client name empty")]
    EmptyName,
    #[error("client address empty")]
    EmptyAddress,
    #[error("invalid client port")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_user() -> User {
        User {
            id: "aaa".into(),
            name: "A".into(),
            address: "10.0.0.1".into(),
            port: 1000,
        }
    }

    #[test]
    fn valid_user_passes() {
        assert!(valid_user().validate().is_ok());
    }

    #[test]
    fn whitespace_only_fields_are_empty() {
        let mut u = valid_user();
        u.id = "   ".into();
        assert_eq!(u.validate(), Err(ValidationError::EmptyId));

        let mut u = valid_user();
        u.name = "\t".into();
        assert_eq!(u.validate(), Err(ValidationError::EmptyName));

        let mut u = valid_user();
        u.address = "".into();
        assert_eq!(u.validate(), Err(ValidationError::EmptyAddress));
    }

    #[test]
    fn low_port_is_rejected() {
        let mut u = valid_user();
        u.port = 999;
        let err = u.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid client port");
    }

    #[test]
    fn user_id_is_deterministic() {
        assert_eq!(user_id("10.0.0.1", 1000), user_id("10.0.0.1", 1000));
        assert_ne!(user_id("10.0.0.1", 1000), user_id("10.0.0.1", 1001));
    }

    #[test]
    fn json_uses_wire_field_names() {
        let u = valid_user();
        let json = serde_json::to_string(&u).unwrap();
        assert!(json.contains("\"address\":\"10.0.0.1\""));
        assert!(json.contains("\"port\":1000"));
    }
}
