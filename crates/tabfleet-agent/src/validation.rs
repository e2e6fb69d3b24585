use crate::error::{Error, Result};

/// Well-known service ports a worker must never bind.
pub const BLOCKED_PORTS: [u16; 7] = [3306, 5432, 6379, 9200, 27017, 11211, 2049];

pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        return Err(Error::validation(format!(
            "port {port} is out of range (1024-65535)"
        )));
    }
    if BLOCKED_PORTS.contains(&port) {
        return Err(Error::validation(format!(
            "port {port} is reserved for another service"
        )));
    }
    Ok(())
}

/// Parses a port from an API string. Empty and `0` mean "allocate one".
pub fn parse_port(raw: &str) -> Result<Option<u16>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }
    let port: u16 = raw
        .parse()
        .map_err(|_| Error::validation(format!("invalid port {raw:?}")))?;
    validate_port(port)?;
    Ok(Some(port))
}

pub fn validate_profile_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("profile name cannot be empty"));
    }
    if name.contains("..") {
        return Err(Error::validation("profile name cannot contain '..'"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::validation(
            "profile name cannot contain '/' or '\\'",
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn ports() {
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(65535).is_ok());
        assert_eq!(validate_port(80).unwrap_err().kind(), ErrorKind::Validation);
        for p in BLOCKED_PORTS {
            assert!(validate_port(p).is_err(), "{p}");
        }
    }

    #[test]
    fn parse_port_treats_zero_and_empty_as_auto() {
        assert_eq!(parse_port("").unwrap(), None);
        assert_eq!(parse_port(" 0 ").unwrap(), None);
        assert_eq!(parse_port("9901").unwrap(), Some(9901));
        assert!(parse_port("70000").is_err());
        assert!(parse_port("abc").is_err());
        assert!(parse_port("5432").is_err());
    }

    #[test]
    fn profile_names() {
        assert!(validate_profile_name("work").is_ok());
        assert!(validate_profile_name("my.profile").is_ok());
        assert_eq!(
            validate_profile_name("").unwrap_err().to_string(),
            "profile name cannot be empty"
        );
        assert!(validate_profile_name("../etc").is_err());
        assert!(validate_profile_name("a/b").is_err());
        assert!(validate_profile_name("a\\b").is_err());
    }
}
