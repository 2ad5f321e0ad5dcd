#[derive(Debug, Clone, PartialEq)]
pub enum AuthMode {
    None,
    Token(String),
}

impl AuthMode {
    /// A blank or absent token leaves the endpoint open.
    pub fn from_token(token: Option<&str>) -> Self {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => AuthMode::Token(t.to_string()),
            None => AuthMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingHeader,
    NotBearer,
    BadToken,
}

impl AuthRejection {
    pub fn message(self) -> &'static str {
        match self {
            AuthRejection::MissingHeader => "Missing Authorization header",
            AuthRejection::NotBearer => "Authorization must use the Bearer scheme",
            AuthRejection::BadToken => "Invalid token",
        }
    }
}

/// Check the `Authorization` header of a run request.
pub fn validate_auth(mode: &AuthMode, authorization_header: Option<&str>) -> Result<(), AuthRejection> {
    let AuthMode::Token(expected) = mode else {
        return Ok(());
    };
    let header = authorization_header.ok_or(AuthRejection::MissingHeader)?;
    let presented = header
        .strip_prefix("Bearer ")
        .ok_or(AuthRejection::NotBearer)?
        .trim();
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthRejection::BadToken)
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_mode() -> AuthMode {
        AuthMode::Token("team-token".into())
    }

    #[test]
    fn test_open_mode_accepts_anything() {
        assert!(validate_auth(&AuthMode::None, None).is_ok());
        assert!(validate_auth(&AuthMode::None, Some("Basic abc")).is_ok());
    }

    #[test]
    fn test_matching_bearer_token() {
        assert_eq!(validate_auth(&token_mode(), Some("Bearer team-token")), Ok(()));
    }

    #[test]
    fn test_rejections() {
        let mode = token_mode();
        assert_eq!(validate_auth(&mode, None), Err(AuthRejection::MissingHeader));
        assert_eq!(validate_auth(&mode, Some("team-token")), Err(AuthRejection::NotBearer));
        assert_eq!(validate_auth(&mode, Some("Bearer team-tokem")), Err(AuthRejection::BadToken));
        assert_eq!(validate_auth(&mode, Some("Bearer team")), Err(AuthRejection::BadToken));
    }

    #[test]
    fn test_blank_token_disables_auth() {
        assert_eq!(AuthMode::from_token(Some("  ")), AuthMode::None);
        assert_eq!(AuthMode::from_token(None), AuthMode::None);
        assert_eq!(AuthMode::from_token(Some("t")), AuthMode::Token("t".into()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
