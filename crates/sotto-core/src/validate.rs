//! Username validation shared by the relay and clients.

use crate::error::{ChatError, ChatResult};

/// Minimum username length in characters.
pub const USERNAME_MIN_CHARS: usize = 2;
/// Maximum username length in characters.
pub const USERNAME_MAX_CHARS: usize = 20;

/// Validate a username against the join rules.
///
/// Allowed: letters, digits, space, underscore, hyphen; length 2–20
/// characters; must not be blank. The returned error names the violated
/// rule so the relay can send it to the requester verbatim.
pub fn validate_username(username: &str) -> ChatResult<()> {
    if username.trim().is_empty() {
        return Err(ChatError::Validation("Username cannot be blank".into()));
    }

    let len = username.chars().count();
    if !(USERNAME_MIN_CHARS..=USERNAME_MAX_CHARS).contains(&len) {
        return Err(ChatError::Validation(format!(
            "Username must be {USERNAME_MIN_CHARS}-{USERNAME_MAX_CHARS} characters"
        )));
    }

    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == ' ' || c == '_' || c == '-')
    {
        return Err(ChatError::Validation(
            "Username may only contain letters, digits, spaces, underscores, and hyphens".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["Ana", "Bob", "user_42", "mary-jane", "Jo Jo", "Åsa"] {
            assert!(validate_username(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_too_short_and_too_long() {
        assert!(validate_username("a").is_err());
        assert!(validate_username(&"x".repeat(21)).is_err());
        assert!(validate_username(&"x".repeat(20)).is_ok());
        assert!(validate_username("ab").is_ok());
    }

    #[test]
    fn rejects_blank() {
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
    }

    #[test]
    fn rejects_forbidden_characters() {
        for name in ["an@", "a<b>", "semi;colon", "new\nline", "slash/"] {
            assert!(validate_username(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn error_names_the_rule() {
        let err = validate_username("a").unwrap_err();
        assert!(err.to_string().contains("2-20"));
    }
}
