//! Access-token helpers.

/// The last 20 characters of an access token: a stable per-participant
/// identifier that is safe to log and to use as a `toclose` map key.
pub fn short_token(acctok: &str) -> &str {
    let len = acctok.len();
    if len <= 20 {
        acctok
    } else {
        &acctok[len - 20..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_to_last_20_chars() {
        let tok = "a".repeat(5) + &"b".repeat(25);
        let short = short_token(&tok);
        assert_eq!(short.len(), 20);
        assert!(short.chars().all(|c| c == 'b'));
    }

    #[test]
    fn short_tokens_are_returned_unchanged() {
        assert_eq!(short_token("tiny"), "tiny");
    }
}
