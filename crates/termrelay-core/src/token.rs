//! HMAC bearer tokens for termrelay.
//!
//! A token names the owner it was issued to and carries its own expiry.
//! Format: `<owner_id>.<expiry unix secs>.<hex HMAC-SHA256(owner_id.expiry)>`

use crate::error::{RelayError, RelayResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sign(secret: &[u8], owner_id: &str, expiry: u64) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, format!("{owner_id}.{expiry}").as_bytes())
}

/// Issue a bearer token for `owner_id` valid for `ttl_secs`.
///
/// Owner ids may not contain `.`.
pub fn issue_token(secret: &[u8], owner_id: &str, ttl_secs: u64) -> RelayResult<String> {
    if owner_id.is_empty() || owner_id.contains('.') {
        return Err(RelayError::Token(format!("invalid owner id: {owner_id:?}")));
    }
    let expiry = now_secs() + ttl_secs;
    let tag = sign(secret, owner_id, expiry);
    Ok(format!("{owner_id}.{expiry}.{}", hex::encode(tag.as_ref())))
}

/// Verify a bearer token and return the owner id it was issued to.
///
/// Checks both the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> RelayResult<String> {
    let mut parts = token.rsplitn(3, '.');
    let (mac_hex, expiry_str, owner_id) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(e), Some(o)) if !o.is_empty() => (m, e, o),
        _ => return Err(RelayError::Token("malformed token".into())),
    };

    let expiry: u64 = expiry_str
        .parse()
        .map_err(|_| RelayError::Token("malformed expiry".into()))?;
    let mac = hex::decode(mac_hex).map_err(|_| RelayError::Token("malformed signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, format!("{owner_id}.{expiry}").as_bytes(), &mac)
        .map_err(|_| RelayError::Token("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(RelayError::Token("token expired".into()));
    }

    Ok(owner_id.to_string())
}

/// Generate a random signing secret (32 bytes).
pub fn generate_secret() -> RelayResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| RelayError::Other("system RNG failure".into()))?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify() {
        let secret = generate_secret().unwrap();
        let token = issue_token(&secret, "user-42", 3600).unwrap();
        assert!(token.starts_with("user-42."));
        assert_eq!(verify_token(&secret, &token).unwrap(), "user-42");
    }

    #[test]
    fn wrong_secret() {
        let token = issue_token(&generate_secret().unwrap(), "user-42", 3600).unwrap();
        assert!(verify_token(&generate_secret().unwrap(), &token).is_err());
    }

    #[test]
    fn tampered_owner() {
        let secret = generate_secret().unwrap();
        let token = issue_token(&secret, "alice", 3600).unwrap();
        let forged = token.replacen("alice", "mallory", 1);
        assert!(verify_token(&secret, &forged).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let expiry = now_secs() - 10;
        let tag = sign(secret, "alice", expiry);
        let token = format!("alice.{expiry}.{}", hex::encode(tag.as_ref()));
        let err = verify_token(secret, &token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn garbage_is_rejected() {
        let secret = generate_secret().unwrap();
        assert!(verify_token(&secret, "").is_err());
        assert!(verify_token(&secret, "no-dots").is_err());
        assert!(verify_token(&secret, ".123.abcd").is_err());
        assert!(verify_token(&secret, "alice.soon.abcd").is_err());
    }

    #[test]
    fn owner_ids_with_dots_are_refused() {
        let secret = generate_secret().unwrap();
        assert!(issue_token(&secret, "a.b", 60).is_err());
    }
}
