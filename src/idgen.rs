//! Unguessable identifier generation for portals and client tokens.

use base32::Alphabet;
use rand::TryRngCore;
use rand::rngs::OsRng;

const ID_BYTES: usize = 16;
const ENCODING: Alphabet = Alphabet::Rfc4648Lower { padding: false };

/// Generates a portal ID of the form `p_<base32>`.
pub fn new_portal_id() -> std::io::Result<String> {
    random_id("p_")
}

/// Generates a client token of the form `ct_<base32>`.
pub fn new_client_token() -> std::io::Result<String> {
    random_id("ct_")
}

fn random_id(prefix: &str) -> std::io::Result<String> {
    let mut buf = [0u8; ID_BYTES];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(std::io::Error::other)?;
    Ok(format!("{prefix}{}", base32::encode(ENCODING, &buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_ids_carry_prefix_and_length() {
        let id = new_portal_id().expect("portal id");
        assert!(id.starts_with("p_"));
        // 16 bytes -> 26 base32 characters without padding.
        assert_eq!(id.len(), 2 + 26);
    }

    #[test]
    fn client_tokens_carry_prefix() {
        let token = new_client_token().expect("client token");
        assert!(token.starts_with("ct_"));
        assert_eq!(token.len(), 3 + 26);
    }

    #[test]
    fn ids_are_lowercase() {
        let id = new_portal_id().expect("portal id");
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn ids_are_unique() {
        let a = new_portal_id().expect("portal id");
        let b = new_portal_id().expect("portal id");
        assert_ne!(a, b);
    }
}
