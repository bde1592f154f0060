//! IP sharing keys.
//!
//! The backend decides whether two service endpoints resolve to the same
//! externally visible IP by comparing sharing keys. A key is
//! `{owner}-ip-{name}` when the endpoint name is already a safe label;
//! otherwise the name is replaced by a fixed-width digest.
//!
//! The digest is the first 15 bytes of SHA-256, encoded with the base32
//! "extended hex" alphabet (RFC 4648 §7) without padding and lower-cased,
//! giving 24 characters. Keys generated by earlier deployments depend on
//! this exact encoding.

use std::sync::LazyLock;

use base32::Alphabet;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::LeaseId;

static ALLOWED_ENDPOINT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-]+$").expect("static regex"));

const DIGEST_PREFIX_BYTES: usize = 15;

/// Build the sharing key for `endpoint_name` within `lease`.
pub fn make_ip_sharing_key(lease: &LeaseId, endpoint_name: &str) -> String {
    let effective = if ALLOWED_ENDPOINT_NAME.is_match(endpoint_name) {
        endpoint_name.to_string()
    } else {
        hashed_name(endpoint_name)
    };
    format!("{}-ip-{}", lease.owner(), effective)
}

fn hashed_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    encode_base32_hex(&digest[..DIGEST_PREFIX_BYTES])
}

/// Unpadded base32hex, lower case.
fn encode_base32_hex(bytes: &[u8]) -> String {
    base32::encode(Alphabet::Rfc4648Hex { padding: false }, bytes).to_lowercase()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::types::OrderId;

    fn lease() -> LeaseId {
        OrderId::new("akash1owner", 1, 2, 3).lease("akash1provider")
    }

    #[test]
    fn conforming_name_is_used_verbatim() {
        assert_eq!(make_ip_sharing_key(&lease(), "web"), "akash1owner-ip-web");
        assert_eq!(
            make_ip_sharing_key(&lease(), "front-end-2"),
            "akash1owner-ip-front-end-2"
        );
    }

    #[test]
    fn non_conforming_name_is_hashed() {
        let key = make_ip_sharing_key(&lease(), "My_Endpoint!");
        assert_eq!(key, "akash1owner-ip-onlhuecaa8shoas89ob89u9p");
        // Upper case is not in the allowed charset either.
        assert_eq!(
            make_ip_sharing_key(&lease(), "WEB"),
            "akash1owner-ip-jn7qloab7638c3plec98bl38"
        );
    }

    #[test]
    fn hashed_key_is_deterministic_fixed_width_lowercase() {
        let a = make_ip_sharing_key(&lease(), "Some Name");
        let b = make_ip_sharing_key(&lease(), "Some Name");
        assert_eq!(a, b);

        let suffix = a.strip_prefix("akash1owner-ip-").unwrap();
        assert_eq!(suffix.len(), 24);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || ('a'..='v').contains(&c)));
    }

    #[test]
    fn key_depends_only_on_owner_and_name() {
        let other = OrderId::new("akash1owner", 99, 9, 9).lease("akash1other");
        assert_eq!(
            make_ip_sharing_key(&lease(), "Shared_IP"),
            make_ip_sharing_key(&other, "Shared_IP")
        );
    }

    #[test]
    fn no_collisions_across_many_non_conforming_names() {
        // Deterministic pseudo-random names, each carrying a disallowed char.
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut keys = HashSet::new();
        let mut names = HashSet::new();
        while names.len() < 10_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let name = format!("Endpoint_{state:x}!");
            if names.insert(name.clone()) {
                let key = make_ip_sharing_key(&lease(), &name);
                assert_eq!(key.len(), "akash1owner-ip-".len() + 24);
                assert_eq!(key, key.to_lowercase());
                keys.insert(key);
            }
        }
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn base32_hex_matches_reference_vectors() {
        // RFC 4648 §10 test vectors, lower-cased and unpadded.
        assert_eq!(encode_base32_hex(b""), "");
        assert_eq!(encode_base32_hex(b"f"), "co");
        assert_eq!(encode_base32_hex(b"fo"), "cpng");
        assert_eq!(encode_base32_hex(b"foo"), "cpnmu");
        assert_eq!(encode_base32_hex(b"foob"), "cpnmuog");
        assert_eq!(encode_base32_hex(b"fooba"), "cpnmuoj1");
        assert_eq!(encode_base32_hex(b"foobar"), "cpnmuoj1e8");
    }
}
