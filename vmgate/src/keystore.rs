use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vmgate_protocol::codes;

use crate::download::Downloader;
use crate::hypervisor::ParameterMap;

/// Trust decisions the session workflow consumes: which origins may
/// request sessions, whether a fetched manifest carries a valid
/// signature, and whether a handshake auth token grants privileges.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Refresh the authorized-domain list if it is not yet valid.
    /// Returns a wire code; the store may stay invalid on failure.
    async fn update_authorized(
        &self,
        downloader: &dyn Downloader,
        cancel: &CancellationToken,
    ) -> i32;

    fn valid(&self) -> bool;

    fn is_domain_valid(&self, domain: &str) -> bool;

    /// Random salt bound into the VMCP request URL.
    fn generate_salt(&self) -> String;

    /// Validate the manifest signature for `domain` and `salt`.
    /// Returns `OK` or a negative code.
    fn signature_validate(&self, domain: &str, salt: &str, vmcp: &ParameterMap) -> i32;

    /// Check a handshake auth token against the local privileged key.
    fn auth_key_valid(&self, key: &str) -> bool;
}

struct TrustState {
    /// domain -> signing key (lowercase hex).
    domains: HashMap<String, String>,
    valid: bool,
}

/// Keystore over a downloadable authorized-domain list.
///
/// List format: one `<domain> <key-hex>` pair per line; `#` starts a
/// comment. The signing key of a domain is mixed into the manifest
/// digest, so a manifest can only validate for the domain it was signed
/// for.
pub struct TrustStore {
    authorized_url: String,
    local_auth_key: String,
    state: RwLock<TrustState>,
}

impl TrustStore {
    pub fn new(authorized_url: impl Into<String>, local_auth_key: impl Into<String>) -> Self {
        Self {
            authorized_url: authorized_url.into(),
            local_auth_key: local_auth_key.into(),
            state: RwLock::new(TrustState {
                domains: HashMap::new(),
                valid: false,
            }),
        }
    }

    /// Seed the domain list directly (tests and offline operation).
    #[allow(dead_code)]
    pub fn with_domains(self, domains: impl IntoIterator<Item = (String, String)>) -> Self {
        {
            let mut state = self.state.write().unwrap();
            state.domains = domains.into_iter().collect();
            state.valid = !state.domains.is_empty();
        }
        self
    }

    fn parse_authorized(text: &str) -> HashMap<String, String> {
        text.lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(domain), Some(key)) => {
                        Some((domain.to_lowercase(), key.to_lowercase()))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Digest the manifest exactly the signing side does: all entries
    /// except `signature`, sorted by key, `k=v` newline-joined, followed
    /// by the salt, the domain, and the domain's signing key.
    fn manifest_digest(domain: &str, salt: &str, domain_key: &str, vmcp: &ParameterMap) -> String {
        let payload = vmcp.to_json();
        let mut pairs: Vec<(String, String)> = payload
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(k, _)| k.as_str() != "signature")
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (k, v) in &pairs {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(salt.as_bytes());
        hasher.update(b"\n");
        hasher.update(domain.as_bytes());
        hasher.update(b"\n");
        hasher.update(domain_key.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

#[async_trait]
impl Keystore for TrustStore {
    async fn update_authorized(
        &self,
        downloader: &dyn Downloader,
        cancel: &CancellationToken,
    ) -> i32 {
        if self.valid() {
            return codes::OK;
        }

        let text = match downloader
            .download_text(&self.authorized_url, None, cancel)
            .await
        {
            Ok(text) => text,
            Err(code) => {
                warn!(url = %self.authorized_url, code, "authorized-domain list fetch failed");
                return code;
            }
        };

        let domains = Self::parse_authorized(&text);
        if domains.is_empty() {
            warn!(url = %self.authorized_url, "authorized-domain list is empty");
            return codes::NOT_VALIDATED;
        }

        let mut state = self.state.write().unwrap();
        info!(count = domains.len(), "authorized-domain list refreshed");
        state.domains = domains;
        state.valid = true;
        codes::OK
    }

    fn valid(&self) -> bool {
        self.state.read().unwrap().valid
    }

    fn is_domain_valid(&self, domain: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .domains
            .contains_key(&domain.to_lowercase())
    }

    fn generate_salt(&self) -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 16] = rng.gen();
        hex_encode(&bytes)
    }

    fn signature_validate(&self, domain: &str, salt: &str, vmcp: &ParameterMap) -> i32 {
        let domain_key = match self
            .state
            .read()
            .unwrap()
            .domains
            .get(&domain.to_lowercase())
            .cloned()
        {
            Some(key) => key,
            None => return codes::NOT_TRUSTED,
        };

        let signature = match vmcp.get("signature") {
            Some(sig) => sig,
            None => return codes::NOT_VALIDATED,
        };

        let expected = Self::manifest_digest(domain, salt, &domain_key, vmcp);
        if constant_time_eq(signature.to_lowercase().as_bytes(), expected.as_bytes()) {
            codes::OK
        } else {
            debug!(domain, "manifest signature mismatch");
            codes::NOT_VALIDATED
        }
    }

    fn auth_key_valid(&self, key: &str) -> bool {
        !self.local_auth_key.is_empty()
            && constant_time_eq(key.as_bytes(), self.local_auth_key.as_bytes())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Sign a manifest with a domain key, producing the `signature` value a
/// VMCP server would embed. Lives here so tests and tooling share the
/// exact digest construction.
#[allow(dead_code)]
pub fn sign_manifest(domain: &str, salt: &str, domain_key: &str, vmcp: &ParameterMap) -> String {
    TrustStore::manifest_digest(domain, salt, domain_key, vmcp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str) -> ParameterMap {
        let obj = json!({"name": name, "secret": "swordfish"});
        ParameterMap::from_json(obj.as_object().unwrap())
    }

    fn seeded_store() -> TrustStore {
        TrustStore::new("https://unused.test/authorized.txt", "hunter2").with_domains([(
            "example.test".to_string(),
            "aabbcc".to_string(),
        )])
    }

    #[test]
    fn parse_authorized_skips_comments_and_blanks() {
        let text = "# trusted domains\nexample.test aabbcc\n\nOther.Test DDEEFF\nmalformed\n";
        let domains = TrustStore::parse_authorized(text);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains["example.test"], "aabbcc");
        assert_eq!(domains["other.test"], "ddeeff");
    }

    #[test]
    fn domain_validity_case_insensitive() {
        let store = seeded_store();
        assert!(store.valid());
        assert!(store.is_domain_valid("example.test"));
        assert!(store.is_domain_valid("EXAMPLE.test"));
        assert!(!store.is_domain_valid("evil.test"));
    }

    #[test]
    fn salts_are_unique_hex() {
        let store = seeded_store();
        let a = store.generate_salt();
        let b = store.generate_salt();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_manifest_validates() {
        let store = seeded_store();
        let vmcp = manifest("vm1");
        let salt = store.generate_salt();
        let sig = sign_manifest("example.test", &salt, "aabbcc", &vmcp);
        vmcp.set("signature", &sig);
        assert_eq!(store.signature_validate("example.test", &salt, &vmcp), codes::OK);
    }

    #[test]
    fn tampered_manifest_fails_validation() {
        let store = seeded_store();
        let vmcp = manifest("vm1");
        let salt = store.generate_salt();
        let sig = sign_manifest("example.test", &salt, "aabbcc", &vmcp);
        vmcp.set("signature", &sig);
        // Tamper after signing.
        vmcp.set("name", "vm1-evil");
        assert_eq!(
            store.signature_validate("example.test", &salt, &vmcp),
            codes::NOT_VALIDATED
        );
    }

    #[test]
    fn signature_bound_to_salt_and_domain() {
        let store = TrustStore::new("https://unused.test/a.txt", "").with_domains([
            ("example.test".to_string(), "aabbcc".to_string()),
            ("other.test".to_string(), "aabbcc".to_string()),
        ]);
        let vmcp = manifest("vm1");
        let sig = sign_manifest("example.test", "salt-1", "aabbcc", &vmcp);
        vmcp.set("signature", &sig);
        assert_eq!(store.signature_validate("example.test", "salt-1", &vmcp), codes::OK);
        // Replay with a different salt or domain fails.
        assert_eq!(
            store.signature_validate("example.test", "salt-2", &vmcp),
            codes::NOT_VALIDATED
        );
        assert_eq!(
            store.signature_validate("other.test", "salt-1", &vmcp),
            codes::NOT_VALIDATED
        );
    }

    #[test]
    fn missing_signature_fails() {
        let store = seeded_store();
        let vmcp = manifest("vm1");
        assert_eq!(
            store.signature_validate("example.test", "salt", &vmcp),
            codes::NOT_VALIDATED
        );
    }

    #[test]
    fn auth_key_checks() {
        let store = seeded_store();
        assert!(store.auth_key_valid("hunter2"));
        assert!(!store.auth_key_valid("hunter3"));
        assert!(!store.auth_key_valid(""));

        let no_key = TrustStore::new("https://unused.test/a.txt", "");
        assert!(!no_key.auth_key_valid(""));
        assert!(!no_key.auth_key_valid("anything"));
    }
}
