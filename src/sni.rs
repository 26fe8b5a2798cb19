//! SNI certificate selection.
//!
//! Chooses the chain for each TLS handshake from the server name the client
//! sent, asking the certificate authority for a new leaf when a pattern has
//! not been seen before.

use std::fmt;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, warn};

use crate::ca::{CertificateAuthority, LeafCertificate};
use crate::domain::{normalize_host, DomainPattern};
use crate::error::GatewayError;

/// Outcome of certificate selection for one server name
#[derive(Debug, Clone)]
pub enum SniDecision {
    /// Serve this leaf and its chain
    Chain(Arc<LeafCertificate>),
    /// Serve the default `*.eth.<base>` chain
    UseDefault,
}

/// Certificate resolver plugged into the TLS acceptor
pub struct SniResolver {
    authority: Arc<CertificateAuthority>,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("base_domain", &self.authority.suffixes().base)
            .field("cached_patterns", &self.authority.cached_patterns().len())
            .finish()
    }
}

impl SniResolver {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }

    /// Pick the chain for `server_name`.
    ///
    /// Absent or unparseable names and names under the default scope get the
    /// default chain; admin names get the root-signed admin leaf; anything
    /// else is issued by the intermediate. Issuance errors are returned so
    /// that only this handshake fails.
    pub fn resolve_name(&self, server_name: Option<&str>) -> Result<SniDecision, GatewayError> {
        let Some(host) = server_name.and_then(normalize_host) else {
            return Ok(SniDecision::UseDefault);
        };

        let suffixes = self.authority.suffixes();
        if suffixes.is_admin_host(&host) {
            return Ok(SniDecision::Chain(self.authority.admin_leaf()));
        }

        let Some(pattern) = DomainPattern::derive(&host, &suffixes.base) else {
            return Ok(SniDecision::UseDefault);
        };
        if pattern == suffixes.default_pattern() {
            return Ok(SniDecision::UseDefault);
        }

        self.authority.issue_leaf(&pattern).map(SniDecision::Chain)
    }

    /// Chain sent for [`SniDecision::UseDefault`]
    pub fn default_chain(&self) -> Arc<CertifiedKey> {
        self.authority.default_leaf().certified_key()
    }

    /// TLS server configuration using this resolver, serving HTTP/1.1
    pub fn server_config(self: Arc<Self>) -> anyhow::Result<ServerConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?
            .with_no_client_auth()
            .with_cert_resolver(self);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        match self.resolve_name(server_name) {
            Ok(SniDecision::Chain(leaf)) => {
                debug!(server_name, pattern = %leaf.pattern, "SNI chain selected");
                Some(leaf.certified_key())
            }
            Ok(SniDecision::UseDefault) => Some(self.default_chain()),
            Err(e) => {
                warn!(server_name, error = %e, "Certificate selection failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaOptions, Signer};
    use crate::trust_store::test_support::RecordingTrustStore;
    use tempfile::TempDir;

    fn resolver(dir: &TempDir) -> (SniResolver, Arc<CertificateAuthority>) {
        let options = CaOptions {
            cert_dir: dir.path().to_path_buf(),
            base_domain: "localhost".to_string(),
            hardened_root_key: true,
        };
        let ca = Arc::new(
            CertificateAuthority::initialize(&options, Box::new(RecordingTrustStore::default()))
                .unwrap(),
        );
        (SniResolver::new(Arc::clone(&ca)), ca)
    }

    #[test]
    fn test_missing_or_bad_names_use_default() {
        let dir = TempDir::new().unwrap();
        let (resolver, ca) = resolver(&dir);

        assert!(matches!(resolver.resolve_name(None), Ok(SniDecision::UseDefault)));
        assert!(matches!(resolver.resolve_name(Some("")), Ok(SniDecision::UseDefault)));
        assert!(matches!(
            resolver.resolve_name(Some("example.com")),
            Ok(SniDecision::UseDefault)
        ));
        assert_eq!(ca.generated_count(), 0);
    }

    #[test]
    fn test_top_level_names_use_default() {
        let dir = TempDir::new().unwrap();
        let (resolver, ca) = resolver(&dir);

        assert!(matches!(
            resolver.resolve_name(Some("vitalik.eth.localhost")),
            Ok(SniDecision::UseDefault)
        ));
        assert_eq!(ca.generated_count(), 0);
        assert_eq!(resolver.default_chain().cert.len(), 2);
    }

    #[test]
    fn test_admin_names_get_root_signed_leaf() {
        let dir = TempDir::new().unwrap();
        let (resolver, ca) = resolver(&dir);

        for name in ["node.localhost", "ethereum.node.localhost"] {
            match resolver.resolve_name(Some(name)).unwrap() {
                SniDecision::Chain(leaf) => {
                    assert_eq!(leaf.signed_by, Signer::Root);
                    assert_eq!(leaf.chain_len(), 2);
                }
                SniDecision::UseDefault => panic!("{} should use the admin leaf", name),
            }
        }
        assert_eq!(ca.generated_count(), 0);
    }

    #[test]
    fn test_nested_names_are_issued_once() {
        let dir = TempDir::new().unwrap();
        let (resolver, ca) = resolver(&dir);

        for name in ["blog.vitalik.eth.localhost", "docs.vitalik.eth.localhost"] {
            match resolver.resolve_name(Some(name)).unwrap() {
                SniDecision::Chain(leaf) => {
                    assert_eq!(leaf.pattern.as_str(), "*.vitalik.eth.localhost");
                    assert_eq!(leaf.chain_len(), 3);
                }
                SniDecision::UseDefault => panic!("{} should get its own leaf", name),
            }
        }
        assert_eq!(ca.generated_count(), 1);
    }

    #[test]
    fn test_names_outside_constraint_fail() {
        let dir = TempDir::new().unwrap();
        let (resolver, _ca) = resolver(&dir);

        // Under the base domain but not under eth.<base>
        let err = resolver.resolve_name(Some("a.other.localhost")).unwrap_err();
        assert!(matches!(err, GatewayError::Issuance { .. }));
    }
}
