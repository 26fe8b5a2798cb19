//! Hostname handling shared by the SNI resolver and the host router.
//!
//! Every routing and certificate decision starts from a hostname and the
//! configured base domain (`localhost` by default):
//!
//! ```text
//! vitalik.eth.localhost        -> content proxy, pattern *.eth.localhost (default cert)
//! blog.vitalik.eth.localhost   -> content proxy, pattern *.vitalik.eth.localhost
//! node.localhost               -> cache admin, admin cert
//! ethereum.node.localhost      -> RPC proxy, admin cert
//! ```

use std::fmt;

/// Label under the base domain that carries ENS names
pub const ENS_LABEL: &str = "eth";

/// Label under the base domain that carries the node's own services
pub const NODE_LABEL: &str = "node";

/// Host prefix of the RPC service under the node label
pub const RPC_LABEL: &str = "ethereum";

/// Wildcard scope used as the certificate cache key.
///
/// Always of the form `*.<scope>`; derived deterministically from a hostname
/// and the base domain so that identical inputs share one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainPattern(String);

impl DomainPattern {
    /// Derive the pattern for `hostname` under `base_domain`.
    ///
    /// The hostname's parent becomes the wildcard scope: `blog.app.eth.X`
    /// yields `*.app.eth.X` and `name.eth.X` yields `*.eth.X`. A hostname
    /// with a single label under the base (`eth.X`) is covered by its own
    /// wildcard (`*.eth.X`). Returns `None` for hostnames outside the base.
    pub fn derive(hostname: &str, base_domain: &str) -> Option<Self> {
        let host = normalize_host(hostname)?;
        let base = normalize_host(base_domain)?;
        let labels = host.strip_suffix(&base)?.strip_suffix('.')?;
        if labels.is_empty() || labels.split('.').any(str::is_empty) {
            return None;
        }

        let scope = match labels.split_once('.') {
            Some((_, parent)) => format!("{}.{}", parent, base),
            None => host.clone(),
        };
        Some(DomainPattern(format!("*.{}", scope)))
    }

    /// Pattern covering all direct subdomains of `scope`
    pub fn for_scope(scope: &str) -> Self {
        DomainPattern(format!("*.{}", scope.trim_start_matches("*.").to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scope without the wildcard label (`app.eth.X` for `*.app.eth.X`)
    pub fn base_form(&self) -> &str {
        self.0.trim_start_matches("*.")
    }

    /// Subject alternative names a certificate for this pattern must carry
    pub fn subject_alt_names(&self) -> Vec<String> {
        vec![self.0.clone(), self.base_form().to_string()]
    }

    /// File-system friendly name (`_.app.eth.X`)
    pub fn file_stem(&self) -> String {
        self.0.replace('*', "_")
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase a Host header or SNI value and strip port, brackets and the
/// trailing root dot. Returns `None` for empty or obviously malformed input.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal, optionally followed by :port
        rest.split(']').next()?
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
            Some(_) => return None,
            None => raw,
        }
    };

    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.contains(['/', ' ', '\\', '@']) {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// `name` equals `suffix` or is a subdomain of it
pub fn matches_suffix(name: &str, suffix: &str) -> bool {
    name == suffix
        || (name.len() > suffix.len()
            && name.ends_with(suffix)
            && name.as_bytes()[name.len() - suffix.len() - 1] == b'.')
}

/// Strip `.<base>` from an ENS host, yielding the ENS name
/// (`blog.vitalik.eth.localhost` -> `blog.vitalik.eth`).
pub fn ens_name_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = normalize_host(host)?;
    let ens_suffix = format!("{}.{}", ENS_LABEL, base_domain);
    if host == ens_suffix || !matches_suffix(&host, &ens_suffix) {
        return None;
    }
    host.strip_suffix(base_domain)
        .and_then(|h| h.strip_suffix('.'))
        .map(str::to_string)
}

/// Pre-computed suffixes for one base domain
#[derive(Debug, Clone)]
pub struct HostSuffixes {
    pub base: String,
    pub ens: String,
    pub node: String,
    pub rpc: String,
}

impl HostSuffixes {
    pub fn new(base_domain: &str) -> Self {
        let base = base_domain.trim_matches('.').to_ascii_lowercase();
        Self {
            ens: format!("{}.{}", ENS_LABEL, base),
            node: format!("{}.{}", NODE_LABEL, base),
            rpc: format!("{}.{}.{}", RPC_LABEL, NODE_LABEL, base),
            base,
        }
    }

    /// The pattern served by the root-signed default certificate
    pub fn default_pattern(&self) -> DomainPattern {
        DomainPattern::for_scope(&self.ens)
    }

    /// The pattern served by the root-signed admin certificate
    pub fn admin_pattern(&self) -> DomainPattern {
        DomainPattern::for_scope(&self.node)
    }

    pub fn is_admin_host(&self, host: &str) -> bool {
        matches_suffix(host, &self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pattern_from_nested_name() {
        let p = DomainPattern::derive("blog.app.eth.localhost", "localhost").unwrap();
        assert_eq!(p.as_str(), "*.app.eth.localhost");
        assert_eq!(p.base_form(), "app.eth.localhost");
    }

    #[test]
    fn test_pattern_from_top_level_name() {
        let p = DomainPattern::derive("vitalik.eth.localhost", "localhost").unwrap();
        assert_eq!(p.as_str(), "*.eth.localhost");
    }

    #[test]
    fn test_pattern_for_single_label() {
        let p = DomainPattern::derive("eth.localhost", "localhost").unwrap();
        assert_eq!(p.as_str(), "*.eth.localhost");
    }

    #[test]
    fn test_pattern_outside_base() {
        assert!(DomainPattern::derive("example.com", "localhost").is_none());
        assert!(DomainPattern::derive("localhost", "localhost").is_none());
        assert!(DomainPattern::derive("notlocalhost", "localhost").is_none());
        assert!(DomainPattern::derive("a..eth.localhost", "localhost").is_none());
    }

    #[test]
    fn test_pattern_ignores_case_and_port() {
        let a = DomainPattern::derive("Blog.App.ETH.localhost:443", "localhost").unwrap();
        let b = DomainPattern::derive("news.app.eth.localhost", "localhost").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_subject_alt_names() {
        let p = DomainPattern::for_scope("app.eth.localhost");
        assert_eq!(
            p.subject_alt_names(),
            vec!["*.app.eth.localhost".to_string(), "app.eth.localhost".to_string()]
        );
        assert_eq!(p.file_stem(), "_.app.eth.localhost");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Vitalik.ETH.localhost:8443"), Some("vitalik.eth.localhost".into()));
        assert_eq!(normalize_host("node.localhost."), Some("node.localhost".into()));
        assert_eq!(normalize_host("[::1]:443"), Some("::1".into()));
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host("host:abc"), None);
    }

    #[test]
    fn test_suffix_matching() {
        assert!(matches_suffix("node.localhost", "node.localhost"));
        assert!(matches_suffix("admin.node.localhost", "node.localhost"));
        assert!(!matches_suffix("xnode.localhost", "node.localhost"));
    }

    #[test]
    fn test_ens_name_from_host() {
        assert_eq!(
            ens_name_from_host("blog.vitalik.eth.localhost:443", "localhost"),
            Some("blog.vitalik.eth".to_string())
        );
        assert_eq!(ens_name_from_host("eth.localhost", "localhost"), None);
        assert_eq!(ens_name_from_host("node.localhost", "localhost"), None);
    }

    #[test]
    fn test_host_suffixes() {
        let s = HostSuffixes::new("localhost");
        assert_eq!(s.rpc, "ethereum.node.localhost");
        assert_eq!(s.default_pattern().as_str(), "*.eth.localhost");
        assert_eq!(s.admin_pattern().as_str(), "*.node.localhost");
        assert!(s.is_admin_host("admin.node.localhost"));
    }

    proptest! {
        #[test]
        fn prop_pattern_is_pure(labels in proptest::collection::vec("[a-z0-9]{1,8}", 1..5)) {
            let host = format!("{}.eth.localhost", labels.join("."));
            let a = DomainPattern::derive(&host, "localhost");
            let b = DomainPattern::derive(&host.to_uppercase(), "localhost");
            prop_assert_eq!(a.clone(), b);
            let pattern = a.unwrap();
            prop_assert!(pattern.as_str().starts_with("*."));
            prop_assert!(matches_suffix(pattern.base_form(), "eth.localhost"));
        }
    }
}
