//! Self-hosted certificate authority.
//!
//! Layout of the certificate directory:
//!
//! ```text
//! root.crt            self-signed root, the only file users install
//! root.key            only written when the root key is not hardened
//! intermediate.crt    root-signed, name-constrained to eth.<base>
//! intermediate.key
//! server.key          the single key shared by every leaf
//! default.crt         root-signed *.eth.<base>
//! admin.crt           root-signed *.node.<base>
//! leaves/*.crt        intermediate-signed leaves generated on demand
//! ```
//!
//! ## Security Notes
//! - Private keys are written with 0600 permissions
//! - In hardened mode the root key exists only inside [`CertificateAuthority::initialize`]
//!   and is dropped once the intermediate and the well-known leaves are signed
//! - Leaves outside the intermediate's permitted subtree are refused before
//!   signing, the same rule a verifying client applies

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use log::{debug, info, warn};
use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, GeneralSubtree, IsCa, KeyPair, KeyUsagePurpose, NameConstraints,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::{CertifiedKey, SigningKey};

use crate::domain::{matches_suffix, DomainPattern, HostSuffixes};
use crate::error::GatewayError;
use crate::lock_utils::{lock_or_recover, read_or_recover, write_or_recover};
use crate::trust_store::{InstallOutcome, TrustStore};

const ROOT_COMMON_NAME: &str = "Ethlink Local Root CA";
const INTERMEDIATE_COMMON_NAME: &str = "Ethlink Local Intermediate CA";
const ORGANIZATION: &str = "Ethlink";

const ROOT_VALIDITY_DAYS: i64 = 3650;
const INTERMEDIATE_VALIDITY_DAYS: i64 = 1825;

/// Browsers reject leaves valid for more than 825 days
const LEAF_VALIDITY_DAYS: i64 = 820;

/// Well-known leaves closer than this to expiry trigger a fresh setup
const RENEW_BEFORE_DAYS: i64 = 30;

const KEY_FILE_MODE: u32 = 0o600;
const CERT_FILE_MODE: u32 = 0o644;

/// Options for [`CertificateAuthority::initialize`]
#[derive(Debug, Clone)]
pub struct CaOptions {
    pub cert_dir: PathBuf,
    pub base_domain: String,
    /// Keep the root key in memory only for the duration of setup
    pub hardened_root_key: bool,
}

/// Paths of the files making up the authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPaths {
    pub dir: PathBuf,
    pub root_cert: PathBuf,
    pub root_key: PathBuf,
    pub intermediate_cert: PathBuf,
    pub intermediate_key: PathBuf,
    pub server_key: PathBuf,
    pub default_cert: PathBuf,
    pub admin_cert: PathBuf,
    pub leaves_dir: PathBuf,
}

impl CaPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            root_cert: dir.join("root.crt"),
            root_key: dir.join("root.key"),
            intermediate_cert: dir.join("intermediate.crt"),
            intermediate_key: dir.join("intermediate.key"),
            server_key: dir.join("server.key"),
            default_cert: dir.join("default.crt"),
            admin_cert: dir.join("admin.crt"),
            leaves_dir: dir.join("leaves"),
        }
    }

    /// Files that must all exist for the authority to be reused
    fn required(&self) -> [&Path; 6] {
        [
            &self.root_cert,
            &self.intermediate_cert,
            &self.intermediate_key,
            &self.server_key,
            &self.default_cert,
            &self.admin_cert,
        ]
    }

    pub fn leaf_cert(&self, pattern: &DomainPattern) -> PathBuf {
        self.leaves_dir.join(format!("{}.crt", pattern.file_stem()))
    }
}

/// Which certificate signed a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    Root,
    Intermediate,
}

/// A leaf certificate ready to be served
pub struct LeafCertificate {
    pub pattern: DomainPattern,
    pub cert_pem: String,
    pub signed_by: Signer,
    certified_key: Arc<CertifiedKey>,
}

impl LeafCertificate {
    /// Chain and signing key in the form the TLS stack consumes
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Number of certificates sent in the handshake
    pub fn chain_len(&self) -> usize {
        self.certified_key.cert.len()
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("pattern", &self.pattern)
            .field("signed_by", &self.signed_by)
            .field("chain_len", &self.chain_len())
            .finish()
    }
}

/// Root + intermediate authority issuing leaves for `*.eth.<base>` patterns
pub struct CertificateAuthority {
    paths: CaPaths,
    suffixes: HostSuffixes,
    /// DNS subtree the intermediate may sign for
    permitted_subtree: String,
    root_der: CertificateDer<'static>,
    intermediate_der: CertificateDer<'static>,
    intermediate: Certificate,
    intermediate_key: KeyPair,
    server_key: KeyPair,
    signing_key: Arc<dyn SigningKey>,
    default_leaf: Arc<LeafCertificate>,
    admin_leaf: Arc<LeafCertificate>,
    leaves: RwLock<HashMap<DomainPattern, Arc<LeafCertificate>>>,
    /// Serializes generation so each pattern is signed at most once
    issuance: Mutex<()>,
    generated: AtomicUsize,
    trust_store: Box<dyn TrustStore>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_dir", &self.paths.dir)
            .field("permitted_subtree", &self.permitted_subtree)
            .field("generated", &self.generated_count())
            .finish()
    }
}

/// Material produced by a first-time setup, or loaded back from disk
struct Material {
    root_der: CertificateDer<'static>,
    intermediate: Certificate,
    intermediate_der: CertificateDer<'static>,
    intermediate_key: KeyPair,
    server_key: KeyPair,
    default_der: CertificateDer<'static>,
    default_pem: String,
    admin_der: CertificateDer<'static>,
    admin_pem: String,
}

impl CertificateAuthority {
    /// Open the authority in `options.cert_dir`, creating it when the
    /// on-disk set is incomplete, stale, or constrained to another base
    /// domain. Calling this repeatedly on a complete directory reuses it.
    pub fn initialize(
        options: &CaOptions,
        trust_store: Box<dyn TrustStore>,
    ) -> std::result::Result<Self, GatewayError> {
        Self::open(options, trust_store)
            .map_err(|e| GatewayError::Configuration(format!("certificate authority: {:#}", e)))
    }

    fn open(options: &CaOptions, trust_store: Box<dyn TrustStore>) -> Result<Self> {
        let paths = CaPaths::new(&options.cert_dir);
        let suffixes = HostSuffixes::new(&options.base_domain);
        let permitted_subtree = suffixes.ens.clone();

        fs::create_dir_all(&paths.leaves_dir).with_context(|| {
            format!("Failed to create certificate directory {}", paths.dir.display())
        })?;

        let material = match load_material(&paths, &permitted_subtree) {
            Ok(Some(material)) => {
                debug!("Reusing certificate authority in {}", paths.dir.display());
                material
            }
            Ok(None) => setup(&paths, &suffixes, options.hardened_root_key)?,
            Err(e) => {
                warn!(
                    "Certificate authority in {} is unreadable ({:#}); recreating it",
                    paths.dir.display(),
                    e
                );
                setup(&paths, &suffixes, options.hardened_root_key)?
            }
        };

        if options.hardened_root_key && paths.root_key.exists() {
            fs::remove_file(&paths.root_key).context("Failed to remove root key")?;
            info!("Removed root key from disk (hardened mode)");
        }

        let signing_key = signing_key_for(&material.server_key)?;

        let default_leaf = Arc::new(LeafCertificate {
            pattern: suffixes.default_pattern(),
            cert_pem: material.default_pem,
            signed_by: Signer::Root,
            certified_key: Arc::new(CertifiedKey::new(
                vec![material.default_der, material.root_der.clone()],
                Arc::clone(&signing_key),
            )),
        });
        let admin_leaf = Arc::new(LeafCertificate {
            pattern: suffixes.admin_pattern(),
            cert_pem: material.admin_pem,
            signed_by: Signer::Root,
            certified_key: Arc::new(CertifiedKey::new(
                vec![material.admin_der, material.root_der.clone()],
                Arc::clone(&signing_key),
            )),
        });

        Ok(Self {
            paths,
            suffixes,
            permitted_subtree,
            root_der: material.root_der,
            intermediate_der: material.intermediate_der,
            intermediate: material.intermediate,
            intermediate_key: material.intermediate_key,
            server_key: material.server_key,
            signing_key,
            default_leaf,
            admin_leaf,
            leaves: RwLock::new(HashMap::new()),
            issuance: Mutex::new(()),
            generated: AtomicUsize::new(0),
            trust_store,
        })
    }

    /// Leaf for `pattern`, signed by the intermediate on first use.
    ///
    /// A cached leaf is returned without touching the disk. Patterns outside
    /// the intermediate's permitted subtree are refused.
    pub fn issue_leaf(
        &self,
        pattern: &DomainPattern,
    ) -> std::result::Result<Arc<LeafCertificate>, GatewayError> {
        if let Some(leaf) = read_or_recover(&self.leaves, "leaf certificates").get(pattern) {
            return Ok(Arc::clone(leaf));
        }

        if !matches_suffix(pattern.base_form(), &self.permitted_subtree) {
            return Err(GatewayError::issuance(
                pattern.as_str(),
                format!("outside permitted subtree {}", self.permitted_subtree),
            ));
        }

        let _guard = lock_or_recover(&self.issuance, "leaf issuance");
        // Another handshake may have generated it while we waited
        if let Some(leaf) = read_or_recover(&self.leaves, "leaf certificates").get(pattern) {
            return Ok(Arc::clone(leaf));
        }

        let leaf = self
            .sign_leaf(pattern)
            .map_err(|e| GatewayError::issuance(pattern.as_str(), format!("{:#}", e)))?;
        let leaf = Arc::new(leaf);

        write_or_recover(&self.leaves, "leaf certificates")
            .insert(pattern.clone(), Arc::clone(&leaf));
        self.generated.fetch_add(1, Ordering::SeqCst);
        info!("Issued leaf certificate for {}", pattern);

        Ok(leaf)
    }

    fn sign_leaf(&self, pattern: &DomainPattern) -> Result<LeafCertificate> {
        let params = leaf_params(pattern)?;
        let cert = params
            .signed_by(&self.server_key, &self.intermediate, &self.intermediate_key)
            .context("Failed to sign leaf certificate")?;
        let cert_pem = cert.pem();

        let file = self.paths.leaf_cert(pattern);
        if let Err(e) = write_file(&file, cert_pem.as_bytes(), CERT_FILE_MODE) {
            // The in-memory leaf is all a handshake needs
            warn!("Failed to persist leaf {}: {:#}", file.display(), e);
        }

        let chain = vec![
            cert.der().clone(),
            self.intermediate_der.clone(),
            self.root_der.clone(),
        ];
        Ok(LeafCertificate {
            pattern: pattern.clone(),
            cert_pem,
            signed_by: Signer::Intermediate,
            certified_key: Arc::new(CertifiedKey::new(chain, Arc::clone(&self.signing_key))),
        })
    }

    /// Root-signed leaf for `*.eth.<base>`
    pub fn default_leaf(&self) -> Arc<LeafCertificate> {
        Arc::clone(&self.default_leaf)
    }

    /// Root-signed leaf for `*.node.<base>`
    pub fn admin_leaf(&self) -> Arc<LeafCertificate> {
        Arc::clone(&self.admin_leaf)
    }

    pub fn suffixes(&self) -> &HostSuffixes {
        &self.suffixes
    }

    pub fn paths(&self) -> &CaPaths {
        &self.paths
    }

    /// DER of the root certificate, for clients that pin it
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Number of leaves generated since startup
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn cached_patterns(&self) -> Vec<DomainPattern> {
        let mut patterns: Vec<_> = read_or_recover(&self.leaves, "leaf certificates")
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }

    pub fn install_to_system_trust_store(&self) -> Result<InstallOutcome> {
        self.trust_store.install(&self.paths.root_cert)
    }

    pub fn is_trusted(&self) -> bool {
        self.trust_store.is_trusted(&self.paths.root_cert)
    }

    pub fn manual_install_instructions(&self) -> String {
        self.trust_store.manual_install_instructions(&self.paths.root_cert)
    }

    /// Delete lazily generated leaf files and forget the cached leaves.
    ///
    /// The server key and the well-known leaves stay on disk.
    pub fn cleanup(&self) -> Result<()> {
        write_or_recover(&self.leaves, "leaf certificates").clear();
        remove_leaf_files(&self.paths.leaves_dir)
    }
}

/// Delete every file in `leaves_dir`
pub fn remove_leaf_files(leaves_dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(leaves_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("Failed to list leaf certificates"),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    info!("Removed {} generated leaf certificates", removed);
    Ok(())
}

/// Generate root, intermediate, server key and well-known leaves
fn setup(paths: &CaPaths, suffixes: &HostSuffixes, hardened_root_key: bool) -> Result<Material> {
    info!(
        "Creating certificate authority in {} (hardened root key: {})",
        paths.dir.display(),
        hardened_root_key
    );

    let root_key = KeyPair::generate().context("Failed to generate root key")?;
    let root = root_params()?
        .self_signed(&root_key)
        .context("Failed to self-sign root certificate")?;

    let intermediate_key = KeyPair::generate().context("Failed to generate intermediate key")?;
    let intermediate = intermediate_params(&suffixes.ens)?
        .signed_by(&intermediate_key, &root, &root_key)
        .context("Failed to sign intermediate certificate")?;

    let server_key = KeyPair::generate().context("Failed to generate server key")?;
    let default_cert = leaf_params(&suffixes.default_pattern())?
        .signed_by(&server_key, &root, &root_key)
        .context("Failed to sign default certificate")?;
    let admin_cert = leaf_params(&suffixes.admin_pattern())?
        .signed_by(&server_key, &root, &root_key)
        .context("Failed to sign admin certificate")?;

    write_file(&paths.root_cert, root.pem().as_bytes(), CERT_FILE_MODE)?;
    if !hardened_root_key {
        write_file(&paths.root_key, root_key.serialize_pem().as_bytes(), KEY_FILE_MODE)?;
    }
    write_file(&paths.intermediate_cert, intermediate.pem().as_bytes(), CERT_FILE_MODE)?;
    write_file(
        &paths.intermediate_key,
        intermediate_key.serialize_pem().as_bytes(),
        KEY_FILE_MODE,
    )?;
    write_file(&paths.server_key, server_key.serialize_pem().as_bytes(), KEY_FILE_MODE)?;
    write_file(&paths.default_cert, default_cert.pem().as_bytes(), CERT_FILE_MODE)?;
    write_file(&paths.admin_cert, admin_cert.pem().as_bytes(), CERT_FILE_MODE)?;

    // Leaves signed by a previous intermediate no longer chain
    remove_leaf_files(&paths.leaves_dir)?;

    drop(root_key);

    Ok(Material {
        root_der: root.der().clone(),
        intermediate_der: intermediate.der().clone(),
        intermediate,
        intermediate_key,
        server_key,
        default_pem: default_cert.pem(),
        default_der: default_cert.der().clone(),
        admin_pem: admin_cert.pem(),
        admin_der: admin_cert.der().clone(),
    })
}

/// Load a complete, current authority. `Ok(None)` means setup is needed.
fn load_material(paths: &CaPaths, permitted_subtree: &str) -> Result<Option<Material>> {
    if let Some(missing) = paths.required().iter().find(|p| !p.exists()) {
        debug!("Certificate authority incomplete: {} missing", missing.display());
        return Ok(None);
    }

    let intermediate_pem = read_to_string(&paths.intermediate_cert)?;
    let intermediate_params = CertificateParams::from_ca_cert_pem(&intermediate_pem)
        .context("Failed to parse intermediate certificate")?;

    if let Some(constraints) = &intermediate_params.name_constraints {
        let matches = constraints.permitted_subtrees.iter().any(
            |subtree| matches!(subtree, GeneralSubtree::DnsName(name) if name == permitted_subtree),
        );
        if !matches {
            info!("Intermediate is constrained to another base domain; recreating authority");
            return Ok(None);
        }
    }
    if expires_soon(&intermediate_params) {
        info!("Intermediate certificate is about to expire; recreating authority");
        return Ok(None);
    }

    let default_pem = read_to_string(&paths.default_cert)?;
    let admin_pem = read_to_string(&paths.admin_cert)?;
    for pem in [&default_pem, &admin_pem] {
        let params = CertificateParams::from_ca_cert_pem(pem)
            .context("Failed to parse well-known leaf")?;
        if expires_soon(&params) {
            info!("Well-known leaf is about to expire; recreating authority");
            return Ok(None);
        }
    }

    let intermediate_key = KeyPair::from_pem(&read_to_string(&paths.intermediate_key)?)
        .context("Failed to parse intermediate key")?;
    let server_key = KeyPair::from_pem(&read_to_string(&paths.server_key)?)
        .context("Failed to parse server key")?;

    // An issuer only needs the subject name and key of the intermediate
    let intermediate = intermediate_params
        .self_signed(&intermediate_key)
        .context("Failed to rebuild intermediate issuer")?;

    Ok(Some(Material {
        root_der: first_cert(&read_to_string(&paths.root_cert)?)?,
        intermediate_der: first_cert(&intermediate_pem)?,
        intermediate,
        intermediate_key,
        server_key,
        default_der: first_cert(&default_pem)?,
        default_pem,
        admin_der: first_cert(&admin_pem)?,
        admin_pem,
    }))
}

fn root_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(ROOT_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, ROOT_VALIDITY_DAYS);
    Ok(params)
}

fn intermediate_params(permitted_subtree: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(INTERMEDIATE_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.name_constraints = Some(NameConstraints {
        permitted_subtrees: vec![GeneralSubtree::DnsName(permitted_subtree.to_string())],
        excluded_subtrees: vec![],
    });
    params.use_authority_key_identifier_extension = true;
    set_validity(&mut params, INTERMEDIATE_VALIDITY_DAYS);
    Ok(params)
}

fn leaf_params(pattern: &DomainPattern) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(pattern.subject_alt_names())
        .with_context(|| format!("Invalid subject alternative names for {}", pattern))?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, pattern.as_str());
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    set_validity(&mut params, LEAF_VALIDITY_DAYS);
    Ok(params)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

/// Valid from yesterday (clock skew) for `days` days
fn set_validity(params: &mut CertificateParams, days: i64) {
    let start = Utc::now() - chrono::Duration::days(1);
    let end = Utc::now() + chrono::Duration::days(days);
    params.not_before = date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

fn expires_soon(params: &CertificateParams) -> bool {
    let threshold = Utc::now() + chrono::Duration::days(RENEW_BEFORE_DAYS);
    params.not_after.unix_timestamp() < threshold.timestamp()
}

fn signing_key_for(key: &KeyPair) -> Result<Arc<dyn SigningKey>> {
    let der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    rustls::crypto::aws_lc_rs::sign::any_supported_type(&der)
        .map_err(|e| anyhow::anyhow!("Unsupported server key: {}", e))
}

fn first_cert(pem: &str) -> Result<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .context("No certificate in PEM data")?
        .context("Failed to decode certificate PEM")
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
