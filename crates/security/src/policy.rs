//! Content-Security-Policy assembly.
//!
//! A policy is rebuilt for every response: a fresh nonce, the fixed directive
//! layout for the environment, and one `report-uri` carrying the current
//! report key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SecurityError, SecurityResult};
use crate::keys::SecretKeyManager;
use crate::nonce::{Nonce, NonceGenerator};

/// Name of the response header carrying the policy.
pub const CSP_HEADER: &str = "Content-Security-Policy";

/// Name of the single reporting directive.
pub const REPORT_DIRECTIVE: &str = "report-uri";

/// Query parameter carrying the report key.
pub const REPORT_KEY_PARAM: &str = "key";

/// Third-party origins scripts may load from: RPC providers, wallet relays,
/// collaboration and CDN hosts.
pub const TRUSTED_SCRIPT_SOURCES: &[&str] = &[
    "https://*.infura.io",
    "https://*.alchemyapi.io",
    "https://*.walletconnect.org",
    "https://*.walletconnect.com",
    "https://*.firebaseio.com",
    "https://*.googleapis.com",
    "https://*.moonpay.com",
    "https://cdn.jsdelivr.net",
];

/// Origins the page may open connections to.
pub const TRUSTED_CONNECT_SOURCES: &[&str] = &[
    "https://*.infura.io",
    "wss://*.infura.io",
    "https://*.alchemyapi.io",
    "wss://*.alchemyapi.io",
    "https://*.walletconnect.org",
    "wss://*.walletconnect.org",
    "wss://*.walletconnect.com",
    "wss://www.walletlink.org",
    "https://*.firebaseio.com",
    "wss://*.firebaseio.com",
    "https://firestore.googleapis.com",
    "https://api.coingecko.com",
];

const TRUSTED_FRAME_SOURCES: &[&str] = &["https://*.walletconnect.org", "https://*.moonpay.com"];

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Production
    }
}

impl std::str::FromStr for Environment {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(SecurityError::InvalidConfiguration(format!(
                "unknown environment: {}",
                other
            ))),
        }
    }
}

/// A single directive: a name followed by its source expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CspDirective {
    name: String,
    sources: Vec<String>,
}

impl CspDirective {
    pub fn new<I, S>(name: &str, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    /// A directive without sources, such as `upgrade-insecure-requests`.
    pub fn flag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sources: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl std::fmt::Display for CspDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        for source in &self.sources {
            write!(f, " {}", source)?;
        }
        Ok(())
    }
}

/// Assembler settings.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub environment: Environment,
    /// Report endpoint; the key is appended as a query parameter.
    pub report_endpoint: Url,
    /// Extra script origins on top of [`TRUSTED_SCRIPT_SOURCES`].
    pub extra_script_sources: Vec<String>,
    /// Extra connect origins on top of [`TRUSTED_CONNECT_SOURCES`].
    pub extra_connect_sources: Vec<String>,
}

impl PolicyConfig {
    pub fn new(environment: Environment, report_endpoint: Url) -> Self {
        Self {
            environment,
            report_endpoint,
            extra_script_sources: Vec::new(),
            extra_connect_sources: Vec::new(),
        }
    }
}

/// The nonce and directive list produced for one response.
#[derive(Debug)]
pub struct AssembledPolicy {
    pub nonce: Nonce,
    pub directives: Vec<CspDirective>,
}

impl AssembledPolicy {
    /// The header value: directives joined by `"; "`.
    pub fn header_value(&self) -> String {
        self.directives
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn directive(&self, name: &str) -> Option<&CspDirective> {
        self.directives.iter().find(|d| d.name() == name)
    }

    pub fn report_directive(&self) -> Option<&CspDirective> {
        self.directive(REPORT_DIRECTIVE)
    }

    /// The report key embedded in the reporting directive.
    pub fn report_key(&self) -> Option<String> {
        let endpoint = self.report_directive()?.sources().first()?;
        let url = Url::parse(endpoint).ok()?;
        url.query_pairs()
            .find(|(name, _)| name == REPORT_KEY_PARAM)
            .map(|(_, value)| value.into_owned())
    }
}

/// Builds the policy for each response.
#[derive(Debug)]
pub struct PolicyAssembler {
    keys: Arc<SecretKeyManager>,
    nonces: NonceGenerator,
    config: PolicyConfig,
}

impl PolicyAssembler {
    pub fn new(keys: Arc<SecretKeyManager>, config: PolicyConfig) -> Self {
        Self {
            keys,
            nonces: NonceGenerator::new(),
            config,
        }
    }

    pub fn environment(&self) -> Environment {
        self.config.environment
    }

    /// Produce a nonce and the full directive list.
    ///
    /// Fails when the key manager cannot supply a usable key; callers must
    /// then not ship a policy at all.
    pub async fn get_directives(&self) -> SecurityResult<AssembledPolicy> {
        let nonce = self.nonces.generate()?;
        let key = self.keys.current_key().await?;

        let mut report_url = self.config.report_endpoint.clone();
        report_url
            .query_pairs_mut()
            .append_pair(REPORT_KEY_PARAM, key.reference());

        let mut directives = self.base_directives(&nonce);
        directives.push(CspDirective::new(REPORT_DIRECTIVE, [report_url.to_string()]));

        Ok(AssembledPolicy { nonce, directives })
    }

    fn base_directives(&self, nonce: &Nonce) -> Vec<CspDirective> {
        let dev = self.config.environment.is_development();

        let mut script = vec!["'self'".to_string()];
        if dev {
            // A nonce would make browsers ignore 'unsafe-inline'.
            script.extend(
                ["'unsafe-inline'", "'unsafe-eval'", "http://localhost:*"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        } else {
            script.push(nonce.source_expression());
        }
        script.extend(TRUSTED_SCRIPT_SOURCES.iter().map(|s| s.to_string()));
        script.extend(self.config.extra_script_sources.iter().cloned());

        let mut connect = vec!["'self'".to_string()];
        if dev {
            connect.extend(
                ["ws://localhost:*", "wss://localhost:*", "http://localhost:*"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        connect.extend(TRUSTED_CONNECT_SOURCES.iter().map(|s| s.to_string()));
        connect.extend(self.config.extra_connect_sources.iter().cloned());

        let mut frame = vec!["'self'".to_string()];
        frame.extend(TRUSTED_FRAME_SOURCES.iter().map(|s| s.to_string()));

        let mut directives = vec![
            CspDirective::new("default-src", ["'self'"]),
            CspDirective::new("script-src", script),
            CspDirective::new("style-src", ["'self'", "'unsafe-inline'", "https://fonts.googleapis.com"]),
            CspDirective::new("font-src", ["'self'", "https://fonts.gstatic.com", "data:"]),
            CspDirective::new("img-src", ["'self'", "data:", "https:", "blob:"]),
            CspDirective::new("connect-src", connect),
            CspDirective::new("frame-src", frame),
            CspDirective::new("worker-src", ["'self'", "blob:"]),
            CspDirective::new("manifest-src", ["'self'"]),
            CspDirective::new("media-src", ["'self'"]),
            CspDirective::new("object-src", ["'none'"]),
            CspDirective::new("base-uri", ["'self'"]),
            CspDirective::new("form-action", ["'self'"]),
            CspDirective::new("frame-ancestors", ["'self'"]),
        ];
        if !dev {
            directives.push(CspDirective::flag("upgrade-insecure-requests"));
        }
        directives
    }
}

/// Whether `source` fits in a directive as a single source expression.
///
/// A separator inside it would inject further sources or directives.
pub fn is_source_expression(source: &str) -> bool {
    !source.is_empty()
        && !source
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == ';' || c == ',')
}

/// Static security headers shipped alongside the policy on navigations.
pub fn companion_headers(environment: Environment) -> Vec<(&'static str, &'static str)> {
    let mut headers = vec![
        ("X-Content-Type-Options", "nosniff"),
        ("X-Frame-Options", "SAMEORIGIN"),
        ("Referrer-Policy", "strict-origin-when-cross-origin"),
        (
            "Permissions-Policy",
            "camera=(), microphone=(), geolocation=(), interest-cohort=(), payment=(), usb=(), bluetooth=()",
        ),
    ];
    if !environment.is_development() {
        headers.push(("Strict-Transport-Security", "max-age=31536000; includeSubDomains"));
        headers.push(("Cross-Origin-Opener-Policy", "same-origin"));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::KeyManagerConfig;
    use crate::secrets::InMemorySecretsBackend;
    use pretty_assertions::assert_eq;

    async fn assembler(environment: Environment) -> (Arc<SecretKeyManager>, PolicyAssembler) {
        let keys = Arc::new(SecretKeyManager::with_clock(
            Arc::new(InMemorySecretsBackend::new()),
            KeyManagerConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        keys.initialize().await.unwrap();
        let endpoint = Url::parse("https://edge.example.com/csp-report").unwrap();
        let assembler = PolicyAssembler::new(keys.clone(), PolicyConfig::new(environment, endpoint));
        (keys, assembler)
    }

    #[tokio::test]
    async fn test_single_report_directive_with_current_key() {
        let (keys, assembler) = assembler(Environment::Production).await;
        let policy = assembler.get_directives().await.unwrap();
        let key = keys.current_key().await.unwrap();

        let reports = policy
            .directives
            .iter()
            .filter(|d| d.name() == REPORT_DIRECTIVE)
            .count();
        assert_eq!(reports, 1);
        assert_eq!(policy.report_key().as_deref(), Some(key.reference()));
    }

    #[tokio::test]
    async fn test_production_script_src_uses_nonce() {
        let (_keys, assembler) = assembler(Environment::Production).await;
        let policy = assembler.get_directives().await.unwrap();
        let script = policy.directive("script-src").unwrap();

        assert!(script.sources().contains(&policy.nonce.source_expression()));
        assert!(!script.sources().iter().any(|s| s == "'unsafe-inline'"));
        assert!(script.sources().iter().any(|s| s == "https://*.walletconnect.org"));
        assert!(policy.directive("upgrade-insecure-requests").is_some());
    }

    #[tokio::test]
    async fn test_development_relaxes_script_src() {
        let (_keys, assembler) = assembler(Environment::Development).await;
        let policy = assembler.get_directives().await.unwrap();
        let script = policy.directive("script-src").unwrap();

        assert!(script.sources().iter().any(|s| s == "'unsafe-eval'"));
        assert!(script.sources().iter().any(|s| s == "'unsafe-inline'"));
        assert!(policy.directive("upgrade-insecure-requests").is_none());
    }

    #[tokio::test]
    async fn test_fixed_directives_present() {
        let (_keys, assembler) = assembler(Environment::Production).await;
        let policy = assembler.get_directives().await.unwrap();
        let header = policy.header_value();

        for expected in [
            "object-src 'none'",
            "base-uri 'self'",
            "form-action 'self'",
            "frame-ancestors 'self'",
        ] {
            assert!(header.contains(expected), "missing {}", expected);
        }
        assert!(header.starts_with("default-src 'self'; script-src"));
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_call() {
        let (_keys, assembler) = assembler(Environment::Production).await;
        let a = assembler.get_directives().await.unwrap();
        let b = assembler.get_directives().await.unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_directive_display() {
        assert_eq!(CspDirective::new("object-src", ["'none'"]).to_string(), "object-src 'none'");
        assert_eq!(CspDirective::flag("upgrade-insecure-requests").to_string(), "upgrade-insecure-requests");
    }

    #[test]
    fn test_companion_headers_by_environment() {
        let prod = companion_headers(Environment::Production);
        let dev = companion_headers(Environment::Development);
        assert!(prod.iter().any(|(name, _)| *name == "Strict-Transport-Security"));
        assert!(!dev.iter().any(|(name, _)| *name == "Strict-Transport-Security"));
    }

    #[test]
    fn test_source_expression_check() {
        assert!(is_source_expression("https://cdn.example.com"));
        assert!(is_source_expression("'sha256-abc='"));
        assert!(!is_source_expression(""));
        assert!(!is_source_expression("https://a.example; script-src *"));
        assert!(!is_source_expression("https://a.example, default-src *"));
        assert!(!is_source_expression("https://a.example *"));
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("staging".parse::<Environment>().is_err());
    }
}
