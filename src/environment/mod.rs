//! Process-wide environment: cookie storage and TLS policy.
//!
//! Both transports consult a single, process-wide [`Environment`]. It is
//! configured at most once, before the first client is constructed, and is
//! immutable afterwards; clients constructed without an explicit
//! [`configure`] call get the defaults (empty cookie jar, platform trust
//! roots).

use std::sync::Arc;
use std::sync::OnceLock;

use reqwest::cookie::CookieStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use url::Url;

use crate::error::ClientError;

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// TLS validation policy applied to every outbound connection.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicy {
    /// Skip certificate validation entirely. Test and development use only.
    pub accept_invalid_certs: bool,
    /// Additional PEM-encoded root certificates trusted alongside the
    /// platform roots.
    pub extra_root_certs_pem: Vec<String>,
}

/// Settings applied process-wide before the first client exists.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfig {
    /// Cookies seeded into the shared jar, as `Set-Cookie` strings scoped to
    /// a URL.
    pub cookies: Vec<(Url, String)>,
    /// TLS validation policy.
    pub tls: TlsPolicy,
}

/// Install the process-wide environment.
///
/// # Errors
///
/// Returns [`ClientError::EnvironmentLocked`] if the environment was already
/// configured, or if a client has already been constructed (construction
/// locks in the defaults).
pub fn configure(config: EnvironmentConfig) -> Result<(), ClientError> {
    ENVIRONMENT
        .set(Environment::build(config))
        .map_err(|_| ClientError::EnvironmentLocked)
}

/// The environment in effect, initializing defaults on first use.
pub(crate) fn current() -> &'static Environment {
    ENVIRONMENT.get_or_init(|| Environment::build(EnvironmentConfig::default()))
}

/// Shared cookie jar and TLS material, built once.
pub(crate) struct Environment {
    cookie_jar: Arc<reqwest::cookie::Jar>,
    tls: TlsPolicy,
    ws_tls: Arc<rustls::ClientConfig>,
}

impl Environment {
    fn build(config: EnvironmentConfig) -> Self {
        let cookie_jar = Arc::new(reqwest::cookie::Jar::default());
        for (url, cookie) in &config.cookies {
            cookie_jar.add_cookie_str(cookie, url);
        }
        let ws_tls = Arc::new(build_rustls_config(&config.tls));
        Self {
            cookie_jar,
            tls: config.tls,
            ws_tls,
        }
    }

    /// Jar shared with the HTTP client.
    pub(crate) fn cookie_jar(&self) -> Arc<reqwest::cookie::Jar> {
        Arc::clone(&self.cookie_jar)
    }

    /// `Cookie` header value for a request to `url`, if any cookies match.
    pub(crate) fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookie_jar
            .cookies(url)
            .and_then(|v| v.to_str().map(str::to_string).ok())
    }

    /// rustls configuration for WebSocket handshakes.
    pub(crate) fn ws_tls(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.ws_tls)
    }

    /// Whether certificate validation is disabled.
    pub(crate) fn accept_invalid_certs(&self) -> bool {
        self.tls.accept_invalid_certs
    }
}

fn build_rustls_config(tls: &TlsPolicy) -> rustls::ClientConfig {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    if tls.accept_invalid_certs {
        return rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for pem in &tls.extra_root_certs_pem {
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()).flatten() {
            // Unparseable extras are skipped rather than failing startup.
            let _ = roots.add(cert);
        }
    }
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Verifier that accepts any server certificate.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_environment_has_no_cookies() {
        let env = Environment::build(EnvironmentConfig::default());
        let url = Url::parse("https://push.example.com").unwrap();
        assert!(env.cookie_header(&url).is_none());
        assert!(!env.accept_invalid_certs());
    }

    #[test]
    fn seeded_cookies_are_returned_for_matching_host() {
        let url = Url::parse("https://push.example.com").unwrap();
        let env = Environment::build(EnvironmentConfig {
            cookies: vec![(url.clone(), "sid=abc123; Path=/".to_string())],
            tls: TlsPolicy::default(),
        });
        let header = env.cookie_header(&url).unwrap();
        assert!(header.contains("sid=abc123"));

        let other = Url::parse("https://other.example.com").unwrap();
        assert!(env.cookie_header(&other).is_none());
    }

    #[test]
    fn accept_invalid_builds_permissive_config() {
        let env = Environment::build(EnvironmentConfig {
            cookies: vec![],
            tls: TlsPolicy {
                accept_invalid_certs: true,
                extra_root_certs_pem: vec![],
            },
        });
        assert!(env.accept_invalid_certs());
    }
}
