//! TLS material loading and SNI certificate selection

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::config::{CertificateInfo, TlsInfo};
use crate::error::{Error, Result};

/// Picks a certificate by the requested server name, falling back to the
/// default certificate for unknown names and clients without SNI.
pub struct SniResolver {
    default: Arc<CertifiedKey>,
    named: HashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SniResolver {
    fn lookup(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        server_name
            .and_then(|name| self.named.get(&name.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.lookup(client_hello.server_name()))
    }
}

/// Build an acceptor from the default certificate and every named one.
///
/// Any certificate that fails to load fails the whole build; no partial
/// certificate set is ever returned.
pub fn build_acceptor(info: &TlsInfo) -> Result<TlsAcceptor> {
    let default = load_certified_key(&info.default)
        .map_err(|e| Error::TlsConfig(format!("default certificate: {}", e)))?;

    let mut named = HashMap::with_capacity(info.named.len());
    for (hostname, pair) in &info.named {
        let key = load_certified_key(pair)
            .map_err(|e| Error::TlsConfig(format!("certificate for {}: {}", hostname, e)))?;
        named.insert(hostname.to_ascii_lowercase(), key);
    }

    let resolver = SniResolver {
        default,
        named,
    };
    debug!(?resolver, "TLS certificates loaded");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(named = info.named.len(), "TLS configuration built");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certified_key(info: &CertificateInfo) -> std::result::Result<Arc<CertifiedKey>, String> {
    let certs = load_certs(&info.certificate)?;
    let key = load_key(&info.key)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| format!("unsupported private key in {}: {}", info.key.display(), e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certs(path: &Path) -> std::result::Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path)
        .map_err(|e| format!("failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificates from {}: {}", path.display(), e))?;

    if certs.is_empty() {
        return Err(format!("no certificates found in {}", path.display()));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> std::result::Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path)
        .map_err(|e| format!("failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| format!("failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(format!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey as Generated};
    use std::path::PathBuf;

    fn write_pair(dir: &Path, name: &str) -> CertificateInfo {
        let Generated { cert, key_pair } =
            generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let certificate = dir.join(format!("{}.pem", name));
        let key = dir.join(format!("{}.key", name));
        std::fs::write(&certificate, cert.pem()).unwrap();
        std::fs::write(&key, key_pair.serialize_pem()).unwrap();
        CertificateInfo { certificate, key }
    }

    fn resolver_for(info: &TlsInfo) -> SniResolver {
        let default = load_certified_key(&info.default).unwrap();
        let named = info
            .named
            .iter()
            .map(|(h, p)| (h.to_ascii_lowercase(), load_certified_key(p).unwrap()))
            .collect();
        SniResolver { default, named }
    }

    #[test]
    fn test_build_with_default_only() {
        let dir = tempfile::tempdir().unwrap();
        let info = TlsInfo {
            default: write_pair(dir.path(), "localhost"),
            named: Default::default(),
        };
        assert!(build_acceptor(&info).is_ok());
    }

    #[test]
    fn test_missing_default_certificate_fails() {
        let info = TlsInfo {
            default: CertificateInfo {
                certificate: PathBuf::from("/nonexistent/cert.pem"),
                key: PathBuf::from("/nonexistent/key.pem"),
            },
            named: Default::default(),
        };
        let err = build_acceptor(&info).err().expect("build should fail");
        assert!(matches!(err, Error::TlsConfig(_)));
        assert!(err.to_string().contains("default certificate"));
    }

    #[test]
    fn test_one_bad_named_certificate_fails_whole_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = TlsInfo {
            default: write_pair(dir.path(), "localhost"),
            named: Default::default(),
        };
        info.named
            .insert("a.example.com".to_string(), write_pair(dir.path(), "a.example.com"));
        info.named.insert(
            "b.example.com".to_string(),
            CertificateInfo {
                certificate: dir.path().join("missing.pem"),
                key: dir.path().join("missing.key"),
            },
        );

        let err = build_acceptor(&info).err().expect("build should fail");
        assert!(err.to_string().contains("b.example.com"));
    }

    #[test]
    fn test_key_file_without_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut pair = write_pair(dir.path(), "localhost");
        pair.key = pair.certificate.clone();
        let info = TlsInfo {
            default: pair,
            named: Default::default(),
        };
        let err = build_acceptor(&info).err().expect("build should fail");
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_resolver_selects_by_server_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = TlsInfo {
            default: write_pair(dir.path(), "localhost"),
            named: Default::default(),
        };
        info.named
            .insert("A.example.com".to_string(), write_pair(dir.path(), "a.example.com"));
        let resolver = resolver_for(&info);

        let default_cert = resolver.lookup(None).cert[0].clone();
        let named_cert = resolver.lookup(Some("a.example.com")).cert[0].clone();
        let upper_cert = resolver.lookup(Some("A.EXAMPLE.COM")).cert[0].clone();
        let unknown_cert = resolver.lookup(Some("other.example.com")).cert[0].clone();

        assert_ne!(default_cert, named_cert);
        assert_eq!(named_cert, upper_cert);
        assert_eq!(default_cert, unknown_cert);
    }
}
