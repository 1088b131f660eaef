//! TLS for the duplex channel: the daemon's certificate and trust-on-first-use
//! pinning on the client.

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::config_dir;

const SELF_SIGNED_NAME: &str = "remorad.local";
const KNOWN_HOSTS_HEADER: &str = "# remora known_hosts v1: <host:port>=<sha256 of server certificate>";

/// Where the daemon's certificate and key live on disk.
#[derive(Clone, Debug)]
pub struct ServerIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ServerIdentity {
    /// Both paths or neither; neither means the self-signed pair under the config dir.
    pub fn resolve(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<Self> {
        match (cert, key) {
            (Some(cert_path), Some(key_path)) => Ok(Self { cert_path, key_path }),
            (None, None) => {
                let dir = config_dir();
                Ok(Self {
                    cert_path: dir.join("server-cert.pem"),
                    key_path: dir.join("server-key.pem"),
                })
            }
            _ => bail!("--tls-cert and --tls-key must be given together"),
        }
    }

    /// Writes a fresh self-signed pair unless both files already exist.
    pub fn ensure(&self) -> Result<()> {
        if self.cert_path.exists() && self.key_path.exists() {
            return Ok(());
        }
        for p in [&self.cert_path, &self.key_path] {
            if let Some(dir) = p.parent() {
                fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
        }
        let generated = rcgen::generate_simple_self_signed(vec![SELF_SIGNED_NAME.to_string()])
            .context("generate self-signed certificate")?;
        let cert_pem = generated.serialize_pem().context("encode certificate")?;
        fs::write(&self.cert_path, cert_pem)
            .with_context(|| format!("write {}", self.cert_path.display()))?;
        write_private(&self.key_path, generated.serialize_private_key_pem().as_bytes())?;
        tracing::info!(cert = %self.cert_path.display(), "generated self-signed certificate");
        Ok(())
    }

    fn certificates(&self) -> Result<Vec<CertificateDer<'static>>> {
        let file = fs::File::open(&self.cert_path)
            .with_context(|| format!("open {}", self.cert_path.display()))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::io::Result<Vec<_>>>()
            .context("parse certificate pem")?;
        if certs.is_empty() {
            bail!("no certificate in {}", self.cert_path.display());
        }
        Ok(certs)
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        let file = fs::File::open(&self.key_path)
            .with_context(|| format!("open {}", self.key_path.display()))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .context("parse key pem")?
            .ok_or_else(|| anyhow!("no private key in {}", self.key_path.display()))
    }

    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certificates()?, self.private_key()?)
            .context("build server tls config")
    }
}

/// Generates the pair if needed and returns a ready server config.
pub fn load_or_generate_server_config(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<rustls::ServerConfig> {
    let identity = ServerIdentity::resolve(cert, key)?;
    identity.ensure()?;
    identity.server_config()
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path).with_context(|| format!("open {}", path.display()))?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Pinned server fingerprints, one `host:port=hex` line each.
#[derive(Clone, Debug)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing or unreadable file reads as empty.
    pub fn entries(&self) -> BTreeMap<String, String> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }

    pub fn lookup(&self, endpoint: &str) -> Option<String> {
        self.entries().remove(endpoint)
    }

    pub fn pin(&self, endpoint: &str, fp: &str) -> Result<()> {
        let mut entries = self.entries();
        entries.insert(endpoint.to_string(), fp.to_string());
        self.save(&entries)
    }

    // written beside the target and renamed over it
    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let mut body = String::from(KNOWN_HOSTS_HEADER);
        body.push('\n');
        for (endpoint, fp) in entries {
            body.push_str(&format!("{endpoint}={fp}\n"));
        }
        let staging = self.path.with_extension("tmp");
        write_private(&staging, body.as_bytes())?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Accepts whatever certificate an endpoint shows first, then only that one.
#[derive(Debug)]
struct PinningVerifier {
    endpoint: String,
    hosts: KnownHosts,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let seen = fingerprint(end_entity);
        match self.hosts.lookup(&self.endpoint) {
            Some(pinned) if pinned == seen => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(format!(
                "certificate for {} does not match the pinned fingerprint",
                self.endpoint
            ))),
            None => {
                tracing::info!(endpoint = %self.endpoint, fingerprint = %seen, "pinning server certificate");
                if let Err(e) = self.hosts.pin(&self.endpoint, &seen) {
                    tracing::warn!("could not pin certificate for {}: {e:#}", self.endpoint);
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub fn build_client_config_tofu(host: &str, port: u16, known_path: PathBuf) -> rustls::ClientConfig {
    let verifier = PinningVerifier {
        endpoint: format!("{host}:{port}"),
        hosts: KnownHosts::at(known_path),
        algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
        Err(_) => ServerName::try_from(host.to_string())
            .map_err(|e| anyhow!("invalid server name {host}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts_pin_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = KnownHosts::at(dir.path().join("pins/known_hosts"));
        assert!(hosts.lookup("h:9031").is_none());
        hosts.pin("h:9031", "abcd").unwrap();
        hosts.pin("g:1", "ef01").unwrap();
        hosts.pin("h:9031", "beef").unwrap();
        assert_eq!(hosts.lookup("h:9031").as_deref(), Some("beef"));
        assert_eq!(hosts.entries().len(), 2);
        let text = fs::read_to_string(dir.path().join("pins/known_hosts")).unwrap();
        assert!(text.starts_with('#'));
    }

    #[test]
    fn test_server_name_for() {
        assert!(matches!(server_name_for("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("example.org").unwrap(), ServerName::DnsName(_)));
    }

    #[test]
    fn test_generate_and_load_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("c.pem");
        let key = dir.path().join("k.pem");
        load_or_generate_server_config(Some(cert.clone()), Some(key.clone())).unwrap();
        assert!(cert.exists() && key.exists());
        let first = fs::read(&cert).unwrap();
        // second load reuses the persisted pair
        load_or_generate_server_config(Some(cert.clone()), Some(key)).unwrap();
        assert_eq!(fs::read(&cert).unwrap(), first);
        assert!(load_or_generate_server_config(Some(dir.path().join("x")), None).is_err());
    }
}
