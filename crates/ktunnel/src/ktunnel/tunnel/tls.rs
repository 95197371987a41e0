//! rustls setup for the two control links.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Acceptor for the exposed host's control port. Without files an ephemeral
/// self-signed certificate for `localhost` is generated.
pub fn acceptor(cert_file: &str, key_file: &str) -> anyhow::Result<TlsAcceptor> {
    let (certs, key) = load_or_generate_cert(cert_file, key_file)?;
    let cfg = server_config(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

pub fn connector(insecure_skip_verify: bool, ca_file: &str) -> anyhow::Result<TlsConnector> {
    let cfg = client_config(insecure_skip_verify, ca_file)?;
    Ok(TlsConnector::from(Arc::new(cfg)))
}

/// SNI for dialing `host`; `server_name` wins when set.
pub fn server_name(server_name: &str, host: &str) -> anyhow::Result<ServerName<'static>> {
    let name = server_name.trim();
    let name = if name.is_empty() { host } else { name };
    let name = name.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(name.to_string())
        .with_context(|| format!("tls: invalid server name {name:?}"))
}

pub fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("tls: set both cert_file and key_file, or neither to auto-generate");
        }

        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    tracing::info!("tls: no certificate configured; generating an ephemeral self-signed one");
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(["localhost".to_string()])?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(key) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(key)
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<rustls::ServerConfig> {
    let cfg = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(cfg)
}

pub fn client_config(
    insecure_skip_verify: bool,
    ca_file: &str,
) -> anyhow::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    if insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    let ca_file = ca_file.trim();
    if !ca_file.is_empty() {
        for cert in load_certs(Path::new(ca_file))? {
            roots.add(cert)?;
        }
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM. Exposed hosts with ephemeral certificates need it.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
