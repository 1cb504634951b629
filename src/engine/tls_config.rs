use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;

/// Builds a server configuration from a PEM certificate chain and a PEM
/// private key.
pub fn load_tls_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, Error> {
    let cert_chain = read_certificates(cert_path)?;
    let key = read_private_key(key_path)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

/// Builds a client configuration that trusts the PEM certificates in
/// `ca_cert_path`.
pub fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in read_certificates(ca_cert_path)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn read_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|source| Error::TlsCertificateLoad {
        path: path.to_string(),
        source,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("{path}: {e}")))?;
    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "{path}: no certificates found"
        )));
    }
    Ok(chain)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|source| Error::TlsKeyLoad {
        path: path.to_string(),
        source,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("{path}: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("{path}: no private key found")))
}
