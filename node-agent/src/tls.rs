// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Optional TLS on the discovery socket.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
};

/// Builds an acceptor serving the certificate chain in `cert` with the key in `key`.
pub fn build_tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    if certs.is_empty() {
        bail!("no certificate found in {}", cert.display());
    }
    let key = load_key(key)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("selecting TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS config")?;

    tracing::info!("[tls] serving certificate from {}", cert.display());

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening certificate {}", path.display()))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening private key {}", path.display()))?,
    );
    match rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading private key {}", path.display()))?
    {
        Some(key) => Ok(key),
        None => bail!("no private key found in {}", path.display()),
    }
}
