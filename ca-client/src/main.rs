// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! `ca-sign`: requests a single certificate from a CA and prints the chain.
//!
//! Useful to verify CA reachability and credentials from a node before the
//! agent is rolled out.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ca_client::chain::concat_chain;
use ca_client::constants::{DEFAULT_CERT_TTL, URI_SCHEME};
use ca_client::{CaClientConfig, ProviderKind, SignRequest, generate_csr, new_ca_client};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workload identity to request a certificate for
    #[arg(long, env("CA_SIGN_IDENTITY"))]
    identity: String,

    /// Base URL of the CA
    #[arg(long, default_value = "https://istio-citadel:8060", env("CA_SIGN_ENDPOINT"))]
    endpoint: String,

    /// CA backend
    #[arg(long, value_enum, default_value_t = ProviderKind::Citadel, env("CA_SIGN_PROVIDER"))]
    provider: ProviderKind,

    /// Requested validity in seconds
    #[arg(long, default_value_t = DEFAULT_CERT_TTL.as_secs(), env("CA_SIGN_TTL_SECS"))]
    ttl_secs: u64,

    /// PEM bundle of roots trusted for the CA's TLS certificate
    #[arg(long, env("CA_SIGN_ROOT_CERT"))]
    root_cert: Option<PathBuf>,

    /// File holding a bearer token for the vendor CA
    #[arg(long, env("CA_SIGN_TOKEN_FILE"))]
    token_file: Option<PathBuf>,

    /// Bearer credential to present instead of the identity
    #[arg(long, env("CA_SIGN_CREDENTIAL"), hide_env_values = true)]
    credential: Option<String>,

    /// Also print the generated private key
    #[arg(long, default_value_t = false)]
    print_key: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with_current_span(false)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if !args.identity.starts_with(URI_SCHEME) {
        bail!("identity must start with {URI_SCHEME}");
    }

    let mut config = CaClientConfig::new(args.endpoint, args.provider);
    config.root_cert = args.root_cert;
    config.token_file = args.token_file;

    let client = new_ca_client(&config).context("unable to create CA client")?;
    let bundle = generate_csr(&args.identity).context("unable to generate CSR")?;

    let mut request = SignRequest::new(
        bundle.csr_pem.clone(),
        args.identity.clone(),
        Duration::from_secs(args.ttl_secs),
    );
    if let Some(credential) = args.credential {
        request = request.with_credential(credential);
    }

    let chain = client
        .sign(&request)
        .await
        .with_context(|| format!("CA {} refused to sign", client.provider()))?;

    tracing::info!(identity = %args.identity, certs = chain.len(), "certificate issued");

    print!("{}", String::from_utf8_lossy(&concat_chain(&chain)));
    if args.print_key {
        print!("{}", bundle.private_key_pem);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_defaults_to_cert_ttl() {
        let args = Args::try_parse_from(["ca-sign", "--identity", "spiffe://a/b"]).unwrap();
        assert_eq!(Duration::from_secs(args.ttl_secs), DEFAULT_CERT_TTL);
        assert_eq!(args.provider, ProviderKind::Citadel);
    }

    #[test]
    fn test_ttl_override() {
        let args =
            Args::try_parse_from(["ca-sign", "--identity", "spiffe://a/b", "--ttl-secs", "60"])
                .unwrap();
        assert_eq!(args.ttl_secs, 60);
    }
}
