// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # Node Agent
//!
//! A per-node security agent that hands short-lived TLS secrets (certificate
//! chain and private key) to local workload proxies over a Unix-domain
//! socket, and keeps them fresh by signing CSRs with a certificate authority.
//!
//! ## Architecture
//!
//! ```text
//! Proxy -> UDS (frames) -> Server -> SdsService -> SecretCache -> CaClient -> CA
//!                                       ^               |
//!                                       |               v
//!                                    Registry <--- SecretEvent (rotated / evicted)
//! ```
//!
//! - **Discovery**: unary fetch, and streams that are pushed a new secret
//!   whenever the cached one is rotated
//! - **Secret cache**: single-flight issuance, rotation before expiry,
//!   eviction of unused or unrenewable secrets
//! - **Registry**: one live stream per workload identity with coalescing
//!   push signals
//!
//! ## Modules
//!
//! - [`cache`]: secret cache and rotation task
//! - [`client`]: client for the discovery socket
//! - [`configuration`]: CLI argument parsing with clap
//! - [`connection`]: per-stream state machine and receive task
//! - [`constants`]: defaults and limits
//! - [`errors`]: application error type with wire error codes
//! - [`models`]: secrets and discovery messages with validation
//! - [`protocol`]: length-prefixed frame protocol
//! - [`registry`]: active streams keyed by workload identity
//! - [`server`]: socket listener and stream dispatch
//! - [`service`]: discovery request handling
//! - [`tls`]: optional TLS on the socket
//!
//! ## Usage
//!
//! ```bash
//! node-agent --sds-uds-path /var/run/sds/uds_path --ca-endpoint https://istio-citadel:8060
//! ```
//!
//! ## Security Considerations
//!
//! - Private keys are zeroized on drop and never logged
//! - Every request names exactly one workload identity and carries a credential
//! - Frames are capped at 10 MB
//! - Internal error details are not sent to clients

pub mod cache;
pub mod client;
pub mod configuration;
pub mod connection;
pub mod constants;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod tls;
