// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Certificate authority client used by the node agent.
//!
//! Turns a workload identity into a signed certificate chain: a fresh key
//! pair and CSR are generated locally ([`generate_csr`]) and the CSR is
//! submitted to one of the supported CA backends behind [`CaClient`].

pub mod chain;
pub mod citadel;
pub mod constants;
pub mod csr;
pub mod errors;
pub mod google;
pub mod models;
pub mod provider;
#[cfg(feature = "testing")]
pub mod testing;

pub use csr::generate_csr;
pub use errors::CaError;
pub use models::{CsrBundle, SignRequest};
pub use provider::{CaClient, CaClientConfig, ProviderKind, new_ca_client};
