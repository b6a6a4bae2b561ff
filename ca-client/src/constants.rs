// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Path of the certificate signing endpoint on a self-hosted CA.
pub const CITADEL_SIGN_PATH: &str = "/v1alpha1/certificate:create";

/// Path of the certificate signing endpoint on the vendor-hosted CA.
pub const GOOGLE_CA_SIGN_PATH: &str = "/v1alpha1/projects/-/certificates:create";

/// Default request timeout for a single signing call.
pub const DEFAULT_CA_TIMEOUT: Duration = Duration::from_secs(10);

/// Default validity requested for issued certificates.
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on a CA response body (1 MB); chains are a few KB.
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// URI scheme of workload identities placed in CSR subject alternative names.
pub const URI_SCHEME: &str = "spiffe://";

/// Organization placed in the CSR subject.
pub const CSR_ORGANIZATION: &str = "node-agent";
