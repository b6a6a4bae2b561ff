// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Type marker placed on every discovery response.
pub const SECRET_TYPE_URL: &str = "type.googleapis.com/envoy.api.v2.auth.Secret";

/// Stream metadata key carrying the workload's credential token.
pub const CREDENTIAL_TOKEN_HEADER_KEY: &str = "authorization";

pub const DEFAULT_SDS_UDS_PATH: &str = "/var/run/sds/uds_path";
pub const DEFAULT_CA_ENDPOINT: &str = "https://istio-citadel:8060";
pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(3600); // 1 hour
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(600); // 10 minutes
pub const DEFAULT_ROTATION_GRACE: Duration = Duration::from_secs(900); // rotate 15m before expiry
pub const DEFAULT_EVICTION_DURATION: Duration = Duration::from_secs(86400); // 24 hours
pub const DEFAULT_MAX_STREAMS: usize = 100_000;

pub const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

/// Authentication failures tolerated on one stream before it is closed.
pub const MAX_AUTH_FAILURES: u32 = 3;

/// Time allowed for a client to send its headers frame after connecting.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(10);

/// Time open streams get to wind down once the server stops accepting.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const PUSH_CHANNEL_CAPACITY: usize = 1;
pub const REQUEST_CHANNEL_CAPACITY: usize = 16;
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// Validation constants for DiscoveryRequest
pub const MAX_NODE_ID_LENGTH: u64 = 1024;
pub const MAX_RESOURCE_NAME_LENGTH: u64 = 2048;
