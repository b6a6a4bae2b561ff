// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use validator::Validate;
use zeroize::ZeroizeOnDrop;

use crate::constants::{MAX_NODE_ID_LENGTH, MAX_RESOURCE_NAME_LENGTH, SECRET_TYPE_URL};

/// Key material issued for one workload identity.
///
/// Never mutated after issuance: rotation builds a new `Secret` and swaps the
/// shared pointer held by the cache.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Secret {
    #[zeroize(skip)]
    pub identity: String,
    /// PEM certificates, leaf first.
    #[zeroize(skip)]
    pub cert_chain: Vec<String>,
    /// PEM-encoded private key.
    pub private_key: Vec<u8>,
    #[zeroize(skip)]
    pub created_at: SystemTime,
    #[zeroize(skip)]
    pub expires_at: SystemTime,
}

impl Secret {
    pub fn new(
        identity: impl Into<String>,
        cert_chain: Vec<String>,
        private_key: Vec<u8>,
        created_at: SystemTime,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            identity: identity.into(),
            cert_chain,
            private_key,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Lifetime left at `now`, zero once expired.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// The chain as a single PEM bundle.
    pub fn chain_pem(&self) -> Vec<u8> {
        ca_client::chain::concat_chain(&self.cert_chain)
    }
}

// Custom Debug implementation to prevent accidental logging of key material
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("identity", &self.identity)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cluster: String,
}

/// Status attached by a client that rejected the previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub version_info: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_node"))]
    pub node: Option<Node>,

    #[serde(default)]
    #[validate(custom(function = "validate_resource_names"))]
    pub resource_names: Vec<String>,

    #[serde(default)]
    pub type_url: String,

    #[serde(default)]
    pub response_nonce: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    /// A request for `resource_name` on behalf of node `node_id`.
    pub fn new(node_id: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            node: Some(Node {
                id: node_id.into(),
                cluster: String::new(),
            }),
            resource_names: vec![resource_name.into()],
            type_url: SECRET_TYPE_URL.to_string(),
            ..Default::default()
        }
    }

    /// Acknowledges `response` on the same resource.
    pub fn ack(&self, response: &DiscoveryResponse) -> Self {
        Self {
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
            ..self.clone()
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node
            .as_ref()
            .map(|node| node.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

fn validate_node(node: &Node) -> Result<(), validator::ValidationError> {
    if node.id.len() as u64 > MAX_NODE_ID_LENGTH {
        return Err(validator::ValidationError::new("node_id_too_long"));
    }
    Ok(())
}

fn validate_resource_names(names: &[String]) -> Result<(), validator::ValidationError> {
    if names
        .iter()
        .any(|name| name.len() as u64 > MAX_RESOURCE_NAME_LENGTH)
    {
        return Err(validator::ValidationError::new("resource_name_too_long"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    #[serde(default)]
    pub resources: Vec<SecretResource>,
    pub type_url: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResource {
    pub name: String,
    pub tls_certificate: TlsCertificate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCertificate {
    pub certificate_chain: DataSource,
    pub private_key: DataSource,
}

/// Bytes carried inline in a response, base64 encoded on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct DataSource {
    #[serde(with = "inline_bytes")]
    pub inline_bytes: Vec<u8>,
}

impl DataSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inline_bytes: bytes,
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("inline_bytes_len", &self.inline_bytes.len())
            .finish()
    }
}

mod inline_bytes {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
