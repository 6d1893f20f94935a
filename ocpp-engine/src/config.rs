//! Configuration for a networking node

use std::time::Duration;

use crate::routing::{NodeId, DEFAULT_MAX_HOPS};
use crate::signature::SignaturePolicy;

/// Complete engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity of this node, stamped into network paths
    pub node_id: NodeId,

    /// Longest network path a message may carry
    pub max_hops: usize,

    /// How long a request waits for its response
    pub request_timeout: Duration,

    /// How long a single transmission may take
    pub transmit_timeout: Duration,

    /// Signing and verification rules
    pub signature_policy: SignaturePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "ocpp-node".to_string(),
            max_hops: DEFAULT_MAX_HOPS,
            request_timeout: Duration::from_secs(30),
            transmit_timeout: Duration::from_secs(10),
            signature_policy: SignaturePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create config for the given node
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set hop limit
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set transmit timeout
    pub fn with_transmit_timeout(mut self, timeout: Duration) -> Self {
        self.transmit_timeout = timeout;
        self
    }

    /// Set signature policy
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }
}
