//! # OCPP Engine
//!
//! Message transport and dispatch for OCPP charging stations, networking
//! nodes and CSMS backends.
//!
//! ## Architecture
//!
//! ```text
//!  Charging Station            Networking Node                 CSMS
//! ┌────────────────┐         ┌────────────────┐         ┌────────────────┐
//! │ NetworkingNode │◄──WS───►│ NetworkingNode │◄──WS───►│ NetworkingNode │
//! └────────────────┘         └────────────────┘         └────────────────┘
//!
//! each node:
//! ┌──────────────────────────────────────────────────────────────┐
//! │ transport ─► codec ─► signature ─► dispatch ─► signature ─►  │
//! │   codec ─► source routing ─► reporter ─► transport           │
//! │                                                              │
//! │ outbound: signature ─► source routing ─► correlator ─►       │
//! │   reporter ─► transport ... response ─► correlator ─► caller │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | `ocpp` | text and binary envelope codec, message schemas |
//! | `routing` | network paths, source routing, connection table |
//! | `correlation` | pending requests, timeouts, cancellation |
//! | `signature` | signing and verification rules |
//! | `dispatch` | action registry and subscriber fan-out |
//! | `reporter` | per-transmission result reporting |
//! | `node` | the above wired into one networking node |
//! | `transport` | connection trait, in-memory and WebSocket transports |
//!
//! ## Usage
//!
//! ```no_run
//! use chrono::Utc;
//! use ocpp_engine::ocpp::types::{HeartbeatRequest, HeartbeatResponse};
//! use ocpp_engine::{transport, EngineConfig, NetworkingNode, Reply, SourceRouting};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let csms = NetworkingNode::new(EngineConfig::new("CSMS"));
//!     let station = NetworkingNode::new(EngineConfig::new("CS001"));
//!     transport::link(&csms, &station, 64);
//!
//!     csms.router().register::<HeartbeatRequest, _, _>(|_| async {
//!         Ok(Reply::Respond(HeartbeatResponse { current_time: Utc::now() }))
//!     })?;
//!
//!     let outcome = station
//!         .outbound()
//!         .request(&SourceRouting::to("CSMS"), &HeartbeatRequest {})
//!         .await?;
//!     println!("{:?}", outcome.response());
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod ocpp;
pub mod reporter;
pub mod routing;
pub mod signature;
pub mod transport;

pub use config::EngineConfig;
pub use error::EngineError;
pub use node::{NetworkingNode, Outbound};

// Re-export key types
pub use correlation::{CancelToken, NextHop, Outcome, PendingResponse, RequestOutcome};
pub use dispatch::{
    CallContext, DispatchRouter, Dispatched, HandlerError, IncomingRequest, OcppRequest,
    OcppResponse, Reply, SubscriptionId,
};
pub use ocpp::{Call, CallError, CallResult, ErrorCode, OcppMessage, Payload, RequestId};
pub use reporter::{SentMessageObserver, SentMessageReport, SentMessageResult};
pub use routing::{ConnectionId, NetworkPath, NodeId, RoutingError, SourceRouting};
pub use signature::{Direction, Enforcement, KeyMaterial, SignaturePolicy, SignatureRule};
