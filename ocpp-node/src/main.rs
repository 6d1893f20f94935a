//! OCPP Node - networking node CLI
//!
//! Accepts charge points on a WebSocket listener, optionally connects to an
//! upstream CSMS, and relays source-routed OCPP messages between them.
//!
//! # Usage
//!
//! ```bash
//! # Local CSMS-style endpoint
//! ocpp-node --name CSMS --listen 0.0.0.0:8180
//!
//! # Networking node between stations and a CSMS
//! ocpp-node --name NN1 --listen 0.0.0.0:9000 \
//!     --upstream ws://localhost:8180/ocpp --upstream-id CSMS
//!
//! # Require HMAC signatures on every message
//! ocpp-node --name NN1 --listen 0.0.0.0:9000 \
//!     --hmac-key k1:6b6579 --require-signatures
//! ```

mod session;

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use ocpp_engine::ocpp::types::{HeartbeatRequest, HeartbeatResponse};
use ocpp_engine::transport::ws::{WsClient, WsClientConfig, WsListener, WsListenerConfig};
use ocpp_engine::{
    EngineConfig, Enforcement, KeyMaterial, NetworkingNode, Reply, SignaturePolicy, SignatureRule,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::session::Session;

/// OCPP networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identity of this node
    #[arg(short, long)]
    name: String,

    /// Address to accept downstream connections on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream WebSocket URL (the node identity is appended)
    #[arg(long)]
    upstream: Option<String>,

    /// Identity of the upstream node
    #[arg(long, default_value = "CSMS")]
    upstream_id: String,

    /// Sub-protocols to offer and accept, most preferred first (can be repeated)
    #[arg(long)]
    subprotocol: Vec<String>,

    /// Longest network path accepted on relayed messages
    #[arg(long, default_value = "10")]
    max_hops: usize,

    /// Seconds to wait for a response
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// HMAC-SHA256 key as `keyId:hexsecret` (can be repeated)
    #[arg(long)]
    hmac_key: Vec<String>,

    /// Reject unsigned messages instead of accepting them
    #[arg(long)]
    require_signatures: bool,

    /// Vendor reported in BootNotification
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model reported in BootNotification
    #[arg(long, default_value = "EK3-NN")]
    model: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.listen.is_none() && args.upstream.is_none() {
        return Err("nothing to do: pass --listen and/or --upstream".into());
    }

    let config = EngineConfig::new(&args.name)
        .with_max_hops(args.max_hops)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_signature_policy(signature_policy(&args.hmac_key, args.require_signatures)?);

    info!(
        "Starting {} (max hops {}, request timeout {}s)",
        args.name, args.max_hops, args.request_timeout
    );

    let node = NetworkingNode::new(config);
    node.router()
        .register::<HeartbeatRequest, _, _>(|_| async {
            Ok(Reply::Respond(HeartbeatResponse {
                current_time: Utc::now(),
            }))
        })?;

    let mut tasks = Vec::new();

    if let Some(bind_addr) = args.listen {
        let listener = WsListener::new(
            WsListenerConfig::new(bind_addr).with_subprotocols(args.subprotocol.clone()),
            node.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!("Listener stopped: {}", e);
            }
        }));
    }

    if let Some(url) = &args.upstream {
        node.set_default_route(Some(args.upstream_id.clone()));
        let client = WsClient::new(
            WsClientConfig::new(url, args.upstream_id.clone())
                .with_subprotocols(args.subprotocol.clone()),
            node.clone(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = client.run().await {
                error!("Upstream client stopped: {}", e);
            }
        }));

        let session = Session::new(&args.vendor, &args.model);
        tasks.push(tokio::spawn(session::run(
            node.clone(),
            args.upstream_id.clone(),
            session,
        )));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        _ = wait_all(tasks) => info!("All tasks finished"),
    }

    Ok(())
}

async fn wait_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Build the signature policy from `keyId:hex` arguments
fn signature_policy(
    keys: &[String],
    required: bool,
) -> Result<SignaturePolicy, Box<dyn std::error::Error>> {
    if keys.is_empty() {
        if required {
            return Err("--require-signatures needs at least one --hmac-key".into());
        }
        return Ok(SignaturePolicy::new());
    }

    let enforcement = if required {
        Enforcement::Required
    } else {
        Enforcement::Optional
    };
    let mut rule = SignatureRule::new(enforcement);
    for arg in keys {
        let (key_id, secret) = arg
            .split_once(':')
            .ok_or_else(|| format!("invalid --hmac-key {:?}, expected keyId:hex", arg))?;
        let secret = hex::decode(secret)?;
        rule = rule.with_key(key_id, KeyMaterial::hmac_sha256(secret));
        info!("Loaded HMAC key {}", key_id);
    }

    Ok(SignaturePolicy::new().with_rule(rule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_engine::Direction;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "ocpp-node",
            "--name",
            "NN1",
            "--listen",
            "127.0.0.1:9000",
            "--subprotocol",
            "ocpp2.0.1",
            "--subprotocol",
            "ocpp1.6",
        ])
        .unwrap();

        assert_eq!(args.name, "NN1");
        assert_eq!(args.max_hops, 10);
        assert_eq!(args.subprotocol, vec!["ocpp2.0.1", "ocpp1.6"]);
        assert!(args.upstream.is_none());
    }

    #[test]
    fn test_signature_policy_from_keys() {
        let policy = signature_policy(&["k1:6b6579".to_string()], true).unwrap();
        assert_eq!(
            policy.enforcement("Heartbeat", Direction::Request),
            Enforcement::Required
        );

        let policy = signature_policy(&[], false).unwrap();
        assert_eq!(
            policy.enforcement("Heartbeat", Direction::Request),
            Enforcement::Skip
        );
    }

    #[test]
    fn test_signature_policy_rejects_bad_keys() {
        assert!(signature_policy(&["nocolon".to_string()], false).is_err());
        assert!(signature_policy(&["k1:zz".to_string()], false).is_err());
        assert!(signature_policy(&[], true).is_err());
    }
}
