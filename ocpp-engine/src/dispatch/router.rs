//! Action registry
//!
//! Each action name maps to one typed entry: the request parser plus an
//! ordered list of subscribers. Dispatch parses the payload once, runs every
//! subscriber on its own task, waits for all of them, and reduces the
//! results in registration order:
//!
//! | Subscribers | Result |
//! |-------------|--------|
//! | action never declared | `NotImplemented` |
//! | declared, none subscribed | `NotSupported` |
//! | payload rejected by the parser | `FormationViolation` |
//! | first `Respond` in registration order | that response |
//! | all abstained | `GenericError` |
//! | none responded, at least one failed or panicked | `InternalError` with the first failure |

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{
    CallContext, Dispatched, HandlerError, IncomingRequest, OcppRequest, OcppResponse,
    RegistryError, Reply, SharedRequest,
};
use crate::ocpp::{ErrorCode, Payload};

/// Handle for removing a subscriber again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerResult<T> = Result<Reply<T>, HandlerError>;

type Handler<R> = Arc<
    dyn Fn(SharedRequest<R>) -> BoxFuture<'static, HandlerResult<<R as OcppRequest>::Response>>
        + Send
        + Sync,
>;

/// Type-erased registry entry
trait ErasedAction: Send + Sync {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn subscriber_count(&self) -> usize;

    fn remove(&mut self, id: SubscriptionId) -> bool;

    /// Parse and snapshot the subscribers; the returned future owns everything it needs
    fn start(&self, context: CallContext, payload: &Payload) -> BoxFuture<'static, Dispatched>;
}

struct TypedAction<R: OcppRequest> {
    subscribers: Vec<(SubscriptionId, Handler<R>)>,
}

impl<R: OcppRequest> ErasedAction for TypedAction<R> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    fn start(&self, context: CallContext, payload: &Payload) -> BoxFuture<'static, Dispatched> {
        if self.subscribers.is_empty() {
            let description = format!("{} has no subscribers", context.action);
            return async move { Dispatched::failure(ErrorCode::NotSupported, description) }.boxed();
        }

        let request = match R::from_payload(payload, &context.network_path) {
            Ok(request) => request,
            Err(e) => {
                let description = format!("{} payload rejected: {}", context.action, e);
                return async move { Dispatched::failure(ErrorCode::FormationViolation, description) }
                    .boxed();
            }
        };

        let handlers: Vec<Handler<R>> = self.subscribers.iter().map(|(_, h)| h.clone()).collect();
        let action = context.action.clone();
        let shared = Arc::new(IncomingRequest { context, request });

        async move {
            // Spawned so a panicking subscriber surfaces as a JoinError
            let tasks = handlers
                .into_iter()
                .map(|handler| tokio::spawn(handler(shared.clone())));
            let results = join_all(tasks).await;

            let mut first_failure: Option<String> = None;
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(Ok(Reply::Respond(response))) => {
                        debug!("{}: subscriber #{} responded", action, index);
                        return match response.to_payload() {
                            Ok(payload) => Dispatched::Response(payload),
                            Err(e) => Dispatched::failure(
                                ErrorCode::InternalError,
                                format!("{} response could not be serialized: {}", action, e),
                            ),
                        };
                    }
                    Ok(Ok(Reply::Abstain)) => {}
                    Ok(Err(e)) => {
                        warn!("{}: subscriber #{} failed: {}", action, index, e);
                        first_failure.get_or_insert(e.0);
                    }
                    Err(e) => {
                        warn!("{}: subscriber #{} panicked: {}", action, index, e);
                        first_failure.get_or_insert_with(|| format!("handler panicked: {}", e));
                    }
                }
            }

            match first_failure {
                Some(message) => Dispatched::failure(ErrorCode::InternalError, message),
                None => Dispatched::failure(
                    ErrorCode::GenericError,
                    format!("every subscriber abstained from {}", action),
                ),
            }
        }
        .boxed()
    }
}

/// Maps action names to typed parsers and their subscribers
#[derive(Default)]
pub struct DispatchRouter {
    actions: RwLock<HashMap<String, Box<dyn ErasedAction>>>,
    next_id: AtomicU64,
}

impl DispatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an action known without subscribing to it
    pub fn declare<R: OcppRequest>(&self) -> Result<(), RegistryError> {
        self.with_entry::<R, _>(|_| ())
    }

    /// Subscribe a handler to `R::ACTION`
    pub fn register<R, F, Fut>(&self, handler: F) -> Result<SubscriptionId, RegistryError>
    where
        R: OcppRequest,
        F: Fn(SharedRequest<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R::Response>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<R> = Arc::new(move |request| handler(request).boxed());

        self.with_entry::<R, _>(|entry| entry.subscribers.push((id, handler)))?;
        debug!("Subscribed {:?} to {}", id, R::ACTION);
        Ok(id)
    }

    /// Remove one subscriber. The action itself stays declared.
    pub fn unregister(&self, action: &str, id: SubscriptionId) -> bool {
        self.actions
            .write()
            .get_mut(action)
            .map_or(false, |entry| entry.remove(id))
    }

    pub fn is_declared(&self, action: &str) -> bool {
        self.actions.read().contains_key(action)
    }

    pub fn subscriber_count(&self, action: &str) -> usize {
        self.actions
            .read()
            .get(action)
            .map_or(0, |entry| entry.subscriber_count())
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<_> = self.actions.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Run every subscriber of the call's action and reduce to one result
    pub async fn dispatch(&self, context: CallContext, payload: &Payload) -> Dispatched {
        let started = {
            let actions = self.actions.read();
            actions
                .get(&context.action)
                .map(|entry| entry.start(context.clone(), payload))
        };

        match started {
            Some(run) => run.await,
            None => Dispatched::failure(
                ErrorCode::NotImplemented,
                format!("action {} is not implemented", context.action),
            ),
        }
    }

    fn with_entry<R, T>(&self, f: impl FnOnce(&mut TypedAction<R>) -> T) -> Result<T, RegistryError>
    where
        R: OcppRequest,
    {
        let mut actions = self.actions.write();
        let entry = actions.entry(R::ACTION.to_string()).or_insert_with(|| {
            Box::new(TypedAction::<R> {
                subscribers: Vec::new(),
            })
        });

        entry
            .as_any_mut()
            .downcast_mut::<TypedAction<R>>()
            .map(f)
            .ok_or_else(|| RegistryError::ActionTypeMismatch(R::ACTION.to_string()))
    }
}
