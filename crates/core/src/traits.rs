//! Traits at the boundary between the engine and the services under test.

use crate::{ServiceError, ServiceResult, TransportErrorKind};
use pathcheck_types::{HandlerId, NodeIndex, Port, TimerId};
use std::any::Any;

/// The simulated environment of one node.
///
/// The engine builds a fresh `NodeApi` for every upcall, bound to the node
/// that is executing. There is no ambient "current node": everything a
/// service does is attributed to the node this handle was built for.
///
/// All methods are synchronous. Sending a message or scheduling a timer only
/// queues an event; nothing is delivered before the current upcall returns.
pub trait NodeApi {
    /// Index of the executing node.
    fn node(&self) -> NodeIndex;

    /// Number of nodes in the cluster.
    fn node_count(&self) -> u32;

    /// How many times the executing node has been reincarnated this path.
    fn incarnation(&self) -> u32;

    /// Current simulated time of the executing node, in microseconds.
    ///
    /// Fails with [`ServiceError::ClockDisallowed`] in model-checking mode when
    /// clock reads are disabled.
    fn now(&mut self) -> Result<u64, ServiceError>;

    /// Register a receive/connection handler with the transport on `port`.
    fn register_handler(&mut self, port: Port, handler: HandlerId) -> ServiceResult;

    /// Queue `payload` for `dest` on the transport bound at `port`.
    ///
    /// # Returns
    ///
    /// `Ok(false)` when the destination queue is full and the message was
    /// dropped; `Ok(true)` otherwise.
    fn route(
        &mut self,
        port: Port,
        dest: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> Result<bool, ServiceError>;

    /// Like [`route`](Self::route), but registers a request-to-send when the
    /// queue is full so the handler later receives `clear_to_send`.
    fn route_rts(
        &mut self,
        port: Port,
        dest: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> Result<bool, ServiceError>;

    /// Ask to be told (via `clear_to_send`) when `dest`'s queue has room.
    fn request_to_send(&mut self, port: Port, dest: NodeIndex, handler: HandlerId)
        -> ServiceResult;

    /// Ask to be told (via `flushed`) once every queue on `port` has drained.
    fn request_flushed(&mut self, port: Port, handler: HandlerId) -> ServiceResult;

    /// Whether a `route` to `dest` on `port` would currently be accepted.
    fn can_send(&self, port: Port, dest: NodeIndex) -> bool;

    /// Bytes queued on the transport at `port`, across all destinations.
    fn queued_bytes(&self, port: Port) -> usize;

    /// Schedule `timer` to fire `delay` microseconds from now. Returns the
    /// firing time.
    fn schedule(&mut self, timer: TimerId, delay: u64) -> u64;

    /// Schedule `timer` at an absolute simulated time. Returns the firing time.
    fn schedule_at(&mut self, timer: TimerId, time: u64) -> u64;

    /// Cancel a pending timer. Returns false (and logs) when it was not pending.
    fn cancel(&mut self, timer: TimerId) -> bool;

    /// A controlled nondeterministic choice in `[0, max)`.
    ///
    /// Every call is recorded on the current path so the interleaving can be
    /// replayed. `max <= 1` always returns 0 and records nothing.
    fn rand_int(&mut self, max: u64) -> Result<u64, ServiceError>;
}

/// A protocol implementation under test; one instance runs per node.
///
/// # Guarantees
///
/// - Upcalls are never reentrant and never concurrent
/// - `init` is called once per incarnation, before any other upcall of that
///   incarnation
/// - `reset` is called when the node crashes; the instance must return to
///   its freshly constructed state
///
/// # Example
///
/// ```ignore
/// impl NodeService for Ping {
///     fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
///         api.register_handler(PORT, HANDLER)?;
///         api.schedule(PING_TIMER, 1_000_000);
///         Ok(())
///     }
///     // ...
/// }
/// ```
pub trait NodeService: Any {
    /// Name used in logs and state dumps.
    fn name(&self) -> &str;

    /// Start (or restart) the node.
    fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult;

    /// The node crashed; drop all volatile state.
    fn reset(&mut self);

    /// A message routed by `from` arrived on `port`.
    fn deliver(
        &mut self,
        api: &mut dyn NodeApi,
        port: Port,
        from: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> ServiceResult;

    /// A timer scheduled by this node fired.
    fn timer_fired(&mut self, api: &mut dyn NodeApi, timer: TimerId) -> ServiceResult;

    /// The connection to `peer` on `port` failed.
    fn transport_error(
        &mut self,
        _api: &mut dyn NodeApi,
        _port: Port,
        _peer: NodeIndex,
        _kind: TransportErrorKind,
    ) -> ServiceResult {
        Ok(())
    }

    /// A queued message to `peer` was dropped by a transport error.
    fn message_error(
        &mut self,
        _api: &mut dyn NodeApi,
        _port: Port,
        _peer: NodeIndex,
        _kind: TransportErrorKind,
        _handler: HandlerId,
        _payload: &str,
    ) -> ServiceResult {
        Ok(())
    }

    /// An earlier request-to-send toward `peer` can now proceed.
    fn clear_to_send(
        &mut self,
        _api: &mut dyn NodeApi,
        _port: Port,
        _peer: NodeIndex,
        _handler: HandlerId,
    ) -> ServiceResult {
        Ok(())
    }

    /// All data queued on `port` has drained.
    fn flushed(&mut self, _api: &mut dyn NodeApi, _port: Port, _handler: HandlerId) -> ServiceResult {
        Ok(())
    }

    /// Canonical rendering of the node's state, hashed for duplicate detection.
    ///
    /// Two instances that would behave identically from here on must render
    /// identically.
    fn state_string(&self) -> String;

    /// Downcasting hook for property checkers.
    fn as_any(&self) -> &dyn Any;
}
