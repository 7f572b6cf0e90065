//! Connection manager: state machine, handshake, session lifecycle and reconnection.
//!
//! One [`HubConnection`] owns at most one live session at a time. A session is one physical
//! socket plus the tasks serving it (read loop, dispatch loop, keepalive) and the writer
//! actor; sessions are replaced, never reused, across reconnects.
//!
//! Lock order is `control` before `session`. No lock is held across an await.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use kameo::prelude::{Actor, ActorRef};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{HubCodec, HubResponse, IncomingMessage, JsonCodec, OutgoingMessage};
use crate::config::{ConnectionParameters, HubConfig};
use crate::core::{
    ConnectionState, FixedDelayRetry, HubError, HubResult, RetryBudget, WsFrame,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;
use crate::ws::dispatch::{self, EventQueue};
use crate::ws::handshake;
use crate::ws::ids::MessageIdAllocator;
use crate::ws::pending::{PendingGuard, PendingRequests, ResponseReceiver};
use crate::ws::subscriptions::{EventFilter, EventHandler, Slot, SubscriptionRegistry};
use crate::ws::writer::{WsWriterActor, write_frame};

/// Error code the hub reports when a request identifier was already used on the connection.
const ID_REUSE_CODE: &str = "id_reuse";
/// Error code the hub reports when unsubscribing an id it does not know.
const NOT_FOUND_CODE: &str = "not_found";

fn rejection(response: &HubResponse) -> HubError {
    match &response.error {
        Some(error) if error.code == ID_REUSE_CODE => HubError::InvalidOperation(format!(
            "hub reported identifier {} as already used: {}",
            response.id, error.message
        )),
        Some(error) => HubError::ServerError {
            code: error.code.clone(),
            message: error.message.clone(),
        },
        None => HubError::ServerError {
            code: "unknown_error".to_string(),
            message: "request failed without error details".to_string(),
        },
    }
}

/// Mutable connection-level state, guarded by one lock.
struct Control {
    state: ConnectionState,
    /// Bumped by every `connect` and `close`; flows from an older cycle stop touching state.
    cycle: u64,
    /// Cancelled by `close`; gates in-flight connect and reconnect attempts of this cycle.
    close_signal: CancellationToken,
    /// Known while a connect cycle is active; cleared by `close`.
    params: Option<ConnectionParameters>,
    disposed: bool,
}

struct Session<W>
where
    W: futures_util::Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    epoch: u64,
    cycle: u64,
    writer: ActorRef<WsWriterActor<W>>,
    shutdown: CancellationToken,
    /// Set under the control lock once the session reached `Connected`.
    connected: AtomicBool,
}

impl<W> Session<W>
where
    W: futures_util::Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    /// Stop the session's tasks and writer without waiting for them.
    fn stop(&self) {
        self.shutdown.cancel();
        let writer = self.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = writer.stop_gracefully().await;
            });
        }
    }
}

struct Inner<T: WsTransport, C: HubCodec> {
    transport: T,
    codec: C,
    config: HubConfig,
    control: Mutex<Control>,
    state_tx: broadcast::Sender<ConnectionState>,
    session: Mutex<Option<Arc<Session<T::Writer>>>>,
    ids: MessageIdAllocator,
    pending: PendingRequests,
    registry: Arc<SubscriptionRegistry>,
    server_version: Mutex<Option<String>>,
    dropped_events: Arc<AtomicU64>,
    epochs: AtomicU64,
}

/// Tears down a session that never reached `Connected` unless disarmed.
struct SessionGuard<'a, T: WsTransport, C: HubCodec> {
    inner: &'a Inner<T, C>,
    session: Option<Arc<Session<T::Writer>>>,
}

impl<T: WsTransport, C: HubCodec> SessionGuard<'_, T, C> {
    fn disarm(&mut self) {
        self.session = None;
    }
}

impl<T: WsTransport, C: HubCodec> Drop for SessionGuard<'_, T, C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.inner.abandon_session(&session);
        }
    }
}

/// Undoes a first-handler registration whose subscribe did not succeed.
struct PlaceholderGuard<'a> {
    registry: &'a SubscriptionRegistry,
    slot: &'a Arc<Slot>,
    handler: &'a EventHandler,
    armed: bool,
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.slot.remove_handler(self.handler);
        if !self.slot.is_established() {
            self.registry.unbind(self.slot);
            if self.slot.handler_count() == 0 {
                self.registry.retire(self.slot);
            }
        }
    }
}

impl<T: WsTransport, C: HubCodec> Inner<T, C> {
    fn transition_locked(&self, control: &mut Control, next: ConnectionState) {
        if control.state == next {
            return;
        }
        let previous = std::mem::replace(&mut control.state, next);
        debug!(from = %previous, to = %next, "connection state changed");
        // No receivers is fine.
        let _ = self.state_tx.send(next);
    }

    /// Transition only while `cycle` is still current.
    fn transition(&self, cycle: u64, next: ConnectionState) -> bool {
        let mut control = self.control.lock();
        if control.cycle != cycle {
            return false;
        }
        self.transition_locked(&mut control, next);
        true
    }

    fn ensure_usable(&self) -> HubResult<()> {
        if self.control.lock().disposed {
            return Err(HubError::Disposed);
        }
        Ok(())
    }

    /// The current session, provided the state allows requests.
    ///
    /// Caller-facing requests need `Connected`; internal ones (restore, unsubscribe during
    /// restore) only need a live session.
    fn live_session(&self, require_connected: bool) -> HubResult<Arc<Session<T::Writer>>> {
        let control = self.control.lock();
        if control.disposed {
            return Err(HubError::Disposed);
        }
        let allowed = if require_connected {
            control.state == ConnectionState::Connected
        } else {
            control.state.is_live()
        };
        if !allowed {
            return Err(HubError::InvalidState(format!(
                "operation requires a connected session, current state is {}",
                control.state
            )));
        }
        self.session
            .lock()
            .clone()
            .ok_or_else(|| HubError::InvalidState("no live session".to_string()))
    }

    async fn connect(
        self: &Arc<Self>,
        params: ConnectionParameters,
        budget: RetryBudget,
        cancel: Option<CancellationToken>,
    ) -> HubResult<()> {
        let (cycle, close) = {
            let mut control = self.control.lock();
            if control.disposed {
                return Err(HubError::Disposed);
            }
            if budget.is_unlimited() && cancel.is_none() {
                return Err(HubError::InvalidArgument(
                    "an unlimited retry budget requires a cancellation token".to_string(),
                ));
            }
            if control.state != ConnectionState::Disconnected {
                return Err(HubError::InvalidState(format!(
                    "connect requires the disconnected state, current state is {}",
                    control.state
                )));
            }
            control.cycle += 1;
            control.close_signal = CancellationToken::new();
            control.params = Some(params.clone());
            self.transition_locked(&mut control, ConnectionState::Connecting);
            (control.cycle, control.close_signal.clone())
        };

        let cancel = cancel.unwrap_or_default();
        let outcome = self.run_connect(&params, budget, &cancel, &close, cycle).await;
        if outcome.is_err() {
            let mut control = self.control.lock();
            if control.cycle == cycle {
                control.params = None;
                self.transition_locked(&mut control, ConnectionState::Disconnected);
            }
        }
        outcome
    }

    /// Connect attempts with fixed-delay retries, shared by `connect` and reconnection.
    async fn run_connect(
        self: &Arc<Self>,
        params: &ConnectionParameters,
        budget: RetryBudget,
        cancel: &CancellationToken,
        close: &CancellationToken,
        cycle: u64,
    ) -> HubResult<()> {
        let mut retry = FixedDelayRetry::new(self.config.retry_delay, budget);
        loop {
            let outcome = tokio::select! {
                biased;
                _ = close.cancelled() => Err(HubError::cancelled("connection closed")),
                _ = cancel.cancelled() => Err(HubError::cancelled("connect cancelled")),
                outcome = self.attempt(params, cycle, close) => outcome,
            };
            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let Some(delay) = retry.next_delay() else {
                warn!(
                    endpoint = params.endpoint(),
                    error = %err,
                    retries = retry.retries(),
                    "connect retry budget exhausted"
                );
                return Err(err);
            };
            warn!(
                endpoint = params.endpoint(),
                error = %err,
                retry = retry.retries(),
                delay_ms = delay.as_millis() as u64,
                "connect attempt failed; retrying"
            );
            if !self.transition(cycle, ConnectionState::Connecting) {
                return Err(HubError::cancelled("connection closed"));
            }
            tokio::select! {
                biased;
                _ = close.cancelled() => return Err(HubError::cancelled("connection closed")),
                _ = cancel.cancelled() => return Err(HubError::cancelled("connect cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One full attempt: open, authenticate, start the session, restore, go `Connected`.
    async fn attempt(
        self: &Arc<Self>,
        params: &ConnectionParameters,
        cycle: u64,
        close: &CancellationToken,
    ) -> HubResult<()> {
        let superseded = || HubError::cancelled("connection closed");
        if !self.transition(cycle, ConnectionState::Connecting) {
            return Err(superseded());
        }
        let (mut reader, mut writer) = self
            .transport
            .connect(
                params.endpoint().to_string(),
                self.config.buffers,
                self.config.tls,
            )
            .await?;

        self.ids.reset();
        if !self.transition(cycle, ConnectionState::Authenticating) {
            return Err(superseded());
        }
        let version = tokio::time::timeout(
            self.config.auth_timeout,
            handshake::authenticate(&mut reader, &mut writer, &self.codec, params.access_token()),
        )
        .await
        .map_err(|_| HubError::Timeout {
            context: "authentication".to_string(),
        })??;
        info!(
            endpoint = params.endpoint(),
            version = version.as_deref().unwrap_or("unknown"),
            "authenticated with hub"
        );
        *self.server_version.lock() = version;

        let session = self.start_session(reader, writer, cycle)?;
        let mut guard = SessionGuard {
            inner: self,
            session: Some(Arc::clone(&session)),
        };

        let slots = self.registry.established_slots();
        if !slots.is_empty() {
            if !self.transition(cycle, ConnectionState::Restoring) {
                return Err(superseded());
            }
            let count = slots.len();
            self.restore_subscriptions(&session, slots, close)
                .await
                .map_err(|err| {
                    if close.is_cancelled() {
                        superseded()
                    } else {
                        HubError::ConnectionFailed(format!("restoring subscriptions failed: {err}"))
                    }
                })?;
            info!(count, "restored subscriptions");
        }

        {
            let mut control = self.control.lock();
            let current = self
                .session
                .lock()
                .as_ref()
                .is_some_and(|s| s.epoch == session.epoch);
            if control.cycle != cycle {
                return Err(superseded());
            }
            if !current {
                return Err(HubError::ConnectionFailed(
                    "session lost before it was established".to_string(),
                ));
            }
            session.connected.store(true, Ordering::SeqCst);
            self.transition_locked(&mut control, ConnectionState::Connected);
        }
        guard.disarm();
        info!(endpoint = params.endpoint(), epoch = session.epoch, "hub connection established");
        Ok(())
    }

    fn start_session(
        self: &Arc<Self>,
        reader: T::Reader,
        writer: T::Writer,
        cycle: u64,
    ) -> HubResult<Arc<Session<T::Writer>>> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = CancellationToken::new();
        let writer = WsWriterActor::spawn(WsWriterActor::new(writer, shutdown.clone()));
        let session = Arc::new(Session {
            epoch,
            cycle,
            writer,
            shutdown,
            connected: AtomicBool::new(false),
        });

        {
            let control = self.control.lock();
            if control.cycle != cycle || control.close_signal.is_cancelled() {
                drop(control);
                session.stop();
                return Err(HubError::cancelled("connection closed"));
            }
            if let Some(stale) = self.session.lock().replace(Arc::clone(&session)) {
                stale.stop();
            }
        }

        let (queue, events) = dispatch::event_queue(
            self.config.event_queue_capacity,
            Arc::clone(&self.dropped_events),
        );
        tokio::spawn(dispatch::run_dispatch_loop(
            events,
            Arc::clone(&self.registry),
            session.shutdown.clone(),
        ));
        tokio::spawn(Arc::clone(self).read_loop(reader, queue, Arc::clone(&session)));
        if let Some(interval) = self.config.ping_interval {
            tokio::spawn(Arc::clone(self).keepalive_loop(Arc::clone(&session), interval));
        }
        debug!(epoch, "session started");
        Ok(session)
    }

    /// Re-issue subscribe for every filter the hub acknowledged before the disconnect.
    ///
    /// The set is the snapshot taken when restoration began. Each filter is handled under its
    /// gate, so a concurrent removal either retires the slot first (skipped here) or runs
    /// after it was restored (and unsubscribes through the live session).
    async fn restore_subscriptions(
        &self,
        session: &Session<T::Writer>,
        slots: Vec<Arc<Slot>>,
        close: &CancellationToken,
    ) -> HubResult<()> {
        for slot in slots {
            let _gate = tokio::select! {
                biased;
                _ = close.cancelled() => return Err(HubError::cancelled("connection closed")),
                gate = slot.gate.lock() => gate,
            };
            if slot.is_retired() || slot.server_id().is_some() {
                continue;
            }
            let outcome = self
                .request(
                    session,
                    OutgoingMessage::subscribe_events(slot.filter()),
                    close,
                    |id| self.registry.bind(&slot, id),
                )
                .await;
            match outcome {
                Ok(response) if response.success => {
                    debug!(filter = %slot.filter(), subscription = response.id, "subscription restored");
                }
                Ok(response) => {
                    self.registry.unbind(&slot);
                    return Err(rejection(&response));
                }
                Err(err) => {
                    self.registry.unbind(&slot);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: T::Reader,
        queue: EventQueue,
        session: Arc<Session<T::Writer>>,
    ) {
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = session.shutdown.cancelled() => return,
                next = reader.next() => next,
            };
            match next {
                Some(Ok(WsFrame::Close(frame))) => {
                    break format!(
                        "hub closed the socket (code {})",
                        frame.map_or(1005, |f| f.code)
                    );
                }
                Some(Ok(frame)) => match self.codec.decode(&frame) {
                    Ok(messages) => {
                        for message in messages {
                            self.route(message, &queue);
                        }
                    }
                    Err(err) => {
                        warn!(epoch = session.epoch, error = %err, "failed to decode hub frame; skipped");
                    }
                },
                Some(Err(err)) => break format!("read failed: {err}"),
                None => break "socket closed".to_string(),
            }
        };
        self.on_session_lost(session.epoch, reason).await;
    }

    fn route(&self, message: IncomingMessage, queue: &EventQueue) {
        match message {
            IncomingMessage::Result(response) => {
                let id = response.id;
                if !self.pending.resolve(response) {
                    warn!(id, "result without a pending request; dropped");
                }
            }
            IncomingMessage::Pong { id } => {
                let pong = HubResponse {
                    id,
                    success: true,
                    result: None,
                    error: None,
                };
                if !self.pending.resolve(pong) {
                    debug!(id, "pong without a pending ping; dropped");
                }
            }
            IncomingMessage::Event(event) => {
                queue.push(event);
            }
            IncomingMessage::Unknown { kind } => {
                debug!(kind = %kind, "ignoring unknown hub message");
            }
            other => {
                warn!(frame = ?other, "handshake message on a live session; ignored");
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>, session: Arc<Session<T::Writer>>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = session.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !session.connected.load(Ordering::SeqCst) {
                continue;
            }
            let ping = self.request(&session, OutgoingMessage::ping(), &session.shutdown, |_| {});
            let reason = match tokio::time::timeout(self.config.pong_timeout, ping).await {
                Ok(Ok(_)) => {
                    debug!(epoch = session.epoch, "keepalive pong received");
                    continue;
                }
                Ok(Err(err)) if err.is_retryable() => format!("keepalive failed: {err}"),
                Ok(Err(err)) => {
                    if session.shutdown.is_cancelled() {
                        return;
                    }
                    debug!(error = %err, "keepalive ping skipped");
                    continue;
                }
                Err(_) => format!("no pong within {:?}", self.config.pong_timeout),
            };
            self.on_session_lost(session.epoch, reason).await;
            return;
        }
    }

    /// Handle the loss of session `epoch`. Idempotent per epoch.
    ///
    /// Only a session that reached `Connected` triggers reconnection; a session lost while
    /// its attempt is still running is left to that attempt's retry loop.
    fn on_session_lost(self: &Arc<Self>, epoch: u64, reason: String) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            let (session, reconnect) = {
                let mut control = inner.control.lock();
                let session = {
                    let mut slot = inner.session.lock();
                    if slot.as_ref().is_some_and(|s| s.epoch == epoch) {
                        slot.take()
                    } else {
                        None
                    }
                };
                let Some(session) = session else {
                    return;
                };
                let reconnect = if !session.connected.load(Ordering::SeqCst)
                    || control.cycle != session.cycle
                {
                    None
                } else if inner.config.auto_reconnect && control.params.is_some() {
                    inner.transition_locked(&mut control, ConnectionState::Connecting);
                    control
                        .params
                        .clone()
                        .map(|params| (params, control.close_signal.clone(), control.cycle))
                } else {
                    inner.transition_locked(&mut control, ConnectionState::Disconnected);
                    None
                };
                (session, reconnect)
            };

            warn!(epoch, reason = %reason, "hub session lost");
            session.stop();
            inner.pending.fail_all("connection lost");
            inner.registry.clear_server_ids();

            let Some((params, close, cycle)) = reconnect else {
                return;
            };
            info!(endpoint = params.endpoint(), "reconnecting to hub");
            let never = CancellationToken::new();
            if let Err(err) = inner
                .run_connect(&params, RetryBudget::Unlimited, &never, &close, cycle)
                .await
            {
                if !err.is_cancelled() {
                    warn!(error = %err, "reconnect abandoned");
                }
                let mut control = inner.control.lock();
                if control.cycle == cycle {
                    control.params = None;
                    inner.transition_locked(&mut control, ConnectionState::Disconnected);
                }
            }
        })
    }

    fn abandon_session(&self, session: &Session<T::Writer>) {
        let taken = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.epoch == session.epoch) {
                slot.take()
            } else {
                None
            }
        };
        session.stop();
        if taken.is_some() {
            self.pending.fail_all("session abandoned");
            self.registry.clear_server_ids();
        }
    }

    fn close_session(&self, dispose: bool) -> HubResult<Option<Arc<Session<T::Writer>>>> {
        let session = {
            let mut control = self.control.lock();
            if control.disposed {
                return if dispose { Ok(None) } else { Err(HubError::Disposed) };
            }
            control.disposed = dispose;
            let session = self.session.lock().take();
            if control.state == ConnectionState::Disconnected && session.is_none() {
                return Ok(None);
            }
            control.cycle += 1;
            control.close_signal.cancel();
            control.params = None;
            self.transition_locked(&mut control, ConnectionState::Disconnected);
            session
        };

        let failed = self.pending.fail_all("connection closed");
        self.registry.clear_server_ids();
        if let Some(session) = &session {
            session.stop();
        }
        info!(failed_requests = failed, "hub connection closed");
        Ok(session)
    }

    async fn close(&self, cancel: &CancellationToken, dispose: bool) -> HubResult<()> {
        if let Some(session) = self.close_session(dispose)? {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = session.writer.wait_for_shutdown() => {}
            }
        }
        Ok(())
    }

    /// Allocate an id, write the frame, await the correlated response.
    ///
    /// `on_id` runs after registration and before the write.
    async fn request(
        &self,
        session: &Session<T::Writer>,
        message: OutgoingMessage,
        cancel: &CancellationToken,
        on_id: impl FnOnce(u64),
    ) -> HubResult<HubResponse> {
        let (id, mut rx) = self.submit(session, &message, cancel, on_id).await?;
        let mut guard = PendingGuard::new(&self.pending, id);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HubError::cancelled("request cancelled")),
            response = self.await_response(session, id, &mut rx) => response,
        };
        guard.disarm();
        response
    }

    /// Register a waiter and write the frame. The entry stays pending on success.
    async fn submit(
        &self,
        session: &Session<T::Writer>,
        message: &OutgoingMessage,
        cancel: &CancellationToken,
        on_id: impl FnOnce(u64),
    ) -> HubResult<(u64, ResponseReceiver)> {
        if session.shutdown.is_cancelled() {
            return Err(HubError::cancelled("connection closed"));
        }
        let id = self.ids.next_id();
        let rx = self.pending.register(id)?;
        let mut guard = PendingGuard::new(&self.pending, id);
        on_id(id);
        let frame = self.codec.encode(Some(id), message)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HubError::cancelled("request cancelled")),
            _ = session.shutdown.cancelled() => return Err(HubError::cancelled("connection closed")),
            written = write_frame(&session.writer, frame) => written?,
        }
        guard.disarm();
        debug!(id, kind = message.kind(), "request sent");
        Ok((id, rx))
    }

    async fn await_response(
        &self,
        session: &Session<T::Writer>,
        id: u64,
        rx: &mut ResponseReceiver,
    ) -> HubResult<HubResponse> {
        let limit = self.config.request_timeout;
        let response = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| HubError::Timeout {
                    context: format!("response to request {id}"),
                }),
                None => Ok(rx.await),
            }
        };
        let delivered = tokio::select! {
            biased;
            _ = session.shutdown.cancelled() => return Err(HubError::cancelled("connection closed")),
            response = response => response?,
        };
        match delivered {
            Ok(outcome) => outcome,
            Err(_) => Err(HubError::cancelled("response channel closed")),
        }
    }

    /// Take over the reply to a subscribe whose caller gave up after the frame was written.
    ///
    /// A late acknowledgement is answered with `unsubscribe_events`, so the hub does not keep
    /// a subscription nothing routes.
    fn release_abandoned_subscribe(
        self: &Arc<Self>,
        session: Arc<Session<T::Writer>>,
        id: u64,
        mut rx: ResponseReceiver,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = {
                let _guard = PendingGuard::new(&inner.pending, id);
                inner.await_response(&session, id, &mut rx).await
            };
            match outcome {
                Ok(response) if response.success => {}
                Ok(_) => return,
                Err(err) => {
                    debug!(subscription = id, error = %err, "abandoned subscribe never acknowledged");
                    return;
                }
            }
            let released = inner
                .request(
                    &session,
                    OutgoingMessage::unsubscribe_events(id),
                    &session.shutdown,
                    |_| {},
                )
                .await;
            match released {
                Ok(response) if response.success => {
                    debug!(subscription = id, "released abandoned subscription");
                }
                Ok(response) => {
                    warn!(subscription = id, error = %rejection(&response), "hub refused to release abandoned subscription");
                }
                Err(err) => {
                    debug!(subscription = id, error = %err, "abandoned subscription not released");
                }
            }
        });
    }

    async fn add_handler(
        self: &Arc<Self>,
        filter: EventFilter,
        handler: EventHandler,
        cancel: &CancellationToken,
    ) -> HubResult<()> {
        self.ensure_usable()?;
        loop {
            let slot = self.registry.get_or_insert(&filter);
            let _gate = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HubError::cancelled("add_handler cancelled")),
                gate = slot.gate.lock() => gate,
            };
            if slot.is_retired() {
                continue;
            }
            if slot.is_established() {
                slot.push_handler(handler);
                return Ok(());
            }

            // First handler for this filter: subscribe before it counts.
            let session = match self.live_session(true) {
                Ok(session) => session,
                Err(err) => {
                    if slot.handler_count() == 0 {
                        self.registry.retire(&slot);
                    }
                    return Err(err);
                }
            };
            slot.push_handler(Arc::clone(&handler));
            let mut placeholder = PlaceholderGuard {
                registry: &self.registry,
                slot: &slot,
                handler: &handler,
                armed: true,
            };
            if cancel.is_cancelled() {
                return Err(HubError::cancelled("add_handler cancelled"));
            }
            // Once started, the write runs to completion so a reply is always owned by someone.
            let (id, mut rx) = self
                .submit(
                    &session,
                    &OutgoingMessage::subscribe_events(&filter),
                    &CancellationToken::new(),
                    |id| self.registry.bind(&slot, id),
                )
                .await?;
            let waited = {
                let mut guard = PendingGuard::new(&self.pending, id);
                let waited = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    response = self.await_response(&session, id, &mut rx) => Some(response),
                };
                if waited.is_none() {
                    // The entry now belongs to the release task.
                    guard.disarm();
                }
                waited
            };
            let Some(response) = waited else {
                self.release_abandoned_subscribe(Arc::clone(&session), id, rx);
                return Err(HubError::cancelled("add_handler cancelled"));
            };
            let response = response?;
            if !response.success {
                return Err(rejection(&response));
            }
            slot.mark_established();
            placeholder.armed = false;
            info!(filter = %filter, subscription = response.id, "subscribed to hub events");
            return Ok(());
        }
    }

    async fn remove_handler(
        &self,
        filter: &EventFilter,
        handler: &EventHandler,
        cancel: &CancellationToken,
    ) -> HubResult<bool> {
        self.ensure_usable()?;
        loop {
            let Some(slot) = self.registry.get(filter) else {
                return Ok(false);
            };
            let _gate = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HubError::cancelled("remove_handler cancelled")),
                gate = slot.gate.lock() => gate,
            };
            if slot.is_retired() {
                continue;
            }
            let removed = slot.remove_handler(handler);
            if slot.handler_count() > 0 {
                return Ok(removed);
            }
            let Some(server_id) = slot.server_id() else {
                // Nothing held on the hub side.
                self.registry.retire(&slot);
                return Ok(removed);
            };

            // Last handler gone: the slot stays (zero handlers) until the hub confirms.
            let session = self.live_session(false)?;
            let response = self
                .request(
                    &session,
                    OutgoingMessage::unsubscribe_events(server_id),
                    cancel,
                    |_| {},
                )
                .await?;
            let gone_on_hub = response
                .error
                .as_ref()
                .is_some_and(|error| error.code == NOT_FOUND_CODE);
            if !response.success && !gone_on_hub {
                return Err(rejection(&response));
            }
            self.registry.retire(&slot);
            info!(filter = %filter, subscription = server_id, "unsubscribed from hub events");
            return Ok(true);
        }
    }
}

/// Connection to one automation hub.
///
/// Cheap to clone; clones share the same connection. Call [`close`](Self::close) or
/// [`dispose`](Self::dispose) to stop the background tasks.
pub struct HubConnection<T: WsTransport, C: HubCodec = JsonCodec> {
    inner: Arc<Inner<T, C>>,
}

impl<T: WsTransport, C: HubCodec> Clone for HubConnection<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl HubConnection<TungsteniteTransport, JsonCodec> {
    /// Connection over tokio-tungstenite with the JSON codec.
    pub fn tungstenite(config: HubConfig) -> HubResult<Self> {
        Self::new(TungsteniteTransport::default(), config)
    }
}

impl<T: WsTransport> HubConnection<T, JsonCodec> {
    pub fn new(transport: T, config: HubConfig) -> HubResult<Self> {
        Self::with_codec(transport, JsonCodec, config)
    }
}

impl<T: WsTransport, C: HubCodec> HubConnection<T, C> {
    pub fn with_codec(transport: T, codec: C, config: HubConfig) -> HubResult<Self> {
        config.validate().map_err(HubError::InvalidArgument)?;
        let (state_tx, _) = broadcast::channel(config.state_channel_capacity);
        let pending = PendingRequests::new(config.max_pending_requests);
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                codec,
                config,
                control: Mutex::new(Control {
                    state: ConnectionState::Disconnected,
                    cycle: 0,
                    close_signal: CancellationToken::new(),
                    params: None,
                    disposed: false,
                }),
                state_tx,
                session: Mutex::new(None),
                ids: MessageIdAllocator::new(),
                pending,
                registry: Arc::new(SubscriptionRegistry::new()),
                server_version: Mutex::new(None),
                dropped_events: Arc::new(AtomicU64::new(0)),
                epochs: AtomicU64::new(0),
            }),
        })
    }

    /// Connect and authenticate, retrying transport failures up to `retries`.
    ///
    /// `retries` follows [`RetryBudget`] (`0` none, `n > 0` at most `n`, negative unlimited).
    /// An unlimited budget requires `cancel`. Authentication rejection is never retried.
    pub async fn connect(
        &self,
        params: ConnectionParameters,
        retries: impl Into<RetryBudget>,
        cancel: Option<CancellationToken>,
    ) -> HubResult<()> {
        self.inner.connect(params, retries.into(), cancel).await
    }

    /// Close the connection. No-op when already disconnected.
    ///
    /// Pending requests fail with [`HubError::Cancelled`]; registered handlers are kept and
    /// re-subscribed by the next `connect`. `cancel` only bounds the wait for the writer drain.
    pub async fn close(&self, cancel: &CancellationToken) -> HubResult<()> {
        self.inner.close(cancel, false).await
    }

    /// Close and make every later operation fail with [`HubError::Disposed`].
    pub async fn dispose(&self) -> HubResult<()> {
        self.inner.close(&CancellationToken::new(), true).await
    }

    /// Send a request and await its raw response.
    ///
    /// Requires [`ConnectionState::Connected`]; otherwise fails before any I/O.
    pub async fn send(
        &self,
        message: OutgoingMessage,
        cancel: &CancellationToken,
    ) -> HubResult<HubResponse> {
        let session = self.inner.live_session(true)?;
        let response = self.inner.request(&session, message, cancel, |_| {}).await?;
        if !response.success
            && response
                .error
                .as_ref()
                .is_some_and(|error| error.code == ID_REUSE_CODE)
        {
            return Err(rejection(&response));
        }
        Ok(response)
    }

    /// Send a request and deserialize the payload of a successful response.
    pub async fn send_typed<R: DeserializeOwned>(
        &self,
        message: OutgoingMessage,
        cancel: &CancellationToken,
    ) -> HubResult<R> {
        self.send(message, cancel).await?.into_result()
    }

    /// Register `handler` for `filter`, subscribing on the hub when it is the first one.
    pub async fn add_handler(
        &self,
        filter: EventFilter,
        handler: EventHandler,
        cancel: &CancellationToken,
    ) -> HubResult<()> {
        self.inner.add_handler(filter, handler, cancel).await
    }

    /// Remove one registration of `handler`; the last one unsubscribes on the hub.
    ///
    /// Returns `false` when nothing was registered for `filter`/`handler`. A failed
    /// unsubscribe keeps the zero-handler subscription so a later call retries it.
    pub async fn remove_handler(
        &self,
        filter: &EventFilter,
        handler: &EventHandler,
        cancel: &CancellationToken,
    ) -> HubResult<bool> {
        self.inner.remove_handler(filter, handler, cancel).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.control.lock().state
    }

    /// Stream of state transitions; each change is sent exactly once.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of filters with an acknowledged subscription.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn handler_count(&self, filter: &EventFilter) -> usize {
        self.inner.registry.handler_count(filter)
    }

    /// Version banner reported by the hub on the last successful handshake.
    pub fn server_version(&self) -> Option<String> {
        self.inner.server_version.lock().clone()
    }

    /// Events dropped because the dispatch queue was full.
    pub fn dropped_event_count(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }
}
