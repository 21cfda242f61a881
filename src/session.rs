use crate::config::ClientConfig;
use crate::connection::{Connection, Frames};
use crate::correlator::Correlator;
use crate::error::{ComfoError, Result};
use crate::lock;
use crate::protocol::{self, Incoming, Operation, Request, Response, ResultCode};
use crate::state::SessionState;
use crate::subscription::{PropertyCallback, SessionEvent, SubscriptionHandle, SubscriptionRegistry};
use crate::types::{PropertyId, PropertyValue, UnitDescriptor, Value};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

const SUPERVISOR_STOP_GRACE: Duration = Duration::from_millis(500);

struct Link {
    generation: u64,
    connection: Connection,
}

/// State shared between the session handle, its receive loop and its supervisor
struct Shared {
    unit: UnitDescriptor,
    pincode: u32,
    config: ClientConfig,
    state: watch::Sender<SessionState>,
    correlator: Mutex<Correlator>,
    subscriptions: Mutex<SubscriptionRegistry>,
    /// Serializes wire subscribe/unsubscribe with registry changes
    subscribe_gate: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    last_activity: Mutex<Instant>,
    events: broadcast::Sender<SessionEvent>,
    lost_tx: mpsc::UnboundedSender<u64>,
}

/// Authenticated session with one ventilation unit
///
/// The session owns the TCP link and keeps it alive: it sends keep-alives,
/// watches for silence and reconnects with backoff when the link drops,
/// re-subscribing every property that still has listeners.
pub struct Session {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect to a unit and authenticate with the PIN
    ///
    /// A single attempt: a socket failure fails with [`ComfoError::Connect`] and
    /// a rejected PIN with [`ComfoError::Authentication`]. Automatic reconnects
    /// only happen once the session was established.
    pub async fn connect(
        unit: UnitDescriptor,
        pincode: u32,
        config: ClientConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let (state, _) = watch::channel(SessionState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            correlator: Mutex::new(Correlator::new(config.retire_margin())),
            unit,
            pincode,
            config,
            state,
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            subscribe_gate: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            events,
            lost_tx,
        });

        shared.open().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(shared.clone(), lost_rx, shutdown_rx));

        Ok(Self {
            shared,
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn unit(&self) -> &UnitDescriptor {
        &self.shared.unit
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session is authenticated
    ///
    /// Fails with [`ComfoError::Timeout`] after `limit` and with
    /// [`ComfoError::SessionFailed`] if the session gave up.
    pub async fn wait_authenticated(&self, limit: Duration) -> Result<()> {
        let mut rx = self.watch_state();
        let state = match timeout(
            limit,
            rx.wait_for(|s| s.is_authenticated() || *s == SessionState::Failed),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(ComfoError::ConnectionClosed),
            Err(_) => return Err(ComfoError::Timeout),
        };

        if state == SessionState::Failed {
            return Err(ComfoError::SessionFailed(format!(
                "session with {} failed",
                self.shared.unit.uuid()
            )));
        }
        Ok(())
    }

    /// Read a property value
    pub async fn read(&self, property: PropertyId) -> Result<Value> {
        self.shared.ensure_authenticated()?;
        let response = self.shared.request(Operation::Read(property)).await?;
        let value = response
            .into_result()?
            .ok_or_else(|| ComfoError::Decode(format!("read response for {} without value", property)))?;

        if value.id != property {
            return Err(ComfoError::Decode(format!(
                "asked for {}, unit answered {}",
                property, value.id
            )));
        }
        Ok(value.value)
    }

    /// Write a property value, resolving once the unit acknowledged it
    pub async fn write(&self, value: PropertyValue) -> Result<()> {
        self.shared.ensure_authenticated()?;
        self.shared
            .request(Operation::Write(value))
            .await?
            .into_result()?;
        Ok(())
    }

    /// Register a listener for pushes of a property
    ///
    /// The first listener of a property subscribes it on the wire. While the
    /// session is reconnecting the listener is only recorded; the subscribe is
    /// sent once the link is back.
    pub async fn subscribe(
        &self,
        property: PropertyId,
        callback: PropertyCallback,
    ) -> Result<SubscriptionHandle> {
        let _gate = self.shared.subscribe_gate.lock().await;

        if self.state() == SessionState::Failed {
            return Err(ComfoError::SessionFailed(
                "cannot subscribe on a failed session".to_string(),
            ));
        }

        let registration = lock(&self.shared.subscriptions).register(property, callback);

        if registration.first && self.state().is_authenticated() {
            if let Err(e) = self.shared.wire_subscribe(property).await {
                lock(&self.shared.subscriptions).unregister(registration.handle);
                return Err(e);
            }
        }

        Ok(registration.handle)
    }

    /// Remove a listener; the last one of a property unsubscribes on the wire
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let _gate = self.shared.subscribe_gate.lock().await;

        let last = lock(&self.shared.subscriptions).unregister(handle);
        if last == Some(true) && self.state().is_authenticated() {
            self.shared
                .request(Operation::Unsubscribe(handle.property()))
                .await?
                .into_result()?;
        }
        Ok(())
    }

    /// Close the session
    ///
    /// Pending requests fail with [`ComfoError::Cancelled`] and all listeners
    /// are dropped.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = timeout(SUPERVISOR_STOP_GRACE, handle).await;
        }

        let shared = &self.shared;
        if shared.state().is_active() {
            let _ = shared.transition(SessionState::Closing);
        }

        let link = lock(&shared.link).take();
        if let Some(link) = link {
            let _ = link.connection.send(&protocol::encode_close());
            link.connection.close().await;
        }
        lock(&shared.correlator).cancel_all();
        lock(&shared.subscriptions).clear();

        if shared.state() == SessionState::Closing {
            let _ = shared.transition(SessionState::Disconnected);
        }
        tracing::info!("Session with {} closed", shared.unit.uuid());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        // dropping the connection stops its tasks and, with them, the receive loop
        lock(&self.shared.link).take();
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, to: SessionState) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.try_transition(to) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        match &outcome {
            Ok(()) => {
                tracing::info!(unit = self.unit.uuid(), state = ?to, "Session state changed");
                let _ = self.events.send(SessionEvent::StateChanged(to));
            }
            Err(e) => tracing::debug!("Ignoring transition: {}", e),
        }
        outcome
    }

    fn ensure_authenticated(&self) -> Result<()> {
        let state = self.state();
        if state.is_authenticated() {
            Ok(())
        } else {
            Err(ComfoError::NotAuthenticated(state))
        }
    }

    fn current_generation(&self) -> Option<u64> {
        lock(&self.link).as_ref().map(|link| link.generation)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let link = lock(&self.link);
        link.as_ref()
            .ok_or(ComfoError::ConnectionClosed)?
            .connection
            .send(frame)
    }

    /// Send a request and wait for its response
    async fn request(&self, operation: Operation) -> Result<Response> {
        let allocated = {
            let mut correlator = lock(&self.correlator);
            match correlator.next_sequence() {
                Ok(sequence) => {
                    let frame = protocol::encode_request(sequence, &operation)?;
                    let request = Request {
                        sequence,
                        operation,
                        deadline: Instant::now() + self.config.request_timeout,
                    };
                    correlator
                        .submit(request)
                        .map(|pending| (sequence, frame, pending))
                }
                Err(e) => Err(e),
            }
        };
        let (sequence, frame, pending) = match allocated {
            Ok(allocated) => allocated,
            Err(e @ ComfoError::DuplicateSequence(_)) => return Err(self.sequence_exhausted(e)),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.send_frame(&frame) {
            lock(&self.correlator).withdraw(sequence);
            return Err(e);
        }

        pending.wait(&self.correlator).await
    }

    /// No sequence number is usable on this link; have the supervisor replace it
    fn sequence_exhausted(&self, e: ComfoError) -> ComfoError {
        tracing::error!(unit = self.unit.uuid(), "Sequence space exhausted, dropping link: {}", e);
        if let Some(generation) = self.current_generation() {
            let _ = self.lost_tx.send(generation);
        }
        e
    }

    async fn wire_subscribe(&self, property: PropertyId) -> Result<()> {
        self.request(Operation::Subscribe(property))
            .await?
            .into_result()?;
        if self.state() == SessionState::Authenticated {
            self.transition(SessionState::Streaming)?;
        }
        Ok(())
    }

    /// Open the link, authenticate and restore wire subscriptions
    ///
    /// On failure the link is dropped and the state is back to `Disconnected`.
    async fn open(self: &Arc<Self>) -> Result<()> {
        self.transition(SessionState::Connecting)?;

        let mut connection =
            match Connection::connect(&self.unit, self.config.connect_timeout).await {
                Ok(connection) => connection,
                Err(e) => {
                    self.transition(SessionState::Disconnected)?;
                    return Err(e);
                }
            };

        let result = match connection.frames() {
            Ok(frames) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                lock(&self.correlator).reset();
                *lock(&self.last_activity) = Instant::now();
                *lock(&self.link) = Some(Link {
                    generation,
                    connection,
                });
                tokio::spawn(receive_loop(self.clone(), frames, generation));

                // subscribe() waits until restored subscriptions are on the wire
                let _gate = self.subscribe_gate.lock().await;
                match self.authenticate().await {
                    Ok(()) => self.restore_subscriptions().await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.drop_link().await;
            match (&e, self.state()) {
                (ComfoError::Authentication(_), SessionState::Registering) => {
                    let _ = self.transition(SessionState::Disconnected);
                }
                (_, state) if state.is_active() => {
                    let _ = self.transition(SessionState::Closing);
                    let _ = self.transition(SessionState::Disconnected);
                }
                _ => {}
            }
            return Err(e);
        }

        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        self.request(Operation::Handshake).await?.into_result()?;
        self.transition(SessionState::Registering)?;

        let response = self
            .request(Operation::Register {
                pincode: self.pincode,
                client_uuid: self.config.client_uuid,
                device_name: self.config.device_name.clone(),
            })
            .await?;

        match response.status {
            ResultCode::Ok => self.transition(SessionState::Authenticated),
            status => {
                tracing::error!(unit = self.unit.uuid(), "Unit rejected the PIN: {}", status);
                Err(ComfoError::Authentication(status))
            }
        }
    }

    /// Re-subscribe every property with listeners; caller holds `subscribe_gate`
    async fn restore_subscriptions(&self) -> Result<()> {
        let properties = lock(&self.subscriptions).properties();
        for property in properties {
            tracing::debug!(%property, "Restoring subscription");
            self.wire_subscribe(property).await?;
        }
        Ok(())
    }

    /// Take the link down and cancel whatever was waiting on it
    async fn drop_link(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.connection.close().await;
        }
        lock(&self.correlator).cancel_all();
    }

    fn dispatch(&self, value: PropertyValue) {
        let listeners = lock(&self.subscriptions).listeners(value.id);
        if listeners.is_empty() {
            tracing::debug!(property = %value.id, "Push for property without listeners");
        } else {
            let report = listeners.dispatch(&value);
            tracing::trace!(
                property = %value.id,
                listeners = listeners.len(),
                delivered = report.delivered,
                failed = report.failed,
                "Push dispatched"
            );
        }
        let _ = self.events.send(SessionEvent::PropertyChanged(value));
    }

    /// Reconnect after the link was lost
    ///
    /// Returns `false` when the session is finished (failed or shut down).
    async fn recover(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.state().is_active() {
            let _ = self.transition(SessionState::Closing);
        }
        self.drop_link().await;
        if self.state() == SessionState::Closing {
            let _ = self.transition(SessionState::Disconnected);
        }

        let reconnect = &self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            if !reconnect.allows(attempt) {
                self.fail(format!("gave up after {} reconnect attempts", attempt));
                return false;
            }

            let delay = reconnect.delay(attempt);
            tracing::info!(
                unit = self.unit.uuid(),
                delay_ms = delay.as_millis() as u64,
                attempt,
                "Waiting before reconnect"
            );

            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                result = async {
                    sleep(delay).await;
                    self.open().await
                } => result,
            };

            match result {
                Ok(()) => {
                    tracing::info!(unit = self.unit.uuid(), attempt, "Reconnected");
                    return true;
                }
                Err(ComfoError::Authentication(status)) => {
                    self.fail(format!("PIN rejected on reconnect: {}", status));
                    return false;
                }
                Err(e) => {
                    tracing::warn!(unit = self.unit.uuid(), attempt, "Reconnect failed: {}", e);
                    attempt += 1;
                }
            }
        }
    }

    fn fail(&self, reason: String) {
        tracing::error!(unit = self.unit.uuid(), "Session failed: {}", reason);
        let _ = self.transition(SessionState::Failed);
        lock(&self.correlator).cancel_all();
        lock(&self.subscriptions).clear();
        let _ = self.events.send(SessionEvent::Failed(reason));
    }
}

/// Demultiplex incoming frames: responses to the correlator, pushes to listeners
async fn receive_loop(shared: Arc<Shared>, mut frames: Frames, generation: u64) {
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(unit = shared.unit.uuid(), "Link error: {}", e);
                break;
            }
        };

        *lock(&shared.last_activity) = Instant::now();

        match protocol::decode_message(&frame) {
            Ok(Incoming::Response(response)) => {
                lock(&shared.correlator).resolve(response);
            }
            Ok(Incoming::Push(value)) => shared.dispatch(value),
            Ok(Incoming::KeepAlive) => tracing::trace!("Keep-alive from unit"),
            Ok(Incoming::Close) => {
                tracing::info!(unit = shared.unit.uuid(), "Unit closed the session");
                break;
            }
            Ok(Incoming::Unknown { kind, sequence }) => {
                tracing::debug!(kind, sequence, "Ignoring frame of unknown kind");
            }
            Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
        }
    }

    let _ = shared.lost_tx.send(generation);
}

/// Keep-alive, watchdog and reconnection for the lifetime of a session
async fn supervise(
    shared: Arc<Shared>,
    mut lost_rx: mpsc::UnboundedReceiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(generation) = lost_rx.recv() => {
                if shared.current_generation() != Some(generation) {
                    continue;
                }
                tracing::warn!(unit = shared.unit.uuid(), "Link lost");
                if !shared.recover(&mut shutdown).await {
                    break;
                }
            }
            _ = keepalive.tick() => {
                {
                    let mut correlator = lock(&shared.correlator);
                    let expired = correlator.sweep(Instant::now());
                    if !expired.is_empty() {
                        tracing::debug!(
                            expired = expired.len(),
                            pending = correlator.pending_count(),
                            "Swept overdue requests"
                        );
                    }
                }
                if !shared.state().is_authenticated() {
                    continue;
                }

                let silent = lock(&shared.last_activity).elapsed();
                if silent >= shared.config.watchdog_timeout {
                    tracing::warn!(
                        unit = shared.unit.uuid(),
                        silent_ms = silent.as_millis() as u64,
                        "No traffic from unit, dropping link"
                    );
                    if !shared.recover(&mut shutdown).await {
                        break;
                    }
                    continue;
                }

                if let Err(e) = shared.send_frame(&protocol::encode_keepalive()) {
                    tracing::warn!("Failed to send keep-alive: {}", e);
                    if !shared.recover(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(unit = shared.unit.uuid(), "Session supervisor stopped");
}
