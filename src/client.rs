use crate::config::{ClientConfig, DiscoveryConfig, PendingPolicy};
use crate::discovery;
use crate::error::{ComfoError, Result};
use crate::lock;
use crate::properties::{self, PropertyDescriptor};
use crate::session::Session;
use crate::state::SessionState;
use crate::subscription::{EventReceiver, SessionEvent, SubscriptionHandle};
use crate::types::{FanMode, NodeInfo, OperatingMode, PropertyId, PropertyValue, UnitDescriptor, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Client for one ComfoAir ventilation unit
///
/// The client owns at most one [`Session`]. Reads and writes need an
/// authenticated session; depending on [`PendingPolicy`] they either connect
/// and wait for it or fail straight away.
///
/// # Example
///
/// ```no_run
/// use comfoair::{ClientConfig, ComfoControlClient, FanMode, UnitDescriptor};
/// use comfoair::properties::OUTDOOR_AIR_TEMPERATURE;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let unit = UnitDescriptor::new("0000000000251010800170b3d54264b4", "192.168.1.50", 56747);
///     let client = ComfoControlClient::new(unit, 1234, ClientConfig::default());
///     client.connect().await?;
///
///     let outdoor = client.read_property(OUTDOOR_AIR_TEMPERATURE.id).await?;
///     println!("Outdoor air: {}", outdoor);
///     client.set_fan_mode(FanMode::Medium).await?;
///
///     client.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct ComfoControlClient {
    unit: UnitDescriptor,
    pincode: u32,
    config: ClientConfig,
    session: Mutex<Option<Arc<Session>>>,
    connect_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl ComfoControlClient {
    /// Create a client for `unit`; nothing is connected until first use
    pub fn new(unit: UnitDescriptor, pincode: u32, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            unit,
            pincode,
            config,
            session: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Find units on the local network
    pub async fn discover(config: &DiscoveryConfig) -> Result<Vec<UnitDescriptor>> {
        discovery::discover(config).await
    }

    /// The unit this client talks to
    pub fn unit(&self) -> &UnitDescriptor {
        &self.unit
    }

    /// Open a session unless one is alive already
    ///
    /// A failed session is replaced by a fresh one.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;

        if let Some(session) = self.current() {
            if session.state() != SessionState::Failed {
                return Ok(());
            }
            tracing::info!(unit = self.unit.uuid(), "Replacing failed session");
        }

        let session = Session::connect(
            self.unit.clone(),
            self.pincode,
            self.config.clone(),
            self.events.clone(),
        )
        .await?;
        *lock(&self.session) = Some(Arc::new(session));
        Ok(())
    }

    /// State of the current session; `Disconnected` without one
    pub fn state(&self) -> SessionState {
        self.current()
            .map_or(SessionState::Disconnected, |session| session.state())
    }

    /// Receive state changes, property pushes and failure reports
    pub fn events(&self) -> EventReceiver {
        EventReceiver::new(self.events.subscribe())
    }

    /// Read the current value of a property
    pub async fn read_property(&self, property: PropertyId) -> Result<Value> {
        let result = async {
            let session = self.ready_session().await?;
            session.read(property).await
        }
        .await;
        result.map_err(|e| ComfoError::read(property, e))
    }

    /// Write a property and wait for the unit to acknowledge it
    pub async fn write_property(&self, value: PropertyValue) -> Result<()> {
        let property = value.id;
        let result = async {
            let session = self.ready_session().await?;
            session.write(value).await
        }
        .await;
        result.map_err(|e| ComfoError::write(property, e))
    }

    /// Set the fan level
    pub async fn set_fan_mode(&self, mode: FanMode) -> Result<()> {
        tracing::info!(?mode, "Setting fan mode");
        self.write_property(PropertyValue::new(
            properties::FAN_SPEED_SETTING.id,
            Value::Integer(mode as i64),
        ))
        .await
    }

    /// Switch between automatic and manual operation
    pub async fn set_operating_mode(&self, mode: OperatingMode) -> Result<()> {
        tracing::info!(?mode, "Setting operating mode");
        self.write_property(PropertyValue::new(
            properties::OPERATING_MODE.id,
            Value::Integer(mode as i64),
        ))
        .await
    }

    /// Read the unit's identity
    pub async fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            serial_number: self.read_string(&properties::SERIAL_NUMBER).await?,
            model: self.read_string(&properties::MODEL_NUMBER).await?,
            article_number: self.read_string(&properties::ARTICLE_NUMBER).await?,
            firmware_version: self.read_integer(&properties::FIRMWARE_VERSION).await?,
        })
    }

    /// Call `callback` for every push of `property`
    ///
    /// Listeners are called in registration order on the session's receive
    /// task, so they should return quickly. Properties outside the registry are
    /// rejected with [`ComfoError::UnknownProperty`].
    pub async fn register_property_listener<F>(
        &self,
        property: PropertyId,
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&PropertyValue) + Send + Sync + 'static,
    {
        properties::require(property)?;
        let session = self.live_session().await?;
        session.subscribe(property, Arc::new(callback)).await
    }

    /// Remove a listener registered with [`Self::register_property_listener`]
    pub async fn unregister_property_listener(&self, handle: SubscriptionHandle) -> Result<()> {
        match self.current() {
            Some(session) => session.unsubscribe(handle).await,
            // listeners went away with their session
            None => Ok(()),
        }
    }

    /// Close the session; pending calls fail with [`ComfoError::Cancelled`]
    pub async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn current(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// A session that exists, possibly still reconnecting
    async fn live_session(&self) -> Result<Arc<Session>> {
        match self.config.pending_policy {
            PendingPolicy::Queue => {
                self.connect().await?;
                self.current().ok_or(ComfoError::ConnectionClosed)
            }
            PendingPolicy::FailFast => self
                .current()
                .filter(|session| session.state() != SessionState::Failed)
                .ok_or(ComfoError::NotAuthenticated(self.state())),
        }
    }

    /// An authenticated session
    async fn ready_session(&self) -> Result<Arc<Session>> {
        let session = self.live_session().await?;
        match self.config.pending_policy {
            PendingPolicy::Queue => {
                session.wait_authenticated(self.config.request_timeout).await?;
            }
            PendingPolicy::FailFast => {
                let state = session.state();
                if !state.is_authenticated() {
                    return Err(ComfoError::NotAuthenticated(state));
                }
            }
        }
        Ok(session)
    }

    async fn read_string(&self, descriptor: &PropertyDescriptor) -> Result<String> {
        match self.read_property(descriptor.id).await? {
            Value::String(text) => Ok(text),
            other => Err(unexpected(descriptor, &other)),
        }
    }

    async fn read_integer(&self, descriptor: &PropertyDescriptor) -> Result<i64> {
        let value = self.read_property(descriptor.id).await?;
        value.as_i64().ok_or_else(|| unexpected(descriptor, &value))
    }
}

fn unexpected(descriptor: &PropertyDescriptor, value: &Value) -> ComfoError {
    ComfoError::read(
        descriptor.id,
        ComfoError::Decode(format!(
            "{} should be {:?}, unit sent {:?}",
            descriptor.name,
            descriptor.kind,
            value.kind()
        )),
    )
}
