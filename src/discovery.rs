use crate::config::DiscoveryConfig;
use crate::error::{ComfoError, Result};
use crate::lock;
use crate::types::UnitDescriptor;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout_at, Instant};

/// Probe datagram understood by ComfoConnect gateways
const PROBE: [u8; 2] = [0x0a, 0x00];
const MAX_DATAGRAM: usize = 2048;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct DiscoveryReply {
    uuid: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

/// Find ventilation units on the local network
///
/// Broadcasts a probe and collects replies until `config.timeout` elapses, or
/// until `config.settle` after the first reply. Units are deduplicated by uuid
/// and returned in the order they answered.
///
/// ```no_run
/// use comfoair::{discover, DiscoveryConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DiscoveryConfig::default().with_timeout(Duration::from_secs(10));
///     for unit in discover(&config).await? {
///         println!("{} at {}", unit.uuid(), unit.socket_address());
///     }
///     Ok(())
/// }
/// ```
pub async fn discover(config: &DiscoveryConfig) -> Result<Vec<UnitDescriptor>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let target = format!("{}:{}", config.broadcast_address, config.port);
    socket.send_to(&PROBE, &target).await?;
    tracing::info!(target = %target, "Sent discovery probe");

    let mut units: Vec<UnitDescriptor> = Vec::new();
    let mut deadline = Instant::now() + config.timeout;
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, source) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                tracing::warn!("Discovery socket error: {}", e);
                break;
            }
            Err(_) => break,
        };

        let unit = match parse_reply(&buf[..len], source, config.unit_port) {
            Ok(unit) => unit,
            Err(e) => {
                tracing::warn!(%source, "Ignoring malformed discovery reply: {}", e);
                continue;
            }
        };

        if units.iter().any(|known| known.uuid() == unit.uuid()) {
            tracing::debug!(uuid = unit.uuid(), "Duplicate discovery reply");
            continue;
        }

        if units.is_empty() {
            deadline = deadline.min(Instant::now() + config.settle);
        }
        tracing::info!(uuid = unit.uuid(), address = unit.address(), "Found unit");
        units.push(unit);
    }

    tracing::info!("Discovery finished with {} unit(s)", units.len());
    Ok(units)
}

fn parse_reply(data: &[u8], source: SocketAddr, port: u16) -> Result<UnitDescriptor> {
    let reply: DiscoveryReply = serde_json::from_slice(data)?;
    if reply.uuid.is_empty() {
        return Err(ComfoError::Decode("discovery reply without uuid".to_string()));
    }

    let address = reply
        .address
        .filter(|address| !address.is_empty())
        .unwrap_or_else(|| source.ip().to_string());

    Ok(UnitDescriptor::new(reply.uuid, address, port).with_model(reply.model))
}

/// Background discovery of ventilation units
///
/// Re-probes the network every `interval` and keeps a map of every unit seen so
/// far. A failing scan is retried with exponential backoff.
///
/// # Example
///
/// ```no_run
/// use comfoair::{Discovery, DiscoveryConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut discovery = Discovery::new(DiscoveryConfig::default());
///     discovery.start().await?;
///
///     tokio::time::sleep(tokio::time::Duration::from_secs(12)).await;
///     for unit in discovery.units() {
///         println!("Found unit {} at {}", unit.uuid(), unit.address());
///     }
///
///     discovery.stop().await;
///     Ok(())
/// }
/// ```
pub struct Discovery {
    config: DiscoveryConfig,
    units: Arc<Mutex<BTreeMap<String, UnitDescriptor>>>,
    update_tx: Arc<broadcast::Sender<UnitDescriptor>>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (update_tx, _) = broadcast::channel(100);
        Self {
            config,
            units: Arc::new(Mutex::new(BTreeMap::new())),
            update_tx: Arc::new(update_tx),
            stop_tx: None,
            task_handle: None,
        }
    }

    /// Subscribe to newly found or changed units
    pub fn subscribe_updates(&self) -> broadcast::Receiver<UnitDescriptor> {
        self.update_tx.subscribe()
    }

    /// Snapshot of the units found so far, ordered by uuid
    pub fn units(&self) -> Vec<UnitDescriptor> {
        lock(&self.units).values().cloned().collect()
    }

    pub fn unit_count(&self) -> usize {
        lock(&self.units).len()
    }

    pub fn clear_units(&self) {
        lock(&self.units).clear();
    }

    /// Start scanning
    ///
    /// A running scan is stopped and restarted; known units are kept.
    pub async fn start(&mut self) -> Result<()> {
        self.stop().await;

        let (stop_tx, _) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx.clone());

        let config = self.config.clone();
        let units = self.units.clone();
        let update_tx = self.update_tx.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = Duration::ZERO;
            let mut stop_rx = stop_tx.subscribe();

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Discovery stopped");
                        break;
                    }
                    result = discover(&config) => match result {
                        Ok(found) => {
                            merge(&units, &update_tx, found);
                            backoff = Duration::ZERO;
                        }
                        Err(e) => {
                            tracing::error!("Discovery scan failed: {}", e);
                            backoff = if backoff.is_zero() {
                                Duration::from_secs(1)
                            } else {
                                (backoff * 2).min(MAX_BACKOFF)
                            };
                        }
                    }
                }

                let pause = if backoff.is_zero() { config.interval } else { backoff };
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Discovery stopped");
                        break;
                    }
                    _ = sleep(pause) => {}
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    /// Stop scanning; the unit list is kept
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

fn merge(
    units: &Mutex<BTreeMap<String, UnitDescriptor>>,
    update_tx: &broadcast::Sender<UnitDescriptor>,
    found: Vec<UnitDescriptor>,
) {
    let mut units = lock(units);
    for unit in found {
        if units.get(unit.uuid()) == Some(&unit) {
            continue;
        }
        tracing::info!(uuid = unit.uuid(), "Unit list updated");
        units.insert(unit.uuid().to_string(), unit.clone());
        let _ = update_tx.send(unit);
    }
}
