//! Bluetooth LE transport on btleplug.
//!
//! The adapter runs the central role: it scans for the mesh service UUID,
//! parses discovery advertisements out of service data, maintains up to
//! [`MAX_LINKS`] GATT connections and exchanges datagrams over a single
//! characteristic (writes out, notifications in).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use uuid::Uuid;

use crate::config::ScanMode;
use crate::error::TransportError;
use crate::protocol::PeerId;

use super::{
    Advertisement, Transport, TransportEvent, CHARACTERISTIC_UUID, MAX_LINKS, SEND_TIMEOUT,
    SERVICE_UUID,
};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

struct Link {
    peripheral: Peripheral,
    characteristic: Characteristic,
    last_activity: Instant,
}

struct BleInner {
    scan_mode: ScanMode,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    manager: Mutex<Option<Manager>>,
    adapter: Mutex<Option<Adapter>>,
    links: RwLock<HashMap<PeripheralId, Link>>,
    /// Mesh id → radio link, learned from advertisements.
    peer_links: RwLock<HashMap<PeerId, PeripheralId>>,
    current_ad: RwLock<Option<Advertisement>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    running: RwLock<bool>,
}

/// BLE mesh transport. One instance per node process.
pub struct BleTransport {
    inner: Arc<BleInner>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl BleTransport {
    pub fn new(scan_mode: ScanMode) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BleInner {
                scan_mode,
                service_uuid: Uuid::parse_str(SERVICE_UUID).expect("service uuid literal"),
                characteristic_uuid: Uuid::parse_str(CHARACTERISTIC_UUID)
                    .expect("characteristic uuid literal"),
                manager: Mutex::new(None),
                adapter: Mutex::new(None),
                links: RwLock::new(HashMap::new()),
                peer_links: RwLock::new(HashMap::new()),
                current_ad: RwLock::new(None),
                events_tx,
                running: RwLock::new(false),
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// The blob the platform peripheral stack should currently publish.
    /// btleplug drives only the central role; the host's GATT server is
    /// expected to pick this up for outgoing advertisements.
    pub async fn current_advertisement(&self) -> Option<Advertisement> {
        self.inner.current_ad.read().await.clone()
    }
}

#[async_trait::async_trait]
impl Transport for BleTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if *inner.running.read().await {
            return Ok(());
        }
        info!("starting BLE transport");

        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::RadioUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::RadioUnavailable(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::RadioUnavailable("no bluetooth adapter".into()))?;

        let scan_filter = ScanFilter {
            services: vec![inner.service_uuid],
        };
        adapter
            .start_scan(scan_filter)
            .await
            .map_err(|e| TransportError::RadioUnavailable(e.to_string()))?;

        let events = adapter
            .events()
            .await
            .map_err(|e| TransportError::RadioUnavailable(e.to_string()))?;

        *inner.manager.lock().await = Some(manager);
        *inner.adapter.lock().await = Some(adapter);
        *inner.running.write().await = true;

        // Scan event loop.
        let scan_inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if !*scan_inner.running.read().await {
                    break;
                }
                if let Err(e) = handle_central_event(&scan_inner, event).await {
                    debug!("scan event error: {e:#}");
                }
            }
            debug!("scan event stream ended");
        });

        // Periodic scan restart; some platforms stop reporting
        // advertisements on long-running scans.
        let restart_inner = Arc::clone(inner);
        tokio::spawn(async move {
            let mut interval = time::interval(restart_inner.scan_mode.restart_interval());
            interval.tick().await;
            while *restart_inner.running.read().await {
                interval.tick().await;
                if let Some(adapter) = restart_inner.adapter.lock().await.as_ref() {
                    let _ = adapter.stop_scan().await;
                    time::sleep(Duration::from_millis(100)).await;
                    let filter = ScanFilter {
                        services: vec![restart_inner.service_uuid],
                    };
                    if let Err(e) = adapter.start_scan(filter).await {
                        error!("failed to restart scan: {e}");
                    }
                }
            }
        });

        info!("BLE transport started");
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if !*inner.running.read().await {
            return;
        }
        *inner.running.write().await = false;

        for (id, link) in inner.links.write().await.drain() {
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("disconnect from {id:?} failed: {e}");
            }
        }
        inner.peer_links.write().await.clear();

        if let Some(adapter) = inner.adapter.lock().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        *inner.adapter.lock().await = None;
        *inner.manager.lock().await = None;
        info!("BLE transport stopped");
    }

    async fn advertise(&self, advertisement: Advertisement) -> Result<(), TransportError> {
        if !*self.inner.running.read().await {
            return Err(TransportError::NotStarted);
        }
        *self.inner.current_ad.write().await = Some(advertisement);
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let links = self.inner.links.read().await;
        self.inner
            .peer_links
            .read()
            .await
            .iter()
            .filter(|(_, peripheral_id)| links.contains_key(peripheral_id))
            .map(|(peer, _)| *peer)
            .collect()
    }

    async fn send(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let peripheral_id = self
            .inner
            .peer_links
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or(TransportError::NotConnected(peer))?;

        let (peripheral, characteristic) = {
            let links = self.inner.links.read().await;
            let link = links
                .get(&peripheral_id)
                .ok_or(TransportError::NotConnected(peer))?;
            (link.peripheral.clone(), link.characteristic.clone())
        };

        let write = peripheral.write(&characteristic, bytes, WriteType::WithoutResponse);
        match time::timeout(SEND_TIMEOUT, write).await {
            Ok(Ok(())) => {
                if let Some(link) = self.inner.links.write().await.get_mut(&peripheral_id) {
                    link.last_activity = Instant::now();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::SendFailed {
                peer,
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::SendTimeout { peer }),
        }
    }

    async fn broadcast(&self, bytes: &[u8]) -> usize {
        let targets: Vec<(PeripheralId, Peripheral, Characteristic)> = {
            let links = self.inner.links.read().await;
            links
                .iter()
                .map(|(id, link)| (id.clone(), link.peripheral.clone(), link.characteristic.clone()))
                .collect()
        };

        let mut sent = 0;
        for (id, peripheral, characteristic) in targets {
            let write = peripheral.write(&characteristic, bytes, WriteType::WithoutResponse);
            match time::timeout(SEND_TIMEOUT, write).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => warn!("broadcast write to {id:?} failed: {e}"),
                Err(_) => warn!("broadcast write to {id:?} timed out"),
            }
        }
        sent
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().expect("ble events poisoned").take()
    }
}

async fn handle_central_event(inner: &Arc<BleInner>, event: CentralEvent) -> Result<()> {
    match event {
        CentralEvent::ServiceDataAdvertisement { id, service_data } => {
            if let Some(blob) = service_data.get(&inner.service_uuid) {
                handle_advertisement(inner, id, blob).await?;
            }
        }
        CentralEvent::DeviceDiscovered(id) => {
            debug!("discovered device {id:?}");
            attempt_connection(inner, id).await?;
        }
        CentralEvent::DeviceDisconnected(id) => {
            info!("device disconnected: {id:?}");
            inner.links.write().await.remove(&id);
            inner
                .peer_links
                .write()
                .await
                .retain(|_, peripheral_id| *peripheral_id != id);
        }
        _ => {}
    }
    Ok(())
}

async fn handle_advertisement(
    inner: &Arc<BleInner>,
    id: PeripheralId,
    blob: &[u8],
) -> Result<()> {
    let Some(ad) = Advertisement::decode(blob) else {
        debug!("ignoring malformed advertisement from {id:?}");
        return Ok(());
    };

    let rssi = {
        let adapter = inner.adapter.lock().await;
        match adapter.as_ref() {
            Some(adapter) => match adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|props| props.rssi),
                Err(_) => None,
            },
            None => None,
        }
    };

    inner.peer_links.write().await.insert(ad.sender, id.clone());
    let _ = inner.events_tx.send(TransportEvent::Advertisement {
        peer: ad.sender,
        name: ad.name.clone(),
        rssi: rssi.unwrap_or(i16::MIN),
        status: ad.status,
        protocol_version: ad.protocol_version,
    });

    attempt_connection(inner, id).await
}

async fn attempt_connection(inner: &Arc<BleInner>, id: PeripheralId) -> Result<()> {
    {
        let links = inner.links.read().await;
        if links.contains_key(&id) || links.len() >= MAX_LINKS {
            return Ok(());
        }
    }

    let peripheral = {
        let adapter = inner.adapter.lock().await;
        adapter
            .as_ref()
            .context("adapter not initialized")?
            .peripheral(&id)
            .await
            .context("peripheral lookup failed")?
    };

    debug!("connecting to {id:?}");
    match time::timeout(CONNECTION_TIMEOUT, peripheral.connect()).await {
        Ok(Ok(())) => setup_link(inner, peripheral).await,
        Ok(Err(e)) => {
            warn!("connection to {id:?} failed: {e}");
            Ok(())
        }
        Err(_) => {
            warn!("connection to {id:?} timed out");
            Ok(())
        }
    }
}

async fn setup_link(inner: &Arc<BleInner>, peripheral: Peripheral) -> Result<()> {
    let id = peripheral.id();

    peripheral
        .discover_services()
        .await
        .context("service discovery failed")?;

    let services = peripheral.services();
    let service = services
        .iter()
        .find(|s| s.uuid == inner.service_uuid)
        .context("mesh service not present")?;
    let characteristic = service
        .characteristics
        .iter()
        .find(|c| c.uuid == inner.characteristic_uuid)
        .context("datagram characteristic not present")?
        .clone();

    peripheral
        .subscribe(&characteristic)
        .await
        .context("subscribe failed")?;

    inner.links.write().await.insert(
        id.clone(),
        Link {
            peripheral: peripheral.clone(),
            characteristic,
            last_activity: Instant::now(),
        },
    );

    // Notification pump: every inbound write becomes a datagram event.
    let pump_inner = Arc::clone(inner);
    let pump_id = id.clone();
    tokio::spawn(async move {
        let id = pump_id;
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("notification stream for {id:?} failed: {e}");
                return;
            }
        };
        while let Some(notification) = notifications.next().await {
            if !*pump_inner.running.read().await {
                break;
            }
            if let Some(link) = pump_inner.links.write().await.get_mut(&id) {
                link.last_activity = Instant::now();
            }
            let _ = pump_inner.events_tx.send(TransportEvent::Datagram {
                bytes: notification.value,
            });
        }
        debug!("notification stream ended for {id:?}");
        pump_inner.links.write().await.remove(&id);
    });

    info!("link established: {:?}", id);
    Ok(())
}
