//! Bluetooth LE transport. New addition relative to the teacher (spec.md §6
//! names BLE as a first-class transport; the teacher only implements
//! serial). GATT notifications arrive as discrete writes, so unlike the
//! stream transports there is no magic-byte framing to resync — each
//! notification on FROMRADIO is one frame.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::Transport;

// Meshtastic's BLE GATT service and characteristics (upstream-fixed UUIDs).
#[allow(dead_code)]
const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
const TORADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
const FROMRADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
const FROMNUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

pub struct BleTransport {
    address: String,
    adapter_index: Option<usize>,
    peripheral: Option<Peripheral>,
    notifications: Option<mpsc::Receiver<Vec<u8>>>,
}

impl BleTransport {
    pub fn new(address: impl Into<String>, adapter_index: Option<usize>) -> Self {
        Self {
            address: address.into(),
            adapter_index,
            peripheral: None,
            notifications: None,
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<()> {
        let manager = Manager::new().await.context("creating BLE manager")?;
        let adapters = manager.adapters().await.context("listing BLE adapters")?;
        let adapter = adapters
            .into_iter()
            .nth(self.adapter_index.unwrap_or(0))
            .context("no BLE adapter available")?;
        adapter.start_scan(ScanFilter::default()).await.context("starting BLE scan")?;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let peripherals = adapter.peripherals().await.context("listing BLE peripherals")?;
        let mut target = None;
        for p in peripherals {
            if let Ok(Some(props)) = p.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(&self.address) {
                    target = Some(p);
                    break;
                }
            }
        }
        let peripheral = target.ok_or_else(|| anyhow!("BLE device {} not found", self.address))?;
        peripheral.connect().await.context("connecting to BLE device")?;
        peripheral.discover_services().await.context("discovering BLE services")?;

        let chars = peripheral.characteristics();
        let fromnum = chars
            .iter()
            .find(|c| c.uuid == FROMNUM_UUID)
            .context("FROMNUM characteristic not found")?
            .clone();
        peripheral.subscribe(&fromnum).await.context("subscribing to FROMNUM")?;

        let (tx, rx) = mpsc::channel(128);
        let mut stream = peripheral
            .notifications()
            .await
            .context("subscribing to BLE notification stream")?;
        let peripheral_clone = peripheral.clone();
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != FROMNUM_UUID {
                    continue;
                }
                let chars = peripheral_clone.characteristics();
                let Some(fromradio) = chars.iter().find(|c| c.uuid == FROMRADIO_UUID) else {
                    continue;
                };
                if let Ok(data) = peripheral_clone.read(fromradio).await {
                    if !data.is_empty() && tx.send(data).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.peripheral = Some(peripheral);
        self.notifications = Some(rx);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            let _ = peripheral.disconnect().await;
        }
        self.notifications = None;
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let rx = self
            .notifications
            .as_mut()
            .context("ble transport not connected")?;
        rx.recv().await.context("ble notification channel closed")
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let peripheral = self.peripheral.as_ref().context("ble transport not connected")?;
        let chars = peripheral.characteristics();
        let toradio = chars
            .iter()
            .find(|c| c.uuid == TORADIO_UUID)
            .context("TORADIO characteristic not found")?;
        peripheral
            .write(toradio, payload, WriteType::WithResponse)
            .await
            .context("writing BLE frame")
    }

    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn status_target(&self) -> Option<String> {
        Some(self.address.clone())
    }
}
