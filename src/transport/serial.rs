//! Serial transport: direct USB/UART connection to a Meshtastic device
//! (spec.md §6, default baud 115200). Grounded on the teacher's
//! `meshtastic::MeshtasticDevice` serial port handling, adapted from a
//! blocking `SerialPort` to `tokio::task::spawn_blocking` bridges so it can
//! satisfy the async [`Transport`] interface alongside the other transports.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;

use super::Transport;

pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    // `Box<dyn SerialPort>` is `Send` but not `Sync`, while the `Transport`
    // trait requires implementors to be `Sync` (it's held behind a
    // `tokio::sync::RwLock` in `SwitchableTransport`). `std::sync::Mutex<T>`
    // is `Sync` whenever `T: Send`, so wrapping the field is enough to
    // satisfy that bound; all access here is already exclusive via `&mut
    // self`, so the lock is never contended.
    port: std::sync::Mutex<Option<Box<dyn SerialPort>>>,
    rx_buf: Vec<u8>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: Option<u32>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: baud_rate.unwrap_or(115_200),
            port: std::sync::Mutex::new(None),
            rx_buf: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&mut self) -> Result<()> {
        let name = self.port_name.clone();
        let baud = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud)
                .timeout(Duration::from_millis(200))
                .open()
        })
        .await
        .context("serial open task panicked")?
        .with_context(|| format!("opening serial port {}", self.port_name))?;
        *self.port.lock().unwrap() = Some(port);
        self.rx_buf.clear();
        Ok(())
    }

    async fn close(&mut self) {
        *self.port.lock().unwrap() = None;
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        // serialport's blocking API doesn't compose with `framing::read_frame`
        // (which wants an `AsyncRead`), so we poll a byte at a time through
        // spawn_blocking and drive the same start/length state machine
        // inline rather than duplicating the magic-byte resync logic.
        let mut port = self.port.lock().unwrap().take().context("serial transport not connected")?;
        let result = tokio::task::spawn_blocking(move || -> Result<(Box<dyn SerialPort>, Vec<u8>)> {
            let mut buf = [0u8; 1];
            loop {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(_) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!(e)),
                }
            }
            if buf[0] != 0x94 {
                return Ok((port, Vec::new()));
            }
            loop {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(_) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!(e)),
                }
            }
            if buf[0] != 0xC3 {
                return Ok((port, Vec::new()));
            }
            let mut len_buf = [0u8; 2];
            read_exact_blocking(&mut *port, &mut len_buf)?;
            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 || len > 512 {
                return Ok((port, Vec::new()));
            }
            let mut payload = vec![0u8; len];
            read_exact_blocking(&mut *port, &mut payload)?;
            Ok((port, payload))
        })
        .await
        .context("serial read task panicked")??;
        *self.port.lock().unwrap() = Some(result.0);
        if result.1.is_empty() {
            // Resync byte consumed with no complete frame; caller's reader
            // loop will call read_frame again immediately.
            return Err(anyhow!("serial frame resync"));
        }
        Ok(result.1)
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut port = self.port.lock().unwrap().take().context("serial transport not connected")?;
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.push(0x94);
        framed.push(0xC3);
        framed.push(((payload.len() >> 8) & 0xFF) as u8);
        framed.push((payload.len() & 0xFF) as u8);
        framed.extend_from_slice(payload);
        let result = tokio::task::spawn_blocking(move || -> Result<Box<dyn SerialPort>> {
            port.write_all(&framed)?;
            port.flush()?;
            Ok(port)
        })
        .await
        .context("serial write task panicked")??;
        *self.port.lock().unwrap() = Some(result);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "serial"
    }

    fn status_target(&self) -> Option<String> {
        Some(format!("{}@{}", self.port_name, self.baud_rate))
    }
}

fn read_exact_blocking(port: &mut dyn SerialPort, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read(&mut buf[filled..]) {
            Ok(0) => continue,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(anyhow!(e)),
        }
    }
    Ok(())
}
