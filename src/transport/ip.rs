//! TCP transport: connects to a Meshtastic device's IP API on the default
//! port 4403 (spec.md §6).

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{framing, Transport};

pub struct IpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl IpTransport {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port: port.unwrap_or(4403),
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for IpTransport {
    async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().context("ip transport not connected")?;
        framing::read_frame(stream).await
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().context("ip transport not connected")?;
        framing::write_frame(stream, payload).await
    }

    fn name(&self) -> &'static str {
        "ip"
    }

    fn status_target(&self) -> Option<String> {
        Some(format!("{}:{}", self.host, self.port))
    }
}
