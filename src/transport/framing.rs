//! Length-delimited framing shared by the stream transports (IP, serial).
//!
//! Meshtastic's wired streams prefix every protobuf frame with a two-byte
//! magic (`0x94 0xC3`) and a big-endian 16-bit length. BLE has no such
//! framing (GATT notifications already arrive as discrete writes), so only
//! `ip.rs` and `serial.rs` use this module.

use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const START1: u8 = 0x94;
const START2: u8 = 0xC3;
const MAX_FRAME_LEN: usize = 512;

/// Read one framed payload, resyncing past stray bytes until the magic is
/// found. A corrupt length (`> MAX_FRAME_LEN`) is treated as a resync point
/// rather than a fatal error, matching spec.md §7's "frame-level parse
/// errors are logged and skipped" policy.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    loop {
        let mut b = [0u8; 1];
        loop {
            reader.read_exact(&mut b).await?;
            if b[0] == START1 {
                break;
            }
        }
        reader.read_exact(&mut b).await?;
        if b[0] != START2 {
            continue;
        }
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            continue;
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(payload);
    }
}

/// Wrap `payload` in the `0x94 0xC3 len_hi len_lo` header and write it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME_LEN));
    }
    let mut header = [0u8; 4];
    header[0] = START1;
    header[1] = START2;
    header[2] = ((payload.len() >> 8) & 0xFF) as u8;
    header[3] = (payload.len() & 0xFF) as u8;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn resyncs_past_garbage_prefix() {
        let mut buf = vec![0x00, 0x11, 0x94, 0x99];
        write_frame(&mut buf, b"ok").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let got = read_frame(&mut cursor).await.unwrap();
        assert_eq!(got, b"ok");
    }
}
