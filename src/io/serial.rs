//! UART bridge between a tokio-serial port and the link transport
//!
//! - Baud: 115200, 8N1
//! - The bridge task owns the port; the control loop talks to it through a
//!   `ChannelTransport`, so the link never blocks on the UART.
//! - End of stream (adapter unplugged, pty closed) ends the bridge; the link
//!   then sees a closed transport.

use crate::io::link::ChannelTransport;
use anyhow::Context;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, trace, warn};

/// Chunks buffered in each direction
const BRIDGE_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 256;

/// Open `device` and spawn the bridge task.
pub fn open_serial_transport(
    device: &str,
    baud: u32,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ChannelTransport> {
    let port = tokio_serial::new(device, baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .with_context(|| format!("opening serial port {device}"))?;
    info!(device = %device, baud = %baud, "serial_port_opened");

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(BRIDGE_CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(BRIDGE_CHANNEL_CAPACITY);

    tokio::spawn(run_bridge(port, out_rx, in_tx, shutdown, device.to_string()));

    Ok(ChannelTransport::from_parts(out_tx, in_rx))
}

async fn run_bridge<P: AsyncRead + AsyncWrite + Unpin>(
    mut port: P,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    in_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    device: String,
) {
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(device = %device, "serial_bridge_shutdown");
                    return;
                }
            }
            outgoing = out_rx.recv() => {
                let Some(bytes) = outgoing else {
                    info!(device = %device, "serial_bridge_closed");
                    return;
                };
                if let Err(e) = port.write_all(&bytes).await {
                    warn!(device = %device, error = %e, "serial_write_error");
                }
            }
            read = port.read(&mut read_buf) => match read {
                Ok(0) => {
                    error!(device = %device, "serial_port_disconnected");
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, raw = %hex::encode(&read_buf[..n]), "serial_bytes_read");
                    if in_tx.try_send(read_buf[..n].to_vec()).is_err() {
                        // Control loop stalled or gone; the link retries what it lost
                        debug!(device = %device, dropped = n, "serial_rx_overrun");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    error!(device = %device, error = %e, "serial_read_error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_forwards_both_ways() {
        let (port, mut far) = tokio::io::duplex(256);
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bridge = tokio::spawn(run_bridge(port, out_rx, in_tx, shutdown_rx, "test".into()));

        far.write_all(&[0x02, 0x30]).await.unwrap();
        assert_eq!(in_rx.recv().await.unwrap(), vec![0x02, 0x30]);

        out_tx.send(vec![0x06]).await.unwrap();
        let mut buf = [0u8; 1];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x06]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), bridge).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_stops_at_end_of_stream() {
        let (port, far) = tokio::io::duplex(256);
        let (_out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let bridge = tokio::spawn(run_bridge(port, out_rx, in_tx, shutdown_rx, "test".into()));

        drop(far);
        tokio::time::timeout(Duration::from_secs(1), bridge)
            .await
            .expect("bridge should exit on end of stream")
            .unwrap();
        assert!(in_rx.recv().await.is_none());
    }
}
