//! UDP receiver for FEM data ports.
//!
//! One socket and one thread per mapped port. Each datagram is tagged with the
//! local port it arrived on, which is what the FEM port map routes on.
//!
//! * `SO_RCVBUF` is raised to absorb a full frame burst from every FEM; a
//!   warning is logged if the kernel caps it (`net.core.rmem_max`).
//! * A short read timeout lets the loop observe the shared running flag.
//! * Hand-off to the assembler never blocks: a full queue counts the packet as
//!   overflowed and drops it.

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::loss::LossAccumulator;
use crate::metrics;

/// One datagram as received from a FEM.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    /// Local port the datagram arrived on.
    pub port: u16,
    pub from: Option<SocketAddr>,
    /// [`metrics::now_ns`] when the datagram was read; 0 if unknown.
    pub recv_timestamp_ns: u64,
}

/// Large enough for a primary packet plus trailer on a jumbo-frame link.
const PKT_CAP: usize = 9000;
pub const DEFAULT_RECV_BUFFER: usize = 32 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct PacketReceiver {
    socket: UdpSocket,
    port: u16,
    tx: Sender<RawPacket>,
    loss: Arc<LossAccumulator>,
    running: Arc<AtomicBool>,
}

impl PacketReceiver {
    /// Bind `addr:port`. Port 0 binds an ephemeral port; see [`Self::port`].
    pub fn bind(
        addr: IpAddr,
        port: u16,
        recv_buffer: usize,
        tx: Sender<RawPacket>,
        loss: Arc<LossAccumulator>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        if socket.set_recv_buffer_size(recv_buffer).is_err() {
            tracing::warn!(port, "failed to set receive buffer size");
        }
        if let Ok(actual) = socket.recv_buffer_size() {
            if actual < recv_buffer / 2 {
                tracing::warn!(
                    port,
                    "recv buffer is {}KB (wanted {}KB); raise it with: sysctl -w net.core.rmem_max={}",
                    actual / 1024,
                    recv_buffer / 1024,
                    recv_buffer * 2
                );
            }
        }

        let bind_addr = SocketAddr::new(addr, port);
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind UDP {}", bind_addr))?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let port = socket.local_addr()?.port();

        Ok(Self { socket, port, tx, loss, running })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receive until the running flag clears or the pipeline goes away.
    pub fn run(&self) -> Result<()> {
        tracing::info!(port = self.port, "receiver started");
        let mut buf = vec![0u8; PKT_CAP];

        while self.running.load(Relaxed) {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e).with_context(|| format!("recv on port {}", self.port)),
            };

            let packet = RawPacket {
                data: buf[..n].to_vec(),
                port: self.port,
                from: Some(from),
                recv_timestamp_ns: metrics::now_ns(),
            };
            match self.tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.loss.packets_overflowed.fetch_add(1, Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        tracing::info!(port = self.port, "receiver stopped");
        Ok(())
    }
}

/// Bind every port, then start one `lpd-recv-<port>` thread per socket.
/// Binding happens up front so a bad port fails the call, not the thread.
pub fn spawn_receivers(
    addr: IpAddr,
    ports: &[u16],
    recv_buffer: usize,
    pin_core: Option<usize>,
    tx: Sender<RawPacket>,
    loss: Arc<LossAccumulator>,
    running: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    let receivers = ports
        .iter()
        .map(|&port| PacketReceiver::bind(addr, port, recv_buffer, tx.clone(), loss.clone(), running.clone()))
        .collect::<Result<Vec<_>>>()?;

    let mut handles = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let handle = std::thread::Builder::new()
            .name(format!("lpd-recv-{}", receiver.port()))
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_to_core(core);
                }
                if let Err(e) = receiver.run() {
                    tracing::error!(port = receiver.port(), "receiver failed: {:#}", e);
                }
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

pub fn pin_to_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = core_id;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_receiver_tags_local_port() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let loss = LossAccumulator::new();
        let running = Arc::new(AtomicBool::new(true));
        let receiver = PacketReceiver::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            1024 * 1024,
            tx,
            loss,
            running.clone(),
        )
        .unwrap();
        let port = receiver.port();
        assert_ne!(port, 0);

        let handle = std::thread::spawn(move || receiver.run());
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(&[1, 2, 3], (Ipv4Addr::LOCALHOST, port)).unwrap();

        let packet = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(packet.data, vec![1, 2, 3]);
        assert_eq!(packet.port, port);
        assert_eq!(packet.from, Some(sender.local_addr().unwrap()));

        running.store(false, Relaxed);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_full_queue_counts_overflow() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let loss = LossAccumulator::new();
        let running = Arc::new(AtomicBool::new(true));
        let receiver =
            PacketReceiver::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1024 * 1024, tx, loss.clone(), running.clone())
                .unwrap();
        let port = receiver.port();
        let handle = std::thread::spawn(move || receiver.run());

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        for _ in 0..3 {
            sender.send_to(&[0], (Ipv4Addr::LOCALHOST, port)).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while loss.snapshot().packets_overflowed < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(loss.snapshot().packets_overflowed, 2);
        assert_eq!(rx.len(), 1);

        running.store(false, Relaxed);
        handle.join().unwrap().unwrap();
    }
}
