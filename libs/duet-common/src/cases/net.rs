// Socket and iptables helpers used by the built-in test bodies
use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Packets sent to this port are expected to be dropped.
pub const DROP_PORT: u16 = 2401;
/// Packets sent to this port are expected to arrive.
pub const ACCEPT_PORT: u16 = 2402;

/// How long the local side sends and the container side listens.
pub const SENDLOOP_DURATION: Duration = Duration::from_secs(2);
pub const SEND_INTERVAL: Duration = Duration::from_millis(100);

/// Run `iptables -t filter <args>` inside the container.
pub async fn filter_table(args: &[&str]) -> Result<()> {
    let mut full = vec!["-t", "filter"];
    full.extend_from_slice(args);
    run_command("iptables", &full).await
}

pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", program))?;

    if !output.status.success() {
        bail!(
            "command \"{} {}\" failed with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Wait up to `timeout` for one datagram on `port`. Returns its size, or
/// `None` if nothing arrived in time.
pub async fn listen_udp(port: u16, timeout: Duration) -> Result<Option<usize>> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on UDP port {}", port))?;

    let mut buf = [0u8; 1024];
    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((n, from))) => {
            debug!(port, bytes = n, from = %from, "Received packet");
            Ok(Some(n))
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("error reading on UDP port {}", port)),
        Err(_) => Ok(None),
    }
}

/// Send a one-byte datagram to `ip:port` every [`SEND_INTERVAL`] for `duration`.
pub async fn send_udp_loop(ip: IpAddr, port: u16, duration: Duration) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .await
        .context("Failed to open UDP socket")?;
    let target = SocketAddr::new(ip, port);

    let deadline = Instant::now() + duration;
    let mut ticker = tokio::time::interval(SEND_INTERVAL);
    let mut sent = 0u32;
    while Instant::now() < deadline {
        ticker.tick().await;
        socket
            .send_to(&[0u8], target)
            .await
            .with_context(|| format!("error writing to {}", target))?;
        sent += 1;
    }

    debug!(target = %target, packets = sent, "Send loop finished");
    Ok(())
}

/// Listen on `port`; succeed only if nothing arrives.
pub async fn expect_dropped(port: u16) -> Result<()> {
    if let Some(n) = listen_udp(port, SENDLOOP_DURATION).await? {
        bail!(
            "packets on port {} should have been dropped, but got a packet with {} bytes",
            port,
            n
        );
    }
    Ok(())
}

/// Listen on `port`; succeed only if a packet arrives.
pub async fn expect_accepted(port: u16) -> Result<()> {
    match listen_udp(port, SENDLOOP_DURATION).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => bail!("packets on port {} should be allowed, but none arrived", port),
        Err(e) => Err(e.context(format!(
            "packets on port {} should be allowed, but encountered an error",
            port
        ))),
    }
}
