// iptables INPUT-chain filter tests
use super::net::{
    expect_accepted, expect_dropped, filter_table, send_udp_loop, ACCEPT_PORT, DROP_PORT,
    SENDLOOP_DURATION,
};
use crate::registry::Testcase;
use async_trait::async_trait;
use std::net::IpAddr;

/// Drops every inbound packet and checks that UDP traffic never arrives.
pub struct DropAll;

#[async_trait]
impl Testcase for DropAll {
    fn name(&self) -> &'static str {
        "DropAll"
    }

    async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
        filter_table(&["-A", "INPUT", "-j", "DROP"]).await?;
        expect_dropped(DROP_PORT).await
    }

    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()> {
        send_udp_loop(peer, DROP_PORT, SENDLOOP_DURATION).await
    }
}

/// Tests that we can drop UDP traffic.
pub struct FilterInputDropUdp;

#[async_trait]
impl Testcase for FilterInputDropUdp {
    fn name(&self) -> &'static str {
        "FilterInputDropUDP"
    }

    async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
        filter_table(&["-A", "INPUT", "-p", "udp", "-j", "DROP"]).await?;
        expect_dropped(DROP_PORT).await
    }

    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()> {
        send_udp_loop(peer, DROP_PORT, SENDLOOP_DURATION).await
    }
}

/// Tests that we can drop UDP traffic by port.
pub struct FilterInputDropUdpPort;

#[async_trait]
impl Testcase for FilterInputDropUdpPort {
    fn name(&self) -> &'static str {
        "FilterInputDropUDPPort"
    }

    async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
        drop_udp_to(DROP_PORT).await?;
        expect_dropped(DROP_PORT).await
    }

    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()> {
        send_udp_loop(peer, DROP_PORT, SENDLOOP_DURATION).await
    }
}

/// Tests that dropping one UDP port doesn't drop packets on other ports.
pub struct FilterInputDropDifferentUdpPort;

#[async_trait]
impl Testcase for FilterInputDropDifferentUdpPort {
    fn name(&self) -> &'static str {
        "FilterInputDropDifferentUDPPort"
    }

    async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
        drop_udp_to(DROP_PORT).await?;
        expect_accepted(ACCEPT_PORT).await
    }

    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()> {
        send_udp_loop(peer, ACCEPT_PORT, SENDLOOP_DURATION).await
    }
}

async fn drop_udp_to(port: u16) -> anyhow::Result<()> {
    let port = port.to_string();
    filter_table(&[
        "-A",
        "INPUT",
        "-p",
        "udp",
        "-m",
        "udp",
        "--destination-port",
        port.as_str(),
        "-j",
        "DROP",
    ])
    .await
}
