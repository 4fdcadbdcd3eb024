use super::net::{expect_accepted, send_udp_loop, ACCEPT_PORT, SENDLOOP_DURATION};
use crate::registry::Testcase;
use async_trait::async_trait;
use std::net::IpAddr;

/// No rules installed: a packet from the host must reach the container.
/// Useful as a sanity check of the harness itself.
pub struct Echo;

#[async_trait]
impl Testcase for Echo {
    fn name(&self) -> &'static str {
        "Echo"
    }

    async fn container_action(&self, _peer: IpAddr) -> anyhow::Result<()> {
        expect_accepted(ACCEPT_PORT).await
    }

    async fn local_action(&self, peer: IpAddr) -> anyhow::Result<()> {
        send_udp_loop(peer, ACCEPT_PORT, SENDLOOP_DURATION).await
    }
}
