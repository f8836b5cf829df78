//! UDP front end: bind port 67 on the served interface, fan each datagram
//! out to its own task, and send the reply the handler builds.
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use dhcproto::v4;
use tokio::{net::UdpSocket, sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::handler::{encode_reply, DhcpHandler};

/// upper bound on one DHCP message
const RECV_BUF: usize = 2048;
/// upper bound on handling one packet, probes included
const HANDLE_TIMEOUT: Duration = Duration::from_secs(3);
/// how long shutdown waits for in-flight handlers
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the server socket: broadcast-capable, bound to the interface by
/// name so multi-homed hosts serve the right link.
fn create_socket(interface: &str, addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
    socket
        .bind_device(Some(interface.as_bytes()))
        .context("failed to bind interface")?;
    socket
        .set_broadcast(true)
        .context("failed to set_broadcast")?;
    socket
        .set_reuse_address(true)
        .context("failed to set_reuse_address")?;
    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking mode on socket")?;
    socket
        .bind(&std::net::SocketAddr::V4(addr).into())
        .context("failed to bind address")?;
    Ok(UdpSocket::from_std(unsafe {
        std::net::UdpSocket::from_raw_fd(socket.into_raw_fd())
    })?)
}

/// Read datagrams until cancelled, then drain in-flight handlers.
pub async fn run(
    handler: Arc<DhcpHandler>,
    interface: String,
    token: CancellationToken,
) -> Result<()> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v4::SERVER_PORT);
    let soc = Arc::new(create_socket(&interface, addr)?);
    info!(%addr, interface, "DHCP server listening");

    // every in-flight task holds a clone; recv() below completes when the
    // last one drops
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

    let mut buf = [0u8; RECV_BUF];
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("shutdown requested, no longer accepting DHCP");
                break;
            }
            res = soc.recv_from(&mut buf) => {
                let (n, src) = match res {
                    Ok(ok) => ok,
                    Err(err) => {
                        warn!(?err, "recv failed");
                        continue;
                    }
                };
                trace!(n, %src, "received datagram");
                let packet = buf[..n].to_vec();
                let handler = handler.clone();
                let soc = soc.clone();
                let _done = done_tx.clone();
                tokio::spawn(async move {
                    let _done = _done;
                    match time::timeout(HANDLE_TIMEOUT, handler.handle(&packet, src)).await {
                        Ok(Some((resp, dst))) => send_reply(&soc, &resp, dst).await,
                        Ok(None) => {}
                        Err(_) => warn!(%src, "handler timed out, dropping"),
                    }
                });
            }
        }
    }

    drop(done_tx);
    if time::timeout(DRAIN_TIMEOUT, done_rx.recv()).await.is_err() {
        error!("in-flight handlers did not finish inside the drain timeout");
    } else {
        debug!("all in-flight handlers finished");
    }
    Ok(())
}

async fn send_reply(soc: &UdpSocket, resp: &v4::Message, dst: SocketAddr) {
    match encode_reply(resp) {
        Ok(bytes) => {
            if let Err(err) = soc.send_to(&bytes, dst).await {
                error!(?err, %dst, "failed to send reply");
            } else {
                trace!(%dst, len = bytes.len(), "sent reply");
            }
        }
        Err(err) => error!(?err, "failed to encode reply"),
    }
}
