//! HEP ingestion.
//!
//! One loop owns the UDP socket. Every datagram is decoded and parsed in its
//! own task so a bad packet cannot take the loop down; accepted SIP messages
//! go through a bounded queue to a single consumer that drives the
//! [`CallCorrelator`].
use crate::{
    correlation::CallCorrelator,
    hep::{self, ProtocolType},
    rtcp::RtcpReportService,
    sip::{SipMessage, SipParser},
};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    select,
    sync::mpsc::{Receiver, Sender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct HepServerOption {
    pub max_packet_length: usize,
    pub min_packet_length: usize,
    pub read_timeout: Duration,
}

impl Default for HepServerOption {
    fn default() -> Self {
        Self {
            max_packet_length: 4096,
            min_packet_length: 24,
            read_timeout: Duration::from_secs(5),
        }
    }
}

pub struct HepServer {
    socket: UdpSocket,
    option: HepServerOption,
    parser: Arc<SipParser>,
    rtcp: Arc<RtcpReportService>,
    sender: Sender<SipMessage>,
    token: CancellationToken,
}

impl HepServer {
    pub async fn bind(
        addr: SocketAddr,
        option: HepServerOption,
        parser: Arc<SipParser>,
        rtcp: Arc<RtcpReportService>,
        sender: Sender<SipMessage>,
        token: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind hep listener on {}", addr))?;
        info!(addr = %socket.local_addr()?, "hep listener started");
        Ok(Self {
            socket,
            option,
            parser,
            rtcp,
            sender,
            token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until cancelled or until the consumer goes away. A full queue
    /// stalls this loop rather than dropping messages.
    pub async fn serve(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = select! {
                _ = self.token.cancelled() => break,
                r = tokio::time::timeout(self.option.read_timeout, self.socket.recv_from(&mut buf)) => r,
            };
            let (len, remote) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "hep receive failed");
                    continue;
                }
                Ok(Ok(r)) => r,
            };
            if len < self.option.min_packet_length || len > self.option.max_packet_length {
                debug!(remote_addr = %remote, len, "dropping datagram outside length limits");
                continue;
            }

            let permit = select! {
                _ = self.token.cancelled() => break,
                permit = self.sender.clone().reserve_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        info!("sip queue closed, stopping hep listener");
                        break;
                    }
                },
            };

            let datagram = Bytes::copy_from_slice(&buf[..len]);
            let parser = self.parser.clone();
            let rtcp = self.rtcp.clone();
            let min_payload_length = self.option.min_packet_length;
            tokio::spawn(async move {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handle_datagram(&datagram, remote, min_payload_length, &parser, &rtcp)
                }));
                match outcome {
                    Ok(Some(msg)) => {
                        permit.send(msg);
                    }
                    Ok(None) => {}
                    Err(_) => error!(remote_addr = %remote, len, "panic while processing datagram"),
                }
            });
        }
        info!("hep listener stopped");
        Ok(())
    }
}

/// Decode one datagram. RTCP is stored right away, SIP is returned for the
/// correlation queue. Payloads shorter than `min_payload_length` are dropped.
pub fn handle_datagram(
    datagram: &[u8],
    remote: SocketAddr,
    min_payload_length: usize,
    parser: &SipParser,
    rtcp: &RtcpReportService,
) -> Option<SipMessage> {
    let envelope = match hep::decode(datagram).and_then(|envelope| {
        envelope.check_payload(min_payload_length)?;
        Ok(envelope)
    }) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(remote_addr = %remote, error = %e, "dropping undecodable datagram");
            return None;
        }
    };
    let node_ip = remote.ip().to_string();
    match envelope.protocol_type {
        ProtocolType::Sip => parser.accept(&envelope, &node_ip),
        ProtocolType::Rtcp => {
            match rtcp.receive(&node_ip, &envelope) {
                Ok(true) => {}
                Ok(false) => debug!(remote_addr = %remote, "rtcp report without call id"),
                Err(e) => warn!(remote_addr = %remote, error = %e, "dropping rtcp report"),
            }
            None
        }
        other => {
            debug!(remote_addr = %remote, protocol = ?other, "ignoring payload");
            None
        }
    }
}

/// Drain the queue into the correlator, one message at a time.
pub async fn run_consumer(
    mut receiver: Receiver<SipMessage>,
    correlator: Arc<CallCorrelator>,
    token: CancellationToken,
) {
    loop {
        let msg = select! {
            _ = token.cancelled() => break,
            msg = receiver.recv() => msg,
        };
        match msg {
            Some(msg) => correlator.handle(msg).await,
            None => break,
        }
    }
    info!("sip consumer stopped");
}

#[cfg(test)]
mod tests;
