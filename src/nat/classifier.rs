//! RFC 3489 NAT type classification
//!
//! Runs up to four probes over one channel, each depending on the previous:
//!
//! ```text
//! Test I  (primary)                       -- silence -> Blocked
//!   mapped == local ?
//!     Test II (primary, change IP+port)   -- answer -> Open, silence -> Symmetric UDP firewall
//!   else
//!     Test II (primary, change IP+port)   -- answer -> Full cone
//!     Test I  (alternate)                 -- new mapping -> Symmetric
//!     Test III (alternate, change port)   -- answer -> Restricted, silence -> Port restricted
//! ```
//!
//! Silence is evidence here, not a failure: only transport errors are
//! returned as `Err`.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ProbePolicy};
use crate::network::{exchange, DatagramChannel, Exchange, StunError};
use crate::protocol::{Attribute, ChangeRequest, Message};

use super::types::{Discovery, Host, NatType};

/// Drives the probe sequence over a borrowed channel
pub struct Classifier<'a, C: ?Sized> {
    conn: &'a C,
    config: &'a ClientConfig,
}

impl<'a, C: DatagramChannel + ?Sized> Classifier<'a, C> {
    pub fn new(conn: &'a C, config: &'a ClientConfig) -> Self {
        Self { conn, config }
    }

    /// Classify the NAT between this channel and `server`
    pub async fn classify(&self, server: SocketAddr) -> Result<Discovery, StunError> {
        let local = self.conn.local_addr()?;

        debug!("Test I: binding request to {}", server);
        let Some(first) = self.binding(server).await? else {
            info!("No response from {}", server);
            return Ok(Discovery::new(NatType::Blocked, None));
        };
        if !first.is_success() {
            warn!("Server rejected binding request: {:?}", first.message.error_code());
            return Ok(Discovery::new(NatType::Error, None));
        }
        let Some(mapped) = first.message.mapped_address().map(Host::from) else {
            warn!("Binding response from {} has no mapped address", server);
            return Ok(Discovery::new(NatType::Error, None));
        };
        debug!("Mapped address: {}", mapped);

        let Some(alternate) = first.message.alternate_address() else {
            warn!("Server {} did not advertise CHANGED-ADDRESS or OTHER-ADDRESS", server);
            return Ok(Discovery::new(NatType::Error, Some(mapped)));
        };
        let local_mapping = is_local_mapping(mapped.addr(), local);
        debug!(
            "Alternate server address: {}, local mapping: {}",
            alternate, local_mapping
        );

        debug!("Test II: change IP and port request to {}", server);
        let unfiltered = self
            .filter_probe(server, ChangeRequest::IP_AND_PORT)
            .await?;

        if local_mapping {
            let nat_type = if unfiltered {
                NatType::Open
            } else {
                NatType::SymmetricUdpFirewall
            };
            return Ok(self.verdict(nat_type, mapped));
        }
        if unfiltered {
            return Ok(self.verdict(NatType::FullCone, mapped));
        }

        debug!("Test I: binding request to alternate address {}", alternate);
        let Some(second) = self.binding(alternate).await? else {
            // Test I already proved the path is open, so this is inconsistent
            warn!("No response from alternate address {}", alternate);
            return Ok(self.verdict(NatType::Unknown, mapped));
        };
        if !second.is_success() {
            warn!("Alternate server rejected binding request: {:?}", second.message.error_code());
            return Ok(self.verdict(NatType::Error, mapped));
        }
        match second.message.mapped_address() {
            Some(addr) if addr == mapped.addr() => {}
            Some(addr) => {
                debug!("Mapping changed to {} for a new destination", addr);
                return Ok(self.verdict(NatType::Symmetric, mapped));
            }
            None => {
                warn!("Binding response from {} has no mapped address", alternate);
                return Ok(self.verdict(NatType::Error, mapped));
            }
        }

        debug!("Test III: change port request to {}", alternate);
        let port_unfiltered = self.filter_probe(alternate, ChangeRequest::PORT).await?;

        let nat_type = if port_unfiltered {
            NatType::RestrictedCone
        } else {
            NatType::PortRestrictedCone
        };
        Ok(self.verdict(nat_type, mapped))
    }

    /// Test I: a plain binding request, retried per the answer policy
    pub async fn binding(&self, server: SocketAddr) -> Result<Option<Exchange>, StunError> {
        self.probe(server, ChangeRequest::NONE, &self.config.probe)
            .await
    }

    /// Tests II and III: whether a success response gets through at all
    async fn filter_probe(
        &self,
        server: SocketAddr,
        change: ChangeRequest,
    ) -> Result<bool, StunError> {
        let response = self
            .probe(server, change, &self.config.filter_probe)
            .await?;
        Ok(response.is_some_and(|r| r.is_success()))
    }

    /// Send one request, retransmitting it on timeout
    ///
    /// `Ok(None)` means every attempt went unanswered.
    async fn probe(
        &self,
        server: SocketAddr,
        change: ChangeRequest,
        policy: &ProbePolicy,
    ) -> Result<Option<Exchange>, StunError> {
        let request = self.request(change);

        for (attempt, timeout) in policy.timeouts().enumerate() {
            match exchange(self.conn, &request, server, timeout).await {
                Ok(response) => return Ok(Some(response)),
                Err(StunError::Timeout) => {
                    debug!(
                        "No response from {} after {:?} (attempt {}/{})",
                        server,
                        timeout,
                        attempt + 1,
                        policy.attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn request(&self, change: ChangeRequest) -> Message {
        let mut request = Message::binding_request();
        if !change.is_none() {
            request.add_attribute(Attribute::ChangeRequest(change));
        }
        if self.config.software {
            request.add_attribute(Attribute::Software(self.config.software_name.clone()));
        }
        request.fingerprint = self.config.fingerprint;
        request
    }

    fn verdict(&self, nat_type: NatType, mapped: Host) -> Discovery {
        info!("NAT type: {}, mapped address: {}", nat_type, mapped);
        Discovery::new(nat_type, Some(mapped))
    }
}

/// Whether the server saw us at our own address
///
/// A socket bound to the wildcard address is compared against every local
/// interface address.
fn is_local_mapping(mapped: SocketAddr, local: SocketAddr) -> bool {
    if mapped.port() != local.port() {
        return false;
    }
    if !local.ip().is_unspecified() {
        return mapped.ip() == local.ip();
    }

    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces.iter().any(|(_, ip)| *ip == mapped.ip()),
        Err(e) => {
            debug!("Failed to list network interfaces: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::protocol::MessageClass;

    const LOCAL: &str = "192.168.1.10:40000";
    const PRIMARY: &str = "198.51.100.1:3478";
    const ALTERNATE: &str = "198.51.100.2:3479";
    const PUBLIC: &str = "203.0.113.5:61000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// Scripted server behavior: request, destination -> optional reply and its origin
    type Script = Box<dyn Fn(&Message, SocketAddr) -> Option<(Message, SocketAddr)> + Send + Sync>;

    /// In-memory channel that answers requests according to a script
    struct ScriptedChannel {
        local: SocketAddr,
        script: Script,
        inbox: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        arrived: Notify,
        sent: Mutex<Vec<(Message, SocketAddr)>>,
    }

    impl ScriptedChannel {
        fn new(local: &str, script: Script) -> Self {
            Self {
                local: addr(local),
                script,
                inbox: Mutex::new(VecDeque::new()),
                arrived: Notify::new(),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(Message, SocketAddr)> {
            self.sent.lock().clone()
        }
    }

    impl DatagramChannel for ScriptedChannel {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            let request = Message::decode(buf).expect("client sent a malformed request");
            if let Some((reply, origin)) = (self.script)(&request, target) {
                self.inbox.lock().push_back((reply.encode(), origin));
                self.arrived.notify_one();
            }
            self.sent.lock().push((request, target));
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            loop {
                let next = self.inbox.lock().pop_front();
                if let Some((data, origin)) = next {
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok((data.len(), origin));
                }
                self.arrived.notified().await;
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    /// RFC 3489 server with a primary and an alternate address, seen through a NAT
    struct Network {
        /// Mapping the server observes, per destination server IP
        mapping: fn(SocketAddr) -> SocketAddr,
        /// Whether a reply from `origin` reaches us after we sent to `destination`
        passes: fn(destination: SocketAddr, origin: SocketAddr) -> bool,
    }

    fn server(network: Network) -> Script {
        Box::new(move |request, destination| {
            let change = request.change_request();
            let mut origin = destination;
            if change.change_ip {
                origin.set_ip(if destination.ip() == addr(PRIMARY).ip() {
                    addr(ALTERNATE).ip()
                } else {
                    addr(PRIMARY).ip()
                });
            }
            if change.change_port {
                origin.set_port(if destination.port() == addr(PRIMARY).port() {
                    addr(ALTERNATE).port()
                } else {
                    addr(PRIMARY).port()
                });
            }

            if !(network.passes)(destination, origin) {
                return None;
            }

            let reply = Message::binding_response(request.transaction_id)
                .with_attribute(Attribute::XorMappedAddress((network.mapping)(destination)))
                .with_attribute(Attribute::ChangedAddress(addr(ALTERNATE)))
                .with_fingerprint();
            Some((reply, origin))
        })
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::default().with_policy(ProbePolicy::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(20),
        ))
    }

    async fn classify(channel: &ScriptedChannel) -> Discovery {
        let config = fast_config();
        Classifier::new(channel, &config)
            .classify(addr(PRIMARY))
            .await
            .unwrap()
    }

    fn public_mapping(_: SocketAddr) -> SocketAddr {
        addr(PUBLIC)
    }

    fn everything_passes(_: SocketAddr, _: SocketAddr) -> bool {
        true
    }

    fn same_endpoint_only(destination: SocketAddr, origin: SocketAddr) -> bool {
        destination == origin
    }

    fn same_ip_only(destination: SocketAddr, origin: SocketAddr) -> bool {
        destination.ip() == origin.ip()
    }

    /// Test: no response ever to Test I => Blocked
    #[tokio::test]
    async fn test_blocked() {
        let channel = ScriptedChannel::new(LOCAL, Box::new(|_, _| None));
        let discovery = classify(&channel).await;

        assert_eq!(discovery, Discovery::new(NatType::Blocked, None));
        // Every attempt went to the primary server with the same transaction
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, to)| *to == addr(PRIMARY)));
        assert_eq!(sent[0].0.transaction_id, sent[1].0.transaction_id);
    }

    /// Test: mapped == local and Test II answered => Open
    #[tokio::test]
    async fn test_open_internet() {
        let channel = ScriptedChannel::new(
            PUBLIC,
            server(Network {
                mapping: public_mapping,
                passes: everything_passes,
            }),
        );
        let discovery = classify(&channel).await;

        assert_eq!(discovery.nat_type, NatType::Open);
        assert_eq!(discovery.mapped, Some(Host::new(addr(PUBLIC))));
    }

    /// Test: mapped == local and Test II unanswered => Symmetric UDP firewall
    #[tokio::test]
    async fn test_symmetric_udp_firewall() {
        let channel = ScriptedChannel::new(
            PUBLIC,
            server(Network {
                mapping: public_mapping,
                passes: same_endpoint_only,
            }),
        );

        assert_eq!(classify(&channel).await.nat_type, NatType::SymmetricUdpFirewall);
    }

    /// Test: mapped != local and Test II answered => Full cone
    #[tokio::test]
    async fn test_full_cone() {
        let channel = ScriptedChannel::new(
            LOCAL,
            server(Network {
                mapping: public_mapping,
                passes: everything_passes,
            }),
        );
        let discovery = classify(&channel).await;

        assert_eq!(discovery.nat_type, NatType::FullCone);
        assert_eq!(discovery.mapped, Some(Host::new(addr(PUBLIC))));
        assert_eq!(channel.sent().len(), 2);
    }

    /// Test: Test II unanswered, Test I on the alternate address maps differently => Symmetric
    #[tokio::test]
    async fn test_symmetric() {
        fn per_destination(destination: SocketAddr) -> SocketAddr {
            SocketAddr::new(addr(PUBLIC).ip(), 50000 + destination.port() % 1000)
        }

        let channel = ScriptedChannel::new(
            LOCAL,
            server(Network {
                mapping: per_destination,
                passes: same_endpoint_only,
            }),
        );
        let discovery = classify(&channel).await;

        assert_eq!(discovery.nat_type, NatType::Symmetric);
        // The first mapping is the one reported
        assert_eq!(discovery.mapped, Some(Host::new(addr("203.0.113.5:50478"))));
    }

    /// Test: same mapping on the alternate address, Test III answered => Restricted cone
    #[tokio::test]
    async fn test_restricted_cone() {
        let channel = ScriptedChannel::new(
            LOCAL,
            server(Network {
                mapping: public_mapping,
                passes: same_ip_only,
            }),
        );
        let discovery = classify(&channel).await;

        assert_eq!(discovery.nat_type, NatType::RestrictedCone);

        let sent = channel.sent();
        let (last, to) = sent.last().unwrap();
        assert_eq!(*to, addr(ALTERNATE));
        assert_eq!(last.change_request(), ChangeRequest::PORT);
    }

    /// Test: same mapping on the alternate address, Test III unanswered => Port restricted cone
    #[tokio::test]
    async fn test_port_restricted_cone() {
        let channel = ScriptedChannel::new(
            LOCAL,
            server(Network {
                mapping: public_mapping,
                passes: same_endpoint_only,
            }),
        );

        assert_eq!(classify(&channel).await.nat_type, NatType::PortRestrictedCone);
    }

    /// Test: alternate address never answers => Unknown
    #[tokio::test]
    async fn test_alternate_silent_is_unknown() {
        let inner = server(Network {
            mapping: public_mapping,
            passes: same_endpoint_only,
        });
        let channel = ScriptedChannel::new(
            LOCAL,
            Box::new(move |request, destination| {
                if destination == addr(ALTERNATE) {
                    None
                } else {
                    inner(request, destination)
                }
            }),
        );

        assert_eq!(classify(&channel).await.nat_type, NatType::Unknown);
    }

    /// Test: a server without CHANGED-ADDRESS / OTHER-ADDRESS => Error with mapped host
    #[tokio::test]
    async fn test_missing_alternate_address_is_error() {
        let channel = ScriptedChannel::new(
            LOCAL,
            Box::new(|request, destination| {
                let reply = Message::binding_response(request.transaction_id)
                    .with_attribute(Attribute::MappedAddress(addr(PUBLIC)));
                Some((reply, destination))
            }),
        );
        let discovery = classify(&channel).await;

        assert_eq!(discovery.nat_type, NatType::Error);
        assert_eq!(discovery.mapped, Some(Host::new(addr(PUBLIC))));
    }

    /// Test: OTHER-ADDRESS is accepted in place of CHANGED-ADDRESS
    #[tokio::test]
    async fn test_other_address_is_used() {
        let channel = ScriptedChannel::new(
            LOCAL,
            Box::new(|request, destination| {
                if destination == addr(ALTERNATE) || !request.change_request().is_none() {
                    return None;
                }
                let reply = Message::binding_response(request.transaction_id)
                    .with_attribute(Attribute::XorMappedAddress(addr(PUBLIC)))
                    .with_attribute(Attribute::OtherAddress(addr(ALTERNATE)));
                Some((reply, destination))
            }),
        );

        // The alternate is probed, and its silence makes the result Unknown
        assert_eq!(classify(&channel).await.nat_type, NatType::Unknown);
        assert!(channel.sent().iter().any(|(_, to)| *to == addr(ALTERNATE)));
    }

    /// Test: an error response to Test I => Error without a host
    #[tokio::test]
    async fn test_error_response_is_error() {
        let channel = ScriptedChannel::new(
            LOCAL,
            Box::new(|request, destination| {
                let mut reply = Message::binding_response(request.transaction_id);
                reply.class = MessageClass::ErrorResponse;
                reply.add_attribute(Attribute::ErrorCode {
                    code: 420,
                    reason: "Unknown Attribute".to_string(),
                });
                Some((reply, destination))
            }),
        );

        assert_eq!(classify(&channel).await, Discovery::new(NatType::Error, None));
    }

    #[tokio::test]
    async fn test_requests_follow_config() {
        let channel = Arc::new(ScriptedChannel::new(LOCAL, Box::new(|_, _| None)));

        let mut config = fast_config();
        config.software_name = "unit-test".to_string();
        Classifier::new(&channel, &config)
            .classify(addr(PRIMARY))
            .await
            .unwrap();
        let (request, _) = channel.sent().remove(0);
        assert_eq!(request.software(), Some("unit-test"));
        assert!(request.fingerprint);

        config.software = false;
        config.fingerprint = false;
        let channel = ScriptedChannel::new(LOCAL, Box::new(|_, _| None));
        Classifier::new(&channel, &config)
            .classify(addr(PRIMARY))
            .await
            .unwrap();
        let (request, _) = channel.sent().remove(0);
        assert_eq!(request.software(), None);
        assert!(!request.fingerprint);
        assert!(request.attributes.is_empty());
    }

    /// How a [`BrokenChannel`] misbehaves
    #[derive(Clone, Copy)]
    enum Failure {
        Send,
        Receive,
        /// One ICMP-style reset on receive, then silence
        ResetOnce,
    }

    struct BrokenChannel {
        failure: Failure,
        receives: Mutex<u32>,
    }

    impl BrokenChannel {
        fn new(failure: Failure) -> Self {
            Self {
                failure,
                receives: Mutex::new(0),
            }
        }
    }

    impl DatagramChannel for BrokenChannel {
        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            match self.failure {
                Failure::Send => Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "network is unreachable",
                )),
                _ => Ok(buf.len()),
            }
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let first = {
                let mut receives = self.receives.lock();
                *receives += 1;
                *receives == 1
            };
            match self.failure {
                Failure::Receive => Err(io::Error::new(io::ErrorKind::NotConnected, "closed")),
                Failure::ResetOnce if first => {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "port unreachable"))
                }
                _ => std::future::pending().await,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(addr(LOCAL))
        }
    }

    /// Test: a send failure is returned as an error, not folded into Blocked
    #[tokio::test]
    async fn test_send_failure_is_an_error() {
        let channel = BrokenChannel::new(Failure::Send);
        let config = fast_config();
        let unreachable = io::ErrorKind::AddrNotAvailable;

        let result = Classifier::new(&channel, &config).classify(addr(PRIMARY)).await;
        assert!(matches!(
            result,
            Err(StunError::TransportUnavailable(ref e)) if e.kind() == unreachable
        ));
    }

    /// Test: a receive failure is returned as an error, not folded into Blocked
    #[tokio::test]
    async fn test_receive_failure_is_an_error() {
        let channel = BrokenChannel::new(Failure::Receive);
        let config = fast_config();

        let result = Classifier::new(&channel, &config).classify(addr(PRIMARY)).await;
        assert!(matches!(
            result,
            Err(StunError::TransportUnavailable(ref e)) if e.kind() == io::ErrorKind::NotConnected
        ));
    }

    /// Test: a connection reset on receive is skipped and silence still means Blocked
    #[tokio::test]
    async fn test_connection_reset_is_transient() {
        let channel = BrokenChannel::new(Failure::ResetOnce);
        let config = fast_config();

        let discovery = Classifier::new(&channel, &config)
            .classify(addr(PRIMARY))
            .await
            .unwrap();
        assert_eq!(discovery, Discovery::new(NatType::Blocked, None));
        assert!(*channel.receives.lock() >= 2);
    }

    #[test]
    fn test_is_local_mapping() {
        assert!(is_local_mapping(addr(PUBLIC), addr(PUBLIC)));
        assert!(!is_local_mapping(addr(PUBLIC), addr(LOCAL)));
        assert!(!is_local_mapping(addr("192.168.1.10:40001"), addr(LOCAL)));
        // Wildcard bind never matches a documentation address
        assert!(!is_local_mapping(addr("203.0.113.77:40000"), addr("0.0.0.0:40000")));
    }
}
