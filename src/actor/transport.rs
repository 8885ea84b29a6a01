//! Transport seam: picks a route among candidate endpoints, sends bytes and
//! receives bytes, plus a UDP socket implementation and an in-memory one.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use lru::LruCache;
use tracing::{trace, warn};

use crate::common::{Endpoint, Protocol};

use super::config::DEFAULT_PORT;

const MTU: usize = 2048;
const ROUTE_CACHE_SIZE: usize = 1024;
/// How long an address that sent us something stays the preferred route.
const ROUTE_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

/// Sends and receives raw packages.
///
/// Implementations demultiplex their own sockets, the actor only sees endpoints.
pub trait Transport: Send + Debug {
    /// Endpoints this transport listens on.
    fn listen_endpoints(&self) -> Vec<Endpoint>;

    /// Pick the endpoint to send to among `candidates`, None if none is usable.
    fn route(&mut self, candidates: &[Endpoint], ignore_route_cache: bool) -> Option<Endpoint>;

    fn send_to(&mut self, endpoint: &Endpoint, bytes: &[u8]) -> std::io::Result<()>;

    /// Non blocking receive of one package and the endpoint it came from.
    fn recv_from(&mut self) -> Option<(Vec<u8>, Endpoint)>;
}

#[derive(Debug)]
/// Non blocking UDP socket transport.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Addresses we recently received from, preferred when routing.
    responsive: LruCache<SocketAddr, Instant>,
}

impl UdpTransport {
    /// Bind on `port`, or on [DEFAULT_PORT] falling back to a random port.
    pub fn bind(ip: IpAddr, port: Option<u16>) -> std::io::Result<Self> {
        let socket = if let Some(port) = port {
            UdpSocket::bind(SocketAddr::new(ip, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(ip, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(ip, 0)),
            }?
        };

        let local_addr = socket.local_addr()?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local_addr,
            responsive: LruCache::new(
                NonZeroUsize::new(ROUTE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
        })
    }

    /// Bind on every IPv4 interface.
    pub fn new(port: Option<u16>) -> std::io::Result<Self> {
        Self::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Bind on the loopback interface, random port.
    pub fn localhost() -> std::io::Result<Self> {
        Self::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), Some(0))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_routable(&self, endpoint: &Endpoint) -> bool {
        endpoint.is_udp()
            && !endpoint.is_zero()
            && endpoint.address.is_ipv4() == self.local_addr.is_ipv4()
    }
}

impl Transport for UdpTransport {
    fn listen_endpoints(&self) -> Vec<Endpoint> {
        vec![Endpoint::udp(self.local_addr)]
    }

    fn route(&mut self, candidates: &[Endpoint], ignore_route_cache: bool) -> Option<Endpoint> {
        let now = Instant::now();

        if !ignore_route_cache {
            let cached = candidates.iter().find(|ep| {
                self.is_routable(ep)
                    && self
                        .responsive
                        .peek(&ep.address)
                        .is_some_and(|seen| now.saturating_duration_since(*seen) < ROUTE_CACHE_TTL)
            });
            if let Some(endpoint) = cached {
                return Some(*endpoint);
            }
        }

        candidates.iter().find(|ep| self.is_routable(ep)).copied()
    }

    fn send_to(&mut self, endpoint: &Endpoint, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, endpoint.address)?;
        trace!(context = "transport", to = %endpoint, len = bytes.len(), "Sent package");
        Ok(())
    }

    fn recv_from(&mut self) -> Option<(Vec<u8>, Endpoint)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, from)) => {
                if from.port() == 0 {
                    trace!(context = "transport", "Package from port 0");
                    return None;
                }
                self.responsive.put(from, Instant::now());

                Some((buf[..amt].to_vec(), Endpoint::udp(from)))
            }
            Err(error) => {
                if error.kind() != ErrorKind::WouldBlock {
                    warn!("IO error {error}");
                }
                None
            }
        }
    }
}

type Inbox = Sender<(Vec<u8>, Endpoint)>;

#[derive(Debug, Clone, Default)]
/// In-process network connecting [MemoryTransport]s, for simulations and tests.
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<SocketAddr, Inbox>>>,
    next_port: Arc<Mutex<u16>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a transport at `127.0.0.1:<next port>` with the given protocol.
    pub fn transport(&self, protocol: Protocol) -> MemoryTransport {
        let port = match self.next_port.lock() {
            Ok(mut next) => {
                *next = next.wrapping_add(1).max(1);
                *next
            }
            Err(_) => 1,
        };

        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let (sender, receiver) = flume::unbounded();

        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(address, sender);
        }

        MemoryTransport {
            endpoint: Endpoint::new(address, protocol),
            receiver,
            network: self.clone(),
        }
    }

    /// Detach an address, packages sent to it are lost.
    pub fn disconnect(&self, address: &SocketAddr) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(address);
        }
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    endpoint: Endpoint,
    receiver: Receiver<(Vec<u8>, Endpoint)>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Transport for MemoryTransport {
    fn listen_endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint]
    }

    fn route(&mut self, candidates: &[Endpoint], _ignore_route_cache: bool) -> Option<Endpoint> {
        candidates
            .iter()
            .find(|ep| ep.protocol == self.endpoint.protocol && !ep.is_zero())
            .copied()
    }

    fn send_to(&mut self, endpoint: &Endpoint, bytes: &[u8]) -> std::io::Result<()> {
        let inbox = self
            .network
            .nodes
            .lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "memory network poisoned"))?
            .get(&endpoint.address)
            .cloned();

        // Like UDP, sending into the void is not an error.
        if let Some(inbox) = inbox {
            let _ = inbox.send((bytes.to_vec(), self.endpoint));
        }

        Ok(())
    }

    fn recv_from(&mut self) -> Option<(Vec<u8>, Endpoint)> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn udp_send_and_receive() {
        let mut server = UdpTransport::localhost().unwrap();
        let mut client = UdpTransport::localhost().unwrap();

        let server_endpoint = server.listen_endpoints()[0];
        let client_address = client.local_addr();

        let server_thread = thread::spawn(move || loop {
            if let Some((bytes, from)) = server.recv_from() {
                assert_eq!(bytes, b"hello");
                assert_eq!(from, Endpoint::udp(client_address));
                break;
            }
        });

        client.send_to(&server_endpoint, b"hello").unwrap();

        server_thread.join().unwrap();
    }

    #[test]
    fn udp_route_skips_unusable_candidates() {
        let mut transport = UdpTransport::localhost().unwrap();

        let tcp = Endpoint::tcp(SocketAddr::from(([127, 0, 0, 1], 5000)));
        let v6 = Endpoint::udp("[::1]:5000".parse().unwrap());
        let zero = Endpoint::udp(SocketAddr::from(([0, 0, 0, 0], 5000)));
        let good = Endpoint::udp(SocketAddr::from(([127, 0, 0, 1], 5001)));

        assert_eq!(transport.route(&[tcp, v6, zero, good], false), Some(good));
        assert_eq!(transport.route(&[tcp, v6], false), None);
    }

    #[test]
    fn udp_route_prefers_responsive() {
        let mut transport = UdpTransport::localhost().unwrap();
        let first = Endpoint::udp(SocketAddr::from(([127, 0, 0, 1], 5000)));
        let second = Endpoint::udp(SocketAddr::from(([127, 0, 0, 1], 5001)));

        transport.responsive.put(second.address, Instant::now());

        assert_eq!(transport.route(&[first, second], false), Some(second));
        assert_eq!(transport.route(&[first, second], true), Some(first));
    }

    #[test]
    fn memory_network() {
        let network = MemoryNetwork::new();
        let mut a = network.transport(Protocol::Udp);
        let mut b = network.transport(Protocol::Udp);

        a.send_to(&b.endpoint(), b"ping").unwrap();

        assert_eq!(b.recv_from(), Some((b"ping".to_vec(), a.endpoint())));
        assert_eq!(b.recv_from(), None);
    }
}
