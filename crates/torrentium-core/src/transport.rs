//! Transport abstraction over the peer-to-peer host
//!
//! Connection establishment, identity, and NAT traversal belong to the host.
//! The rest of the system only dials addresses, exchanges framed messages on
//! the resulting streams, and listens for close events.

use crate::types::{PeerAddress, PeerInfo};
use crate::Result;
use std::future::Future;
use tokio::sync::broadcast;

/// Capacity of the host event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events the host reports about its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The remote at this address explicitly closed or reset its connection
    ConnectionClosed(PeerAddress),
}

/// A bidirectional, message-framed byte stream to one peer
pub trait PeerStream: Send + 'static {
    /// Send one message
    fn send(&mut self, data: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next message
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Close the stream
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Peer transport facade
///
/// This trait abstracts over the network host, allowing for:
/// - An in-memory network for tests
/// - A plain TCP host for the command line node
/// - Future alternative transports
pub trait Host: Send + Sync + 'static {
    type Stream: PeerStream;

    /// Our own identity and address
    fn local_peer(&self) -> &PeerInfo;

    /// Open a stream to the peer listening at `address`
    fn dial(&self, address: &PeerAddress) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Wait for the next inbound stream
    fn accept(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Subscribe to connection events
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    /// Stop accepting and tear down open streams
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

pub mod memory {
    //! In-memory network for testing and development
    //!
    //! Hosts register under `mem://<id>` addresses. The network can take hosts
    //! offline to simulate peers disappearing mid-transfer.

    use super::*;
    use crate::types::PeerId;
    use crate::Error;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct HostSlot {
        inbound: mpsc::UnboundedSender<MemoryStream>,
        events: broadcast::Sender<HostEvent>,
        online: bool,
    }

    #[derive(Default)]
    struct NetworkInner {
        hosts: HashMap<PeerAddress, HostSlot>,
    }

    impl NetworkInner {
        fn is_online(&self, address: &PeerAddress) -> bool {
            self.hosts.get(address).map(|h| h.online).unwrap_or(false)
        }
    }

    /// A shared in-memory network
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        inner: Arc<Mutex<NetworkInner>>,
    }

    impl MemoryNetwork {
        /// Create an empty network
        pub fn new() -> Self {
            Self::default()
        }

        /// Address used for a host with the given id
        pub fn address_for(id: &str) -> PeerAddress {
            PeerAddress::new(format!("mem://{}", id))
        }

        /// Register a new host
        pub fn host(&self, id: &str) -> MemoryHost {
            let address = Self::address_for(id);
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

            self.lock().hosts.insert(
                address.clone(),
                HostSlot {
                    inbound: inbound_tx,
                    events,
                    online: true,
                },
            );

            MemoryHost {
                local: PeerInfo {
                    id: PeerId::new(id),
                    address,
                },
                network: self.clone(),
                inbound: tokio::sync::Mutex::new(inbound_rx),
            }
        }

        /// Take a host offline: dials fail and open streams break.
        /// Every other host observes the close.
        pub fn disconnect(&self, address: &PeerAddress) {
            let mut inner = self.lock();
            if let Some(slot) = inner.hosts.get_mut(address) {
                slot.online = false;
            }
            for (other, slot) in inner.hosts.iter() {
                if other != address {
                    let _ = slot.events.send(HostEvent::ConnectionClosed(address.clone()));
                }
            }
        }

        /// Bring a previously disconnected host back
        pub fn reconnect(&self, address: &PeerAddress) {
            if let Some(slot) = self.lock().hosts.get_mut(address) {
                slot.online = true;
            }
        }

        pub fn is_online(&self, address: &PeerAddress) -> bool {
            self.lock().is_online(address)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
            // A poisoned lock only means a test panicked mid-update
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    /// One host attached to a [`MemoryNetwork`]
    pub struct MemoryHost {
        local: PeerInfo,
        network: MemoryNetwork,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    }

    impl Host for MemoryHost {
        type Stream = MemoryStream;

        fn local_peer(&self) -> &PeerInfo {
            &self.local
        }

        async fn dial(&self, address: &PeerAddress) -> Result<MemoryStream> {
            let inner = self.network.lock();
            if !inner.is_online(&self.local.address) {
                return Err(Error::ConnectionFailed("local host is offline".to_string()));
            }
            let slot = inner
                .hosts
                .get(address)
                .filter(|slot| slot.online)
                .ok_or_else(|| Error::ConnectionFailed(format!("{} unreachable", address)))?;

            let (to_remote, remote_rx) = mpsc::unbounded_channel();
            let (to_local, local_rx) = mpsc::unbounded_channel();

            let remote_end = MemoryStream {
                network: self.network.clone(),
                local: address.clone(),
                remote: self.local.address.clone(),
                tx: Some(to_local),
                rx: remote_rx,
            };
            slot.inbound
                .send(remote_end)
                .map_err(|_| Error::ConnectionFailed(format!("{} is not accepting", address)))?;

            Ok(MemoryStream {
                network: self.network.clone(),
                local: self.local.address.clone(),
                remote: address.clone(),
                tx: Some(to_remote),
                rx: local_rx,
            })
        }

        async fn accept(&self) -> Result<MemoryStream> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::ConnectionFailed("host closed".to_string()))
        }

        fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
            match self.network.lock().hosts.get(&self.local.address) {
                Some(slot) => slot.events.subscribe(),
                None => broadcast::channel(1).1,
            }
        }

        async fn close(&self) -> Result<()> {
            self.network.lock().hosts.remove(&self.local.address);
            Ok(())
        }
    }

    /// One end of an in-memory stream
    pub struct MemoryStream {
        network: MemoryNetwork,
        local: PeerAddress,
        remote: PeerAddress,
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl MemoryStream {
        fn link_up(&self) -> bool {
            let inner = self.network.lock();
            inner.is_online(&self.local) && inner.is_online(&self.remote)
        }
    }

    impl PeerStream for MemoryStream {
        async fn send(&mut self, data: Vec<u8>) -> Result<()> {
            if !self.link_up() {
                self.tx = None;
                return Err(Error::ConnectionFailed(format!("link to {} is down", self.remote)));
            }
            self.tx
                .as_ref()
                .ok_or_else(|| Error::ConnectionFailed("stream closed".to_string()))?
                .send(data)
                .map_err(|_| Error::ConnectionFailed(format!("{} closed the stream", self.remote)))
        }

        async fn recv(&mut self) -> Result<Vec<u8>> {
            let data = self
                .rx
                .recv()
                .await
                .ok_or_else(|| Error::ConnectionFailed(format!("{} closed the stream", self.remote)))?;
            if !self.link_up() {
                return Err(Error::ConnectionFailed(format!("link to {} is down", self.remote)));
            }
            Ok(data)
        }

        async fn close(&mut self) -> Result<()> {
            self.tx = None;
            self.rx.close();
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_dial_accept_exchange() {
            let network = MemoryNetwork::new();
            let a = network.host("a");
            let b = network.host("b");

            let mut outbound = a.dial(&b.local_peer().address).await.unwrap();
            outbound.send(b"hello".to_vec()).await.unwrap();

            let mut inbound = b.accept().await.unwrap();
            assert_eq!(inbound.recv().await.unwrap(), b"hello");
            inbound.send(b"world".to_vec()).await.unwrap();
            assert_eq!(outbound.recv().await.unwrap(), b"world");

            inbound.close().await.unwrap();
            assert!(outbound.recv().await.is_err());
        }

        #[tokio::test]
        async fn test_disconnect_breaks_dials_and_notifies() {
            let network = MemoryNetwork::new();
            let a = network.host("a");
            let b = network.host("b");
            let mut events = a.subscribe();

            network.disconnect(&b.local_peer().address);
            assert!(a.dial(&b.local_peer().address).await.is_err());
            assert_eq!(
                events.recv().await.unwrap(),
                HostEvent::ConnectionClosed(b.local_peer().address.clone())
            );

            network.reconnect(&b.local_peer().address);
            assert!(a.dial(&b.local_peer().address).await.is_ok());
        }

        #[tokio::test]
        async fn test_dial_unknown_address_fails() {
            let network = MemoryNetwork::new();
            let a = network.host("a");
            let result = a.dial(&MemoryNetwork::address_for("nobody")).await;
            assert!(matches!(result, Err(Error::ConnectionFailed(_))));
        }
    }
}
