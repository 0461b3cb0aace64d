//! Peer discovery over a multicast heart-beat protocol.
//!
//! Every peer multicasts a heart-beat announcing its HTTP endpoint; the
//! receivers track liveness and reap peers that stop beating. An unknown
//! sender triggers the three-step contact handshake over unicast HTTP. On
//! shutdown, a last-beat tells the group the peer leaves gracefully.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use herald_core::beans::Message;
use herald_core::contact::SUBJECT_DISCOVERY_STEP_1;
use herald_core::{Directory, Transport};

use crate::access::HttpAccess;
use crate::packet::{self, Packet, PACKET_FORMAT_VERSION};
use crate::transport::HttpTransport;
use crate::ACCESS_ID;

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Multicast group address.
    pub group: Ipv4Addr,
    /// Multicast port.
    pub port: u16,
    /// Interval between two heart-beats.
    pub heartbeat_interval: Duration,
    /// Age after which a silent peer is dropped.
    pub peer_ttl: Duration,
    /// When false, heart-beats from peers on the local node are ignored.
    pub discover_local_peers: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 42000,
            heartbeat_interval: Duration::from_secs(20),
            peer_ttl: Duration::from_secs(30),
            discover_local_peers: true,
        }
    }
}

/// Liveness state and packet handling, shared by the receive and reaper
/// tasks (and unit tests, which drive it without sockets).
pub(crate) struct DiscoveryState {
    directory: Arc<Directory>,
    transport: Arc<HttpTransport>,
    config: MulticastConfig,
    /// peer uid -> last time a heart-beat was seen.
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl DiscoveryState {
    fn new(
        directory: Arc<Directory>,
        transport: Arc<HttpTransport>,
        config: MulticastConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    async fn handle_datagram(&self, data: &[u8], sender: SocketAddr) {
        let packet = match packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "undecodable multicast packet");
                return;
            }
        };
        if packet.version() != PACKET_FORMAT_VERSION {
            // Unsupported revision: drop without a trace.
            return;
        }
        match packet {
            Packet::Heartbeat {
                port,
                path,
                peer_uid,
                node_uid,
                app_id,
                ..
            } => {
                if self.observe_heartbeat(&peer_uid, &node_uid, &app_id) {
                    self.contact_peer(sender.ip(), port, &path).await;
                }
            }
            Packet::LastBeat {
                peer_uid, app_id, ..
            } => self.handle_lastbeat(&peer_uid, &app_id),
        }
    }

    /// Records a heart-beat. Returns whether the sender is a new peer that
    /// must be contacted.
    fn observe_heartbeat(&self, peer_uid: &str, node_uid: &str, app_id: &str) -> bool {
        let local = self.directory.get_local_peer();
        if peer_uid == local.uid() || app_id != local.app_id() {
            return false;
        }
        if !self.config.discover_local_peers && node_uid == local.node_uid() {
            return false;
        }
        self.last_seen
            .lock()
            .unwrap()
            .insert(peer_uid.to_string(), Instant::now());
        self.directory.get_peer(peer_uid).is_err()
    }

    /// The sender leaves gracefully: forget it right away.
    fn handle_lastbeat(&self, peer_uid: &str, app_id: &str) {
        let local = self.directory.get_local_peer();
        if peer_uid == local.uid() || app_id != local.app_id() {
            return;
        }
        self.last_seen.lock().unwrap().remove(peer_uid);
        if self.directory.unset_access(peer_uid, ACCESS_ID).is_ok() {
            info!(uid = peer_uid, "peer sent its last beat");
        }
    }

    /// Opens the discovery handshake with a freshly heard peer.
    async fn contact_peer(&self, host: IpAddr, port: u16, path: &str) {
        let host = match host {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(|v4| v4.to_string())
                .unwrap_or_else(|| v6.to_string()),
            IpAddr::V4(v4) => v4.to_string(),
        };
        let extra = json!({"host": host, "port": port, "path": path});
        let dump = match serde_json::to_value(self.directory.get_local_peer().description()) {
            Ok(dump) => dump,
            Err(e) => {
                warn!(error = %e, "could not dump the local peer");
                return;
            }
        };
        let message = Message::new(SUBJECT_DISCOVERY_STEP_1, dump);
        if let Err(e) = self.transport.fire(None, &message, Some(&extra)).await {
            warn!(%host, port, error = %e, "error contacting discovered peer");
        }
    }

    /// Collects the peers whose heart-beat is older than the TTL and drops
    /// their `http` access. The directory is touched outside the lock.
    fn reap(&self) {
        let expired: Vec<String> = {
            let mut last_seen = self.last_seen.lock().unwrap();
            let now = Instant::now();
            let expired: Vec<String> = last_seen
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > self.config.peer_ttl)
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in &expired {
                last_seen.remove(uid);
            }
            expired
        };
        for uid in expired {
            debug!(%uid, "peer reached its TTL");
            let _ = self.directory.unset_access(&uid, ACCESS_ID);
        }
    }

    #[cfg(test)]
    fn backdate(&self, uid: &str, age: Duration) {
        self.last_seen
            .lock()
            .unwrap()
            .insert(uid.to_string(), Instant::now() - age);
    }
}

pub struct MulticastHeartbeat {
    state: Arc<DiscoveryState>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastHeartbeat {
    pub fn new(
        directory: Arc<Directory>,
        transport: Arc<HttpTransport>,
        config: MulticastConfig,
    ) -> Self {
        Self {
            state: Arc::new(DiscoveryState::new(directory, transport, config)),
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Joins the multicast group and starts the receive, heart-beat and
    /// reaper loops. `access` is the local servlet endpoint to announce.
    pub async fn start(&self, access: &HttpAccess) -> Result<(), herald_core::HeraldError> {
        let config = self.state.config.clone();
        let recv_socket = Arc::new(multicast_socket(config.group, config.port)?);
        let send_socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let target = SocketAddr::new(IpAddr::V4(config.group), config.port);

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let local = self.state.directory.get_local_peer();
        let beat = packet::encode_heartbeat(
            access.port(),
            access.path(),
            local.uid(),
            local.node_uid(),
            local.app_id(),
        );

        let mut tasks = self.tasks.lock().unwrap();

        // Receive loop.
        {
            let state = Arc::clone(&self.state);
            let socket = Arc::clone(&recv_socket);
            let mut stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    select! {
                        _ = stop_rx.changed() => break,
                        received = socket.recv_from(&mut buf) => match received {
                            Ok((len, sender)) => {
                                state.handle_datagram(&buf[..len], sender).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "multicast receive error");
                            }
                        }
                    }
                }
            }));
        }

        // Heart-beat loop, one beat every interval.
        {
            let socket = Arc::clone(&send_socket);
            let mut stop_rx = stop_rx.clone();
            let interval = config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    if let Err(e) = socket.send_to(&beat, target).await {
                        warn!(error = %e, "cannot send the multicast heart-beat");
                    }
                    select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }));
        }

        // TTL reaper, once a second.
        {
            let state = Arc::clone(&self.state);
            let mut stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => state.reap(),
                    }
                }
            }));
        }

        // One last beat on the way out, once the loops are stopped.
        {
            let directory = Arc::clone(&self.state.directory);
            let mut stop_rx = stop_rx;
            tasks.push(tokio::spawn(async move {
                while !*stop_rx.borrow() {
                    if stop_rx.changed().await.is_err() {
                        return;
                    }
                }
                let local = directory.get_local_peer();
                let farewell = packet::encode_lastbeat(local.uid(), local.app_id());
                if let Err(e) = send_socket.send_to(&farewell, target).await {
                    warn!(error = %e, "could not send the last beat");
                }
            }));
        }

        info!(group = %config.group, port = config.port, "multicast discovery started");
        Ok(())
    }

    /// Stops the loops, sends the last beat and clears the liveness map.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap().take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.state.last_seen.lock().unwrap().clear();
    }
}

/// A reusable non-blocking UDP socket joined to the multicast group, with
/// loop-back enabled so co-located peers hear each other.
fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        let _ = socket.set_reuse_port(true);
    }
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into())
}
