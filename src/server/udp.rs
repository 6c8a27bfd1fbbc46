//! One UDP listener socket with its two connection indices: cookies of
//! connections still waiting for their UDP handshake, and established
//! connections keyed by the client's observed endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::clock::now_msec;
use crate::config::UDP_DATAGRAM_MAX;
use crate::protocol::C2S_UDP_HANDSHAKE;
use crate::server::connection::Connection;
use crate::util::net;
use crate::wire::obfuscate::{Role, SessionCipher, UdpCipher};
use crate::wire::rpc::CallRouter;
use crate::wire::ser::WireSerialize;
use crate::wire::stream::StreamReader;

pub(crate) struct UdpServerShared {
    port: u16,
    socket: Arc<UdpSocket>,

    established: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
    pre_connections: Mutex<FxHashMap<u32, Arc<Connection>>>,

    /// Router for datagrams from unknown endpoints; its only registered
    /// call is the UDP handshake.
    pre_router: CallRouter,
    /// Sender of the datagram currently going through the pre-connection
    /// router. The receive loop is the only writer.
    pre_from: Mutex<Option<SocketAddr>>,
}

pub(crate) struct UdpServer {
    pub(crate) shared: Arc<UdpServerShared>,
    task: JoinHandle<()>,
}

impl UdpServer {
    pub(crate) async fn start(port: u16) -> anyhow::Result<UdpServer> {
        info!("UDP {}: starting server", port);
        let socket = Arc::new(net::bind_server_udp(port)?);

        let shared = Arc::new(UdpServerShared {
            port,
            socket,
            established: Mutex::new(FxHashMap::default()),
            pre_connections: Mutex::new(FxHashMap::default()),
            pre_router: CallRouter::new(),
            pre_from: Mutex::new(None),
        });

        let weak: Weak<UdpServerShared> = Arc::downgrade(&shared);
        shared.pre_router.set(C2S_UDP_HANDSHAKE, move |(cookie,): (u32,)| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Some(from) = shared.pre_from.lock().unwrap().take() else {
                return;
            };
            // a cookie nobody is waiting for is silently dropped
            if let Some(conn) = shared.pre_map_find_remove(cookie) {
                info!("UDP {}: got handshake from {}", shared.port, from);
                Connection::on_udp_handshake(&conn, from);
                if !shared.map_insert(from, conn) {
                    warn!("UDP {}: endpoint {} already mapped", shared.port, from);
                }
            }
        });

        let task = tokio::spawn(Self::recv_loop(shared.clone()));
        Ok(UdpServer { shared, task })
    }

    pub(crate) async fn stop(self) {
        info!("UDP {}: stopping", self.shared.port);
        self.task.abort();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("UDP receive loop ended abnormally: {}", e);
            }
        }
        self.shared.established.lock().unwrap().clear();
        self.shared.pre_connections.lock().unwrap().clear();
    }

    async fn recv_loop(shared: Arc<UdpServerShared>) {
        let pre_cipher = SessionCipher::new(0, Role::Server).udp_in;
        let mut buf = [0u8; UDP_DATAGRAM_MAX];
        loop {
            match shared.socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let now = now_msec();
                    trace!("UDP {}: {} bytes from {}", shared.port, n, from);
                    let conn = shared.established.lock().unwrap().get(&from).cloned();
                    match conn {
                        Some(conn) => conn.peer().on_udp_data(now, &mut buf[..n]),
                        None => shared.handle_pre_connect(&pre_cipher, from, &mut buf[..n]),
                    }
                }
                Err(e) => {
                    warn!("UDP {}: socket error: {}", shared.port, e);
                }
            }
        }
    }
}

impl UdpServerShared {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    fn handle_pre_connect(&self, cipher: &UdpCipher, from: SocketAddr, datagram: &mut [u8]) {
        cipher.decrypt(datagram);

        let mut r = StreamReader::wrap(datagram);
        let Ok(_wire_time) = u16::try_deser(&mut r) else {
            return;
        };

        *self.pre_from.lock().unwrap() = Some(from);
        if let Err(e) = self.pre_router.dispatch_one(&mut r) {
            trace!("UDP {}: dropping pre-connection datagram from {}: {:#}", self.port, from, e);
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.established.lock().unwrap().len() + self.pre_connections.lock().unwrap().len()
    }

    /// Registers an established endpoint. Never replaces: returns false if
    /// the endpoint is already mapped.
    fn map_insert(&self, addr: SocketAddr, conn: Arc<Connection>) -> bool {
        use std::collections::hash_map::Entry;
        match self.established.lock().unwrap().entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    pub(crate) fn map_remove(&self, addr: &SocketAddr) -> bool {
        self.established.lock().unwrap().remove(addr).is_some()
    }

    /// Registers a pre-connection cookie. Idempotent on collision: returns
    /// false without replacing the existing entry.
    pub(crate) fn pre_map_insert(&self, cookie: u32, conn: Arc<Connection>) -> bool {
        use std::collections::hash_map::Entry;
        match self.pre_connections.lock().unwrap().entry(cookie) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    pub(crate) fn pre_map_remove(&self, cookie: u32) -> bool {
        self.pre_connections.lock().unwrap().remove(&cookie).is_some()
    }

    fn pre_map_find_remove(&self, cookie: u32) -> Option<Arc<Connection>> {
        self.pre_connections.lock().unwrap().remove(&cookie)
    }

    #[cfg(test)]
    fn contains_established(&self, addr: &SocketAddr) -> bool {
        self.established.lock().unwrap().contains_key(addr)
    }

    #[cfg(test)]
    fn contains_cookie(&self, cookie: u32) -> bool {
        self.pre_connections.lock().unwrap().contains_key(&cookie)
    }
}
