//! One accepted client on the server: the shared peer session plus the
//! server-side lifecycle (cookie, assigned UDP port, heartbeat timers, map
//! cleanup).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::clock::{now_msec, reconstruct_msec};
use crate::config::RECEIVE_TIMEOUT_MSEC;
use crate::peer::{HeartbeatSchedule, Peer};
use crate::protocol::{C2S_HEARTBEAT, S2C_HEARTBEAT, S2C_TCP_HANDSHAKE, S2C_TIME_SYNC};
use crate::server::udp::UdpServerShared;
use crate::server::ConnectionInterface;
use crate::wire::obfuscate::Role;
use crate::wire::rpc::{Call, CallArgs, CallRouter};

pub struct Connection {
    peer: Arc<Peer>,
    iface: OnceLock<Arc<dyn ConnectionInterface>>,

    peer_tcp_addr: SocketAddr,
    udp_socket: Arc<UdpSocket>,
    udp_port: u16,
    cookie: u32,

    /// Held until the worker promotes the connection and arms the read loop.
    tcp_stream: Mutex<Option<TcpStream>>,
    /// The UDP server owning this connection's map entries.
    udp_server: Weak<UdpServerShared>,
    /// The client's UDP endpoint once the handshake completed.
    established_endpoint: Mutex<Option<SocketAddr>>,

    heartbeats: Mutex<HeartbeatSchedule>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer_tcp_addr: SocketAddr,
        udp_socket: Arc<UdpSocket>,
        udp_port: u16,
        cookie: u32,
        udp_server: Weak<UdpServerShared>,
    ) -> anyhow::Result<Arc<Connection>> {
        let conn = Arc::new(Connection {
            peer: Peer::new(0, Role::Server)?,
            iface: OnceLock::new(),
            peer_tcp_addr,
            udp_socket,
            udp_port,
            cookie,
            tcp_stream: Mutex::new(Some(stream)),
            udp_server,
            established_endpoint: Mutex::new(None),
            heartbeats: Mutex::new(HeartbeatSchedule::new()),
        });

        conn.peer.router.set(C2S_HEARTBEAT, |(sent_time,): (u16,)| {
            let now = now_msec();
            let sent_full = reconstruct_msec(now, sent_time & 0x7fff);
            debug!("got heartbeat, one-way delay {} ms", now as i64 - sent_full as i64);
        });

        Ok(conn)
    }

    pub(crate) fn set_iface(&self, iface: Arc<dyn ConnectionInterface>) {
        let _ = self.iface.set(iface);
    }

    pub fn router(&self) -> &CallRouter {
        &self.peer.router
    }

    pub fn call_tcp<A: CallArgs>(&self, call: Call<A>, args: &A) -> anyhow::Result<()> {
        self.peer.call_tcp(call, args)
    }

    pub fn call_udp<A: CallArgs>(&self, call: Call<A>, args: &A) -> anyhow::Result<()> {
        self.peer.call_udp(call, args)
    }

    pub fn disconnect(&self) {
        self.peer.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.peer.is_disconnected()
    }

    pub fn is_established(&self) -> bool {
        self.peer.is_full_connection()
    }

    pub fn peer_tcp_addr(&self) -> SocketAddr {
        self.peer_tcp_addr
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub(crate) fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// First tick on the owning worker: sends the TCP handshake and arms
    /// the TCP read loop.
    pub(crate) fn on_worker_start(&self) {
        info!("worker starting on connection; sending TCP handshake");
        if let Err(e) = self.peer.call_tcp(S2C_TCP_HANDSHAKE, &(self.cookie, self.udp_port)) {
            warn!("failed to pack TCP handshake: {:#}", e);
        }
        if let Some(stream) = self.tcp_stream.lock().unwrap().take() {
            self.peer.clone().start_tcp(stream);
        }
    }

    /// The pre-connection router matched this connection's cookie: bind the
    /// UDP flow to the sender's endpoint and promote to a full connection.
    pub(crate) fn on_udp_handshake(conn: &Arc<Connection>, from: SocketAddr) {
        conn.peer.set_udp_binding(conn.udp_socket.clone(), from);
        *conn.established_endpoint.lock().unwrap() = Some(from);
        conn.peer.set_full_connection();

        info!("connection got UDP handshake from client: session established");
        if let Some(iface) = conn.iface.get() {
            iface.on_connect(conn);
        }
    }

    /// One worker tick. Returns true when the connection should be dropped
    /// from the worker's list.
    pub(crate) fn on_tick(conn: &Arc<Connection>, now_msec: u64) -> bool {
        let last = conn.peer.last_receive_local_msec();
        if last != 0 && now_msec.wrapping_sub(last) > RECEIVE_TIMEOUT_MSEC {
            warn!("client timeout: disconnecting");
            conn.peer.disconnect();
        }

        if !conn.peer.is_disconnected() && conn.peer.is_full_connection() {
            if let Some(iface) = conn.iface.get() {
                iface.on_tick(conn, now_msec);
            }
        }

        if conn.peer.is_disconnected() {
            warn!("client is disconnected: removing from worker");
            if conn.peer.is_full_connection() {
                if let Some(iface) = conn.iface.get() {
                    iface.on_disconnect(conn);
                }
            }
            conn.cleanup_udp_maps();
            return true;
        }

        {
            let mut heartbeats = conn.heartbeats.lock().unwrap();
            if conn.peer.is_full_connection() && heartbeats.udp_due(now_msec) {
                let best_delta = conn.peer.window_delta(now_msec) as u16;
                debug!("sending UDP time sync");
                if let Err(e) = conn.peer.call_udp(S2C_TIME_SYNC, &(best_delta,)) {
                    warn!("failed to pack time sync: {:#}", e);
                }
            }
            if heartbeats.tcp_due(now_msec) {
                debug!("sending TCP heartbeat");
                let _ = conn.peer.call_tcp(S2C_HEARTBEAT, &());
            }
        }

        conn.peer.flush();
        false
    }

    fn cleanup_udp_maps(&self) {
        let Some(udp_server) = self.udp_server.upgrade() else {
            return;
        };
        udp_server.pre_map_remove(self.cookie);
        if let Some(endpoint) = self.established_endpoint.lock().unwrap().take() {
            udp_server.map_remove(&endpoint);
        }
    }
}
