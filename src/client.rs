//! Client side of a session: resolve, TCP connect, cookie-based UDP
//! handshake and the steady-state timers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{now_msec, reconstruct_msec};
use crate::config::{CLIENT_TICK_MSEC, RECEIVE_TIMEOUT_MSEC, UDP_DATAGRAM_MAX};
use crate::peer::{HeartbeatSchedule, Peer};
use crate::protocol::{
    C2S_HEARTBEAT, C2S_UDP_HANDSHAKE, S2C_HEARTBEAT, S2C_TCP_HANDSHAKE, S2C_TIME_SYNC,
};
use crate::util::net;
use crate::wire::obfuscate::Role;
use crate::wire::rpc::{Call, CallArgs, CallRouter};

/// Application callbacks. Handlers run on reactor tasks and must not block;
/// each may run concurrently with any other.
pub trait ClientInterface: Send + Sync + 'static {
    /// Resolution failed, every connect attempt failed, or the session died
    /// before it was fully established. Fired at most once, exclusive with
    /// [`on_disconnect`](Self::on_disconnect).
    fn on_connect_fail(&self, client: &Arc<Client>);
    /// The UDP handshake completed; the session is fully established.
    fn on_connect(&self, client: &Arc<Client>);
    /// One timer tick while established.
    fn on_tick(&self, client: &Arc<Client>, now_msec: u64);
    fn on_disconnect(&self, client: &Arc<Client>);
}

pub struct ClientSettings {
    pub host: String,
    pub tcp_port: u16,
}

pub struct Client {
    peer: Arc<Peer>,
    iface: Arc<dyn ClientInterface>,

    cookie: AtomicU32,
    sending_handshakes: AtomicBool,
    /// Estimated (server clock - client clock); only the low 15 bits are
    /// meaningful.
    server_time_delta: AtomicU16,
    terminated: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Spawns the session driver and returns immediately. Progress is
    /// reported through the interface callbacks.
    pub fn start(settings: ClientSettings, iface: Arc<dyn ClientInterface>) -> anyhow::Result<Arc<Client>> {
        info!("starting client for {}:{}", settings.host, settings.tcp_port);

        let client = Arc::new(Client {
            peer: Peer::new(0, Role::Client)?,
            iface,
            cookie: AtomicU32::new(0),
            sending_handshakes: AtomicBool::new(false),
            server_time_delta: AtomicU16::new(0),
            terminated: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let driver = tokio::spawn(client.clone().run(settings));
        client.tasks.lock().unwrap().push(driver);
        Ok(client)
    }

    /// Tears the session down: cancels timers and I/O, closes the sockets.
    pub async fn stop(&self) {
        debug!("stopping client");
        self.terminated.store(true, Ordering::SeqCst);
        self.peer.shutdown().await;
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("client task ended abnormally: {}", e);
                }
            }
        }
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

    /// 15-bit server-time field for outgoing packets.
    pub fn to_server_time15(&self, local_msec: u64) -> u16 {
        let delta = self.server_time_delta.load(Ordering::SeqCst) as u64;
        (local_msec.wrapping_add(delta) & 0x7fff) as u16
    }

    /// Expands a 15-bit server-time field back to local milliseconds.
    pub fn from_server_time15(&self, now_msec: u64, fifteen: u16) -> u64 {
        let delta = self.server_time_delta.load(Ordering::SeqCst);
        reconstruct_msec(now_msec, fifteen.wrapping_sub(delta) & 0x7fff)
    }

    async fn run(self: Arc<Client>, settings: ClientSettings) {
        let addrs: Vec<SocketAddr> =
            match tokio::net::lookup_host((settings.host.as_str(), settings.tcp_port)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    warn!("resolve error: {}", e);
                    self.iface.on_connect_fail(&self);
                    return;
                }
            };
        if addrs.is_empty() {
            self.iface.on_connect_fail(&self);
            return;
        }

        let start = rand::thread_rng().gen_range(0..addrs.len());
        let mut connected = None;
        for i in 0..addrs.len() {
            let addr = addrs[(start + i) % addrs.len()];
            info!("attempting connection to {}", addr);
            match net::connect_tcp(addr).await {
                Ok(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                Err(e) => debug!("connect to {} failed: {:#}", addr, e),
            }
        }
        let Some((stream, server_addr)) = connected else {
            info!("all connection attempts failed");
            self.iface.on_connect_fail(&self);
            return;
        };
        info!("connection success");

        Self::register_handlers(&self, server_addr);
        self.peer.clone().start_tcp(stream);
        self.timer_loop().await;
    }

    fn register_handlers(this: &Arc<Client>, server_addr: SocketAddr) {
        let client = this.clone();
        this.peer.router.set(S2C_TCP_HANDSHAKE, move |(cookie, udp_port): (u32, u16)| {
            info!("got TCP handshake: cookie={:#010x}, udp port={}", cookie, udp_port);
            client.cookie.store(cookie, Ordering::SeqCst);
            Client::open_udp(&client, SocketAddr::new(server_addr.ip(), udp_port));
        });

        let client = this.clone();
        this.peer.router.set(S2C_TIME_SYNC, move |(best_c2s_delta,): (u16,)| {
            if client.sending_handshakes.swap(false, Ordering::SeqCst) {
                client.peer.set_full_connection();
                client.iface.on_connect(&client);
            }

            let now = now_msec();
            let best_s2c_delta = client.peer.window_delta(now);
            let delta = ((best_c2s_delta as i32 - best_s2c_delta as u16 as i32) >> 1) as u16;
            client.server_time_delta.store(delta, Ordering::SeqCst);
            debug!("got time sync: best_c2s={}, server delta={}", best_c2s_delta, delta);
        });

        this.peer.router.set(S2C_HEARTBEAT, move |()| {
            debug!("got heartbeat");
        });
    }

    /// Opens the local UDP socket and begins handshaking over it.
    fn open_udp(this: &Arc<Client>, peer_udp: SocketAddr) {
        let socket = match net::bind_client_udp().map(Arc::new) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("failed to open UDP socket: {:#}", e);
                this.peer.disconnect();
                return;
            }
        };

        this.peer.set_udp_binding(socket.clone(), peer_udp);

        let recv_task = tokio::spawn(this.clone().udp_recv_loop(socket));
        this.peer.track_task(recv_task);

        this.sending_handshakes.store(true, Ordering::SeqCst);
    }

    async fn udp_recv_loop(self: Arc<Client>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; UDP_DATAGRAM_MAX];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let now = now_msec();
                    // a datagram from any endpoint other than the peer's is dropped
                    if self.peer.udp_peer() == Some(from) {
                        self.peer.on_udp_data(now, &mut buf[..n]);
                    }
                }
                Err(e) => {
                    warn!("UDP socket error: {}", e);
                }
            }
            if self.peer.is_disconnected() || self.terminated.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn timer_loop(self: Arc<Client>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(CLIENT_TICK_MSEC));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats = HeartbeatSchedule::new();

        loop {
            ticker.tick().await;
            if self.terminated.load(Ordering::SeqCst) {
                return;
            }
            let now = now_msec();

            if self.peer.is_disconnected() {
                if self.peer.is_full_connection() {
                    warn!("server is disconnected: stopping");
                    self.iface.on_disconnect(&self);
                } else {
                    warn!("session failed before establishment: stopping");
                    self.iface.on_connect_fail(&self);
                }
                self.peer.shutdown().await;
                return;
            }

            if self.sending_handshakes.load(Ordering::SeqCst) {
                let cookie = self.cookie.load(Ordering::SeqCst);
                if let Err(e) = self.peer.call_udp(C2S_UDP_HANDSHAKE, &(cookie,)) {
                    warn!("failed to pack UDP handshake: {:#}", e);
                }
            } else {
                let last = self.peer.last_receive_local_msec();
                if last != 0 && now.wrapping_sub(last) > RECEIVE_TIMEOUT_MSEC {
                    warn!("server timeout: disconnecting");
                    self.peer.disconnect();
                }

                if !self.peer.is_disconnected() && self.peer.is_full_connection() {
                    self.iface.on_tick(&self, now);
                }

                if self.peer.is_full_connection() && heartbeats.udp_due(now) {
                    let t15 = self.to_server_time15(now);
                    if let Err(e) = self.peer.call_udp(C2S_HEARTBEAT, &(t15,)) {
                        warn!("failed to pack UDP heartbeat: {:#}", e);
                    }
                }
                if heartbeats.tcp_due(now) {
                    let t15 = self.to_server_time15(now);
                    let _ = self.peer.call_tcp(C2S_HEARTBEAT, &(t15,));
                }
            }

            self.peer.flush();
        }
    }
}
