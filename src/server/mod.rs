//! The server: a TCP acceptor, a pool of UDP listeners each on its own
//! port, a worker pool, and the load balancing that ties them together.

pub mod connection;
pub(crate) mod udp;
pub(crate) mod worker;

use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::now_usec;
use crate::server::connection::Connection;
use crate::server::udp::UdpServer;
use crate::server::worker::Workers;
use crate::util::net;

/// Per-connection application callbacks. Handlers run on reactor tasks and
/// must not block; each may run concurrently with any other.
pub trait ConnectionInterface: Send + Sync + 'static {
    /// The UDP handshake completed; the connection is fully established.
    fn on_connect(&self, connection: &Arc<Connection>);
    /// One worker tick while established.
    fn on_tick(&self, connection: &Arc<Connection>, now_msec: u64);
    fn on_disconnect(&self, connection: &Arc<Connection>);
}

/// Fabricates the application side of each accepted connection.
pub trait ServerInterface: Send + Sync + 'static {
    fn create_connection(&self, connection: &Arc<Connection>) -> Arc<dyn ConnectionInterface>;
}

pub struct ServerSettings {
    /// 0 means one worker per CPU core.
    pub worker_count: usize,
    pub tcp_port: u16,
    /// Inclusive range of UDP listener ports.
    pub start_udp_port: u16,
    pub stop_udp_port: u16,
}

impl ServerSettings {
    pub fn new(tcp_port: u16) -> ServerSettings {
        ServerSettings {
            worker_count: 0,
            tcp_port,
            start_udp_port: tcp_port,
            stop_udp_port: tcp_port + 1,
        }
    }
}

pub struct Server {
    workers: Arc<Workers>,
    udp_servers: Vec<UdpServer>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub async fn start(
        settings: ServerSettings,
        iface: Arc<dyn ServerInterface>,
    ) -> anyhow::Result<Server> {
        info!(
            "starting server on TCP port {} and UDP ports {}..={}",
            settings.tcp_port, settings.start_udp_port, settings.stop_udp_port
        );

        let worker_count = if settings.worker_count == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            settings.worker_count
        };
        let workers = Arc::new(Workers::start(worker_count));

        let mut udp_servers = Vec::new();
        for port in settings.start_udp_port..=settings.stop_udp_port {
            udp_servers.push(UdpServer::start(port).await?);
        }

        let listener = net::bind_tcp_listener(settings.tcp_port)?;

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            workers.clone(),
            udp_servers.iter().map(|udp| udp.shared.clone()).collect(),
            iface,
        ));

        Ok(Server {
            workers,
            udp_servers,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub async fn stop(self) {
        info!("stopping server");
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
            // the join error for an aborted acceptor is expected noise
            let _ = task.await;
        }
        self.workers.stop().await;
        for udp in self.udp_servers {
            udp.stop().await;
        }
    }

    async fn accept_loop(
        listener: tokio::net::TcpListener,
        workers: Arc<Workers>,
        udp_servers: Vec<Arc<udp::UdpServerShared>>,
        iface: Arc<dyn ServerInterface>,
    ) {
        let mut cookie_gen = SmallRng::seed_from_u64(now_usec());
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("accepted a TCP connection from {}", peer_addr);
                    if let Err(e) = net::configure_tcp_stream(&stream) {
                        warn!("failed to configure accepted socket: {:#}", e);
                    }

                    let cookie = cookie_gen.next_u32();
                    let udp = udp_servers
                        .iter()
                        .min_by_key(|shared| shared.connection_count())
                        .expect("at least one UDP server is configured");

                    let conn = match Connection::new(
                        stream,
                        peer_addr,
                        udp.socket(),
                        udp.port(),
                        cookie,
                        Arc::downgrade(udp),
                    ) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("failed to set up connection: {:#}", e);
                            continue;
                        }
                    };
                    conn.set_iface(iface.create_connection(&conn));

                    if !udp.pre_map_insert(cookie, conn.clone()) {
                        warn!("cookie collision {:#010x} on UDP port {}", cookie, udp.port());
                    }

                    workers.laziest().add_new_connection(conn);
                }
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                }
            }
        }
    }
}
