//! Position-rebroadcast demo: players log in over TCP and stream positions
//! over UDP; the server rebroadcasts each player's latest position to the
//! players near it.
//!
//! Run `arena server` in one terminal and `arena client [host]` in others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use tandem::client::{Client, ClientInterface, ClientSettings};
use tandem::clock::{now_msec, now_usec, reconstruct_msec};
use tandem::server::connection::Connection;
use tandem::server::{ConnectionInterface, Server, ServerInterface, ServerSettings};
use tandem::spatial::{NeighborRef, NeighborTracker};
use tandem::wire::rpc::{Call, CallArgs};
use tandem::wire::ser::WireSerialize;
use tandem::wire::stream::{StreamReader, StreamWriter};

const S2C_SET_PLAYER_ID: Call<(u8,)> = Call::new(1);
const S2C_ADD_PLAYER: Call<(u8, String)> = Call::new(2);
const S2C_REMOVE_PLAYER: Call<(u8,)> = Call::new(3);
const S2C_POSITION_UPDATE: Call<(u8, u16, PlayerPosition)> = Call::new(4);

const C2S_LOGIN: Call<(String,)> = Call::new(1);
const C2S_POSITION_UPDATE: Call<(u16, PlayerPosition)> = Call::new(2);

/// Players whose centers are within this L-infinity distance of each other
/// receive each other's updates.
const BROADCAST_DISTANCE: i32 = 100;

/// At most this many neighbor updates per player per tick; the start index
/// round-robins so every neighbor gets its turn in crowded spots.
const BROADCAST_PLAYER_LIMIT: usize = 15;

/// Do not rebroadcast positions older than this.
const BROADCAST_TIME_LIMIT_MSEC: u64 = 2_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PlayerPosition {
    x: i16,
    y: i16,
    vx: i16,
    vy: i16,
    angle: u8,
    distance: u8,
}

impl WireSerialize for PlayerPosition {
    fn ser(&self, w: &mut StreamWriter<'_>) {
        self.x.ser(w);
        self.y.ser(w);
        self.vx.ser(w);
        self.vy.ser(w);
        self.angle.ser(w);
        self.distance.ser(w);
    }

    fn try_deser(r: &mut StreamReader<'_>) -> anyhow::Result<Self> {
        Ok(PlayerPosition {
            x: i16::try_deser(r)?,
            y: i16::try_deser(r)?,
            vx: i16::try_deser(r)?,
            vy: i16::try_deser(r)?,
            angle: u8::try_deser(r)?,
            distance: u8::try_deser(r)?,
        })
    }
}

//-----------------------------------------------------------------------------
// Server

#[derive(Clone, Copy, Default)]
struct PositionData {
    has_position: bool,
    position: PlayerPosition,
    timestamp15: u16,
    /// Local time the position was sent, for the staleness cutoff.
    position_msec: u64,
}

impl PositionData {
    fn broadcastable(&self, now_msec: u64) -> bool {
        self.has_position && now_msec.saturating_sub(self.position_msec) < BROADCAST_TIME_LIMIT_MSEC
    }
}

struct PlayerEntry {
    id: u8,
    name: Mutex<String>,
    conn: Weak<Connection>,
    position: Mutex<PositionData>,
    neighbor: Mutex<Option<NeighborRef>>,
}

struct PidPool {
    free: Mutex<Vec<u8>>,
}

impl PidPool {
    fn new() -> PidPool {
        PidPool {
            free: Mutex::new((0..=255).rev().collect()),
        }
    }

    fn acquire(&self) -> Option<u8> {
        self.free.lock().unwrap().pop()
    }

    fn release(&self, pid: u8) {
        self.free.lock().unwrap().push(pid);
    }
}

struct Arena {
    tracker: NeighborTracker<Arc<PlayerEntry>>,
    players: Mutex<FxHashMap<u8, Arc<PlayerEntry>>>,
    pids: PidPool,
}

impl Arena {
    /// Sends `call(args)` over TCP to every logged-in player except `skip`.
    fn broadcast<A: CallArgs>(&self, skip: u8, call: Call<A>, args: &A) {
        let players: Vec<Arc<PlayerEntry>> =
            self.players.lock().unwrap().values().cloned().collect();
        for entry in players {
            if entry.id == skip {
                continue;
            }
            if let Some(conn) = entry.conn.upgrade() {
                if let Err(e) = conn.call_tcp(call, args) {
                    warn!("broadcast to {} failed: {:#}", entry.id, e);
                }
            }
        }
    }

    fn on_login(arena: &Arc<Arena>, entry: &Arc<PlayerEntry>, conn: &Arc<Connection>, name: String) {
        info!("{}: user login {:?}", entry.id, name);
        *entry.name.lock().unwrap() = name.clone();

        arena.players.lock().unwrap().insert(entry.id, entry.clone());
        arena.broadcast(entry.id, S2C_ADD_PLAYER, &(entry.id, name));

        // the newcomer gets the whole player list
        let players: Vec<Arc<PlayerEntry>> =
            arena.players.lock().unwrap().values().cloned().collect();
        for other in players {
            let other_name = other.name.lock().unwrap().clone();
            let _ = conn.call_tcp(S2C_ADD_PLAYER, &(other.id, other_name));
        }

        // positions only make sense for a logged-in player
        let arena = arena.clone();
        let entry = entry.clone();
        conn.router().set(
            C2S_POSITION_UPDATE,
            move |(timestamp15, position): (u16, PlayerPosition)| {
                arena.on_position_update(&entry, timestamp15, position);
            },
        );
    }

    fn on_position_update(&self, entry: &Arc<PlayerEntry>, timestamp15: u16, position: PlayerPosition) {
        let now = now_msec();
        let sent_local = reconstruct_msec(now, timestamp15 & 0x7fff);

        {
            let mut data = entry.position.lock().unwrap();
            if !data.has_position {
                info!("{}: received first position", entry.id);
            }
            *data = PositionData {
                has_position: true,
                position,
                timestamp15,
                position_msec: sent_local,
            };
        }

        let mut neighbor = entry.neighbor.lock().unwrap();
        let node = neighbor.get_or_insert_with(|| self.tracker.attach(entry.clone()));
        self.tracker.update(node, position.x as i32, position.y as i32);
    }
}

struct ArenaConnection {
    arena: Arc<Arena>,
    entry: OnceLock<Arc<PlayerEntry>>,
    last_broadcast_index: Mutex<usize>,
}

impl ConnectionInterface for ArenaConnection {
    fn on_connect(&self, connection: &Arc<Connection>) {
        let Some(pid) = self.arena.pids.acquire() else {
            warn!("no player ids left, disconnecting {}", connection.peer_tcp_addr());
            connection.disconnect();
            return;
        };
        info!("{}: connect from {}", pid, connection.peer_tcp_addr());

        let entry = Arc::new(PlayerEntry {
            id: pid,
            name: Mutex::new(String::new()),
            conn: Arc::downgrade(connection),
            position: Mutex::new(PositionData::default()),
            neighbor: Mutex::new(None),
        });
        let _ = self.entry.set(entry.clone());

        let arena = self.arena.clone();
        let conn = Arc::downgrade(connection);
        connection.router().set(C2S_LOGIN, move |(name,): (String,)| {
            if let Some(conn) = conn.upgrade() {
                Arena::on_login(&arena, &entry, &conn, name);
            }
        });

        let _ = connection.call_tcp(S2C_SET_PLAYER_ID, &(pid,));
    }

    fn on_tick(&self, connection: &Arc<Connection>, now_msec: u64) {
        let Some(entry) = self.entry.get() else {
            return;
        };
        if !entry.position.lock().unwrap().broadcastable(now_msec) {
            return;
        }

        let nearby: Vec<Arc<PlayerEntry>> = {
            let neighbor = entry.neighbor.lock().unwrap();
            let Some(node) = neighbor.as_ref() else {
                return;
            };
            self.arena
                .tracker
                .get_neighbors(node, BROADCAST_DISTANCE)
                .iter()
                .cloned()
                .collect()
        };
        if nearby.is_empty() {
            return;
        }

        let mut index = *self.last_broadcast_index.lock().unwrap();
        for _ in 0..nearby.len().min(BROADCAST_PLAYER_LIMIT) {
            index = (index + 1) % nearby.len();
            let other = &nearby[index];
            let data = *other.position.lock().unwrap();
            if data.broadcastable(now_msec) {
                let _ = connection.call_udp(
                    S2C_POSITION_UPDATE,
                    &(other.id, data.timestamp15, data.position),
                );
            }
        }
        *self.last_broadcast_index.lock().unwrap() = index;
    }

    fn on_disconnect(&self, _connection: &Arc<Connection>) {
        let Some(entry) = self.entry.get() else {
            return;
        };
        info!("{}: disconnected", entry.id);

        if let Some(node) = entry.neighbor.lock().unwrap().take() {
            self.arena.tracker.detach(node);
        }
        self.arena.players.lock().unwrap().remove(&entry.id);
        self.arena.broadcast(entry.id, S2C_REMOVE_PLAYER, &(entry.id,));
        self.arena.pids.release(entry.id);
    }
}

struct ArenaFactory {
    arena: Arc<Arena>,
}

impl ServerInterface for ArenaFactory {
    fn create_connection(&self, _connection: &Arc<Connection>) -> Arc<dyn ConnectionInterface> {
        Arc::new(ArenaConnection {
            arena: self.arena.clone(),
            entry: OnceLock::new(),
            last_broadcast_index: Mutex::new(0),
        })
    }
}

//-----------------------------------------------------------------------------
// Client

struct RemotePlayer {
    name: String,
    position: PlayerPosition,
    one_way_delay_msec: i64,
}

struct ArenaClient {
    my_id: AtomicU64,
    players: Mutex<FxHashMap<u8, RemotePlayer>>,
    position: Mutex<PlayerPosition>,
}

impl ArenaClient {
    fn register_handlers(app: &Arc<ArenaClient>, client: &Arc<Client>) {
        let me = app.clone();
        client.router().set(S2C_SET_PLAYER_ID, move |(pid,): (u8,)| {
            info!("my player id is {}", pid);
            me.my_id.store(pid as u64, Ordering::SeqCst);
        });

        let me = app.clone();
        client.router().set(S2C_ADD_PLAYER, move |(pid, name): (u8, String)| {
            let mut players = me.players.lock().unwrap();
            if players
                .insert(
                    pid,
                    RemotePlayer {
                        name: name.clone(),
                        position: PlayerPosition::default(),
                        one_way_delay_msec: 0,
                    },
                )
                .is_some()
            {
                warn!("player {} added twice", pid);
            } else {
                info!("player {} joined: {}", pid, name);
            }
        });

        let me = app.clone();
        client.router().set(S2C_REMOVE_PLAYER, move |(pid,): (u8,)| {
            match me.players.lock().unwrap().remove(&pid) {
                Some(player) => info!("player {} quit: {}", pid, player.name),
                None => warn!("player {} removed twice", pid),
            }
        });

        let me = app.clone();
        let client_for_time = client.clone();
        client.router().set(
            S2C_POSITION_UPDATE,
            move |(pid, timestamp15, position): (u8, u16, PlayerPosition)| {
                let now = now_msec();
                let sent_local = client_for_time.from_server_time15(now, timestamp15);
                let mut players = me.players.lock().unwrap();
                match players.get_mut(&pid) {
                    Some(player) => {
                        player.position = position;
                        player.one_way_delay_msec = now as i64 - sent_local as i64;
                        info!(
                            "player {:?} ({}) moved to ({}, {}), one-way delay {} ms",
                            player.name, pid, position.x, position.y, player.one_way_delay_msec
                        );
                    }
                    None => warn!("position update for unknown player {}", pid),
                }
            },
        );
    }

    /// A little deterministic wander so the demo generates traffic.
    fn advance_position(&self, now_msec: u64) -> PlayerPosition {
        let mut position = self.position.lock().unwrap();
        let phase = (now_msec / 100) as f64 / 10.0;
        position.vx = (phase.cos() * 30.0) as i16;
        position.vy = (phase.sin() * 30.0) as i16;
        position.x = position.x.wrapping_add(position.vx / 10);
        position.y = position.y.wrapping_add(position.vy / 10);
        position.angle = ((phase * 40.0) as u64 % 256) as u8;
        *position
    }
}

impl ClientInterface for ArenaClient {
    fn on_connect_fail(&self, _client: &Arc<Client>) {
        warn!("failed to connect");
    }

    fn on_connect(&self, client: &Arc<Client>) {
        info!("connected");
        let login = format!("guest{}", now_usec());
        if let Err(e) = client.call_tcp(C2S_LOGIN, &(login,)) {
            warn!("login failed: {:#}", e);
        }
    }

    fn on_tick(&self, client: &Arc<Client>, now_msec: u64) {
        let position = self.advance_position(now_msec);
        let timestamp = client.to_server_time15(now_msec);
        let _ = client.call_udp(C2S_POSITION_UPDATE, &(timestamp, position));
    }

    fn on_disconnect(&self, _client: &Arc<Client>) {
        info!("disconnected");
    }
}

//-----------------------------------------------------------------------------
// Entry point

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("server") => {
            let arena = Arc::new(Arena {
                tracker: NeighborTracker::new(),
                players: Mutex::new(FxHashMap::default()),
                pids: PidPool::new(),
            });
            let server = Server::start(
                ServerSettings::new(5060),
                Arc::new(ArenaFactory { arena }),
            )
            .await?;
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }
        Some("client") => {
            let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
            let app = Arc::new(ArenaClient {
                my_id: AtomicU64::new(0),
                players: Mutex::new(FxHashMap::default()),
                position: Mutex::new(PlayerPosition::default()),
            });
            let client = Client::start(
                ClientSettings {
                    host,
                    tcp_port: 5060,
                },
                app.clone(),
            )?;
            ArenaClient::register_handlers(&app, &client);
            tokio::signal::ctrl_c().await?;
            client.stop().await;
        }
        _ => {
            eprintln!("usage: arena server | arena client [host]");
        }
    }
    Ok(())
}
