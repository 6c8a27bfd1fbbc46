//! The side-agnostic half of a session: one TCP socket and one UDP flow,
//! send-side pack buffers, the compression boundary, per-direction
//! obfuscation and the call router. Server connections and the client both
//! build on [`Peer`].
//!
//! Every handler may run concurrently with every other; the two pack locks
//! serialize producers into the pack buffers, and outbound TCP bytes go
//! through a single writer task to keep the stream ordered.

pub mod frame;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::{now_msec, reconstruct_counter16, WindowedTimes};
use crate::config::{
    MAX_CALL_BYTES, PACK_BUFFER_BYTES, TCP_HEARTBEAT_INTERVAL_MSEC, TCP_READ_CHUNK_BYTES,
    UDP_DATAGRAM_MAX, UDP_TIME_SYNC_FAST_COUNT, UDP_TIME_SYNC_INTERVAL_FAST_MSEC,
    UDP_TIME_SYNC_INTERVAL_SLOW_MSEC,
};
use crate::peer::frame::{FrameDecoder, FrameEncoder};
use crate::wire::obfuscate::{Role, SessionCipher, TcpCipher, UdpCipher};
use crate::wire::rpc::{Call, CallArgs, CallRouter, Dispatch};
use crate::wire::ser::WireSerialize;
use crate::wire::stream::StreamReader;

#[cfg(test)]
use mockall::automock;

/// Outbound datagram seam; real sockets and tests plug in here. Sends are
/// best effort: a failure means the datagram is dropped, never retried.
#[cfg_attr(test, automock)]
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        self.try_send_to(datagram, to).map(|_| ())
    }
}

struct TcpOut {
    buf: BytesMut,
    cipher: TcpCipher,
    frames: FrameEncoder,
}

struct UdpOut {
    buf: [u8; UDP_DATAGRAM_MAX],
    used: usize,
    cipher: UdpCipher,
}

struct UdpBinding {
    sink: Arc<dyn DatagramSink>,
    peer: SocketAddr,
}

/// State consumed by the TCP read loop: the incoming cipher half plus the
/// streaming decompressor.
struct TcpIn {
    cipher: TcpCipher,
    frames: FrameDecoder,
}

pub struct Peer {
    pub router: CallRouter,

    disconnected: AtomicBool,
    full_connection: AtomicBool,

    /// Local receive time of the last accepted UDP datagram, for timeouts.
    last_receive_local_msec: AtomicU64,
    /// Last expanded remote wire timestamp.
    last_udp_remote_msec: AtomicU64,
    win_times: WindowedTimes,

    tcp_out: Mutex<TcpOut>,
    udp_out: Mutex<UdpOut>,

    tcp_tx: mpsc::UnboundedSender<Bytes>,
    tcp_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    tcp_in: Mutex<Option<TcpIn>>,

    udp_binding: Mutex<Option<UdpBinding>>,
    udp_in_cipher: UdpCipher,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(key: u32, role: Role) -> anyhow::Result<Arc<Peer>> {
        let cipher = SessionCipher::new(key, role);
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Peer {
            router: CallRouter::new(),
            disconnected: AtomicBool::new(false),
            full_connection: AtomicBool::new(false),
            last_receive_local_msec: AtomicU64::new(0),
            last_udp_remote_msec: AtomicU64::new(0),
            win_times: WindowedTimes::new(),
            tcp_out: Mutex::new(TcpOut {
                buf: BytesMut::with_capacity(PACK_BUFFER_BYTES),
                cipher: cipher.tcp_out,
                frames: FrameEncoder::new()?,
            }),
            udp_out: Mutex::new(UdpOut {
                buf: [0u8; UDP_DATAGRAM_MAX],
                used: 2,
                cipher: cipher.udp_out,
            }),
            tcp_tx,
            tcp_rx: Mutex::new(Some(tcp_rx)),
            tcp_in: Mutex::new(Some(TcpIn {
                cipher: cipher.tcp_in,
                frames: FrameDecoder::new()?,
            })),
            udp_binding: Mutex::new(None),
            udp_in_cipher: cipher.udp_in,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Arms the TCP read and write loops on `stream`. Called once, when the
    /// session is ready to process traffic.
    pub fn start_tcp(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let rx = self
            .tcp_rx
            .lock()
            .unwrap()
            .take()
            .expect("TCP loops are armed only once");
        let rx_state = self
            .tcp_in
            .lock()
            .unwrap()
            .take()
            .expect("TCP loops are armed only once");

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Self::tcp_write_loop(
            self.clone(),
            write_half,
            rx,
        )));
        tasks.push(tokio::spawn(Self::tcp_read_loop(
            self.clone(),
            read_half,
            rx_state,
        )));
    }

    /// Associates the UDP flow with a socket and the peer's endpoint.
    pub fn set_udp_binding(&self, sink: Arc<dyn DatagramSink>, peer: SocketAddr) {
        *self.udp_binding.lock().unwrap() = Some(UdpBinding { sink, peer });
    }

    /// The peer's UDP endpoint, once the flow is associated.
    pub fn udp_peer(&self) -> Option<SocketAddr> {
        self.udp_binding.lock().unwrap().as_ref().map(|b| b.peer)
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn set_full_connection(&self) {
        self.full_connection.store(true, Ordering::SeqCst);
    }

    pub fn is_full_connection(&self) -> bool {
        self.full_connection.load(Ordering::SeqCst)
    }

    pub fn last_receive_local_msec(&self) -> u64 {
        self.last_receive_local_msec.load(Ordering::SeqCst)
    }

    /// Best current estimate of (remote clock - local clock).
    pub fn window_delta(&self, now_msec: u64) -> u64 {
        self.win_times.compute_delta(now_msec)
    }

    /// Serializes `{id, args}` and appends the record to the TCP pack
    /// buffer. Refused only when the arguments exceed the record limit.
    pub fn call_tcp<A: CallArgs>(&self, call: Call<A>, args: &A) -> anyhow::Result<()> {
        let mut record = [0u8; MAX_CALL_BYTES];
        let len = call.encode(args, &mut record)?;
        self.pack_tcp(&record[..len]);
        Ok(())
    }

    /// Serializes `{id, args}` and appends the record to the UDP pack
    /// buffer. Refused when the record cannot fit a single datagram; the
    /// session stays intact in that case.
    pub fn call_udp<A: CallArgs>(&self, call: Call<A>, args: &A) -> anyhow::Result<()> {
        let mut record = [0u8; MAX_CALL_BYTES];
        let len = call.encode(args, &mut record)?;
        self.pack_udp(&record[..len])
    }

    fn pack_tcp(&self, record: &[u8]) {
        let mut out = self.tcp_out.lock().unwrap();
        if out.buf.len() + record.len() > PACK_BUFFER_BYTES {
            self.flush_udp();
            self.flush_tcp_locked(&mut out);
        }
        out.buf.extend_from_slice(record);
    }

    fn pack_udp(&self, record: &[u8]) -> anyhow::Result<()> {
        let mut out = self.udp_out.lock().unwrap();
        if out.used + record.len() > UDP_DATAGRAM_MAX {
            self.flush_udp_locked(&mut out);
            if out.used + record.len() > UDP_DATAGRAM_MAX {
                bail!(
                    "{} byte record exceeds the {} byte datagram budget",
                    record.len(),
                    UDP_DATAGRAM_MAX
                );
            }
        }
        let used = out.used;
        out.buf[used..used + record.len()].copy_from_slice(record);
        out.used += record.len();
        Ok(())
    }

    /// Flushes both pack buffers to their sockets.
    pub fn flush(&self) {
        self.flush_udp();
        self.flush_tcp();
    }

    pub fn flush_tcp(&self) {
        let mut out = self.tcp_out.lock().unwrap();
        self.flush_tcp_locked(&mut out);
    }

    pub fn flush_udp(&self) {
        let mut out = self.udp_out.lock().unwrap();
        self.flush_udp_locked(&mut out);
    }

    fn flush_tcp_locked(&self, out: &mut TcpOut) {
        if out.buf.is_empty() {
            return;
        }
        let plain = out.buf.split();

        let TcpOut { cipher, frames, .. } = out;
        let tcp_tx = &self.tcp_tx;
        let result = frames.compress_frame(&plain, |chunk| {
            cipher.encrypt(chunk);
            let _ = tcp_tx.send(Bytes::copy_from_slice(chunk));
        });
        if let Err(e) = result {
            // the frame is lost but the session continues
            warn!("dropping TCP flush: {:#}", e);
        }
    }

    fn flush_udp_locked(&self, out: &mut UdpOut) {
        let used = out.used;
        out.used = 2;
        if used <= 2 {
            return;
        }

        let wire_time = now_msec() as u16;
        out.buf[..2].copy_from_slice(&wire_time.to_le_bytes());

        let datagram = &mut out.buf[..used];
        out.cipher.encrypt(datagram);
        self.send_udp(datagram);
    }

    fn send_udp(&self, datagram: &[u8]) {
        let binding = self.udp_binding.lock().unwrap();
        let Some(binding) = binding.as_ref() else {
            debug!("dropping {} byte datagram, no UDP association yet", datagram.len());
            return;
        };
        trace!("sending {} byte datagram to {}", datagram.len(), binding.peer);
        if let Err(e) = binding.sink.send_datagram(binding.peer, datagram) {
            warn!("UDP send error: {}", e);
        }
    }

    /// Entry point for one received datagram, already verified to come from
    /// the associated peer endpoint. Decrypts in place, reads the 16-bit
    /// wire time and routes the records; the timestamp only counts when at
    /// least one record dispatched.
    ///
    /// Datagrams may arrive out of order with respect to the TCP stream, so
    /// a record the router does not know yet (or a mangled one) only
    /// discards the rest of its datagram; it is not the session-fatal
    /// violation it is on TCP.
    pub fn on_udp_data(&self, now_msec: u64, datagram: &mut [u8]) {
        self.udp_in_cipher.decrypt(datagram);

        let mut r = StreamReader::wrap(datagram);
        let Ok(wire_time) = u16::try_deser(&mut r) else {
            return;
        };

        if self.route_records_lossy(&mut r) {
            self.last_receive_local_msec.store(now_msec, Ordering::SeqCst);
            let expanded = reconstruct_counter16(
                self.last_udp_remote_msec.load(Ordering::SeqCst),
                wire_time,
            );
            self.last_udp_remote_msec.store(expanded, Ordering::SeqCst);
            self.win_times.insert(expanded, now_msec);
        }
    }

    /// Dispatches records until the stream is exhausted. Returns whether at
    /// least one call was handled; a violation aborts the whole frame.
    fn route_records(&self, r: &mut StreamReader<'_>) -> anyhow::Result<bool> {
        let mut any = false;
        loop {
            match self.router.dispatch_one(r)? {
                Dispatch::Handled => any = true,
                Dispatch::EndOfStream => return Ok(any),
            }
        }
    }

    /// Like [`route_records`](Self::route_records), but a violation only
    /// discards the remainder of the frame.
    fn route_records_lossy(&self, r: &mut StreamReader<'_>) -> bool {
        let mut any = false;
        loop {
            match self.router.dispatch_one(r) {
                Ok(Dispatch::Handled) => any = true,
                Ok(Dispatch::EndOfStream) => return any,
                Err(e) => {
                    debug!("dropping rest of datagram: {:#}", e);
                    return any;
                }
            }
        }
    }

    async fn tcp_write_loop(
        peer: Arc<Peer>,
        mut half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = half.write_all(&chunk).await {
                warn!("TCP send error: {}", e);
                peer.disconnect();
                return;
            }
        }
    }

    async fn tcp_read_loop(peer: Arc<Peer>, mut half: OwnedReadHalf, mut state: TcpIn) {
        let mut buf = vec![0u8; TCP_READ_CHUNK_BYTES];
        loop {
            match half.read(&mut buf).await {
                Ok(0) => {
                    info!("TCP close");
                    peer.disconnect();
                    return;
                }
                Ok(n) => {
                    if let Err(e) = peer.on_tcp_read(&mut state, &mut buf[..n]) {
                        warn!("closing session: {:#}", e);
                        peer.disconnect();
                        return;
                    }
                }
                Err(e) => {
                    warn!("TCP read error: {}", e);
                    peer.disconnect();
                    return;
                }
            }
            if peer.is_disconnected() {
                return;
            }
        }
    }

    /// Decrypts one chunk of the TCP stream and routes every frame the
    /// decompressor completes with it.
    fn on_tcp_read(&self, state: &mut TcpIn, bytes: &mut [u8]) -> anyhow::Result<()> {
        state.cipher.decrypt(bytes);
        state.frames.feed(bytes, |frame| {
            let mut r = StreamReader::wrap(frame);
            self.route_records(&mut r)?;
            Ok(())
        })
    }

    /// Cancels the session's I/O tasks. Pending operations resolve with an
    /// error; join failures are logged and swallowed.
    pub async fn shutdown(&self) {
        self.disconnect();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("I/O task ended abnormally: {}", e);
                }
            }
        }
        *self.udp_binding.lock().unwrap() = None;
    }

    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    #[cfg(test)]
    fn take_tcp_queue(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.tcp_rx.lock().unwrap().take().expect("queue still available")
    }

    #[cfg(test)]
    fn take_tcp_in(&self) -> TcpIn {
        self.tcp_in.lock().unwrap().take().expect("receive state still available")
    }
}

/// Shared send schedule for the periodic traffic both sides emit: UDP
/// time-sync/heartbeat on the fast-then-slow cadence, TCP heartbeat on a
/// fixed interval.
pub(crate) struct HeartbeatSchedule {
    last_tcp_msec: u64,
    last_udp_msec: u64,
    fast_count: u32,
    udp_interval_msec: u64,
}

impl HeartbeatSchedule {
    pub(crate) fn new() -> HeartbeatSchedule {
        HeartbeatSchedule {
            last_tcp_msec: 0,
            last_udp_msec: 0,
            fast_count: 0,
            udp_interval_msec: UDP_TIME_SYNC_INTERVAL_FAST_MSEC,
        }
    }

    pub(crate) fn udp_due(&mut self, now_msec: u64) -> bool {
        if now_msec.wrapping_sub(self.last_udp_msec) <= self.udp_interval_msec {
            return false;
        }
        self.last_udp_msec = now_msec;
        if self.fast_count <= UDP_TIME_SYNC_FAST_COUNT {
            if self.fast_count == UDP_TIME_SYNC_FAST_COUNT {
                self.udp_interval_msec = UDP_TIME_SYNC_INTERVAL_SLOW_MSEC;
            }
            self.fast_count += 1;
        }
        true
    }

    pub(crate) fn tcp_due(&mut self, now_msec: u64) -> bool {
        if now_msec.wrapping_sub(self.last_tcp_msec) <= TCP_HEARTBEAT_INTERVAL_MSEC {
            return false;
        }
        self.last_tcp_msec = now_msec;
        true
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU32;

    use crate::wire::rpc::Call;

    use super::*;

    const NOTE: Call<(String,)> = Call::new(7);
    const NUDGE: Call<(u16,)> = Call::new(8);

    fn peer_pair() -> (Arc<Peer>, Arc<Peer>) {
        let client = Peer::new(0, Role::Client).unwrap();
        let server = Peer::new(0, Role::Server).unwrap();
        (client, server)
    }

    /// Carries every queued TCP chunk from `from` into `to`'s receive path,
    /// split into `chunk` byte reads.
    fn pump_tcp(from: &Peer, rx: &mut mpsc::UnboundedReceiver<Bytes>, to: &Peer, state: &mut TcpIn, chunk: usize) {
        let _ = from;
        let mut wire = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            wire.extend_from_slice(&bytes);
        }
        for part in wire.chunks_mut(chunk.max(1)) {
            to.on_tcp_read(state, part).unwrap();
        }
    }

    #[test]
    fn test_tcp_calls_roundtrip_through_pack_flush_and_frames() {
        let (client, server) = peer_pair();
        let mut queue = client.take_tcp_queue();
        let mut server_in = server.take_tcp_in();

        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router.set(NOTE, {
            let seen = seen.clone();
            move |(text,): (String,)| seen.lock().unwrap().push(text)
        });

        client.call_tcp(NOTE, &("hello".to_string(),)).unwrap();
        client.call_tcp(NOTE, &("world".to_string(),)).unwrap();
        client.flush_tcp();

        pump_tcp(&client, &mut queue, &server, &mut server_in, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn test_tcp_records_preserve_order_across_flushes() {
        let (client, server) = peer_pair();
        let mut queue = client.take_tcp_queue();
        let mut server_in = server.take_tcp_in();

        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router.set(NUDGE, {
            let seen = seen.clone();
            move |(n,): (u16,)| seen.lock().unwrap().push(n)
        });

        for n in 0..300u16 {
            client.call_udp(NUDGE, &(n,)).ok();
            client.call_tcp(NUDGE, &(n,)).unwrap();
            if n % 37 == 0 {
                client.flush_tcp();
            }
        }
        client.flush_tcp();

        pump_tcp(&client, &mut queue, &server, &mut server_in, 16);
        assert_eq!(*seen.lock().unwrap(), (0..300).collect::<Vec<u16>>());
    }

    #[test]
    fn test_oversize_tcp_record_still_fits() {
        let (client, server) = peer_pair();
        let mut queue = client.take_tcp_queue();
        let mut server_in = server.take_tcp_in();

        let seen = Arc::new(Mutex::new(Vec::new()));
        server.router.set(NOTE, {
            let seen = seen.clone();
            move |(text,): (String,)| seen.lock().unwrap().push(text)
        });

        // larger than the pack threshold, smaller than the record limit
        let big = "b".repeat(500);
        client.call_tcp(NOTE, &(big.clone(),)).unwrap();
        client.flush_tcp();

        pump_tcp(&client, &mut queue, &server, &mut server_in, 64);
        assert_eq!(*seen.lock().unwrap(), vec![big]);
    }

    #[test]
    fn test_oversize_udp_record_is_refused() {
        let (client, _server) = peer_pair();
        let big = "b".repeat(500);
        assert!(client.call_udp(NOTE, &(big,)).is_err());
        assert!(!client.is_disconnected());
        // the session still accepts reasonable records
        client.call_udp(NUDGE, &(1,)).unwrap();
    }

    #[test]
    fn test_udp_datagram_roundtrip_with_mock_sink() {
        let (client, server) = peer_pair();

        let sent: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut sink = MockDatagramSink::new();
        let sent_in_mock = sent.clone();
        sink.expect_send_datagram().returning(move |_, datagram| {
            sent_in_mock.lock().unwrap().push(datagram.to_vec());
            Ok(())
        });
        let peer_addr: SocketAddr = "127.0.0.1:5061".parse().unwrap();
        client.set_udp_binding(Arc::new(sink), peer_addr);

        let hits = Arc::new(AtomicU32::new(0));
        server.router.set(NUDGE, {
            let hits = hits.clone();
            move |(n,): (u16,)| {
                hits.fetch_add(n as u32, Ordering::SeqCst);
            }
        });

        client.call_udp(NUDGE, &(21,)).unwrap();
        client.call_udp(NUDGE, &(21,)).unwrap();
        client.flush_udp();

        let datagrams = sent.lock().unwrap();
        assert_eq!(datagrams.len(), 1);

        let mut datagram = datagrams[0].clone();
        let now = now_msec();
        server.on_udp_data(now, &mut datagram);
        assert_eq!(hits.load(Ordering::SeqCst), 42);
        assert_eq!(server.last_receive_local_msec(), now);
    }

    #[test]
    fn test_udp_garbage_is_dropped_without_disconnect() {
        let (_, server) = peer_pair();
        let mut datagram = vec![0u8; 16];
        // decrypts to records with no handler: the datagram is discarded
        server.on_udp_data(now_msec(), &mut datagram);
        assert!(!server.is_disconnected());
        assert_eq!(server.last_receive_local_msec(), 0);
    }

    #[test]
    fn test_udp_prefix_dispatches_before_bad_record() {
        let (client, server) = peer_pair();

        let sent: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut sink = MockDatagramSink::new();
        let sent_in_mock = sent.clone();
        sink.expect_send_datagram().returning(move |_, datagram| {
            sent_in_mock.lock().unwrap().push(datagram.to_vec());
            Ok(())
        });
        client.set_udp_binding(Arc::new(sink), "127.0.0.1:5061".parse().unwrap());

        let hits = Arc::new(AtomicU32::new(0));
        server.router.set(NUDGE, {
            let hits = hits.clone();
            move |(n,): (u16,)| {
                hits.fetch_add(n as u32, Ordering::SeqCst);
            }
        });
        // NOTE is deliberately left unregistered on the receiving side

        client.call_udp(NUDGE, &(5,)).unwrap();
        client.call_udp(NOTE, &("x".to_string(),)).unwrap();
        client.call_udp(NUDGE, &(7,)).unwrap();
        client.flush_udp();

        let mut datagram = sent.lock().unwrap()[0].clone();
        let now = now_msec();
        server.on_udp_data(now, &mut datagram);

        // the leading record dispatched, the rest of the datagram is gone
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert!(!server.is_disconnected());
        // at least one record dispatched, so the timestamp counted
        assert_eq!(server.last_receive_local_msec(), now);
    }

    #[test]
    fn test_tcp_unknown_call_is_a_violation() {
        let (client, server) = peer_pair();
        let mut queue = client.take_tcp_queue();
        let mut server_in = server.take_tcp_in();

        // nothing registered on the server side
        client.call_tcp(NUDGE, &(1,)).unwrap();
        client.flush_tcp();

        let mut wire = Vec::new();
        while let Ok(bytes) = queue.try_recv() {
            wire.extend_from_slice(&bytes);
        }
        assert!(server.on_tcp_read(&mut server_in, &mut wire).is_err());
    }

    #[test]
    fn test_empty_udp_datagram_is_ignored() {
        let (_, server) = peer_pair();
        let mut datagram = [0u8; 1];
        server.on_udp_data(now_msec(), &mut datagram);
        assert!(!server.is_disconnected());
        assert_eq!(server.last_receive_local_msec(), 0);
    }

    #[test]
    fn test_heartbeat_schedule_fast_then_slow() {
        let mut hb = HeartbeatSchedule::new();
        let mut now = 1_000u64;
        let mut fires = Vec::new();
        let mut last = 0u64;
        for _ in 0..10_000 {
            now += 30;
            if hb.udp_due(now) {
                fires.push(now - last);
                last = now;
            }
        }
        // first sends come at the fast cadence, later ones at the slow one
        assert!(fires[1] <= 330);
        assert!(fires.last().unwrap() >= &1_000);
        let slow = fires.iter().filter(|gap| **gap >= 1_000).count();
        assert!(slow > 5);
    }
}
