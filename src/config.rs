//! Compile-time tuning constants shared by client and server.

/// Kernel buffer sizes for UDP/TCP sockets.
pub const UDP_SEND_BUFFER_BYTES: usize = 64_000;
pub const UDP_RECV_BUFFER_BYTES: usize = 64_000;
pub const TCP_SEND_BUFFER_BYTES: usize = 64_000;
pub const TCP_RECV_BUFFER_BYTES: usize = 64_000;

/// Number of bytes to read from a TCP socket at a time.
pub const TCP_READ_CHUNK_BYTES: usize = 16_000;

/// Worker timer cadence on the server.
pub const SERVER_TICK_MSEC: u64 = 30;

/// Timer cadence on the client.
pub const CLIENT_TICK_MSEC: u64 = 100;

/// Interval between TCP heartbeats, both directions.
pub const TCP_HEARTBEAT_INTERVAL_MSEC: u64 = 10_000;

/// UDP time-sync/heartbeat cadence: fast for the first
/// [`UDP_TIME_SYNC_FAST_COUNT`] sends, slow afterwards.
pub const UDP_TIME_SYNC_INTERVAL_FAST_MSEC: u64 = 300;
pub const UDP_TIME_SYNC_INTERVAL_SLOW_MSEC: u64 = 1_000;
pub const UDP_TIME_SYNC_FAST_COUNT: u32 = 10;

/// A peer that has been silent on UDP for this long is considered gone.
pub const RECEIVE_TIMEOUT_MSEC: u64 = 40_000;

/// Hard upper bound for a UDP datagram; this layer never fragments.
pub const UDP_DATAGRAM_MAX: usize = 490;

/// Interval between client UDP handshake attempts.
pub const HANDSHAKE_RETRY_MSEC: u64 = 100;

/// Outgoing pack buffers are flushed once they reach this size.
pub const PACK_BUFFER_BYTES: usize = UDP_DATAGRAM_MAX;

/// zstd level for the TCP stream.
pub const COMPRESSION_LEVEL: i32 = 9;

/// Upper bound for one encoded RPC record (1 id byte + arguments).
pub const MAX_CALL_BYTES: usize = 512;
