//! Built-in session protocol. Application call ids occupy the low range of
//! the id space; the session layer owns the top.

use crate::wire::rpc::Call;

/// S2C: keep-alive over TCP.
pub const S2C_HEARTBEAT: Call<()> = Call::new(255);

/// S2C over UDP: time sync carrying the best observed client-to-server delta.
pub const S2C_TIME_SYNC: Call<(u16,)> = Call::new(254);

/// S2C over TCP: the connection cookie and the UDP port to dial.
pub const S2C_TCP_HANDSHAKE: Call<(u32, u16)> = Call::new(253);

/// C2S: keep-alive carrying the sender's 15-bit server-time estimate.
/// Sent over TCP and UDP.
pub const C2S_HEARTBEAT: Call<(u16,)> = Call::new(254);

/// C2S over UDP: echoes the cookie received over TCP to prove that both
/// flows belong to the same client.
pub const C2S_UDP_HANDSHAKE: Call<(u32,)> = Call::new(255);
