//! Lightweight per-direction byte scramblers for the TCP stream and UDP
//! datagrams. This is traffic obfuscation, not cryptography.

/// Which side of the session this cipher belongs to. The two roles derive
/// mirrored incoming/outgoing keys from the shared session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Rolling-state scrambler for one direction of the TCP byte stream. The
/// last plaintext byte carries across calls, so the same instance must see
/// the stream's bytes exactly once and in order.
pub struct TcpCipher {
    key: u32,
    last: u8,
}

impl TcpCipher {
    fn new(key: u32) -> TcpCipher {
        TcpCipher {
            key,
            last: (key >> 20) as u8,
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let mut last = self.last;
        let adder = (self.key >> 9) as u8;
        for b in buf.iter_mut() {
            let cur = *b;
            *b = (cur ^ last).wrapping_sub(adder);
            last = cur;
        }
        self.last = last;
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let mut last = self.last;
        let adder = (self.key >> 9) as u8;
        for b in buf.iter_mut() {
            last = b.wrapping_add(adder) ^ last;
            *b = last;
        }
        self.last = last;
    }
}

/// Stateless per-datagram scrambler for one direction of the UDP flow; the
/// rolling byte reseeds from the key at the start of every datagram.
#[derive(Clone, Copy)]
pub struct UdpCipher {
    key: u32,
}

impl UdpCipher {
    fn new(key: u32) -> UdpCipher {
        UdpCipher { key }
    }

    pub fn encrypt(&self, datagram: &mut [u8]) {
        let mut last = self.key as u8;
        let adder = (self.key >> 8) as u8;
        for b in datagram.iter_mut() {
            let cur = *b;
            *b = cur.wrapping_add(last) ^ adder;
            last = cur;
        }
    }

    pub fn decrypt(&self, datagram: &mut [u8]) {
        let mut last = self.key as u8;
        let adder = (self.key >> 8) as u8;
        for b in datagram.iter_mut() {
            last = (*b ^ adder).wrapping_sub(last);
            *b = last;
        }
    }
}

/// The four per-direction states of one session, derived from a shared key
/// and the session role. Server and client ends mirror each other.
pub struct SessionCipher {
    pub tcp_out: TcpCipher,
    pub tcp_in: TcpCipher,
    pub udp_out: UdpCipher,
    pub udp_in: UdpCipher,
}

impl SessionCipher {
    pub fn new(key: u32, role: Role) -> SessionCipher {
        let incoming = key;
        let outgoing = key ^ 0x12345678;
        let (incoming, outgoing) = match role {
            Role::Client => (incoming, outgoing),
            Role::Server => (outgoing, incoming),
        };

        SessionCipher {
            tcp_out: TcpCipher::new(outgoing),
            tcp_in: TcpCipher::new(incoming),
            udp_out: UdpCipher::new(!outgoing),
            udp_in: UdpCipher::new(!incoming),
        }
    }
}
