//! End-to-end session tests over real loopback sockets: TCP handshake,
//! cookie-based UDP association, time sync, and application RPC on top.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tandem::client::{Client, ClientInterface, ClientSettings};
use tandem::server::connection::Connection;
use tandem::server::{ConnectionInterface, Server, ServerInterface, ServerSettings};
use tandem::wire::obfuscate::{Role, SessionCipher};
use tandem::wire::rpc::Call;
use tandem::wire::ser::WireSerialize;
use tandem::wire::stream::StreamWriter;

const ECHO: Call<(String,)> = Call::new(10);
const FIRST: Call<(u32,)> = Call::new(11);
const SECOND: Call<(u32,)> = Call::new(12);

#[derive(Debug)]
enum Event {
    ServerConnect,
    ServerDisconnect,
    ClientConnect,
    ClientConnectFail,
    ClientDisconnect,
    Echo(String),
    Numbered(&'static str, u32),
}

type Events = mpsc::UnboundedSender<Event>;

struct TestServerApp {
    events: Events,
}

struct TestConnection {
    events: Events,
}

impl ServerInterface for TestServerApp {
    fn create_connection(&self, _connection: &Arc<Connection>) -> Arc<dyn ConnectionInterface> {
        Arc::new(TestConnection {
            events: self.events.clone(),
        })
    }
}

impl ConnectionInterface for TestConnection {
    fn on_connect(&self, connection: &Arc<Connection>) {
        let events = self.events.clone();
        connection.router().set(ECHO, move |(text,): (String,)| {
            let _ = events.send(Event::Echo(text));
        });
        let events = self.events.clone();
        connection.router().set(FIRST, move |(n,): (u32,)| {
            let _ = events.send(Event::Numbered("first", n));
        });
        let events = self.events.clone();
        connection.router().set(SECOND, move |(n,): (u32,)| {
            let _ = events.send(Event::Numbered("second", n));
        });
        let _ = self.events.send(Event::ServerConnect);
    }

    fn on_tick(&self, _connection: &Arc<Connection>, _now_msec: u64) {}

    fn on_disconnect(&self, _connection: &Arc<Connection>) {
        let _ = self.events.send(Event::ServerDisconnect);
    }
}

struct TestClientApp {
    events: Events,
}

impl ClientInterface for TestClientApp {
    fn on_connect_fail(&self, _client: &Arc<Client>) {
        let _ = self.events.send(Event::ClientConnectFail);
    }

    fn on_connect(&self, _client: &Arc<Client>) {
        let _ = self.events.send(Event::ClientConnect);
    }

    fn on_tick(&self, _client: &Arc<Client>, _now_msec: u64) {}

    fn on_disconnect(&self, _client: &Arc<Client>) {
        let _ = self.events.send(Event::ClientDisconnect);
    }
}

fn settings(port: u16) -> ServerSettings {
    ServerSettings {
        worker_count: 2,
        tcp_port: port,
        start_udp_port: port,
        stop_udp_port: port + 1,
    }
}

async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    want: impl Fn(&Event) -> bool,
    what: &str,
) -> Event {
    loop {
        let event = timeout(Duration::from_secs(20), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap_or_else(|| panic!("event channel closed waiting for {}", what));
        if want(&event) {
            return event;
        }
    }
}

async fn connect_pair(
    port: u16,
) -> (
    Server,
    Arc<Client>,
    mpsc::UnboundedReceiver<Event>,
    mpsc::UnboundedReceiver<Event>,
) {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let server = Server::start(settings(port), Arc::new(TestServerApp { events: server_tx }))
        .await
        .expect("server starts");

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = Client::start(
        ClientSettings {
            host: "127.0.0.1".to_string(),
            tcp_port: port,
        },
        Arc::new(TestClientApp { events: client_tx }),
    )
    .expect("client starts");

    expect_event(&mut server_rx, |e| matches!(e, Event::ServerConnect), "server on_connect").await;
    expect_event(&mut client_rx, |e| matches!(e, Event::ClientConnect), "client on_connect").await;

    (server, client, server_rx, client_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_connect() {
    let (server, client, _server_rx, _client_rx) = connect_pair(46_100).await;

    assert!(client.is_established());
    assert!(!client.is_disconnected());

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_cookie_is_ignored() {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let server = Server::start(settings(46_120), Arc::new(TestServerApp { events: server_tx }))
        .await
        .expect("server starts");

    // a well-formed handshake datagram whose cookie nobody minted
    let mut datagram = [0u8; 16];
    let len = {
        let mut w = StreamWriter::fixed(&mut datagram);
        0u16.ser(&mut w);
        255u8.ser(&mut w);
        0xDEADu32.ser(&mut w);
        assert!(w.good());
        w.used()
    };
    let cipher = SessionCipher::new(0, Role::Client);
    cipher.udp_out.encrypt(&mut datagram[..len]);

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..3 {
        socket.send_to(&datagram[..len], "127.0.0.1:46120").unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // the server is unaffected: a real client still connects
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client = Client::start(
        ClientSettings {
            host: "127.0.0.1".to_string(),
            tcp_port: 46_120,
        },
        Arc::new(TestClientApp { events: client_tx }),
    )
    .expect("client starts");

    expect_event(&mut server_rx, |e| matches!(e, Event::ServerConnect), "server on_connect").await;
    expect_event(&mut client_rx, |e| matches!(e, Event::ClientConnect), "client on_connect").await;

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversize_rpc_tcp_delivers_udp_refuses() {
    let (server, client, mut server_rx, _client_rx) = connect_pair(46_140).await;

    let payload = "x".repeat(500);

    // over TCP the record exceeds the pack threshold but not the record
    // limit, and arrives whole
    client.call_tcp(ECHO, &(payload.clone(),)).unwrap();
    let event = expect_event(&mut server_rx, |e| matches!(e, Event::Echo(_)), "large echo").await;
    match event {
        Event::Echo(text) => assert_eq!(text, payload),
        _ => unreachable!(),
    }

    // over UDP the same record cannot fit one datagram: refused locally,
    // session intact
    assert!(client.call_udp(ECHO, &(payload,)).is_err());
    assert!(!client.is_disconnected());

    client.call_tcp(ECHO, &("still alive".to_string(),)).unwrap();
    let event = expect_event(&mut server_rx, |e| matches!(e, Event::Echo(_)), "follow-up echo").await;
    match event {
        Event::Echo(text) => assert_eq!(text, "still alive"),
        _ => unreachable!(),
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_records_arrive_in_order() {
    let (server, client, mut server_rx, _client_rx) = connect_pair(46_160).await;

    for n in 0..50u32 {
        client.call_tcp(FIRST, &(n,)).unwrap();
        client.call_tcp(SECOND, &(n,)).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 100 {
        let event =
            expect_event(&mut server_rx, |e| matches!(e, Event::Numbered(..)), "ordered record")
                .await;
        if let Event::Numbered(tag, n) = event {
            seen.push((tag, n));
        }
    }

    let expected: Vec<(&str, u32)> = (0..50u32)
        .flat_map(|n| [("first", n), ("second", n)])
        .collect();
    assert_eq!(seen, expected);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_fail_without_server() {
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let _client = Client::start(
        ClientSettings {
            host: "127.0.0.1".to_string(),
            tcp_port: 46_180,
        },
        Arc::new(TestClientApp { events: client_tx }),
    )
    .expect("client starts");

    expect_event(
        &mut client_rx,
        |e| matches!(e, Event::ClientConnectFail),
        "client on_connect_fail",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_sees_client_teardown() {
    let (server, client, mut server_rx, _client_rx) = connect_pair(46_200).await;

    // dropping the TCP socket surfaces on the server as a disconnect at the
    // next worker tick
    client.stop().await;
    expect_event(
        &mut server_rx,
        |e| matches!(e, Event::ServerDisconnect),
        "server on_disconnect",
    )
    .await;

    server.stop().await;
}
