use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use rstest::{fixture, rstest};
use tcp_connector::{
    encode_frame, setup_local_tracing, AppError, ClientConfig, Connector, Message, MessageSink,
    ServerConfig, TcpClientConnector, TcpServerConnector, UNBOUND_ADDRESS,
};

const WAIT: Duration = Duration::from_secs(10);

#[fixture]
#[once]
fn setup() {
    setup_local_tracing();
}

/// Collects every message delivered by a connector.
#[derive(Default)]
struct Catcher {
    messages: Mutex<Vec<Message>>,
    arrived: Condvar,
}

impl MessageSink for Catcher {
    fn receive(&self, message: Message) {
        self.messages.lock().push(message);
        self.arrived.notify_all();
    }
}

impl Catcher {
    fn block_until_size(&self, expected: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut messages = self.messages.lock();
        while messages.len() < expected {
            if self.arrived.wait_until(&mut messages, deadline).timed_out() {
                return messages.len() >= expected;
            }
        }
        true
    }

    fn message(&self, index: usize) -> Message {
        self.messages.lock()[index].clone()
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

fn create_message(body_length: usize, remote_address: SocketAddr) -> Message {
    let mut body = vec![0u8; body_length];
    rand::thread_rng().fill_bytes(&mut body);
    // GET, no token
    Message::new(encode_frame(1, &[], &body).unwrap(), remote_address)
}

fn client_config(idle_timeout_ms: u64) -> ClientConfig {
    ClientConfig {
        worker_threads: 1,
        connect_timeout_ms: 1000,
        idle_timeout_ms,
        ..Default::default()
    }
}

fn start_server(idle_timeout_ms: u64) -> (TcpServerConnector, Arc<Catcher>) {
    let server = TcpServerConnector::new(ServerConfig::ephemeral(idle_timeout_ms));
    let catcher = Arc::new(Catcher::default());
    server.set_message_sink(catcher.clone()).unwrap();
    server.start().unwrap();
    (server, catcher)
}

fn start_client(idle_timeout_ms: u64) -> (TcpClientConnector, Arc<Catcher>) {
    let client = TcpClientConnector::new(client_config(idle_timeout_ms));
    let catcher = Arc::new(Catcher::default());
    client.set_message_sink(catcher.clone()).unwrap();
    client.start().unwrap();
    (client, catcher)
}

fn wait_for(condition: impl Fn() -> bool, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn unused_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[rstest]
#[case(0)]
#[case(7)]
#[case(13)]
#[case(35)]
#[case(269)]
#[case(313)]
#[case(65805)]
#[case(389805)]
fn server_client_ping_pong(_setup: (), #[case] message_size: usize) {
    let (server, server_catcher) = start_server(100_000);
    let (client, client_catcher) = start_client(100_000);

    let msg = create_message(message_size, server.local_address());
    client.send(msg.clone()).unwrap();
    assert!(server_catcher.block_until_size(1));
    let received = server_catcher.message(0);
    assert_eq!(received.payload(), msg.payload());

    // response must go over the same connection the client already opened
    let reply = create_message(message_size, received.remote_address());
    server.send(reply.clone()).unwrap();
    assert!(client_catcher.block_until_size(1));
    assert_eq!(client_catcher.message(0).payload(), reply.payload());
    assert_eq!(
        client_catcher.message(0).remote_address(),
        server.local_address()
    );
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.pool_size(), 1);

    client.stop();
    server.stop();
}

#[rstest]
fn single_server_many_clients(_setup: ()) {
    let clients = 100;
    let (server, server_catcher) = start_server(100_000);

    let mut connectors = Vec::with_capacity(clients);
    let mut sent = Vec::with_capacity(clients);
    for _ in 0..clients {
        let (client, _) = start_client(100_000);
        let msg = create_message(35, server.local_address());
        client.send(msg.clone()).unwrap();
        sent.push(msg.into_payload());
        connectors.push(client);
    }

    assert!(server_catcher.block_until_size(clients));
    let mut received: Vec<_> = (0..clients)
        .map(|i| server_catcher.message(i).into_payload())
        .collect();
    sent.sort();
    received.sort();
    assert_eq!(received, sent);
    assert_eq!(server_catcher.len(), clients);

    for client in connectors {
        client.stop();
    }
    server.stop();
}

#[rstest]
fn messages_on_one_connection_keep_order(_setup: ()) {
    let (server, server_catcher) = start_server(100_000);
    let (client, _) = start_client(100_000);

    let sent: Vec<_> = (0..50)
        .map(|i| create_message(i * 37, server.local_address()))
        .collect();
    for msg in &sent {
        client.send(msg.clone()).unwrap();
    }

    assert!(server_catcher.block_until_size(sent.len()));
    for (i, msg) in sent.iter().enumerate() {
        assert_eq!(server_catcher.message(i).payload(), msg.payload());
    }
    // one pooled connection carried everything
    assert_eq!(server.connection_count(), 1);
}

#[rstest]
fn concurrent_server_sends_to_one_peer_do_not_interleave(_setup: ()) {
    let senders = 8;
    let per_sender = 25;
    let (server, server_catcher) = start_server(100_000);
    let (client, client_catcher) = start_client(100_000);

    client
        .send(create_message(7, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(1));
    let peer = server_catcher.message(0).remote_address();

    // larger than the 4 byte extended length threshold
    let sent: Vec<Vec<_>> = (0..senders)
        .map(|_| {
            (0..per_sender)
                .map(|_| create_message(70_000, peer).into_payload())
                .collect()
        })
        .collect();
    thread::scope(|scope| {
        for frames in &sent {
            let server = &server;
            scope.spawn(move || {
                for frame in frames {
                    server.send(Message::new(frame.clone(), peer)).unwrap();
                }
            });
        }
    });

    let total = senders * per_sender;
    assert!(client_catcher.block_until_size(total));
    let origin: HashMap<_, _> = sent
        .iter()
        .enumerate()
        .flat_map(|(sender, frames)| {
            frames
                .iter()
                .enumerate()
                .map(move |(index, frame)| (frame.clone(), (sender, index)))
        })
        .collect();

    // any interleaved bytes would produce a payload that was never sent
    let mut next_index = vec![0; senders];
    for i in 0..total {
        let payload = client_catcher.message(i).into_payload();
        let (sender, index) = origin[&payload];
        assert_eq!(index, next_index[sender]);
        next_index[sender] += 1;
    }
    assert!(next_index.iter().all(|count| *count == per_sender));
    assert_eq!(client_catcher.len(), total);
    assert_eq!(server.connection_count(), 1);
    client.stop();
    server.stop();
}

#[rstest]
fn fragmented_and_coalesced_writes(_setup: ()) {
    let (server, server_catcher) = start_server(100_000);
    let mut socket = TcpStream::connect(server.local_address()).unwrap();
    socket.set_nodelay(true).unwrap();

    let first = create_message(300, server.local_address());
    for chunk in first.payload().chunks(7) {
        socket.write_all(chunk).unwrap();
        socket.flush().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(server_catcher.block_until_size(1));
    assert_eq!(server_catcher.message(0).payload(), first.payload());

    let second = create_message(0, server.local_address());
    let third = create_message(20, server.local_address());
    let mut coalesced = second.payload().to_vec();
    coalesced.extend_from_slice(third.payload());
    socket.write_all(&coalesced).unwrap();

    assert!(server_catcher.block_until_size(3));
    assert_eq!(server_catcher.message(1).payload(), second.payload());
    assert_eq!(server_catcher.message(2).payload(), third.payload());
    assert_eq!(
        server_catcher.message(2).remote_address(),
        socket.local_addr().unwrap()
    );
}

#[rstest]
fn server_idle_timeout_closes_connection(_setup: ()) {
    let (server, server_catcher) = start_server(200);
    let (client, _) = start_client(0);

    client
        .send(create_message(7, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(1));
    let peer = server_catcher.message(0).remote_address();
    assert!(server.is_connected(&peer));

    // deregistered shortly after the idle deadline
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_millis(600)));
    // the client sees the close and frees its slot
    assert!(wait_for(|| client.pool_size() == 0, Duration::from_secs(2)));

    // a later send dials again
    client
        .send(create_message(7, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(2));
}

#[rstest]
fn client_idle_timeout_evicts_pool_slot(_setup: ()) {
    let (server, server_catcher) = start_server(0);
    let (client, _) = start_client(200);

    client
        .send(create_message(13, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(1));
    assert!(client.is_connected(&server.local_address()));

    assert!(wait_for(|| client.pool_size() == 0, Duration::from_millis(600)));
    assert!(wait_for(|| server.connection_count() == 0, Duration::from_secs(2)));

    let msg = create_message(13, server.local_address());
    client.send(msg.clone()).unwrap();
    assert!(server_catcher.block_until_size(2));
    assert_eq!(server_catcher.message(1).payload(), msg.payload());
    assert_ne!(
        server_catcher.message(0).remote_address(),
        server_catcher.message(1).remote_address()
    );
}

#[rstest]
fn send_without_connection_is_dropped(_setup: ()) {
    let (server, server_catcher) = start_server(100_000);
    let (client, client_catcher) = start_client(100_000);

    // server never dials
    server
        .send(create_message(7, unused_address()))
        .unwrap();
    assert_eq!(server.connection_count(), 0);

    // client dial fails, message dropped, slot released
    let unreachable = unused_address();
    client.send(create_message(7, unreachable)).unwrap();
    assert!(wait_for(|| !client.is_connected(&unreachable), Duration::from_secs(3)));

    // the pool is usable afterwards
    client
        .send(create_message(7, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server_catcher.len(), 1);
    assert_eq!(client_catcher.len(), 0);
}

#[rstest]
fn contract_violations(_setup: ()) {
    let server = TcpServerConnector::new(ServerConfig::ephemeral(0));
    assert!(matches!(server.start(), Err(AppError::IllegalStateError(_))));
    assert!(matches!(
        server.send(create_message(1, unused_address())),
        Err(AppError::IllegalStateError(_))
    ));

    server.set_message_sink(Arc::new(Catcher::default())).unwrap();
    assert!(matches!(
        server.set_message_sink(Arc::new(Catcher::default())),
        Err(AppError::IllegalStateError(_))
    ));
    server.start().unwrap();
    assert!(matches!(server.start(), Err(AppError::IllegalStateError(_))));

    // the port is taken by the first server
    let mut taken = ServerConfig::ephemeral(0);
    taken.port = server.local_address().port();
    let second = TcpServerConnector::new(taken);
    second.set_message_sink(Arc::new(Catcher::default())).unwrap();
    assert!(matches!(second.start(), Err(AppError::IllegalStateError(_))));

    server.destroy();
    assert!(matches!(server.start(), Err(AppError::IllegalStateError(_))));

    let client = TcpClientConnector::new(client_config(0));
    assert!(matches!(client.start(), Err(AppError::IllegalStateError(_))));
    client.set_message_sink(Arc::new(Catcher::default())).unwrap();
    assert!(matches!(
        client.send(create_message(1, unused_address())),
        Err(AppError::IllegalStateError(_))
    ));
    client.start().unwrap();
    assert!(matches!(client.start(), Err(AppError::IllegalStateError(_))));
    assert_eq!(client.local_address(), UNBOUND_ADDRESS);
    assert!(client.is_tcp());
}

#[rstest]
fn stop_then_start_again(_setup: ()) {
    let (server, server_catcher) = start_server(100_000);
    let (client, client_catcher) = start_client(100_000);

    client
        .send(create_message(7, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(1));

    server.stop();
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);
    // stopping twice is harmless
    server.stop();
    // the client notices the closed connection
    assert!(wait_for(|| client.pool_size() == 0, Duration::from_secs(2)));

    server.start().unwrap();
    client
        .send(create_message(9, server.local_address()))
        .unwrap();
    assert!(server_catcher.block_until_size(2));

    client.stop();
    assert!(matches!(
        client.send(create_message(7, server.local_address())),
        Err(AppError::IllegalStateError(_))
    ));
    client.start().unwrap();
    let msg = create_message(11, server.local_address());
    client.send(msg).unwrap();
    assert!(server_catcher.block_until_size(3));

    let reply = create_message(5, server_catcher.message(2).remote_address());
    server.send(reply.clone()).unwrap();
    assert!(client_catcher.block_until_size(1));
    assert_eq!(client_catcher.message(0).payload(), reply.payload());
}
