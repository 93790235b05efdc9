//! End-to-end tests over real sockets.

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use io_reactor::{Backend, Mesh};
use server::{Config, Envelope, router, worker};

const MB: usize = 1024 * 1024;

/// Get an available port for testing.
fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

struct TestServer {
    config: Config,
    mesh: Arc<Mesh<Envelope>>,
    shutdown: Arc<AtomicBool>,
    handles: Option<Vec<JoinHandle<()>>>,
}

impl TestServer {
    fn start(threads: usize, udp: bool) -> Self {
        let config = Config {
            address: "127.0.0.1".parse().unwrap(),
            port: free_tcp_port(),
            udp_port: if udp { free_udp_port() } else { 0 },
            backlog: 128,
            memory_limit: threads * MB,
            segment_size: 64 * 1024,
            threads,
            io_backend: Backend::default(),
            isolate_cpus: Vec::new(),
            sched_fifo: false,
        };
        config.validate().unwrap();

        let mesh = Arc::new(Mesh::new(threads).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = worker::spawn(&config, mesh.clone(), shutdown.clone());

        Self {
            config,
            mesh,
            shutdown,
            handles: Some(handles),
        }
    }

    fn connect(&self) -> TcpStream {
        let addr = self.config.tcp_addr();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    return stream;
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("could not connect to test server: {e}"),
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.mesh.wake_all();
        for handle in self.handles.take().unwrap() {
            let _ = handle.join();
        }
    }
}

/// Send a request and assert the exact response bytes.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).unwrap();
    let mut response = vec![0u8; expected.len()];
    stream.read_exact(&mut response).unwrap();
    assert_eq!(
        response,
        expected,
        "request {:?}: got {:?}, expected {:?}",
        String::from_utf8_lossy(request),
        String::from_utf8_lossy(&response),
        String::from_utf8_lossy(expected)
    );
}

/// Find a key that routes to `shard` out of `nr_shards`.
fn key_for_shard(shard: usize, nr_shards: usize) -> Vec<u8> {
    (0u32..)
        .map(|i| format!("key-{i}").into_bytes())
        .find(|key| router::target_shard(key, nr_shards) == shard)
        .unwrap()
}

#[test]
fn protocol_parse_and_roundtrip() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    roundtrip(&mut stream, b"foo\r\n", b"ERROR\r\n");
    roundtrip(&mut stream, b"set foo 0 0 3\r\nbar\r\n", b"STORED\r\n");
    roundtrip(&mut stream, b"get foo\r\n", b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
}

#[test]
fn get_missing_key() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    roundtrip(&mut stream, b"get nothere\r\n", b"END\r\n");
}

#[test]
fn overwrite_same_key() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    roundtrip(
        &mut stream,
        b"set abcdefgh 0 0 16\r\n0123456789abcdef\r\n",
        b"STORED\r\n",
    );
    roundtrip(
        &mut stream,
        b"get abcdefgh\r\n",
        b"VALUE abcdefgh 0 16\r\n0123456789abcdef\r\nEND\r\n",
    );
    roundtrip(
        &mut stream,
        b"set abcdefgh 0 0 16\r\nfedcba9876543210\r\n",
        b"STORED\r\n",
    );
    roundtrip(
        &mut stream,
        b"get abcdefgh\r\n",
        b"VALUE abcdefgh 0 16\r\nfedcba9876543210\r\nEND\r\n",
    );
}

#[test]
fn pipelined_commands_stay_ordered_on_one_shard() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    roundtrip(
        &mut stream,
        b"set a 0 0 1\r\nx\r\nset b 0 0 1\r\ny\r\nget a\r\n",
        b"STORED\r\nSTORED\r\nVALUE a 0 1\r\nx\r\nEND\r\n",
    );
}

#[test]
fn malformed_command_keeps_connection_open() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    roundtrip(&mut stream, b"bogus command\r\n", b"ERROR\r\n");
    roundtrip(&mut stream, b"set k 0 0 1\r\nv\r\n", b"STORED\r\n");
    roundtrip(&mut stream, b"get k\r\n", b"VALUE k 0 1\r\nv\r\nEND\r\n");
}

#[test]
fn cross_shard_routing() {
    let server = TestServer::start(2, false);
    let mut stream = server.connect();

    let key0 = key_for_shard(0, 2);
    let key1 = key_for_shard(1, 2);
    assert_ne!(
        router::target_shard(&key0, 2),
        router::target_shard(&key1, 2)
    );

    // both keys are issued on the same socket; one of them must hop shards
    for (key, value) in [(&key0, "shard-zero"), (&key1, "shard-one")] {
        let mut request = Vec::new();
        request.extend_from_slice(b"set ");
        request.extend_from_slice(key);
        request.extend_from_slice(format!(" 0 0 {}\r\n", value.len()).as_bytes());
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
        roundtrip(&mut stream, &request, b"STORED\r\n");
    }

    for (key, value) in [(&key0, "shard-zero"), (&key1, "shard-one")] {
        let mut request = Vec::new();
        request.extend_from_slice(b"get ");
        request.extend_from_slice(key);
        request.extend_from_slice(b"\r\n");

        let mut expected = Vec::new();
        expected.extend_from_slice(b"VALUE ");
        expected.extend_from_slice(key);
        expected.extend_from_slice(format!(" 0 {}\r\n", value.len()).as_bytes());
        expected.extend_from_slice(value.as_bytes());
        expected.extend_from_slice(b"\r\nEND\r\n");
        roundtrip(&mut stream, &request, &expected);
    }
}

#[test]
fn oversized_value_is_rejected() {
    let server = TestServer::start(1, false);
    let mut stream = server.connect();

    // larger than a 64 KB segment
    let value = vec![b'x'; 70_000];
    let mut request = Vec::new();
    request.extend_from_slice(format!("set big 0 0 {}\r\n", value.len()).as_bytes());
    request.extend_from_slice(&value);
    request.extend_from_slice(b"\r\n");
    roundtrip(
        &mut stream,
        &request,
        b"SERVER_ERROR out of memory storing object\r\n",
    );

    // the store is still usable
    roundtrip(&mut stream, b"set ok 0 0 2\r\nhi\r\n", b"STORED\r\n");
}

#[test]
fn reconnect_sees_stored_data() {
    let server = TestServer::start(1, false);

    {
        let mut stream = server.connect();
        roundtrip(&mut stream, b"set keep 0 0 4\r\ndata\r\n", b"STORED\r\n");
    }

    let mut stream = server.connect();
    roundtrip(&mut stream, b"get keep\r\n", b"VALUE keep 0 4\r\ndata\r\nEND\r\n");
}

fn udp_request(server: &TestServer, request_id: u16, payload: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut datagram = Vec::new();
    datagram.extend_from_slice(&request_id.to_be_bytes());
    datagram.extend_from_slice(&0u16.to_be_bytes()); // sequence_num
    datagram.extend_from_slice(&1u16.to_be_bytes()); // nr_datagrams
    datagram.extend_from_slice(&0u16.to_be_bytes()); // reserved
    datagram.extend_from_slice(payload);
    socket
        .send_to(&datagram, server.config.udp_addr())
        .unwrap();

    let mut buf = vec![0u8; 64 * 1024];
    let (n, _) = socket.recv_from(&mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn udp_roundtrip_echoes_frame() {
    let server = TestServer::start(1, true);

    let response = udp_request(&server, 0x1234, b"set foo 0 0 3\r\nbar\r\n");
    assert_eq!(&response[..8], &[0x12, 0x34, 0, 0, 0, 1, 0, 0]);
    assert_eq!(&response[8..], b"STORED\r\n");

    let response = udp_request(&server, 0x4321, b"get foo\r\n");
    assert_eq!(&response[..8], &[0x43, 0x21, 0, 0, 0, 1, 0, 0]);
    assert_eq!(&response[8..], b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
}

#[test]
fn udp_rejects_residual_bytes() {
    let server = TestServer::start(1, true);

    // two commands in one datagram: one request per datagram is required
    let response = udp_request(&server, 7, b"get a\r\nget b\r\n");
    assert_eq!(&response[..8], &[0, 7, 0, 0, 0, 1, 0, 0]);
    assert_eq!(&response[8..], b"ERROR\r\n");
}
