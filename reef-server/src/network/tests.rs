use super::NetworkServer;
use super::blocking::BlockingServer;
use super::reactor::ReactorServer;
use googletest::prelude::*;
use reef_common::config::{NetworkMode, PoolLimits, ServerConfig};
use reef_storage::{MemoryStore, Storage};
use rstest::rstest;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config(mode: NetworkMode) -> ServerConfig {
    ServerConfig {
        port: 0,
        network_mode: mode,
        reactor_workers: 2,
        pool: PoolLimits::new(1, 4, 4).expect("test limits should be valid"),
        pool_idle_timeout: Duration::from_millis(200),
        receive_timeout: Duration::from_secs(5),
        max_store_bytes: 0,
    }
}

fn storage() -> Arc<dyn Storage> {
    Arc::new(MemoryStore::new())
}

fn connect(addr: SocketAddr) -> TcpStream {
    let client = TcpStream::connect(addr).expect("connect should succeed");
    client
        .set_read_timeout(Some(Duration::from_millis(100)))
        .expect("client read timeout should be configurable");
    client
}

/// Reads until `response` ends with `suffix`, the peer closes, or the deadline passes.
fn read_until_suffix(client: &mut TcpStream, suffix: &[u8], deadline: Instant) -> Vec<u8> {
    let mut response = Vec::new();
    while Instant::now() < deadline {
        let mut chunk = [0_u8; 256];
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(read_len) => {
                response.extend_from_slice(&chunk[..read_len]);
                if response.ends_with(suffix) {
                    break;
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(error) => panic!("read from client failed: {error}"),
        }
    }
    response
}

/// Reads until the peer closes the connection; panics if it stays open past the deadline.
fn read_until_eof(client: &mut TcpStream, deadline: Instant) -> Vec<u8> {
    let mut response = Vec::new();
    while Instant::now() < deadline {
        let mut chunk = [0_u8; 256];
        match client.read(&mut chunk) {
            Ok(0) => return response,
            Ok(read_len) => response.extend_from_slice(&chunk[..read_len]),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(_) => return response,
        }
    }
    panic!("peer did not close the connection before the deadline");
}

#[rstest]
fn blocking_server_executes_set_get_roundtrip() {
    let mut server = BlockingServer::new(test_config(NetworkMode::Blocking), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set user:42 0 0 5\r\nalice\r\nget user:42\r\n")
        .expect("write commands should succeed");

    let response = read_until_suffix(
        &mut client,
        b"END\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(
        &response,
        eq(&b"STORED\r\nVALUE user:42 0 5\r\nalice\r\nEND\r\n".to_vec())
    );

    server.stop();
    server.join();
}

#[rstest]
fn blocking_server_handles_argument_split_across_reads() {
    let mut server = BlockingServer::new(test_config(NetworkMode::Blocking), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set foo 0 0 3\r\n")
        .expect("write header should succeed");
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"bar").expect("write body should succeed");
    thread::sleep(Duration::from_millis(50));
    client
        .write_all(b"\r\nget foo\r\n")
        .expect("write terminator should succeed");

    let response = read_until_suffix(
        &mut client,
        b"END\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(
        &response,
        eq(&b"STORED\r\nVALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec())
    );

    server.stop();
    server.join();
}

#[rstest]
fn blocking_server_finishes_in_flight_command_after_stop() {
    let mut config = test_config(NetworkMode::Blocking);
    config.receive_timeout = Duration::from_secs(2);
    let mut server = BlockingServer::new(config, storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set foo 0 0 3\r\nba")
        .expect("write partial command should succeed");
    // Let the handler consume the header and enter the argument phase.
    thread::sleep(Duration::from_millis(150));

    server.stop();
    thread::sleep(Duration::from_millis(50));
    client
        .write_all(b"r\r\n")
        .expect("write remaining argument should succeed");

    let response = read_until_eof(&mut client, Instant::now() + Duration::from_secs(3));
    assert_that!(&response, eq(&b"STORED\r\n".to_vec()));

    server.join();
}

#[rstest]
fn blocking_server_rejects_connections_when_pool_saturated() {
    let mut config = test_config(NetworkMode::Blocking);
    config.pool = PoolLimits::new(0, 1, 1).expect("test limits should be valid");
    let mut server = BlockingServer::new(config, storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    // Occupies the single pool thread (idle inside its read call) and fills the queue.
    let pinned = connect(addr);
    thread::sleep(Duration::from_millis(150));
    let queued = connect(addr);
    thread::sleep(Duration::from_millis(150));

    let mut rejected = connect(addr);
    let leftovers = read_until_eof(&mut rejected, Instant::now() + Duration::from_secs(2));
    assert_that!(leftovers.is_empty(), eq(true));

    drop(pinned);
    drop(queued);
    server.stop();
    server.join();
}

#[rstest]
fn blocking_server_closes_stalled_clients_on_receive_timeout() {
    let mut config = test_config(NetworkMode::Blocking);
    config.receive_timeout = Duration::from_millis(200);
    let mut server = BlockingServer::new(config, storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    let response = read_until_eof(&mut client, Instant::now() + Duration::from_secs(2));
    assert_that!(response.is_empty(), eq(true));

    server.stop();
    server.join();
}

#[rstest]
fn blocking_server_reports_execution_failures_in_band() {
    let mut config = test_config(NetworkMode::Blocking);
    config.max_store_bytes = 8;
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::with_capacity(config.max_store_bytes));
    let mut server = BlockingServer::new(config, store);
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set big 0 0 32\r\naaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\nget big\r\n")
        .expect("write commands should succeed");

    let response = read_until_suffix(
        &mut client,
        b"END\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(response.starts_with(b"SERVER_ERROR "), eq(true));
    assert_that!(response.ends_with(b"END\r\n"), eq(true));

    server.stop();
    server.join();
}

#[rstest]
fn reactor_server_executes_pipelined_commands_in_order() {
    let mut server = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set a 0 0 1\r\nx\r\nset b 0 0 1\r\ny\r\nget a b\r\n")
        .expect("write pipelined commands should succeed");

    let response = read_until_suffix(
        &mut client,
        b"END\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(
        &response,
        eq(&b"STORED\r\nSTORED\r\nVALUE a 0 1\r\nx\r\nVALUE b 0 1\r\ny\r\nEND\r\n".to_vec())
    );

    server.stop();
    server.join();
}

#[rstest]
fn reactor_server_handles_argument_split_across_reads() {
    let mut server = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set foo 0 0 3\r\n")
        .expect("write header should succeed");
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"bar").expect("write body should succeed");
    thread::sleep(Duration::from_millis(50));
    client
        .write_all(b"\r\nget foo\r\n")
        .expect("write terminator should succeed");

    let response = read_until_suffix(
        &mut client,
        b"END\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(
        &response,
        eq(&b"STORED\r\nVALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec())
    );

    server.stop();
    server.join();
}

#[rstest]
fn reactor_server_serves_connections_on_every_worker() {
    let mut server = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    // Round-robin distribution sends consecutive connections to different loops; each must
    // still serve the protocol independently.
    let mut clients = (0..4).map(|_| connect(addr)).collect::<Vec<_>>();
    for (index, client) in clients.iter_mut().enumerate() {
        let command = format!("set key:{index} 0 0 1\r\nv\r\n");
        client
            .write_all(command.as_bytes())
            .expect("write command should succeed");
    }
    for client in &mut clients {
        let response = read_until_suffix(
            client,
            b"STORED\r\n",
            Instant::now() + Duration::from_secs(2),
        );
        assert_that!(&response, eq(&b"STORED\r\n".to_vec()));
    }

    server.stop();
    server.join();
}

#[rstest]
fn reactor_server_closes_connection_on_protocol_violation() {
    let mut server = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"bogus command\r\n")
        .expect("write malformed header should succeed");

    let response = read_until_eof(&mut client, Instant::now() + Duration::from_secs(2));
    assert_that!(response.is_empty(), eq(true));

    server.stop();
    server.join();
}

#[rstest]
fn reactor_server_stop_tears_down_live_connections() {
    let mut server = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    server.start().expect("server start should succeed");
    let addr = server.local_addr().expect("local addr should be available");

    let mut client = connect(addr);
    client
        .write_all(b"set k 0 0 1\r\nv\r\n")
        .expect("write command should succeed");
    let response = read_until_suffix(
        &mut client,
        b"STORED\r\n",
        Instant::now() + Duration::from_secs(2),
    );
    assert_that!(&response, eq(&b"STORED\r\n".to_vec()));

    server.stop();
    server.join();

    let trailing = read_until_eof(&mut client, Instant::now() + Duration::from_secs(2));
    assert_that!(trailing.is_empty(), eq(true));
}

#[rstest]
fn stop_is_idempotent_for_both_deployments() {
    let mut blocking = BlockingServer::new(test_config(NetworkMode::Blocking), storage());
    blocking.start().expect("server start should succeed");
    blocking.stop();
    blocking.stop();
    blocking.join();

    let mut reactor = ReactorServer::new(test_config(NetworkMode::Reactor), storage());
    reactor.start().expect("server start should succeed");
    reactor.stop();
    reactor.stop();
    reactor.join();
}
