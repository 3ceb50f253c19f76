//! End-to-end tests against a minimal in-process mock of the native
//! protocol (v4, no auth, no compression). The mock implements just enough
//! of the server side to bootstrap a cluster: OPTIONS/STARTUP/REGISTER,
//! the system-table queries, and scripted PREPARE/EXECUTE behavior.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use corvus::cluster::metadata::Strategy;
use corvus::errors::NewSessionError;
use corvus::{Cluster, ClusterConfig, ProtocolVersion};
use corvus_cql::frame::types;

// Request opcodes the mock understands.
const OP_STARTUP: u8 = 0x01;
const OP_OPTIONS: u8 = 0x05;
const OP_QUERY: u8 = 0x07;
const OP_PREPARE: u8 = 0x09;
const OP_EXECUTE: u8 = 0x0A;
const OP_REGISTER: u8 = 0x0B;

// Response opcodes.
const OP_ERROR: u8 = 0x00;
const OP_READY: u8 = 0x02;
const OP_SUPPORTED: u8 = 0x06;
const OP_RESULT: u8 = 0x08;

const PREPARED_ID: &[u8] = b"\xde\xad\xbe\xef";

#[derive(Clone)]
struct NodeSpec {
    host_id: Uuid,
    ip: IpAddr,
    token: i64,
}

struct MockCluster {
    port: u16,
    nodes: Vec<NodeSpec>,
    /// How many EXECUTE requests should still bounce with UNPREPARED.
    unprepared_remaining: AtomicUsize,
    prepare_count: AtomicUsize,
    execute_count: AtomicUsize,
}

impl MockCluster {
    async fn start(node_count: usize) -> Arc<MockCluster> {
        // All nodes share one port on distinct loopback addresses, the way
        // a real cluster shares the native port across hosts.
        let first_listener = TcpListener::bind((Ipv4Addr::new(127, 0, 0, 1), 0))
            .await
            .unwrap();
        let port = first_listener.local_addr().unwrap().port();

        let nodes: Vec<NodeSpec> = (0..node_count)
            .map(|i| NodeSpec {
                host_id: Uuid::new_v4(),
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, (i + 1) as u8)),
                token: (i as i64 + 1) * 1000,
            })
            .collect();

        let cluster = Arc::new(MockCluster {
            port,
            nodes,
            unprepared_remaining: AtomicUsize::new(0),
            prepare_count: AtomicUsize::new(0),
            execute_count: AtomicUsize::new(0),
        });

        let mut listeners = vec![first_listener];
        for node in cluster.nodes.iter().skip(1) {
            listeners.push(
                TcpListener::bind((node.ip, port))
                    .await
                    .expect("loopback aliases must be bindable"),
            );
        }

        for (index, listener) in listeners.into_iter().enumerate() {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let cluster = cluster.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(socket, cluster, index).await;
                    });
                }
            });
        }

        cluster
    }

    fn contact_point(&self) -> SocketAddr {
        SocketAddr::new(self.nodes[0].ip, self.port)
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    cluster: Arc<MockCluster>,
    node_index: usize,
) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 9];
        socket.read_exact(&mut header).await?;
        let stream_id = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let body_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; body_len];
        socket.read_exact(&mut body).await?;

        let response = match opcode {
            OP_OPTIONS => encode_response(stream_id, OP_SUPPORTED, &supported_body()),
            OP_STARTUP | OP_REGISTER => encode_response(stream_id, OP_READY, &[]),
            OP_QUERY => {
                let statement = types::read_long_string(&mut &body[..]).unwrap().to_owned();
                let body = query_response_body(&cluster, node_index, &statement);
                encode_response(stream_id, OP_RESULT, &body)
            }
            OP_PREPARE => {
                cluster.prepare_count.fetch_add(1, Ordering::SeqCst);
                encode_response(stream_id, OP_RESULT, &prepared_body())
            }
            OP_EXECUTE => {
                cluster.execute_count.fetch_add(1, Ordering::SeqCst);
                let bounce = cluster
                    .unprepared_remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if bounce {
                    encode_response(stream_id, OP_ERROR, &unprepared_error_body())
                } else {
                    encode_response(stream_id, OP_RESULT, &void_body())
                }
            }
            _ => encode_response(stream_id, OP_RESULT, &void_body()),
        };
        socket.write_all(&response).await?;
    }
}

fn encode_response(stream_id: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x84, 0x00];
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

fn supported_body() -> Vec<u8> {
    let mut options = HashMap::new();
    options.insert("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()]);
    options.insert("COMPRESSION".to_owned(), Vec::new());
    let mut body = Vec::new();
    types::write_string_multimap(&options, &mut body).unwrap();
    body
}

fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

fn unprepared_error_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x2500, &mut body);
    types::write_string("unprepared statement", &mut body).unwrap();
    types::write_short_bytes(PREPARED_ID, &mut body).unwrap();
    body
}

// RESULT::Prepared for `INSERT INTO ks.t (k, v) VALUES (?, ?)`, with k (an
// int) being the whole partition key.
fn prepared_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(PREPARED_ID, &mut body).unwrap();
    // Prepared metadata: global table spec, 2 variables, pk index [0].
    types::write_int(0x0001, &mut body);
    types::write_int(2, &mut body);
    types::write_int(1, &mut body);
    types::write_short(0, &mut body);
    types::write_string("ks", &mut body).unwrap();
    types::write_string("t", &mut body).unwrap();
    types::write_string("k", &mut body).unwrap();
    types::write_short(0x0009, &mut body); // int
    types::write_string("v", &mut body).unwrap();
    types::write_short(0x000D, &mut body); // varchar
    // Result metadata: no columns.
    types::write_int(0, &mut body);
    types::write_int(0, &mut body);
    body
}

struct RowsBodyBuilder {
    body: Vec<u8>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl RowsBodyBuilder {
    // `columns` are (name, type-option) pairs; only primitive types here.
    fn new(table: &str, columns: &[(&str, u16)]) -> Self {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body);
        types::write_int(0x0001, &mut body); // global table spec
        types::write_int(columns.len() as i32, &mut body);
        types::write_string("system", &mut body).unwrap();
        types::write_string(table, &mut body).unwrap();
        for (name, type_option) in columns {
            types::write_string(name, &mut body).unwrap();
            types::write_short(*type_option, &mut body);
            if *type_option == 0x0022 {
                // set<varchar>
                types::write_short(0x000D, &mut body);
            }
            if *type_option == 0x0021 {
                // map<varchar, varchar>
                types::write_short(0x000D, &mut body);
                types::write_short(0x000D, &mut body);
            }
        }
        Self {
            body,
            rows: Vec::new(),
        }
    }

    fn push_row(&mut self, cells: Vec<Option<Vec<u8>>>) {
        self.rows.push(cells);
    }

    fn finish(mut self) -> Vec<u8> {
        types::write_int(self.rows.len() as i32, &mut self.body);
        for row in self.rows {
            for cell in row {
                types::write_bytes_opt(cell, &mut self.body).unwrap();
            }
        }
        self.body
    }
}

fn text_cell(s: &str) -> Option<Vec<u8>> {
    Some(s.as_bytes().to_vec())
}

fn uuid_cell(id: Uuid) -> Option<Vec<u8>> {
    Some(id.as_bytes().to_vec())
}

fn inet_cell(ip: IpAddr) -> Option<Vec<u8>> {
    match ip {
        IpAddr::V4(v4) => Some(v4.octets().to_vec()),
        IpAddr::V6(v6) => Some(v6.octets().to_vec()),
    }
}

fn token_set_cell(token: i64) -> Option<Vec<u8>> {
    let mut cell = Vec::new();
    types::write_int(1, &mut cell);
    types::write_bytes(token.to_string().as_bytes(), &mut cell).unwrap();
    Some(cell)
}

fn replication_map_cell(entries: &[(&str, &str)]) -> Option<Vec<u8>> {
    let mut cell = Vec::new();
    types::write_int(entries.len() as i32, &mut cell);
    for (k, v) in entries {
        types::write_bytes(k.as_bytes(), &mut cell).unwrap();
        types::write_bytes(v.as_bytes(), &mut cell).unwrap();
    }
    Some(cell)
}

fn query_response_body(cluster: &MockCluster, node_index: usize, statement: &str) -> Vec<u8> {
    if statement.contains("system.local") {
        let node = &cluster.nodes[node_index];
        let mut builder = RowsBodyBuilder::new(
            "local",
            &[
                ("host_id", 0x000C),
                ("cluster_name", 0x000D),
                ("data_center", 0x000D),
                ("rack", 0x000D),
                ("tokens", 0x0022),
            ],
        );
        builder.push_row(vec![
            uuid_cell(node.host_id),
            text_cell("mock-cluster"),
            text_cell("dc1"),
            text_cell("r1"),
            token_set_cell(node.token),
        ]);
        builder.finish()
    } else if statement.contains("system.peers") {
        let mut builder = RowsBodyBuilder::new(
            "peers",
            &[
                ("host_id", 0x000C),
                ("rpc_address", 0x0010),
                ("data_center", 0x000D),
                ("rack", 0x000D),
                ("tokens", 0x0022),
            ],
        );
        for (index, node) in cluster.nodes.iter().enumerate() {
            if index == node_index {
                continue;
            }
            builder.push_row(vec![
                uuid_cell(node.host_id),
                inet_cell(node.ip),
                text_cell("dc1"),
                text_cell("r1"),
                token_set_cell(node.token),
            ]);
        }
        builder.finish()
    } else if statement.contains("system_schema.keyspaces") {
        let mut builder = RowsBodyBuilder::new(
            "keyspaces",
            &[("keyspace_name", 0x000D), ("replication", 0x0021)],
        );
        builder.push_row(vec![
            text_cell("ks"),
            replication_map_cell(&[("class", "SimpleStrategy"), ("replication_factor", "3")]),
        ]);
        builder.finish()
    } else {
        void_body()
    }
}

fn test_config(cluster: &MockCluster) -> ClusterConfig {
    let mut config = ClusterConfig::new();
    config.add_contact_point(cluster.contact_point());
    config.port = cluster.port;
    config.protocol_version = Some(ProtocolVersion::V4);
    config
}

#[tokio::test]
async fn startup_discovers_all_nodes() {
    let mock = MockCluster::start(3).await;
    let cluster = Cluster::connect(test_config(&mock)).await.unwrap();

    let state = cluster.state();
    let nodes = state.get_nodes_info();
    assert_eq!(nodes.len(), 3);

    let mut host_ids: Vec<Uuid> = nodes.iter().map(|n| n.host_id).collect();
    host_ids.sort();
    host_ids.dedup();
    assert_eq!(host_ids.len(), 3, "host ids must be distinct");

    assert_eq!(state.cluster_name(), Some("mock-cluster"));
    let keyspace = state.get_keyspace("ks").expect("keyspace fetched");
    assert_eq!(
        keyspace.strategy,
        Strategy::SimpleStrategy {
            replication_factor: 3
        }
    );

    // A basic request flows through the executor.
    let session = cluster.session().unwrap();
    let result = session.query_unpaged("SELECT something FROM ks.t", ()).await.unwrap();
    assert!(!result.is_rows());

    cluster.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unprepared_statement_is_transparently_reprepared() {
    let mock = MockCluster::start(1).await;
    let cluster = Cluster::connect(test_config(&mock)).await.unwrap();
    let session = cluster.session().unwrap();

    let prepared = session
        .prepare("INSERT INTO ks.t (k, v) VALUES (?, ?)")
        .await
        .unwrap();
    assert_eq!(&prepared.get_id()[..], PREPARED_ID);
    let prepares_before = mock.prepare_count.load(Ordering::SeqCst);

    // Prime the coordinator to bounce exactly one EXECUTE.
    mock.unprepared_remaining.store(1, Ordering::SeqCst);

    let result = session
        .execute_unpaged(&prepared, (42_i32, "forty-two"))
        .await
        .unwrap();
    assert!(!result.is_rows());

    // Two EXECUTE frames (bounced + retried), one PREPARE in between,
    // all on the same (only) host.
    assert_eq!(mock.execute_count.load(Ordering::SeqCst), 2);
    assert_eq!(mock.prepare_count.load(Ordering::SeqCst), prepares_before + 1);

    cluster.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_disposes_the_handle() {
    let mock = MockCluster::start(1).await;
    let cluster = Cluster::connect(test_config(&mock)).await.unwrap();
    let session = cluster.session().unwrap();

    assert!(cluster.shutdown(Duration::from_secs(1)).await);
    // Idempotent.
    assert!(cluster.shutdown(Duration::from_secs(1)).await);

    // New sessions are refused.
    assert!(matches!(
        cluster.session(),
        Err(NewSessionError::Disposed)
    ));

    // Requests on existing sessions fail with "cluster closing".
    let result = session.query_unpaged("SELECT something FROM ks.t", ()).await;
    assert!(matches!(
        result,
        Err(corvus::errors::ExecutionError::ClusterClosing)
    ));

    let _ = mock;
}
