//! The control connection: a single specially-treated connection used to
//! fetch metadata from the system tables and to receive server events.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use corvus_cql::frame::response::result::Rows;

use crate::cluster::metadata::{Keyspace, Metadata, Peer, Strategy};
use crate::cluster::node::NodeAddr;
use crate::errors::MetadataError;
use crate::network::Connection;
use crate::response::query_result::QueryResult;
use crate::routing::Token;
use crate::statement::unprepared::Statement;

const QUERY_LOCAL: &str =
    "SELECT host_id, cluster_name, data_center, rack, tokens FROM system.local WHERE key='local'";
const QUERY_PEERS: &str =
    "SELECT host_id, rpc_address, data_center, rack, tokens FROM system.peers";
const QUERY_KEYSPACES: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";

pub(crate) struct ControlConnection {
    conn: Arc<Connection>,
}

impl ControlConnection {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.conn.get_connect_address()
    }

    /// Performs a full metadata read: topology from `system.local` and
    /// `system.peers`, plus keyspaces from the schema tables unless schema
    /// fetching is disabled.
    pub(crate) async fn query_metadata(
        &self,
        connect_port: u16,
        fetch_schema: bool,
    ) -> Result<Metadata, MetadataError> {
        let (mut peers, cluster_name) = self.query_local(connect_port).await?;
        let remote_peers = self.query_peers(connect_port).await?;
        peers.extend(remote_peers);

        let keyspaces = if fetch_schema {
            self.query_keyspaces().await?
        } else {
            HashMap::new()
        };

        Ok(Metadata {
            peers,
            keyspaces,
            cluster_name,
        })
    }

    // The control host itself, from system.local. Its address is the one we
    // connected to (known-routable), not the broadcast one.
    async fn query_local(
        &self,
        connect_port: u16,
    ) -> Result<(Vec<Peer>, Option<String>), MetadataError> {
        let result = self.query(QUERY_LOCAL).await?;
        let rows = require_rows(&result, "system.local")?;
        let row = rows
            .rows
            .first()
            .ok_or(MetadataError::LocalAbsent)?;

        let host_id: Uuid = get_column(rows, row, "system.local", "host_id")?;
        let cluster_name: Option<String> =
            get_column(rows, row, "system.local", "cluster_name").unwrap_or(None);
        let datacenter: Option<String> = get_column(rows, row, "system.local", "data_center")?;
        let rack: Option<String> = get_column(rows, row, "system.local", "rack")?;
        let tokens = parse_tokens(get_column(rows, row, "system.local", "tokens")?);

        let mut address = self.get_connect_address();
        address.set_port(connect_port);

        let peer = Peer {
            host_id,
            address: NodeAddr::Untranslatable(address),
            tokens,
            datacenter,
            rack,
        };
        Ok((vec![peer], cluster_name))
    }

    async fn query_peers(&self, connect_port: u16) -> Result<Vec<Peer>, MetadataError> {
        let result = self.query(QUERY_PEERS).await?;
        let rows = require_rows(&result, "system.peers")?;

        let mut peers = Vec::with_capacity(rows.rows_count);
        for row in rows.rows.iter() {
            let host_id: Option<Uuid> = get_column(rows, row, "system.peers", "host_id")?;
            let Some(host_id) = host_id else {
                warn!("system.peers row has NULL host_id; skipping the peer");
                continue;
            };
            let rpc_address: Option<IpAddr> =
                get_column(rows, row, "system.peers", "rpc_address")?;
            let Some(rpc_address) = rpc_address else {
                warn!("system.peers row has NULL rpc_address; skipping the peer");
                continue;
            };
            if rpc_address == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                || rpc_address == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            {
                // A node misconfigured to broadcast 0.0.0.0 cannot be
                // reached through what it advertises.
                warn!(
                    "system.peers row advertises the unspecified address {}; skipping the peer",
                    rpc_address
                );
                continue;
            }

            let datacenter: Option<String> = get_column(rows, row, "system.peers", "data_center")?;
            let rack: Option<String> = get_column(rows, row, "system.peers", "rack")?;
            let tokens = parse_tokens(get_column(rows, row, "system.peers", "tokens")?);

            peers.push(Peer {
                host_id,
                address: NodeAddr::Translatable(SocketAddr::new(rpc_address, connect_port)),
                tokens,
                datacenter,
                rack,
            });
        }
        Ok(peers)
    }

    async fn query_keyspaces(&self) -> Result<HashMap<String, Keyspace>, MetadataError> {
        let result = self.query(QUERY_KEYSPACES).await?;
        let rows = require_rows(&result, "system_schema.keyspaces")?;

        let mut keyspaces = HashMap::with_capacity(rows.rows_count);
        for row in rows.rows.iter() {
            let keyspace_name: String =
                get_column(rows, row, "system_schema.keyspaces", "keyspace_name")?;
            let replication: HashMap<String, String> =
                get_column(rows, row, "system_schema.keyspaces", "replication")?;
            let strategy = Strategy::from_replication_map(replication);
            keyspaces.insert(keyspace_name, Keyspace { strategy });
        }
        Ok(keyspaces)
    }

    async fn query(&self, statement: &str) -> Result<QueryResult, MetadataError> {
        self.conn
            .query_unpaged(Statement::new(statement))
            .await
            .map_err(MetadataError::FetchError)
    }
}

fn require_rows<'r>(
    result: &'r QueryResult,
    table: &'static str,
) -> Result<&'r Rows, MetadataError> {
    result.rows().ok_or(MetadataError::MalformedSystemRow {
        table,
        column: "*",
        reason: "expected a rows result".to_owned(),
    })
}

fn get_column<T: corvus_cql::frame::response::result::FromCqlCell>(
    rows: &Rows,
    row: &corvus_cql::frame::response::result::Row,
    table: &'static str,
    column: &'static str,
) -> Result<T, MetadataError> {
    let index = rows
        .column_index(column)
        .ok_or(MetadataError::MalformedSystemRow {
            table,
            column,
            reason: "column absent from metadata".to_owned(),
        })?;
    row.get::<T>(index)
        .map_err(|e| MetadataError::MalformedSystemRow {
            table,
            column,
            reason: e.to_string(),
        })
}

// Tokens are stored as a set of decimal strings; unparsable ones are
// dropped with a warning rather than poisoning the whole refresh.
fn parse_tokens(raw: Option<Vec<String>>) -> Vec<Token> {
    raw.unwrap_or_default()
        .iter()
        .filter_map(|s| match s.parse::<i64>() {
            Ok(value) => Some(Token::new(value)),
            Err(_) => {
                warn!("Unparsable token {:?} in system tables; ignoring it", s);
                None
            }
        })
        .collect()
}
