//! The cluster-wide prepared-statement registry.
//!
//! Statements are cached by their server-assigned id (opaque bytes,
//! compared by content). After a statement is prepared on one host, the
//! registry propagates it to the rest of the fleet in the background, and
//! re-prepares the whole cache on hosts returning from Down. All fleet
//! operations are best-effort: a host that misses a statement recovers
//! lazily through the UNPREPARED path.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::state::ClusterState;
use crate::cluster::NodeRef;
use crate::statement::prepared::PreparedStatement;

/// Upper bound on concurrent fleet-wide PREPARE requests.
const REPREPARE_PARALLELISM: usize = 64;

pub(crate) struct PreparedStatementRegistry {
    statements: DashMap<Bytes, PreparedStatement>,
    reprepare_limit: Arc<Semaphore>,
}

impl PreparedStatementRegistry {
    pub(crate) fn new() -> Self {
        Self {
            statements: DashMap::new(),
            reprepare_limit: Arc::new(Semaphore::new(REPREPARE_PARALLELISM)),
        }
    }

    /// Inserts a freshly prepared statement; the first writer of an id
    /// wins and later duplicates are dropped.
    pub(crate) fn insert(&self, prepared: &PreparedStatement) {
        self.statements
            .entry(prepared.get_id().clone())
            .or_insert_with(|| prepared.clone());
    }

    pub(crate) fn get_by_id(&self, id: &[u8]) -> Option<PreparedStatement> {
        self.statements.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all cached statements.
    pub(crate) fn statements(&self) -> Vec<PreparedStatement> {
        self.statements
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Propagates a newly prepared statement to every Up host except the
    /// one that already has it. Best-effort with bounded parallelism;
    /// failures are logged and swallowed.
    pub(crate) async fn propagate_to_fleet(
        &self,
        cluster_state: &ClusterState,
        prepared: &PreparedStatement,
        already_prepared_on: Uuid,
    ) {
        let mut preparations = cluster_state
            .up_nodes()
            .filter(|node| node.host_id != already_prepared_on)
            .map(|node| self.prepare_on_node(node, prepared.clone()))
            .collect::<FuturesUnordered<_>>();

        while preparations.next().await.is_some() {}
    }

    /// Re-prepares every cached statement on a host that came back up.
    pub(crate) async fn reprepare_all_on_node(&self, node: NodeRef<'_>) {
        let statements = self.statements();
        if statements.is_empty() {
            return;
        }
        debug!(
            "Re-preparing {} cached statement(s) on node {}",
            statements.len(),
            node.address
        );

        let mut preparations = statements
            .iter()
            .map(|prepared| self.prepare_on_node(node, prepared.clone()))
            .collect::<FuturesUnordered<_>>();

        while preparations.next().await.is_some() {}
    }

    async fn prepare_on_node(&self, node: NodeRef<'_>, prepared: PreparedStatement) {
        let _permit = self
            .reprepare_limit
            .acquire()
            .await
            .expect("the registry never closes its semaphore");

        let connection = match node.borrow_connection() {
            Ok(connection) => connection,
            Err(err) => {
                warn!(
                    "Could not borrow a connection to {} for re-preparation: {}",
                    node.address, err
                );
                return;
            }
        };

        if let Err(err) = connection
            .reprepare(prepared.get_statement(), &prepared)
            .await
        {
            // The executor recovers lazily via UNPREPARED if this host is
            // ever asked to execute the statement.
            warn!(
                "Failed to re-prepare statement on {}: {}",
                node.address, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::partitioner::PartitionerName;
    use crate::statement::unprepared::Statement;
    use corvus_cql::frame::response::result::{PreparedMetadata, ResultMetadata};

    fn prepared_with_id(id: &'static [u8]) -> PreparedStatement {
        PreparedStatement::new(
            Bytes::from_static(id),
            &Statement::new("SELECT * FROM t WHERE k = ?"),
            None,
            PreparedMetadata {
                flags: 0,
                col_count: 1,
                pk_indexes: vec![0],
                col_specs: Vec::new(),
            },
            None,
            ResultMetadata::mock_empty(),
            PartitionerName::Murmur3,
        )
    }

    #[test]
    fn statements_are_cached_by_id_content() {
        let registry = PreparedStatementRegistry::new();
        registry.insert(&prepared_with_id(b"\x01"));
        registry.insert(&prepared_with_id(b"\x02"));
        // A duplicate id does not create a second entry.
        registry.insert(&prepared_with_id(b"\x01"));

        assert_eq!(registry.statements().len(), 2);
        // Lookup works with any byte slice of equal content.
        assert!(registry.get_by_id(&[0x01]).is_some());
        assert!(registry.get_by_id(&[0x03]).is_none());
    }
}
