//! Sessions: the request-executing face of a cluster handle.
//!
//! A session routes statements through the load balancing policy, walks the
//! resulting query plan with per-attempt deadlines, applies the retry
//! policy, and races speculative executions for idempotent statements. All
//! sessions of a handle share its pools, metadata and prepared-statement
//! registry.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, trace_span, warn, Instrument};
use uuid::Uuid;

use corvus_cql::frame::request::query::{PagingState, PagingStateResponse};
use corvus_cql::serialize::{RowValues, SerializedValues};
use corvus_cql::Consistency;

use crate::cluster::node::NodeRef;
use crate::cluster::state::ClusterState;
use crate::errors::{
    BadQuery, ConnectionPoolError, ExecutionError, MetadataError, NoHostAvailableError,
    PrepareError, RequestAttemptError, UseKeyspaceError,
};
use crate::network::{Connection, VerifiedKeyspaceName};
use crate::policies::load_balancing::{self, LoadBalancingPolicy, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetrySession};
use crate::policies::speculative_execution::{self, AttemptOutcome};
use crate::response::query_result::QueryResult;
use crate::response::NonErrorQueryResponse;
use crate::statement::batch::Batch;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::{PageSize, StatementConfig};

use super::cluster::Cluster;

/// A session created from a [Cluster] handle.
///
/// Sessions are independently named and identified, but share every
/// cluster-level resource; creating many of them is cheap.
pub struct Session {
    cluster: Cluster,
    session_id: Uuid,
    name: String,
}

/// Outcome of a request which a retry policy decided to downgrade to a
/// success (e.g. an ignored write timeout).
pub(crate) enum RunRequestResult<ResT> {
    IgnoredWriteError,
    Completed(ResT),
}

impl Session {
    pub(crate) fn new(cluster: Cluster, session_id: Uuid, name: String) -> Self {
        Self {
            cluster,
            session_id,
            name,
        }
    }

    /// Unique id of this session.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Name of this session (`<prefix><counter>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The metadata snapshot this session would route against right now.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.inner.runtime.get_state()
    }

    /// Statements prepared through this cluster handle, as cached by the
    /// registry.
    pub fn prepared_statements(&self) -> Vec<PreparedStatement> {
        self.cluster.inner.registry.statements()
    }

    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.inner.runtime.refresh_metadata().await
    }

    /// Executes an unprepared statement, without paging.
    pub async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
        values: impl RowValues,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let values = values
            .serialized()
            .map_err(|e| ExecutionError::BadQuery(BadQuery::SerializeValuesError(e)))?;
        self.do_query(&statement, &values, None, PagingState::start())
            .await
    }

    /// Executes an unprepared statement, fetching a single page.
    pub async fn query_single_page(
        &self,
        statement: impl Into<Statement>,
        values: impl RowValues,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let statement = statement.into();
        let values = values
            .serialized()
            .map_err(|e| ExecutionError::BadQuery(BadQuery::SerializeValuesError(e)))?;
        let page_size = statement.get_validated_page_size();
        let result = self
            .do_query(&statement, &values, Some(page_size), paging_state)
            .await?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Executes a prepared statement, without paging.
    pub async fn execute_unpaged(
        &self,
        prepared: &PreparedStatement,
        values: impl RowValues,
    ) -> Result<QueryResult, ExecutionError> {
        let values = values
            .serialized()
            .map_err(|e| ExecutionError::BadQuery(BadQuery::SerializeValuesError(e)))?;
        self.do_execute(prepared, &values, None, PagingState::start())
            .await
    }

    /// Executes a prepared statement, fetching a single page.
    pub async fn execute_single_page(
        &self,
        prepared: &PreparedStatement,
        values: impl RowValues,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let values = values
            .serialized()
            .map_err(|e| ExecutionError::BadQuery(BadQuery::SerializeValuesError(e)))?;
        let page_size = prepared.get_validated_page_size();
        let result = self
            .do_execute(prepared, &values, Some(page_size), paging_state)
            .await?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Executes a batch. `values` holds one value list per batch statement,
    /// in statement order.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: Vec<SerializedValues>,
    ) -> Result<QueryResult, ExecutionError> {
        if values.len() != batch.statements.len() {
            return Err(ExecutionError::BadQuery(BadQuery::ValueCountMismatch {
                got: values.len(),
                expected: batch.statements.len(),
            }));
        }

        let keyspace_guard = self.cluster.inner.keyspace_name.load_full();
        let statement_info = RoutingInfo {
            consistency: batch
                .config
                .determine_consistency(self.cluster.inner.config.query.consistency),
            serial_consistency: batch.config.serial_consistency.flatten(),
            token: None,
            keyspace: keyspace_guard.as_ref().map(|ks| ks.as_str()),
            is_confirmed_lwt: false,
        };

        let values_ref = &values;
        let run_request_result = self
            .run_request(
                statement_info,
                &batch.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let serial_consistency = batch.config.serial_consistency.flatten();
                    async move {
                        connection
                            .batch_with_consistency(
                                batch,
                                values_ref,
                                consistency,
                                serial_consistency,
                            )
                            .await
                            .and_then(|response| response.into_non_error_query_response())
                    }
                },
            )
            .await?;

        match run_request_result {
            RunRequestResult::IgnoredWriteError => Ok(QueryResult::new(
                None,
                PagingStateResponse::NoMorePages,
                None,
                Vec::new(),
            )),
            RunRequestResult::Completed(response) => {
                Ok(response.into_query_result().map_err(ExecutionError::from)?)
            }
        }
    }

    /// Prepares a statement on one host chosen by the load balancing
    /// policy, caches it in the registry, and propagates it to every other
    /// Up host in the background.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, PrepareError> {
        if self.cluster.inner.is_disposed() {
            return Err(PrepareError::ClusterClosing);
        }

        let statement: Statement = statement.into();
        let cluster_state = self.get_cluster_state();
        let keyspace_guard = self.cluster.inner.keyspace_name.load_full();
        let statement_info = RoutingInfo {
            keyspace: keyspace_guard.as_ref().map(|ks| ks.as_str()),
            ..Default::default()
        };

        let load_balancer = self.load_balancer();
        let plan = load_balancing::Plan::new(load_balancer, &statement_info, &cluster_state);

        let mut last_attempt_error: Option<RequestAttemptError> = None;
        let mut last_pool_error: Option<ConnectionPoolError> = None;
        for node in plan {
            let connection = match node.borrow_connection() {
                Ok(connection) => connection,
                Err(err) => {
                    last_pool_error = Some(err);
                    continue;
                }
            };

            match connection.prepare(&statement).await {
                Ok(prepared) => {
                    self.cluster.inner.registry.insert(&prepared);

                    // Fleet-wide propagation is best-effort and happens in
                    // the background; the caller can use the statement
                    // right away.
                    let inner = self.cluster.inner.clone();
                    let state = cluster_state.clone();
                    let prepared_clone = prepared.clone();
                    let prepared_on = node.host_id;
                    tokio::spawn(async move {
                        inner
                            .registry
                            .propagate_to_fleet(&state, &prepared_clone, prepared_on)
                            .await;
                    });

                    return Ok(prepared);
                }
                Err(err) => last_attempt_error = Some(err),
            }
        }

        match (last_attempt_error, last_pool_error) {
            (Some(err), _) => Err(PrepareError::AllAttemptsFailed(err)),
            (None, Some(pool_err)) => Err(PrepareError::ConnectionPoolError(pool_err)),
            (None, None) => Err(PrepareError::ConnectionPoolError(
                ConnectionPoolError::Initializing,
            )),
        }
    }

    /// Sets the session-wide keyspace, propagating the binding to every
    /// pooled connection before returning.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let verified = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)?;
        self.cluster.inner.runtime.use_keyspace(verified.clone()).await?;
        self.cluster.set_keyspace_name(verified);
        Ok(())
    }

    /* Internals. */

    fn load_balancer(&self) -> &dyn LoadBalancingPolicy {
        self.cluster.inner.config.load_balancing_policy.as_ref()
    }

    async fn do_query(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<QueryResult, ExecutionError> {
        let keyspace_guard = self.cluster.inner.keyspace_name.load_full();
        // An unprepared statement carries no variable metadata, so no
        // routing key can be derived; the plan is not token-aware.
        let statement_info = RoutingInfo {
            consistency: statement
                .config
                .determine_consistency(self.cluster.inner.config.query.consistency),
            serial_consistency: statement.config.serial_consistency.flatten(),
            token: None,
            keyspace: keyspace_guard.as_ref().map(|ks| ks.as_str()),
            is_confirmed_lwt: false,
        };

        let paging_state_ref = &paging_state;
        let run_request_result = self
            .run_request(
                statement_info,
                &statement.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let serial_consistency = statement.config.serial_consistency.flatten();
                    async move {
                        connection
                            .query_raw_with_consistency(
                                statement,
                                values,
                                consistency,
                                serial_consistency,
                                page_size,
                                paging_state_ref.clone(),
                            )
                            .await
                            .and_then(|response| response.into_non_error_query_response())
                    }
                },
            )
            .await?;

        self.finalize_result(run_request_result).await
    }

    async fn do_execute(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<QueryResult, ExecutionError> {
        let variable_count = prepared.get_prepared_metadata().col_count;
        if values.element_count() as usize != variable_count {
            return Err(ExecutionError::BadQuery(BadQuery::ValueCountMismatch {
                got: values.element_count() as usize,
                expected: variable_count,
            }));
        }

        let token = prepared
            .calculate_token(values)
            .map_err(|e| ExecutionError::BadQuery(BadQuery::PartitionKeyDerivation(e)))?;

        let keyspace_guard = self.cluster.inner.keyspace_name.load_full();
        let statement_info = RoutingInfo {
            consistency: prepared
                .config
                .determine_consistency(self.cluster.inner.config.query.consistency),
            serial_consistency: prepared.config.serial_consistency.flatten(),
            token,
            keyspace: prepared
                .get_keyspace_hint()
                .or(keyspace_guard.as_ref().map(|ks| ks.as_str())),
            is_confirmed_lwt: false,
        };

        let paging_state_ref = &paging_state;
        let run_request_result = self
            .run_request(
                statement_info,
                &prepared.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let serial_consistency = prepared.config.serial_consistency.flatten();
                    async move {
                        connection
                            .execute_raw_with_consistency(
                                prepared,
                                values,
                                consistency,
                                serial_consistency,
                                page_size,
                                paging_state_ref.clone(),
                            )
                            .await
                            .and_then(|response| response.into_non_error_query_response())
                    }
                },
            )
            .await?;

        self.finalize_result(run_request_result).await
    }

    async fn finalize_result(
        &self,
        run_request_result: RunRequestResult<NonErrorQueryResponse>,
    ) -> Result<QueryResult, ExecutionError> {
        match run_request_result {
            RunRequestResult::IgnoredWriteError => Ok(QueryResult::new(
                None,
                PagingStateResponse::NoMorePages,
                None,
                Vec::new(),
            )),
            RunRequestResult::Completed(response) => {
                self.handle_set_keyspace_response(&response).await?;
                self.handle_schema_change_response(&response).await;
                Ok(response.into_query_result().map_err(ExecutionError::from)?)
            }
        }
    }

    // A schema-altering response triggers a metadata refresh for the
    // affected scope, so routing sees the new strategy without waiting for
    // the pushed event.
    async fn handle_schema_change_response(&self, response: &NonErrorQueryResponse) {
        if response.as_schema_change().is_some() {
            if let Err(err) = self.refresh_metadata().await {
                warn!("Metadata refresh after a schema change failed: {}", err);
            }
        }
    }

    /// Checks whether all reachable nodes agree on the schema version;
    /// returns the agreed version if so.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, ExecutionError> {
        let cluster_state = self.get_cluster_state();
        let per_node_connections = cluster_state
            .iter_working_connections_per_node()
            .map_err(RequestAttemptError::ConnectionPoolError)?;

        let handles = per_node_connections.map(|(host_id, connections)| async move {
            (host_id, Self::read_node_schema_version(connections).await)
        });
        let version_results = futures::future::join_all(handles).await;

        let mut versions = Vec::with_capacity(version_results.len());
        for (host_id, result) in version_results {
            match result {
                Some(version) => versions.push(version),
                None => {
                    trace!(
                        "Node {} did not report a schema version; treating as disagreement",
                        host_id
                    );
                    return Ok(None);
                }
            }
        }

        let Some(first) = versions.first().copied() else {
            return Ok(None);
        };
        Ok(versions.iter().all(|v| *v == first).then_some(first))
    }

    // Tries each connection to the node in turn; the node's version is the
    // first successfully fetched one.
    async fn read_node_schema_version(connections: Vec<Arc<Connection>>) -> Option<Uuid> {
        for connection in connections {
            match connection.fetch_schema_version().await {
                Ok(version) => return Some(version),
                Err(err) => {
                    trace!("Fetching schema version failed: {}", err);
                }
            }
        }
        None
    }

    // A USE statement executed as an ordinary request still rebinds the
    // whole session, keeping pools consistent with what the user asked for.
    async fn handle_set_keyspace_response(
        &self,
        response: &NonErrorQueryResponse,
    ) -> Result<(), ExecutionError> {
        if let Some(set_keyspace) = response.as_set_keyspace() {
            trace!(
                "Detected USE KEYSPACE request; setting session keyspace to {}",
                set_keyspace.keyspace_name
            );
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }
        Ok(())
    }

    /// Routes and executes one request: derives the plan from the load
    /// balancer at the current metadata revision, walks it with the retry
    /// policy, and runs speculative siblings for idempotent statements.
    async fn run_request<'a, QueryFut>(
        &'a self,
        statement_info: RoutingInfo<'a>,
        statement_config: &'a StatementConfig,
        run_request_once: impl Fn(Arc<Connection>, Consistency) -> QueryFut,
    ) -> Result<RunRequestResult<NonErrorQueryResponse>, ExecutionError>
    where
        QueryFut: Future<Output = Result<NonErrorQueryResponse, RequestAttemptError>>,
    {
        if self.cluster.inner.is_disposed() {
            return Err(ExecutionError::ClusterClosing);
        }

        let cluster_state = self.cluster.inner.runtime.get_state();
        let load_balancer = self.load_balancer();
        let retry_policy = self.cluster.inner.config.retry_policy.as_ref();
        let speculative_policy = self
            .cluster
            .inner
            .config
            .speculative_execution_policy
            .as_ref();
        let attempt_timeout = statement_config
            .request_timeout
            .unwrap_or(self.cluster.inner.config.socket.read_timeout);

        let outcome = match speculative_policy {
            // Non-idempotent statements must never race two in-flight
            // attempts, so the speculative machinery is bypassed entirely.
            Some(speculative) if statement_config.is_idempotent => {
                let request_plan =
                    load_balancing::Plan::new(load_balancer, &statement_info, &cluster_state);
                let shared_request_plan = SharedPlan {
                    iter: std::sync::Mutex::new(request_plan),
                };

                let request_runner_generator = |_is_speculative: bool| {
                    self.run_request_speculative_fiber(
                        &shared_request_plan,
                        &run_request_once,
                        ExecuteRequestContext {
                            is_idempotent: statement_config.is_idempotent,
                            consistency_set_on_statement: statement_config.consistency,
                            retry_session: retry_policy.new_session(),
                            load_balancing_policy: load_balancer,
                            query_info: &statement_info,
                            attempt_timeout,
                        },
                    )
                };

                speculative_execution::execute(speculative.as_ref(), request_runner_generator)
                    .await
            }
            _ => {
                let request_plan =
                    load_balancing::Plan::new(load_balancer, &statement_info, &cluster_state);
                self.run_request_speculative_fiber(
                    request_plan,
                    &run_request_once,
                    ExecuteRequestContext {
                        is_idempotent: statement_config.is_idempotent,
                        consistency_set_on_statement: statement_config.consistency,
                        retry_session: retry_policy.new_session(),
                        load_balancing_policy: load_balancer,
                        query_info: &statement_info,
                        attempt_timeout,
                    },
                )
                .await
            }
        };

        if self.cluster.inner.is_disposed() {
            return Err(ExecutionError::ClusterClosing);
        }

        match outcome {
            AttemptOutcome::Completed(result) => Ok(result),
            AttemptOutcome::Terminal(_, RequestAttemptError::ConnectionPoolError(
                ConnectionPoolError::ClusterClosing,
            )) => Err(ExecutionError::ClusterClosing),
            AttemptOutcome::Terminal(_, error) => Err(ExecutionError::LastAttemptError(error)),
            AttemptOutcome::Exhausted(errors) => {
                // Bound the error map to the last error per host.
                let mut per_host: Vec<(SocketAddr, RequestAttemptError)> = Vec::new();
                for (addr, error) in errors {
                    if let Some(entry) = per_host.iter_mut().find(|(a, _)| *a == addr) {
                        entry.1 = error;
                    } else {
                        per_host.push((addr, error));
                    }
                }
                Err(ExecutionError::NoHostAvailable(NoHostAvailableError {
                    errors: per_host,
                }))
            }
        }
    }

    /// Walks the plan: borrow a connection, fire the attempt under its
    /// deadline, and let the retry policy decide what a failure means.
    /// Returns `Exhausted` with the per-host errors once the plan is dry.
    async fn run_request_speculative_fiber<'a, QueryFut>(
        &'a self,
        request_plan: impl Iterator<Item = NodeRef<'a>>,
        run_request_once: &impl Fn(Arc<Connection>, Consistency) -> QueryFut,
        mut context: ExecuteRequestContext<'a>,
    ) -> AttemptOutcome<RunRequestResult<NonErrorQueryResponse>>
    where
        QueryFut: Future<Output = Result<NonErrorQueryResponse, RequestAttemptError>>,
    {
        let mut collected_errors: Vec<(SocketAddr, RequestAttemptError)> = Vec::new();
        let mut current_consistency: Consistency = context
            .consistency_set_on_statement
            .unwrap_or(self.cluster.inner.config.query.consistency);

        'nodes_in_plan: for node in request_plan {
            let span = trace_span!("Executing request", node = %node.address);
            'same_node_retries: loop {
                trace!(parent: &span, "Execution started");
                let connection = match node.borrow_connection() {
                    Ok(connection) => connection,
                    Err(ConnectionPoolError::ClusterClosing) => {
                        return AttemptOutcome::Terminal(
                            node.address.into_inner(),
                            RequestAttemptError::ConnectionPoolError(
                                ConnectionPoolError::ClusterClosing,
                            ),
                        );
                    }
                    Err(e) => {
                        // Nothing was sent; move on to the next host.
                        trace!(parent: &span, error = %e, "Borrowing a connection failed");
                        collected_errors.push((
                            node.address.into_inner(),
                            RequestAttemptError::ConnectionPoolError(e),
                        ));
                        continue 'nodes_in_plan;
                    }
                };

                let connect_address = connection.get_connect_address();
                let request_start = Instant::now();
                trace!(
                    parent: &span,
                    connection = %connect_address,
                    "Sending"
                );

                // The per-attempt deadline: an attempt exceeding it is
                // dropped, which orphans its stream id.
                let request_result: Result<NonErrorQueryResponse, RequestAttemptError> =
                    match tokio::time::timeout(
                        context.attempt_timeout,
                        run_request_once(connection, current_consistency)
                            .instrument(span.clone()),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_elapsed) => Err(RequestAttemptError::AttemptTimeout(
                            context.attempt_timeout,
                        )),
                    };

                let elapsed = request_start.elapsed();
                let request_error: RequestAttemptError = match request_result {
                    Ok(response) => {
                        trace!(parent: &span, "Request succeeded");
                        context.load_balancing_policy.on_request_success(
                            context.query_info,
                            elapsed,
                            node,
                        );
                        return AttemptOutcome::Completed(RunRequestResult::Completed(response));
                    }
                    Err(error) => {
                        trace!(parent: &span, last_error = %error, "Request failed");
                        context.load_balancing_policy.on_request_failure(
                            context.query_info,
                            elapsed,
                            node,
                            &error,
                        );
                        error
                    }
                };

                let request_info = RequestInfo {
                    error: &request_error,
                    is_idempotent: context.is_idempotent,
                    consistency: context
                        .consistency_set_on_statement
                        .unwrap_or(self.cluster.inner.config.query.consistency),
                };
                let retry_decision = context.retry_session.decide_should_retry(request_info);
                trace!(parent: &span, retry_decision = ?retry_decision);

                collected_errors.push((connect_address, request_error));

                match retry_decision {
                    RetryDecision::RetrySameTarget(new_cl) => {
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'same_node_retries;
                    }
                    RetryDecision::RetryNextTarget(new_cl) => {
                        current_consistency = new_cl.unwrap_or(current_consistency);
                        continue 'nodes_in_plan;
                    }
                    RetryDecision::DontRetry => {
                        let (addr, error) = collected_errors
                            .pop()
                            .expect("the failed attempt was just recorded");
                        return AttemptOutcome::Terminal(addr, error);
                    }
                    RetryDecision::IgnoreWriteError => {
                        return AttemptOutcome::Completed(RunRequestResult::IgnoredWriteError);
                    }
                }
            }
        }

        if collected_errors.is_empty() {
            warn!("Load balancing policy returned an empty plan");
        }
        AttemptOutcome::Exhausted(collected_errors)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct ExecuteRequestContext<'a> {
    is_idempotent: bool,
    consistency_set_on_statement: Option<Consistency>,
    retry_session: Box<dyn RetrySession>,
    load_balancing_policy: &'a dyn LoadBalancingPolicy,
    query_info: &'a RoutingInfo<'a>,
    attempt_timeout: Duration,
}

// Shares one query plan between the initial fiber and its speculative
// siblings: whoever polls next gets the next host, so no host is attempted
// twice concurrently.
struct SharedPlan<'a, I>
where
    I: Iterator<Item = NodeRef<'a>>,
{
    iter: std::sync::Mutex<I>,
}

impl<'a, I> Iterator for &SharedPlan<'a, I>
where
    I: Iterator<Item = NodeRef<'a>>,
{
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.lock().unwrap().next()
    }
}
