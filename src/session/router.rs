use std::collections::HashSet;
use std::sync::Arc;
use rand::Rng;
use regex::RegexSet;
use tracing::{debug, info};
use uuid::Uuid;
use crate::config::ReplicaConfig;
use crate::query::{QueryType, TableExtractor};
use crate::session::handle::{ActiveHandle, HandleSlot};
use crate::session::replica_pool::{ConnectMode, Connector, Credentials, ReplicaConnection, ReplicaPool};
use crate::session::staleness::{Clock, StalenessTracker, SystemClock};
use crate::{Result, SqlSplitError};

/// Where a query was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRoute {
    Primary(RouteReason),
    Replica,
}

impl QueryRoute {
    pub fn is_replica(self) -> bool {
        matches!(self, QueryRoute::Replica)
    }
}

/// Why a query stayed on the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// No replica connected for this session
    NoReplica,
    /// An explicit transaction is open
    Transaction,
    /// Query issued by instrumentation on behalf of the session
    Internal,
    /// Text matched an always-primary pattern such as a lock primitive
    PrimaryPattern,
    /// A referenced table is excluded, temporary or recently written
    StaleTables,
    Write,
    Other,
}

/// Who is issuing a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrigin {
    #[default]
    Application,
    /// Logging and other instrumentation queries; never routed to a replica so
    /// they cannot recurse into routing bookkeeping
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEnd {
    Commit,
    Rollback,
}

/// Handle held by an open cursor, unaffected by the per-query reset to primary
#[derive(Debug)]
pub struct PinnedCursor<H> {
    id: u64,
    handle: H,
    route: QueryRoute,
}

impl<H> PinnedCursor<H> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn route(&self) -> QueryRoute {
        self.route
    }
}

/// Per-session read/write splitter.
///
/// Owns both connection handles and the write ledger. Every outgoing query goes
/// through [`before_query`](Self::before_query), which picks a handle and makes
/// it active, and then [`after_query`](Self::after_query), which records writes
/// and puts the primary back as the resting handle.
pub struct ReadSplitter<C: Connector> {
    session_id: Uuid,
    connector: C,
    credentials: Credentials,
    primary_address: String,
    primary: Option<C::Handle>,
    replica: Option<ReplicaConnection<C::Handle>>,
    active: ActiveHandle<C::Handle>,
    extractor: TableExtractor,
    tracker: StalenessTracker,
    primary_patterns: RegexSet,
    transaction_depth: usize,
    pending_writes: Vec<String>,
    last_route: Option<QueryRoute>,
    replica_reads: u64,
    reads_before_write: u64,
    written: bool,
    open_cursors: HashSet<u64>,
    next_cursor_id: u64,
    closed: bool,
}

impl<C: Connector> ReadSplitter<C> {
    /// Connect a session: replica first (best effort), then the primary (mandatory).
    pub fn connect(
        connector: C,
        primary_address: &str,
        credentials: Credentials,
        config: ReplicaConfig,
    ) -> Result<Self> {
        Self::connect_with(
            connector,
            primary_address,
            credentials,
            config,
            &mut rand::rng(),
            Arc::new(SystemClock),
        )
    }

    /// Like [`connect`](Self::connect), taking driver options in their raw form.
    /// Malformed options abort the connect.
    pub fn connect_with_options(
        connector: C,
        primary_address: &str,
        credentials: Credentials,
        options: serde_json::Value,
    ) -> Result<Self> {
        let config = ReplicaConfig::from_options(options)?;
        Self::connect(connector, primary_address, credentials, config)
    }

    /// Connect with an explicit random source for candidate selection and an
    /// explicit clock for the lag window.
    pub fn connect_with<R: Rng>(
        connector: C,
        primary_address: &str,
        credentials: Credentials,
        config: ReplicaConfig,
        rng: &mut R,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let extractor = TableExtractor::new(&config.table_prefix)?;
        let primary_patterns = RegexSet::new(&config.primary_patterns)
            .map_err(|e| SqlSplitError::Config(format!("invalid primary pattern: {e}")))?;
        let tracker = StalenessTracker::with_clock(
            config.lag_tolerance,
            config.excluded_tables.iter().cloned().collect(),
            clock,
        );

        let mut splitter = Self {
            session_id: Uuid::new_v4(),
            connector,
            credentials,
            primary_address: primary_address.to_string(),
            primary: None,
            replica: None,
            active: ActiveHandle::empty(),
            extractor,
            tracker,
            primary_patterns,
            transaction_depth: 0,
            pending_writes: Vec::new(),
            last_route: None,
            replica_reads: 0,
            reads_before_write: 0,
            written: false,
            open_cursors: HashSet::new(),
            next_cursor_id: 1,
            closed: false,
        };

        let pool = ReplicaPool::new(config.addresses);
        splitter.replica = pool.connect(&splitter.connector, &splitter.credentials, rng);

        if let Err(e) = splitter.ensure_primary() {
            splitter.close();
            return Err(e);
        }

        info!(
            "Session {} connected: primary={}, replica={}, lag_tolerance={:?}",
            splitter.session_id,
            splitter.primary_address,
            splitter.replica_address().unwrap_or("none"),
            splitter.tracker.lag_tolerance()
        );

        Ok(splitter)
    }

    /// Route an application query and make the chosen handle active.
    pub fn before_query(&mut self, sql: &str, query_type: QueryType) -> Result<C::Handle> {
        self.before_query_from(sql, query_type, QueryOrigin::Application)
    }

    pub fn before_query_from(
        &mut self,
        sql: &str,
        query_type: QueryType,
        origin: QueryOrigin,
    ) -> Result<C::Handle> {
        self.ensure_open()?;

        let route = self.determine_route(sql, query_type, origin);
        let replica = match route {
            QueryRoute::Replica => self.replica.as_ref().map(|r| r.handle.clone()),
            QueryRoute::Primary(_) => None,
        };
        let handle = match replica {
            Some(handle) => handle,
            None => self.ensure_primary()?,
        };

        debug!(
            "Session {} routed {} query via {:?}: {}",
            self.session_id,
            query_type,
            route,
            sql.chars().take(100).collect::<String>()
        );

        self.active.set(handle.clone());
        self.last_route = Some(route);
        Ok(handle)
    }

    /// Finish the current query: apply pending writes to the ledger and rest on
    /// the primary handle.
    pub fn after_query(&mut self) {
        if !self.pending_writes.is_empty() {
            let tables = std::mem::take(&mut self.pending_writes);
            self.tracker.record_write(&tables);
        }

        // Queries issued while connecting have no primary to rest on yet
        if let Some(primary) = &self.primary {
            self.active.set(primary.clone());
        }
        self.last_route = None;
    }

    /// Open (or nest) a transaction. Returns the primary handle the caller must
    /// issue BEGIN on.
    pub fn begin_transaction(&mut self) -> Result<C::Handle> {
        self.ensure_open()?;
        let primary = self.ensure_primary()?;
        self.transaction_depth += 1;
        self.active.set(primary.clone());
        debug!("Session {} transaction depth now {}", self.session_id, self.transaction_depth);
        Ok(primary)
    }

    /// Close the innermost transaction. Returns the primary handle the caller
    /// must issue COMMIT or ROLLBACK on; routing is released once the outermost
    /// transaction ends.
    pub fn end_transaction(&mut self, end: TransactionEnd) -> Result<C::Handle> {
        self.ensure_open()?;
        if self.transaction_depth == 0 {
            return Err(SqlSplitError::NoActiveTransaction);
        }
        let primary = self.ensure_primary()?;
        self.transaction_depth -= 1;
        self.active.set(primary.clone());
        debug!(
            "Session {} transaction {:?}, depth now {}",
            self.session_id, end, self.transaction_depth
        );
        Ok(primary)
    }

    /// The primary handle, for statements the caller issues itself such as
    /// transaction control. Does not change routing state.
    pub fn primary_handle(&mut self) -> Result<C::Handle> {
        self.ensure_open()?;
        self.ensure_primary()
    }

    /// Forget every open transaction level after the primary reported that
    /// its transaction is gone.
    pub fn reset_transactions(&mut self) {
        if self.transaction_depth > 0 {
            debug!(
                "Session {} dropped {} transaction level(s)",
                self.session_id, self.transaction_depth
            );
            self.transaction_depth = 0;
        }
    }

    /// Route a query whose handle must outlive the current query, such as a
    /// server-side cursor. The returned handle stays in use until
    /// [`close_cursor`](Self::close_cursor) while the session itself rests on
    /// the primary.
    pub fn open_cursor(&mut self, sql: &str, query_type: QueryType) -> Result<PinnedCursor<C::Handle>> {
        let handle = self.before_query(sql, query_type)?;
        let route = self.last_route.unwrap_or(QueryRoute::Primary(RouteReason::Other));
        self.after_query();

        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.open_cursors.insert(id);

        Ok(PinnedCursor { id, handle, route })
    }

    /// Release a cursor. After [`close`](Self::close) this is a no-op since
    /// teardown already released every handle.
    pub fn close_cursor(&mut self, cursor: PinnedCursor<C::Handle>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.open_cursors.remove(&cursor.id) {
            return Err(SqlSplitError::UnknownCursor(cursor.id));
        }
        Ok(())
    }

    /// Release both handles. Safe to call more than once and when no replica
    /// was ever connected.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.active.clear();
        self.open_cursors.clear();

        if let Some(replica) = self.replica.take() {
            self.connector.disconnect(replica.handle);
        }
        if let Some(primary) = self.primary.take() {
            self.connector.disconnect(primary);
        }

        info!(
            "Session {} closed ({} replica reads)",
            self.session_id, self.replica_reads
        );
    }

    /// Number of queries served by the replica so far
    pub fn replica_read_count(&self) -> u64 {
        self.replica_reads
    }

    /// Number of reads issued before this session's first write
    pub fn reads_before_write(&self) -> u64 {
        self.reads_before_write
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub fn replica_address(&self) -> Option<&str> {
        self.replica.as_ref().map(|r| r.address.as_str())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth > 0
    }

    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    /// Route chosen by the query currently between before and after
    pub fn last_route(&self) -> Option<QueryRoute> {
        self.last_route
    }

    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn extractor(&self) -> &TableExtractor {
        &self.extractor
    }

    pub fn tracker(&self) -> &StalenessTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StalenessTracker {
        &mut self.tracker
    }

    fn determine_route(&mut self, sql: &str, query_type: QueryType, origin: QueryOrigin) -> QueryRoute {
        if query_type.is_write() {
            // Writes go into the ledger whatever decided their route
            self.written = true;
            self.pending_writes = self.extractor.table_names(sql);
        } else if query_type == QueryType::Select && !self.written {
            self.reads_before_write += 1;
        }

        if self.replica.is_none() {
            return QueryRoute::Primary(RouteReason::NoReplica);
        }
        if self.transaction_depth > 0 {
            return QueryRoute::Primary(RouteReason::Transaction);
        }
        if origin == QueryOrigin::Internal {
            return QueryRoute::Primary(RouteReason::Internal);
        }
        if self.primary_patterns.is_match(sql) {
            return QueryRoute::Primary(RouteReason::PrimaryPattern);
        }

        match query_type {
            QueryType::Select => {
                let tables = self.extractor.table_names(sql);
                if self.tracker.is_safe_for_replica(&tables) {
                    self.replica_reads += 1;
                    QueryRoute::Replica
                } else {
                    QueryRoute::Primary(RouteReason::StaleTables)
                }
            }
            QueryType::Insert | QueryType::Update | QueryType::StructuralChange => {
                QueryRoute::Primary(RouteReason::Write)
            }
            QueryType::Other => QueryRoute::Primary(RouteReason::Other),
        }
    }

    fn ensure_primary(&mut self) -> Result<C::Handle> {
        if let Some(primary) = &self.primary {
            return Ok(primary.clone());
        }

        let primary = self.connector.connect(
            &self.primary_address,
            &self.credentials,
            ConnectMode::ReadWrite,
        )?;
        self.primary = Some(primary.clone());
        self.active.set(primary.clone());
        Ok(primary)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SqlSplitError::SessionClosed);
        }
        Ok(())
    }
}

impl<C: Connector> HandleSlot for ReadSplitter<C> {
    type Handle = C::Handle;

    fn db_handle(&self) -> Option<C::Handle> {
        self.active.get()
    }

    fn set_db_handle(&mut self, handle: C::Handle) {
        self.active.set(handle);
    }

    fn table_names(&self, sql: &str) -> Vec<String> {
        self.extractor.table_names(sql)
    }
}

impl<C: Connector> Drop for ReadSplitter<C> {
    fn drop(&mut self) {
        self.close();
    }
}
