use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};
use crate::config::ReplicaConfig;
use crate::query::{QueryType, TempTableChange};
use crate::session::handle::HandleSlot;
use crate::session::replica_pool::{ConnectMode, Connector, Credentials};
use crate::session::router::{PinnedCursor, QueryRoute, ReadSplitter, TransactionEnd};
use crate::{Result, SqlSplitError};

/// PRAGMA settings applied to every connection
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub journal_mode: String,
    pub synchronous: String,
    pub cache_size: i32,
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: -64000,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared handle to one SQLite connection.
///
/// Clones share the connection. Once the connector disconnects any clone,
/// every clone reports [`SqlSplitError::SessionClosed`].
#[derive(Clone)]
pub struct SqliteHandle {
    address: Arc<str>,
    mode: ConnectMode,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> ConnectMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == ConnectMode::ReadOnly
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, rusqlite::Error>,
    {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(SqlSplitError::SessionClosed)?;
        f(conn).map_err(SqlSplitError::Sqlite)
    }

    pub fn is_released(&self) -> bool {
        self.conn.lock().is_none()
    }
}

impl PartialEq for SqliteHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Opens SQLite files; replicas are opened read-only
#[derive(Debug, Clone, Default)]
pub struct SqliteConnector {
    options: SqliteOptions,
}

impl SqliteConnector {
    pub fn new(options: SqliteOptions) -> Self {
        Self { options }
    }

    fn open(&self, address: &str, mode: ConnectMode) -> std::result::Result<Connection, rusqlite::Error> {
        let flags = match mode {
            ConnectMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
            ConnectMode::ReadOnly => {
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                    | OpenFlags::SQLITE_OPEN_URI
            }
        };

        let conn = Connection::open_with_flags(address, flags)?;
        conn.busy_timeout(self.options.busy_timeout)?;

        match mode {
            ConnectMode::ReadWrite => {
                let pragma_sql = format!(
                    "PRAGMA journal_mode = {};
                     PRAGMA synchronous = {};
                     PRAGMA cache_size = {};
                     PRAGMA temp_store = MEMORY;",
                    self.options.journal_mode,
                    self.options.synchronous,
                    self.options.cache_size,
                );
                conn.execute_batch(&pragma_sql)?;
            }
            ConnectMode::ReadOnly => {
                conn.execute_batch(&format!(
                    "PRAGMA cache_size = {};
                     PRAGMA query_only = ON;",
                    self.options.cache_size
                ))?;
                // Opening is lazy; touch the schema so an unreadable file fails here
                conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
            }
        }

        Ok(conn)
    }
}

impl Connector for SqliteConnector {
    type Handle = SqliteHandle;

    fn connect(&self, address: &str, credentials: &Credentials, mode: ConnectMode) -> Result<SqliteHandle> {
        // SQLite has no login; credentials are accepted for interface parity
        debug!("Opening {:?} connection to {} as {}", mode, address, credentials.user);

        let conn = self
            .open(address, mode)
            .map_err(|e| SqlSplitError::connection(address, e))?;

        Ok(SqliteHandle {
            address: Arc::from(address),
            mode,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn disconnect(&self, handle: SqliteHandle) {
        let conn = handle.conn.lock().take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!("Closing {} failed: {}", handle.address, e);
            }
        }
    }
}

/// Result of a statement, values in text format
#[derive(Debug, Default)]
pub struct DbResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub rows_affected: usize,
}

impl DbResponse {
    /// Value at `row`/`column` as UTF-8 text, `None` for NULL or out of range
    pub fn text(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)?
            .get(column)?
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// SQLite driver with read/write splitting.
///
/// Every statement is routed by the embedded [`ReadSplitter`] and then run on
/// the handle it picked.
pub struct SqliteDriver {
    splitter: ReadSplitter<SqliteConnector>,
}

impl SqliteDriver {
    pub fn connect(
        primary: &str,
        credentials: Credentials,
        replica_config: ReplicaConfig,
        options: SqliteOptions,
    ) -> Result<Self> {
        let splitter = ReadSplitter::connect(
            SqliteConnector::new(options),
            primary,
            credentials,
            replica_config,
        )?;
        Ok(Self { splitter })
    }

    pub fn from_splitter(splitter: ReadSplitter<SqliteConnector>) -> Self {
        Self { splitter }
    }

    /// Route and run one statement
    pub fn execute(&mut self, sql: &str, query_type: QueryType) -> Result<DbResponse> {
        if query_type == QueryType::StructuralChange {
            self.track_temp_tables(sql);
        }

        let handle = self.splitter.before_query(sql, query_type)?;
        let result = handle.with_connection(|conn| run_statement(conn, sql));
        self.splitter.after_query();

        if let Err(e) = &result {
            // No retry here: a failed replica read is reported as is
            warn!("Statement on {} failed: {}", handle.address(), e);
        }
        result
    }

    /// Route a read whose rows are fetched in batches from the handle that
    /// opened it
    pub fn open_cursor(&mut self, sql: &str) -> Result<SqliteCursor> {
        let pinned = self.splitter.open_cursor(sql, QueryType::Select)?;
        Ok(SqliteCursor {
            pinned,
            sql: sql.trim().trim_end_matches(';').to_string(),
            offset: 0,
            exhausted: false,
        })
    }

    pub fn close_cursor(&mut self, cursor: SqliteCursor) -> Result<()> {
        self.splitter.close_cursor(cursor.pinned)
    }

    /// Open a transaction, or a savepoint when one is already open. Routing
    /// only pins the primary once SQLite accepted the statement.
    pub fn begin(&mut self) -> Result<()> {
        let primary = self.splitter.primary_handle()?;
        let depth = self.splitter.transaction_depth();
        let sql = if depth == 0 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(depth + 1))
        };

        primary.with_connection(|conn| conn.execute_batch(&sql))?;
        self.splitter.begin_transaction()?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.end(TransactionEnd::Commit)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.end(TransactionEnd::Rollback)
    }

    fn end(&mut self, end: TransactionEnd) -> Result<()> {
        let primary = self.splitter.primary_handle()?;
        let depth = self.splitter.transaction_depth();
        if depth == 0 {
            return Err(SqlSplitError::NoActiveTransaction);
        }
        let sql = match (end, depth) {
            (TransactionEnd::Commit, 1) => "COMMIT".to_string(),
            (TransactionEnd::Rollback, 1) => "ROLLBACK".to_string(),
            (TransactionEnd::Commit, d) => format!("RELEASE SAVEPOINT {}", savepoint_name(d)),
            (TransactionEnd::Rollback, d) => {
                let name = savepoint_name(d);
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };

        if let Err(e) = primary.with_connection(|conn| conn.execute_batch(&sql)) {
            // A failed COMMIT usually leaves the transaction open; only let go
            // of the primary if SQLite is back in autocommit mode
            let autocommit = primary
                .with_connection(|conn| Ok(conn.is_autocommit()))
                .unwrap_or(false);
            if autocommit {
                self.splitter.reset_transactions();
            }
            warn!("{:?} at depth {} failed: {}", end, depth, e);
            return Err(e);
        }

        self.splitter.end_transaction(end)?;
        Ok(())
    }

    pub fn replica_read_count(&self) -> u64 {
        self.splitter.replica_read_count()
    }

    pub fn reads_before_write(&self) -> u64 {
        self.splitter.reads_before_write()
    }

    pub fn splitter(&self) -> &ReadSplitter<SqliteConnector> {
        &self.splitter
    }

    pub fn splitter_mut(&mut self) -> &mut ReadSplitter<SqliteConnector> {
        &mut self.splitter
    }

    pub fn close(&mut self) {
        self.splitter.close();
    }

    fn track_temp_tables(&mut self, sql: &str) {
        match self.splitter.extractor().temp_table_change(sql) {
            Some(TempTableChange::Created(table)) => {
                debug!("Temp table {} pinned to primary", table);
                self.splitter.tracker_mut().register_temp_table(&table);
            }
            Some(TempTableChange::Dropped(table)) => {
                self.splitter.tracker_mut().unregister_temp_table(&table);
            }
            None => {}
        }
    }
}

impl HandleSlot for SqliteDriver {
    type Handle = SqliteHandle;

    fn db_handle(&self) -> Option<SqliteHandle> {
        self.splitter.db_handle()
    }

    fn set_db_handle(&mut self, handle: SqliteHandle) {
        self.splitter.set_db_handle(handle);
    }

    fn table_names(&self, sql: &str) -> Vec<String> {
        self.splitter.table_names(sql)
    }
}

/// Batched reader bound to the handle that opened it.
///
/// Each [`fetch`](Self::fetch) re-runs the query with `LIMIT`/`OFFSET`, so
/// rows committed to the source between batches can shift the window: a
/// batch may then skip or repeat rows. Callers that need a stable snapshot
/// should read the whole result with [`SqliteDriver::execute`] instead.
/// Fetching after the session closed fails with
/// [`SqlSplitError::SessionClosed`].
pub struct SqliteCursor {
    pinned: PinnedCursor<SqliteHandle>,
    sql: String,
    offset: usize,
    exhausted: bool,
}

impl SqliteCursor {
    pub fn route(&self) -> QueryRoute {
        self.pinned.route()
    }

    pub fn handle(&self) -> &SqliteHandle {
        self.pinned.handle()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next batch of at most `max_rows` rows; empty once exhausted
    pub fn fetch(&mut self, max_rows: usize) -> Result<DbResponse> {
        if self.exhausted || max_rows == 0 {
            return Ok(DbResponse::default());
        }

        let batch_sql = format!(
            "SELECT * FROM ({}) LIMIT {} OFFSET {}",
            self.sql, max_rows, self.offset
        );
        let response = self
            .pinned
            .handle()
            .with_connection(|conn| run_statement(conn, &batch_sql))?;

        self.offset += response.rows.len();
        if response.rows.len() < max_rows {
            self.exhausted = true;
        }
        Ok(response)
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("sqlsplit_sp{depth}")
}

fn run_statement(conn: &Connection, sql: &str) -> std::result::Result<DbResponse, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();

    if column_count == 0 {
        let rows_affected = stmt.execute([])?;
        return Ok(DbResponse {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
        });
    }

    let columns = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    let result_rows = stmt.query_map([], |row| {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            use rusqlite::types::ValueRef;
            match row.get_ref(i)? {
                ValueRef::Null => values.push(None),
                ValueRef::Integer(i) => values.push(Some(i.to_string().into_bytes())),
                ValueRef::Real(f) => values.push(Some(f.to_string().into_bytes())),
                ValueRef::Text(s) => values.push(Some(s.to_vec())),
                ValueRef::Blob(b) => values.push(Some(b.to_vec())),
            }
        }
        Ok(values)
    })?;

    let mut rows = Vec::new();
    for row in result_rows {
        rows.push(row?);
    }

    let rows_affected = rows.len();
    Ok(DbResponse {
        columns,
        rows,
        rows_affected,
    })
}
