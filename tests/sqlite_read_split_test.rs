use std::sync::Arc;
use std::time::Duration;
use rand::SeedableRng;
use rand::rngs::StdRng;
use sqlsplit::config::ReplicaConfig;
use sqlsplit::query::QueryType;
use sqlsplit::session::{
    Credentials, HandleSlot, ManualClock, QueryRoute, ReadSplitter, SqliteConnector, SqliteDriver,
    SqliteOptions,
};
use sqlsplit::SqlSplitError;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    primary: String,
    replica: String,
}

fn options() -> SqliteOptions {
    SqliteOptions {
        journal_mode: "DELETE".to_string(),
        ..Default::default()
    }
}

/// Primary with two seeded tables and a replica snapshot taken right after seeding
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("primary.db").to_str().unwrap().to_string();
    let replica = dir.path().join("replica.db").to_str().unwrap().to_string();

    let conn = rusqlite::Connection::open(&primary).unwrap();
    conn.execute_batch(
        "CREATE TABLE app_table_a (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE app_table_b (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO app_table_a (name) VALUES ('a1'), ('a2');
         INSERT INTO app_table_b (name) VALUES ('b1'), ('b2'), ('b3'), ('b4'), ('b5');",
    )
    .unwrap();
    conn.execute("VACUUM INTO ?1", [&replica]).unwrap();

    Fixture {
        _dir: dir,
        primary,
        replica,
    }
}

fn connect(fx: &Fixture, config: ReplicaConfig) -> SqliteDriver {
    SqliteDriver::connect(&fx.primary, Credentials::new("app"), config, options()).unwrap()
}

fn config(fx: &Fixture) -> ReplicaConfig {
    ReplicaConfig::new(vec![fx.replica.clone()]).with_table_prefix("app_")
}

fn count(driver: &mut SqliteDriver, table: &str) -> i64 {
    let response = driver
        .execute(&format!("SELECT COUNT(*) FROM app_{table}"), QueryType::Select)
        .unwrap();
    response.text(0, 0).unwrap().parse().unwrap()
}

#[test]
fn test_strict_mode_scenario() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));
    assert_eq!(driver.splitter().replica_address(), Some(fx.replica.as_str()));

    assert_eq!(count(&mut driver, "table_a"), 2);
    assert_eq!(driver.replica_read_count(), 1);

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 2);

    driver
        .execute("INSERT INTO app_table_a (name) VALUES ('a3')", QueryType::Insert)
        .unwrap();

    // the replica snapshot still has 2 rows; reading our own write needs the primary
    assert_eq!(count(&mut driver, "table_a"), 3);
    assert_eq!(driver.replica_read_count(), 2);

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 3);

    // strict mode never lets table_a back onto the replica
    for _ in 0..3 {
        assert_eq!(count(&mut driver, "table_a"), 3);
    }
    assert_eq!(driver.replica_read_count(), 3);
}

#[test]
fn test_resting_handle_is_primary() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.execute("SELECT * FROM app_table_b", QueryType::Select).unwrap();
    let resting = driver.db_handle().unwrap();
    assert!(!resting.is_read_only());
    assert_eq!(resting.address(), fx.primary);
}

#[test]
fn test_lag_tolerance_with_real_connections() {
    let fx = fixture();
    let clock = ManualClock::new();
    let mut rng = StdRng::seed_from_u64(5);
    let splitter = ReadSplitter::connect_with(
        SqliteConnector::new(options()),
        &fx.primary,
        Credentials::new("app"),
        config(&fx).with_lag_tolerance(Duration::from_secs(10)),
        &mut rng,
        Arc::new(clock.clone()),
    )
    .unwrap();
    let mut driver = SqliteDriver::from_splitter(splitter);

    driver
        .execute("DELETE FROM app_table_b WHERE id = 1", QueryType::Update)
        .unwrap();
    assert_eq!(count(&mut driver, "table_b"), 4);
    assert_eq!(driver.replica_read_count(), 0);

    clock.advance(Duration::from_secs(11));
    // past the window the (lagging) replica answers
    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 1);
}

#[test]
fn test_transaction_scenario() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.begin().unwrap();
    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 0);
    driver.commit().unwrap();

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 1);
}

#[test]
fn test_nested_transactions_use_savepoints() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.begin().unwrap();
    driver
        .execute("INSERT INTO app_table_a (name) VALUES ('outer')", QueryType::Insert)
        .unwrap();

    driver.begin().unwrap();
    driver
        .execute("INSERT INTO app_table_a (name) VALUES ('inner')", QueryType::Insert)
        .unwrap();
    driver.rollback().unwrap();

    assert!(driver.splitter().in_transaction());
    driver.commit().unwrap();

    assert_eq!(count(&mut driver, "table_a"), 3);
    assert_eq!(driver.replica_read_count(), 0);
    assert!(matches!(driver.commit(), Err(SqlSplitError::NoActiveTransaction)));
}

#[test]
fn test_unreachable_replicas_run_primary_only() {
    let fx = fixture();
    let missing: Vec<String> = (1..=3)
        .map(|i| format!("{}.missing{i}", fx.replica))
        .collect();
    let mut driver = connect(&fx, ReplicaConfig::new(missing).with_table_prefix("app_"));

    assert!(!driver.splitter().has_replica());
    assert_eq!(count(&mut driver, "table_a"), 2);
    driver
        .execute("INSERT INTO app_table_a (name) VALUES ('a3')", QueryType::Insert)
        .unwrap();
    assert_eq!(count(&mut driver, "table_a"), 3);
    assert_eq!(driver.replica_read_count(), 0);
}

#[test]
fn test_primary_failure_is_fatal() {
    let fx = fixture();
    let result = SqliteDriver::connect(
        "file:/nonexistent-dir/primary.db?mode=rw",
        Credentials::new("app"),
        config(&fx),
        options(),
    );
    let err = result.err().expect("primary cannot be opened");
    assert!(matches!(err, SqlSplitError::Connection { .. }));
}

#[test]
fn test_temp_tables_stay_on_primary() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver
        .execute("CREATE TEMP TABLE app_scratch (id INTEGER)", QueryType::StructuralChange)
        .unwrap();
    assert!(driver.splitter().tracker().is_temp_table("scratch"));

    // the replica connection cannot see this table at all
    let response = driver
        .execute("SELECT COUNT(*) FROM app_scratch", QueryType::Select)
        .unwrap();
    assert_eq!(response.text(0, 0), Some("0"));
    assert_eq!(driver.replica_read_count(), 0);
}

#[test]
fn test_excluded_tables_never_hit_replica() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx).with_excluded_tables(["table_b"]));

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 0);

    assert_eq!(count(&mut driver, "table_a"), 2);
    assert_eq!(driver.replica_read_count(), 1);
}

#[test]
fn test_cursor_stays_on_replica() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    let mut cursor = driver
        .open_cursor("SELECT name FROM app_table_b ORDER BY id;")
        .unwrap();
    assert_eq!(cursor.route(), QueryRoute::Replica);

    // a write in between does not move the open cursor
    driver
        .execute("DELETE FROM app_table_b", QueryType::Update)
        .unwrap();

    let mut names = Vec::new();
    while !cursor.is_exhausted() {
        let batch = cursor.fetch(2).unwrap();
        assert!(cursor.handle().is_read_only());
        for i in 0..batch.rows.len() {
            names.push(batch.text(i, 0).unwrap().to_string());
        }
    }
    assert_eq!(names, vec!["b1", "b2", "b3", "b4", "b5"]);

    driver.close_cursor(cursor).unwrap();
    assert_eq!(driver.splitter().open_cursor_count(), 0);

    // new reads of the emptied table come from the primary
    assert_eq!(count(&mut driver, "table_b"), 0);
}

#[test]
fn test_close_is_idempotent() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.close();
    driver.close();
    assert!(matches!(
        driver.execute("SELECT 1", QueryType::Select),
        Err(SqlSplitError::SessionClosed)
    ));
}

#[test]
fn test_failed_commit_keeps_transaction_on_primary() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.execute("PRAGMA foreign_keys = ON", QueryType::Other).unwrap();
    driver
        .execute("CREATE TABLE app_parent (id INTEGER PRIMARY KEY)", QueryType::StructuralChange)
        .unwrap();
    driver
        .execute(
            "CREATE TABLE app_child (id INTEGER PRIMARY KEY, \
             pid INTEGER REFERENCES app_parent(id) DEFERRABLE INITIALLY DEFERRED)",
            QueryType::StructuralChange,
        )
        .unwrap();

    driver.begin().unwrap();
    driver
        .execute("INSERT INTO app_child (pid) VALUES (99)", QueryType::Insert)
        .unwrap();

    // the deferred foreign key fails at COMMIT and SQLite keeps the transaction
    assert!(matches!(driver.commit(), Err(SqlSplitError::Sqlite(_))));
    assert!(driver.splitter().in_transaction());
    let autocommit = driver
        .splitter_mut()
        .primary_handle()
        .unwrap()
        .with_connection(|c| Ok(c.is_autocommit()))
        .unwrap();
    assert!(!autocommit);

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 0);

    driver.rollback().unwrap();
    assert!(!driver.splitter().in_transaction());
    assert_eq!(count(&mut driver, "child"), 0);

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 1);
}

#[test]
fn test_commit_of_vanished_transaction_releases_primary() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.begin().unwrap();
    driver.execute("ROLLBACK", QueryType::Other).unwrap();

    assert!(matches!(driver.commit(), Err(SqlSplitError::Sqlite(_))));
    assert!(!driver.splitter().in_transaction());

    assert_eq!(count(&mut driver, "table_b"), 5);
    assert_eq!(driver.replica_read_count(), 1);
}

#[test]
fn test_failed_begin_opens_nothing() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    // a transaction opened behind the driver's back makes BEGIN fail
    driver.execute("BEGIN", QueryType::Other).unwrap();
    assert!(matches!(driver.begin(), Err(SqlSplitError::Sqlite(_))));
    assert_eq!(driver.splitter().transaction_depth(), 0);
    assert!(matches!(driver.commit(), Err(SqlSplitError::NoActiveTransaction)));

    driver.execute("ROLLBACK", QueryType::Other).unwrap();
    driver.begin().unwrap();
    assert_eq!(driver.splitter().transaction_depth(), 1);
    driver.commit().unwrap();
}

#[test]
fn test_failed_release_keeps_savepoint_depth() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    driver.begin().unwrap();
    driver.begin().unwrap();
    // drop the inner savepoint so RELEASE has nothing to release
    driver
        .execute("RELEASE SAVEPOINT sqlsplit_sp2", QueryType::Other)
        .unwrap();

    assert!(matches!(driver.commit(), Err(SqlSplitError::Sqlite(_))));
    assert_eq!(driver.splitter().transaction_depth(), 2);

    driver.execute("SAVEPOINT sqlsplit_sp2", QueryType::Other).unwrap();
    driver.commit().unwrap();
    driver.commit().unwrap();
    assert!(!driver.splitter().in_transaction());
}

#[test]
fn test_cursor_fetch_after_close_fails() {
    let fx = fixture();
    let mut driver = connect(&fx, config(&fx));

    let mut cursor = driver.open_cursor("SELECT name FROM app_table_b").unwrap();
    assert_eq!(cursor.route(), QueryRoute::Replica);
    assert_eq!(cursor.fetch(2).unwrap().rows.len(), 2);

    driver.close();
    assert!(cursor.handle().is_released());
    assert!(matches!(cursor.fetch(2), Err(SqlSplitError::SessionClosed)));
    assert!(driver.close_cursor(cursor).is_ok());
}
