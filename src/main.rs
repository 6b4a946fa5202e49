use std::io::{self, BufRead, Write};
use anyhow::Result;
use tracing::{error, info};

use sqlsplit::config::Config;
use sqlsplit::query::QueryType;
use sqlsplit::session::{Credentials, DbResponse, SqliteDriver};

fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(io::stderr)
        .init();

    info!("sqlsplit v{}", env!("CARGO_PKG_VERSION"));

    let replica_config = config.replica_config()?;
    let mut driver = SqliteDriver::connect(
        &config.primary,
        Credentials::new(config.user.clone()),
        replica_config,
        config.sqlite_options(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to connect session: {}", e))?;

    match driver.splitter().replica_address() {
        Some(replica) => info!("Reads go to replica {}", replica),
        None => info!("No replica available, running primary only"),
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    // Each line is either a transaction keyword or "<type> <sql>"
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with("--") {
            continue;
        }

        let outcome = match line.to_ascii_lowercase().as_str() {
            "begin" => driver.begin().map(|_| None),
            "commit" => driver.commit().map(|_| None),
            "rollback" => driver.rollback().map(|_| None),
            _ => {
                let (tag, sql) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
                match QueryType::from_tag(tag) {
                    Some(query_type) => driver.execute(sql.trim(), query_type).map(Some),
                    None => {
                        error!("Unknown query type {:?}; expected select, insert, update, ddl or other", tag);
                        continue;
                    }
                }
            }
        };

        match outcome {
            Ok(Some(response)) => print_response(&mut stdout, &response)?,
            Ok(None) => writeln!(stdout, "OK")?,
            Err(e) => error!("{}", e),
        }
    }

    writeln!(
        stdout,
        "replica reads: {}, reads before first write: {}",
        driver.replica_read_count(),
        driver.reads_before_write()
    )?;
    driver.close();

    Ok(())
}

fn print_response(out: &mut impl Write, response: &DbResponse) -> io::Result<()> {
    if response.columns.is_empty() {
        return writeln!(out, "{} row(s) affected", response.rows_affected);
    }

    writeln!(out, "{}", response.columns.join(" | "))?;
    for row in &response.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|value| match value {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => "NULL".to_string(),
            })
            .collect();
        writeln!(out, "{}", cells.join(" | "))?;
    }
    writeln!(out, "({} row(s))", response.rows.len())
}
