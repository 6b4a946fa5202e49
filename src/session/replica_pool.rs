use std::time::Instant;
use rand::Rng;
use tracing::{debug, info, warn};
use crate::Result;

/// Login details handed through to every connect attempt
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    ReadWrite,
    ReadOnly,
}

/// Opens connections for one SQL dialect.
///
/// A failed attempt is reported as [`SqlSplitError::Connection`](crate::SqlSplitError::Connection).
/// Each attempt may block for as long as the underlying client allows.
pub trait Connector {
    type Handle: Clone;

    fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
        mode: ConnectMode,
    ) -> Result<Self::Handle>;

    /// Release a handle at session teardown. Dropping it is enough for most clients.
    fn disconnect(&self, handle: Self::Handle) {
        drop(handle);
    }
}

/// Replica handle together with the candidate that accepted the connection
#[derive(Debug, Clone)]
pub struct ReplicaConnection<H> {
    pub handle: H,
    pub address: String,
}

/// Ordered set of read-only candidates for one session
#[derive(Debug, Clone, Default)]
pub struct ReplicaPool {
    candidates: Vec<String>,
}

impl ReplicaPool {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidate indices in the order they will be tried: a uniformly random
    /// start, then the rest in configured order.
    pub fn attempt_order<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        match self.candidates.len() {
            0 => Vec::new(),
            1 => vec![0],
            len => {
                let start = rng.random_range(0..len);
                std::iter::once(start)
                    .chain((0..len).filter(|&i| i != start))
                    .collect()
            }
        }
    }

    /// Try candidates until one accepts a read-only connection.
    ///
    /// Returns `None` when every candidate failed. That is not an error: the
    /// session carries on against the primary alone.
    pub fn connect<C, R>(
        &self,
        connector: &C,
        credentials: &Credentials,
        rng: &mut R,
    ) -> Option<ReplicaConnection<C::Handle>>
    where
        C: Connector,
        R: Rng,
    {
        if self.candidates.is_empty() {
            return None;
        }

        let started = Instant::now();
        let mut last_error = None;

        for index in self.attempt_order(rng) {
            let address = &self.candidates[index];
            match connector.connect(address, credentials, ConnectMode::ReadOnly) {
                Ok(handle) => {
                    info!(
                        "Connected to replica {} ({} candidate(s), {:?})",
                        address,
                        self.candidates.len(),
                        started.elapsed()
                    );
                    return Some(ReplicaConnection {
                        handle,
                        address: address.clone(),
                    });
                }
                Err(e) => {
                    debug!("Replica candidate {} unavailable: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            warn!(
                "No replica reachable out of {} candidate(s) after {:?}, using primary only (last error: {})",
                self.candidates.len(),
                started.elapsed(),
                e
            );
        }
        None
    }
}
