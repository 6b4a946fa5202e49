use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tracing::trace;

/// Source of "now" for the write ledger
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Ledger entry for a written table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMark {
    /// Written under strict mode; never readable from the replica again
    Dirty,
    /// Last write time under a lag tolerance
    At(Instant),
}

/// Per-session record of which tables this session has written
#[derive(Debug, Default)]
pub struct WriteLedger {
    entries: HashMap<String, WriteMark>,
}

impl WriteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, table: &str, mark: WriteMark) {
        match self.entries.get_mut(table) {
            Some(existing) => *existing = mark,
            None => {
                self.entries.insert(table.to_string(), mark);
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<WriteMark> {
        self.entries.get(table).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides whether the replica copy of a set of tables is fresh enough to read.
pub struct StalenessTracker {
    ledger: WriteLedger,
    lag_tolerance: Duration,
    excluded: HashSet<String>,
    temp_tables: HashSet<String>,
    clock: Arc<dyn Clock>,
}

impl StalenessTracker {
    pub fn new(lag_tolerance: Duration, excluded: HashSet<String>) -> Self {
        Self::with_clock(lag_tolerance, excluded, Arc::new(SystemClock))
    }

    pub fn with_clock(
        lag_tolerance: Duration,
        excluded: HashSet<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: WriteLedger::new(),
            lag_tolerance,
            excluded,
            temp_tables: HashSet::new(),
            clock,
        }
    }

    /// Zero means strict: a written table never goes back to the replica
    pub fn lag_tolerance(&self) -> Duration {
        self.lag_tolerance
    }

    pub fn ledger(&self) -> &WriteLedger {
        &self.ledger
    }

    pub fn record_write<S: AsRef<str>>(&mut self, tables: &[S]) {
        if tables.is_empty() {
            return;
        }

        let mark = if self.lag_tolerance.is_zero() {
            WriteMark::Dirty
        } else {
            WriteMark::At(self.clock.now())
        };

        for table in tables {
            trace!("Recording write to {} as {:?}", table.as_ref(), mark);
            self.ledger.mark(table.as_ref(), mark);
        }
    }

    pub fn is_safe_for_replica<S: AsRef<str>>(&self, tables: &[S]) -> bool {
        // Only read the clock when a timestamped entry needs it
        let mut now = None;

        for table in tables {
            let table = table.as_ref();

            if self.excluded.contains(table) || self.temp_tables.contains(table) {
                return false;
            }

            match self.ledger.get(table) {
                None => {}
                Some(WriteMark::Dirty) => return false,
                Some(WriteMark::At(written)) => {
                    let now = *now.get_or_insert_with(|| self.clock.now());
                    if now.saturating_duration_since(written) <= self.lag_tolerance {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Temp tables live on the connection that created them, which is always primary
    pub fn register_temp_table(&mut self, table: &str) {
        self.temp_tables.insert(table.to_string());
    }

    pub fn unregister_temp_table(&mut self, table: &str) {
        self.temp_tables.remove(table);
    }

    pub fn is_temp_table(&self, table: &str) -> bool {
        self.temp_tables.contains(table)
    }
}
