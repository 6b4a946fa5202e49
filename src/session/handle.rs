/// The handle a driver dereferences when it runs the next statement.
///
/// Switching is plain reassignment: no I/O, and setting the same handle twice
/// is a no-op.
#[derive(Debug, Clone)]
pub struct ActiveHandle<H> {
    current: Option<H>,
}

impl<H: Clone> ActiveHandle<H> {
    pub fn empty() -> Self {
        Self { current: None }
    }

    pub fn get(&self) -> Option<H> {
        self.current.clone()
    }

    pub fn set(&mut self, handle: H) {
        self.current = Some(handle);
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

impl<H: Clone> Default for ActiveHandle<H> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Capability a dialect driver exposes so the read/write splitter can steer it.
///
/// Drivers hold a [`ReadSplitter`](super::ReadSplitter) and forward these calls to
/// it rather than inheriting behaviour from a shared base type.
pub trait HandleSlot {
    type Handle: Clone;

    /// Handle currently used for queries
    fn db_handle(&self) -> Option<Self::Handle>;

    /// Handle to use for subsequent queries
    fn set_db_handle(&mut self, handle: Self::Handle);

    /// Table names referenced by `sql`, prefix stripped
    fn table_names(&self, sql: &str) -> Vec<String>;
}
