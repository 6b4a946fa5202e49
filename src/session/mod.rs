// Module for session routing state
pub mod handle;
pub mod replica_pool;
pub mod staleness;
pub mod router;
pub mod sqlite_driver;

pub use handle::{ActiveHandle, HandleSlot};
pub use replica_pool::{ConnectMode, Connector, Credentials, ReplicaConnection, ReplicaPool};
pub use staleness::{Clock, ManualClock, StalenessTracker, SystemClock, WriteLedger, WriteMark};
pub use router::{PinnedCursor, QueryOrigin, QueryRoute, ReadSplitter, RouteReason, TransactionEnd};
pub use sqlite_driver::{DbResponse, SqliteConnector, SqliteCursor, SqliteDriver, SqliteHandle, SqliteOptions};
