//! sluice-pool — backend connection pooling.
//!
//! Backend connections are pooled per target (one database alias = one
//! backend address plus one credential context) and leased to client
//! sessions through a [`Lease`] guard.
//!
//! # Architecture
//!
//! ```text
//! Session calls pool.acquire(deadline)
//!   → idle connection available      → lease it
//!   → below max size                 → reserve slot, connect (retry/backoff), lease
//!   → at capacity, queue has room    → park in FIFO wait queue until granted or deadline
//!   → at capacity, queue full        → Overloaded
//!
//! Session calls lease.release(outcome)
//!   → Broken / over limit / too old  → destroy, schedule replacement if needed
//!   → Reusable                       → oldest live waiter, else idle
//! ```
//!
//! Each pool has its own mutex. No `.await` happens while it is held;
//! backend connects run outside it on a reserved slot.

pub mod admission;
pub mod budget;
pub mod connection;
pub mod connector;
pub mod error;
pub mod pool;
pub mod registry;

pub use admission::Admission;
pub use budget::{Budgets, ConnectionBudget};
pub use connection::{BackendConnection, ConnectionState};
pub use connector::{BackendConnector, BackendStream, ConnectFuture, connect_with_retry};
pub use error::{ConnectError, PoolError, PoolResult};
pub use pool::{Lease, Pool, PoolSettings, ReleaseOutcome};
pub use registry::{ApplyReport, PoolRegistry};
