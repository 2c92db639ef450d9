//! Database connectors for pgpolicy
//!
//! `PostgresConnector` is the production connector backed by a sqlx pool.
//! `InMemoryConnector` serves canned rows to tests; outside this crate it needs the
//! `testing` feature.
//! `ConnectionManager` owns whichever one is current.

mod manager;
#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;
mod traits;

pub use manager::{ConnectionLease, ConnectionManager};
#[cfg(any(test, feature = "testing"))]
pub use memory::{InMemoryConnector, InMemoryFactory};
pub use postgres::{PostgresConnector, PostgresConnectorFactory};
pub use traits::{Connector, ConnectorFactory, RowSet};
