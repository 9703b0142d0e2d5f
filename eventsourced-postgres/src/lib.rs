//! [EvtLog](eventsourced::EvtLog) and [SnapshotStore](eventsourced::SnapshotStore) implementations
//! based upon [PostgreSQL](https://www.postgresql.org/).

mod evt_log;
mod snapshot_store;

pub use evt_log::{Config as PostgresEvtLogConfig, PostgresEvtLog};
pub use snapshot_store::{Config as PostgresSnapshotStoreConfig, PostgresSnapshotStore};

use bb8_postgres::{
    bb8::{Pool, PooledConnection, RunError},
    PostgresConnectionManager,
};
use eventsourced::ZeroSeqNoError;
use thiserror::Error;
use tokio_postgres::NoTls;

type CnnPool = Pool<PostgresConnectionManager<NoTls>>;

type Cnn<'a> = PooledConnection<'a, PostgresConnectionManager<NoTls>>;

/// Errors from the [PostgresEvtLog] or [PostgresSnapshotStore].
#[derive(Debug, Error)]
pub enum Error {
    /// Cannot create connection manager.
    #[error("cannot create connection manager")]
    ConnectionManager(#[source] tokio_postgres::Error),

    /// Cannot create connection pool.
    #[error("cannot create connection pool")]
    ConnectionPool(#[source] tokio_postgres::Error),

    /// Cannot get connection from pool.
    #[error("cannot get connection from pool")]
    GetConnection(#[source] RunError<tokio_postgres::Error>),

    /// Cannot execute query.
    #[error("cannot execute query")]
    ExecuteQuery(#[source] tokio_postgres::Error),

    /// Cannot convert an event to bytes.
    #[error("cannot convert an event to bytes")]
    ToBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Cannot convert bytes to an event.
    #[error("cannot convert bytes to an event")]
    FromBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Invalid sequence number read back from a row.
    #[error("invalid sequence number")]
    InvalidSeqNo(#[source] ZeroSeqNoError),
}
