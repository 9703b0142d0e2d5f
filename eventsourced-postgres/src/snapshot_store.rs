//! A [SnapshotStore] implementation based on [PostgreSQL](https://www.postgresql.org/).

use crate::{Cnn, CnnPool, Error};
use bb8_postgres::{bb8::Pool, PostgresConnectionManager};
use eventsourced::{binarize::Binarize, LocalSnapshotStore, SeqNo, Snapshot};
use std::{fmt::Display, marker::PhantomData};
use tokio_postgres::NoTls;
use tracing::{debug, instrument};

/// A [SnapshotStore](eventsourced::SnapshotStore) implementation based on
/// [PostgreSQL](https://www.postgresql.org/).
#[derive(Clone)]
pub struct PostgresSnapshotStore<Id, State, Bin> {
    cnn_pool: CnnPool,
    binarize: Bin,
    _id_state: PhantomData<(Id, State)>,
}

impl<Id, State, Bin> PostgresSnapshotStore<Id, State, Bin> {
    pub async fn new(config: Config, binarize: Bin) -> Result<Self, Error> {
        debug!(?config, "creating PostgresSnapshotStore");

        let tls = NoTls;
        let cnn_manager = PostgresConnectionManager::new_from_stringlike(config.cnn_config(), tls)
            .map_err(Error::ConnectionManager)?;
        let cnn_pool = Pool::builder()
            .build(cnn_manager)
            .await
            .map_err(Error::ConnectionPool)?;

        if config.setup {
            cnn_pool
                .get()
                .await
                .map_err(Error::GetConnection)?
                .batch_execute(include_str!("create_snapshot_store.sql"))
                .await
                .map_err(Error::ExecuteQuery)?;
        }

        Ok(Self {
            cnn_pool,
            binarize,
            _id_state: PhantomData,
        })
    }

    async fn cnn(&self) -> Result<Cnn<'_>, Error> {
        self.cnn_pool.get().await.map_err(Error::GetConnection)
    }
}

impl<Id, State, Bin> std::fmt::Debug for PostgresSnapshotStore<Id, State, Bin> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSnapshotStore").finish()
    }
}

impl<Id, State, Bin> LocalSnapshotStore for PostgresSnapshotStore<Id, State, Bin>
where
    Id: Display + Clone + Send + Sync + 'static,
    State: std::fmt::Debug + Send + Sync + 'static,
    Bin: Binarize<State, State> + Clone + Send + Sync + 'static,
{
    type Id = Id;
    type State = State;
    type Error = Error;

    #[instrument(skip(self, state))]
    async fn save(&self, id: &Self::Id, seq_no: SeqNo, state: &Self::State) -> Result<(), Self::Error> {
        let id = id.to_string();
        let seq_no = seq_no.as_u64() as i64;
        let bytes = self
            .binarize
            .state_to_bytes(state)
            .map_err(|error| Error::ToBytes(Box::new(error)))?;

        self.cnn()
            .await?
            .execute(
                "INSERT INTO snapshots (persistence_id, seq_no, state) VALUES ($1, $2, $3) \
                 ON CONFLICT (persistence_id) DO UPDATE SET seq_no = $2, state = $3",
                &[&id, &seq_no, &bytes.as_ref()],
            )
            .await
            .map_err(Error::ExecuteQuery)?;
        debug!(%id, %seq_no, "saved snapshot");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, id: &Self::Id) -> Result<Option<Snapshot<Self::State>>, Self::Error> {
        let id_str = id.to_string();
        let row = self
            .cnn()
            .await?
            .query_opt(
                "SELECT seq_no, state FROM snapshots WHERE persistence_id = $1",
                &[&id_str],
            )
            .await
            .map_err(Error::ExecuteQuery)?;

        let Some(row) = row else {
            debug!(%id_str, "no snapshot to load");
            return Ok(None);
        };

        let seq_no = SeqNo::new(row.get::<_, i64>(0) as u64).map_err(Error::InvalidSeqNo)?;
        let bytes = row.get::<_, &[u8]>(1);
        let state = self
            .binarize
            .state_from_bytes(bytes::Bytes::copy_from_slice(bytes))
            .map_err(|error| Error::FromBytes(Box::new(error)))?;

        debug!(%id_str, %seq_no, "loaded snapshot");
        Ok(Some(Snapshot::new(seq_no, state)))
    }
}

/// Configuration for the [PostgresSnapshotStore].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub host: String,

    pub port: u16,

    pub user: String,

    pub password: String,

    pub dbname: String,

    pub sslmode: String,

    #[serde(default)]
    pub setup: bool,
}

impl Config {
    fn cnn_config(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode={}",
            self.host, self.port, self.user, self.password, self.dbname, self.sslmode
        )
    }
}

impl Default for Config {
    /// Default values suitable for local testing only.
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "".to_string(),
            dbname: "postgres".to_string(),
            sslmode: "prefer".to_string(),
            setup: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventsourced::binarize::serde_json::SerdeJsonBinarize;
    use eventsourced::SnapshotStore;
    use testcontainers::clients::Cli;
    use testcontainers_modules::postgres::Postgres;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_save_and_load() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = Cli::default();
        let container = client.run(Postgres::default().with_host_auth());
        let port = container.get_host_port_ipv4(5432);

        let config = Config {
            port,
            setup: true,
            ..Default::default()
        };
        let snapshot_store = PostgresSnapshotStore::<Uuid, u64, _>::new(
            config,
            SerdeJsonBinarize::<u64, u64>::new(),
        )
        .await?;

        let id = Uuid::now_v7();

        assert!(snapshot_store.load(&id).await?.is_none());

        snapshot_store.save(&id, SeqNo::new(42)?, &666).await?;

        let snapshot = snapshot_store.load(&id).await?.expect("snapshot present");
        assert_eq!(snapshot.seq_no, SeqNo::new(42)?);
        assert_eq!(snapshot.state, 666);

        Ok(())
    }
}
