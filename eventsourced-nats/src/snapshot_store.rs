//! A [SnapshotStore] implementation based on [NATS](https://nats.io/) JetStream key-value.

use crate::Error;
use async_nats::{
    jetstream::{self, kv::Store, Context as Jetstream},
    ConnectOptions,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use eventsourced::{binarize::Binarize, LocalSnapshotStore, SeqNo, Snapshot};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, marker::PhantomData, path::PathBuf};
use tracing::debug;

/// A [SnapshotStore](eventsourced::SnapshotStore) implementation based on
/// [NATS](https://nats.io/) JetStream key-value buckets.
///
/// Entries are stored as `seq_no (8 bytes, big-endian) ++ state bytes` under key `id`, since a KV
/// bucket's own revision number is store-assigned and does not necessarily track this crate's
/// `SeqNo` domain.
#[derive(Clone)]
pub struct NatsSnapshotStore<Id, State, Bin> {
    jetstream: Jetstream,
    bucket: String,
    binarize: Bin,
    _id_state: PhantomData<(Id, State)>,
}

impl<Id, State, Bin> NatsSnapshotStore<Id, State, Bin> {
    pub async fn new(config: Config, binarize: Bin) -> Result<Self, Error> {
        debug!(?config, "creating NatsSnapshotStore");

        let mut options = ConnectOptions::new();
        if let Some(credentials) = config.credentials {
            options = options.credentials_file(&credentials).await.map_err(|error| {
                Error::Nats(
                    format!("cannot read NATS credentials file at {}", credentials.display()),
                    error.into(),
                )
            })?;
        }
        let client = options.connect(&config.server_addr).await.map_err(|error| {
            Error::Nats(format!("cannot connect to NATS server at {}", config.server_addr), error.into())
        })?;
        let jetstream = jetstream::new(client);

        if config.setup {
            let _ = jetstream
                .create_key_value(jetstream::kv::Config {
                    bucket: config.bucket_name.clone(),
                    max_bytes: config.bucket_max_bytes,
                    ..Default::default()
                })
                .await
                .map_err(|error| Error::Nats("cannot create NATS KV bucket".into(), error.into()))?;
        }

        Ok(Self {
            jetstream,
            bucket: config.bucket_name,
            binarize,
            _id_state: PhantomData,
        })
    }

    async fn get_bucket(&self) -> Result<Store, Error> {
        self.jetstream
            .get_key_value(&self.bucket)
            .await
            .map_err(|error| Error::Nats("cannot get NATS KV bucket".into(), error.into()))
    }
}

impl<Id, State, Bin> std::fmt::Debug for NatsSnapshotStore<Id, State, Bin> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSnapshotStore").field("bucket", &self.bucket).finish()
    }
}

impl<Id, State, Bin> LocalSnapshotStore for NatsSnapshotStore<Id, State, Bin>
where
    Id: Display + Clone + Send + Sync + 'static,
    State: std::fmt::Debug + Send + Sync + 'static,
    Bin: Binarize<State, State> + Clone + Send + Sync + 'static,
{
    type Id = Id;
    type State = State;
    type Error = Error;

    async fn save(&self, id: &Self::Id, seq_no: SeqNo, state: &Self::State) -> Result<(), Self::Error> {
        let state_bytes = self
            .binarize
            .state_to_bytes(state)
            .map_err(|error| Error::StateToBytes(Box::new(error)))?;

        let mut bytes = BytesMut::with_capacity(8 + state_bytes.len());
        bytes.put_u64(seq_no.as_u64());
        bytes.put_slice(&state_bytes);

        self.get_bucket()
            .await?
            .put(id.to_string(), bytes.freeze())
            .await
            .map_err(|error| Error::Nats("cannot store snapshot in NATS KV bucket".into(), error.into()))?;
        debug!(%id, %seq_no, "saved snapshot");

        Ok(())
    }

    async fn load(&self, id: &Self::Id) -> Result<Option<Snapshot<Self::State>>, Self::Error> {
        let entry = self
            .get_bucket()
            .await?
            .get(id.to_string())
            .await
            .map_err(|error| Error::Nats("cannot load snapshot from NATS KV bucket".into(), error.into()))?;

        let Some(mut bytes) = entry else {
            debug!(%id, "no snapshot to load");
            return Ok(None);
        };

        if bytes.len() < 8 {
            return Err(Error::MalformedSnapshot);
        }
        let seq_no = SeqNo::new(bytes.get_u64()).map_err(Error::InvalidSeqNo)?;
        let state = self
            .binarize
            .state_from_bytes(Bytes::copy_from_slice(&bytes))
            .map_err(|error| Error::StateFromBytes(Box::new(error)))?;

        debug!(%id, %seq_no, "loaded snapshot");
        Ok(Some(Snapshot::new(seq_no, state)))
    }
}

/// Configuration for the [NatsSnapshotStore].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_addr: String,

    pub credentials: Option<PathBuf>,

    #[serde(default = "bucket_name_default")]
    pub bucket_name: String,

    #[serde(default = "bucket_max_bytes_default")]
    pub bucket_max_bytes: i64,

    #[serde(default)]
    pub setup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "localhost:4222".to_string(),
            credentials: None,
            bucket_name: bucket_name_default(),
            bucket_max_bytes: bucket_max_bytes_default(),
            setup: false,
        }
    }
}

fn bucket_max_bytes_default() -> i64 {
    -1
}

fn bucket_name_default() -> String {
    "snapshots".to_string()
}
