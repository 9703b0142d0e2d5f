//! An [EvtLog] implementation based on [PostgreSQL](https://www.postgresql.org/).

use crate::{Cnn, CnnPool, Error};
use async_stream::stream;
use bb8_postgres::{bb8::Pool, PostgresConnectionManager};
use eventsourced::{
    binarize::Binarize, JournalEntry, JournalEntryOutcome, LocalEvtLog, Rejection, SeqNo,
};
use futures::Stream;
use std::{fmt::Display, marker::PhantomData};
use tokio_postgres::{error::SqlState, NoTls};
use tracing::{debug, instrument};

/// An [EvtLog](eventsourced::EvtLog) implementation based on
/// [PostgreSQL](https://www.postgresql.org/).
///
/// Events are serialized to bytes via the given [Binarize] implementation before being stored,
/// and deserialized on replay. A single atomic write ([JournalEntry::Write]) is stored inside one
/// PostgreSQL transaction, so either all of its records land or none do.
#[derive(Clone)]
pub struct PostgresEvtLog<Id, Evt, Bin> {
    type_name: &'static str,
    cnn_pool: CnnPool,
    binarize: Bin,
    _id_evt: PhantomData<(Id, Evt)>,
}

impl<Id, Evt, Bin> PostgresEvtLog<Id, Evt, Bin> {
    pub async fn new(config: Config, type_name: &'static str, binarize: Bin) -> Result<Self, Error> {
        debug!(?config, type_name, "creating PostgresEvtLog");

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
                .batch_execute(include_str!("create_evt_log.sql"))
                .await
                .map_err(Error::ExecuteQuery)?;
        }

        Ok(Self {
            type_name,
            cnn_pool,
            binarize,
            _id_evt: PhantomData,
        })
    }

    async fn cnn(&self) -> Result<Cnn<'_>, Error> {
        self.cnn_pool.get().await.map_err(Error::GetConnection)
    }
}

impl<Id, Evt, Bin> std::fmt::Debug for PostgresEvtLog<Id, Evt, Bin> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEvtLog")
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn is_conflict(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

impl<Id, Evt, Bin> LocalEvtLog for PostgresEvtLog<Id, Evt, Bin>
where
    Id: Display + Clone + Send + Sync + 'static,
    Evt: Clone + Send + Sync + 'static,
    Bin: Binarize<Evt, Evt> + Clone + Send + Sync + 'static,
{
    type Id = Id;
    type Evt = Evt;
    type Error = Error;

    #[instrument(skip(self, entries))]
    async fn write_batch(
        &self,
        id: &Self::Id,
        entries: Vec<JournalEntry<Self::Id, Self::Evt>>,
    ) -> Result<Vec<JournalEntryOutcome>, Self::Error> {
        let id = id.to_string();
        let mut cnn = self.cnn().await?;
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry {
                JournalEntry::Write(records) => {
                    let tx = cnn.transaction().await.map_err(Error::ExecuteQuery)?;
                    let mut failed = None;
                    for record in &records {
                        let bytes = self
                            .binarize
                            .evt_to_bytes(&record.payload)
                            .map_err(|error| Error::ToBytes(Box::new(error)))?;
                        let seq_no = record.seq_no.as_u64() as i64;
                        let result = tx
                            .execute(
                                "INSERT INTO evts (persistence_id, seq_no, type, writer, evt) \
                                 VALUES ($1, $2, $3, $4, $5)",
                                &[&id, &seq_no, &self.type_name, &record.writer_uuid, &bytes.as_ref()],
                            )
                            .await;
                        if let Err(error) = result {
                            failed = Some(error);
                            break;
                        }
                    }

                    match failed {
                        None => {
                            tx.commit().await.map_err(Error::ExecuteQuery)?;
                            outcomes.push(JournalEntryOutcome::Accepted);
                        }
                        Some(error) if is_conflict(&error) => {
                            let _ = tx.rollback().await;
                            outcomes.push(JournalEntryOutcome::Rejected(Rejection(error.to_string())));
                        }
                        Some(error) => {
                            let _ = tx.rollback().await;
                            return Err(Error::ExecuteQuery(error));
                        }
                    }
                }

                // A deferAsync payload is never actually stored; it only needs to be
                // acknowledged in submission order.
                JournalEntry::Loop(_) => outcomes.push(JournalEntryOutcome::Accepted),
            }
        }

        debug!(%id, entries = outcomes.len(), "wrote batch");
        Ok(outcomes)
    }

    #[instrument(skip(self))]
    async fn replay(
        &self,
        id: &Self::Id,
        from: SeqNo,
        to: Option<SeqNo>,
        max: Option<u64>,
    ) -> Result<impl Stream<Item = Result<(SeqNo, Self::Evt), Self::Error>> + Send, Self::Error> {
        let id = id.to_string();
        let from = from.as_u64() as i64;
        let to = to.map(|s| s.as_u64() as i64).unwrap_or(i64::MAX);
        let max = max.unwrap_or(u64::MAX);
        let binarize = self.binarize.clone();
        let cnn = self.cnn().await?;

        let evts = stream! {
            let rows = cnn
                .query_raw(
                    "SELECT seq_no, evt FROM evts \
                     WHERE persistence_id = $1 AND seq_no >= $2 AND seq_no <= $3 \
                     ORDER BY seq_no",
                    &[&id as &(dyn tokio_postgres::types::ToSql + Sync), &from, &to],
                )
                .await
                .map_err(Error::ExecuteQuery);

            match rows {
                Ok(rows) => {
                    futures::pin_mut!(rows);
                    let mut yielded = 0u64;
                    while yielded < max {
                        match futures::StreamExt::next(&mut rows).await {
                            Some(Ok(row)) => {
                                let seq_no = row.get::<_, i64>(0);
                                let seq_no = match SeqNo::new(seq_no as u64) {
                                    Ok(seq_no) => seq_no,
                                    Err(error) => {
                                        yield Err(Error::InvalidSeqNo(error));
                                        break;
                                    }
                                };
                                let bytes = row.get::<_, &[u8]>(1);
                                let evt = binarize
                                    .evt_from_bytes(bytes::Bytes::copy_from_slice(bytes))
                                    .map_err(|error| Error::FromBytes(Box::new(error)));
                                match evt {
                                    Ok(evt) => {
                                        yielded += 1;
                                        yield Ok((seq_no, evt));
                                    }
                                    Err(error) => {
                                        yield Err(error);
                                        break;
                                    }
                                }
                            }
                            Some(Err(error)) => {
                                yield Err(Error::ExecuteQuery(error));
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Err(error) => yield Err(error),
            }
        };

        Ok(evts)
    }

    #[instrument(skip(self))]
    async fn last_seq_no(&self, id: &Self::Id) -> Result<Option<SeqNo>, Self::Error> {
        let id = id.to_string();
        self.cnn()
            .await?
            .query_one("SELECT MAX(seq_no) FROM evts WHERE persistence_id = $1", &[&id])
            .await
            .map_err(Error::ExecuteQuery)
            .and_then(|row| {
                // With no rows matching, MAX still returns one row with a NULL column.
                row.try_get::<_, i64>(0)
                    .ok()
                    .map(|seq_no| SeqNo::new(seq_no as u64).map_err(Error::InvalidSeqNo))
                    .transpose()
            })
    }

    #[instrument(skip(self))]
    async fn delete_to(&self, id: &Self::Id, to_seq_no: SeqNo) -> Result<(), Self::Error> {
        let id = id.to_string();
        let to_seq_no = to_seq_no.as_u64() as i64;
        self.cnn()
            .await?
            .execute(
                "DELETE FROM evts WHERE persistence_id = $1 AND seq_no <= $2",
                &[&id, &to_seq_no],
            )
            .await
            .map_err(Error::ExecuteQuery)?;
        Ok(())
    }
}

/// Configuration for the [PostgresEvtLog].
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
    use eventsourced::{binarize::serde_json::SerdeJsonBinarize, EvtLog};
    use futures::TryStreamExt;
    use testcontainers::clients::Cli;
    use testcontainers_modules::postgres::Postgres;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_write_and_replay() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = Cli::default();
        let container = client.run(Postgres::default().with_host_auth());
        let port = container.get_host_port_ipv4(5432);

        let config = Config {
            port,
            setup: true,
            ..Default::default()
        };
        let evt_log = PostgresEvtLog::<Uuid, u32, _>::new(
            config,
            "counter",
            SerdeJsonBinarize::<u32, u32>::new(),
        )
        .await?;

        let id = Uuid::now_v7();

        assert_eq!(evt_log.last_seq_no(&id).await?, None);

        let records = [1u32, 2, 3]
            .into_iter()
            .enumerate()
            .map(|(i, n)| eventsourced::PersistentRepr {
                persistence_id: id,
                seq_no: SeqNo::new(i as u64 + 1).unwrap(),
                writer_uuid: "writer-1".to_string(),
                payload: n,
            })
            .collect();
        let outcomes = evt_log
            .write_batch(&id, vec![JournalEntry::Write(records)])
            .await?;
        assert!(matches!(outcomes.as_slice(), [JournalEntryOutcome::Accepted]));

        assert_eq!(evt_log.last_seq_no(&id).await?, Some(SeqNo::new(3)?));

        let replayed: Vec<_> = evt_log
            .replay(&id, SeqNo::new(1)?, None, None)
            .await?
            .try_collect()
            .await?;
        assert_eq!(
            replayed.into_iter().map(|(_, n)| n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        evt_log.delete_to(&id, SeqNo::new(2)?).await?;
        assert_eq!(evt_log.last_seq_no(&id).await?, Some(SeqNo::new(3)?));

        Ok(())
    }
}
