//! An [EvtLog] implementation based on [NATS](https://nats.io/) JetStream.

use crate::Error;
use async_nats::{
    jetstream::{
        self,
        consumer::{pull, AckPolicy, DeliverPolicy},
        context::Publish,
        stream::{LastRawMessageErrorKind, Stream as JetstreamStream},
        Context as Jetstream,
    },
    ConnectOptions,
};
use eventsourced::{binarize::Binarize, JournalEntry, JournalEntryOutcome, LocalEvtLog, SeqNo};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, marker::PhantomData, path::PathBuf, time::Duration};
use tracing::{debug, instrument};

/// An [EvtLog](eventsourced::EvtLog) implementation based on [NATS](https://nats.io/) JetStream.
///
/// Every entity's events live on one subject `{evt_stream_name}.{type_name}.{id}` within a single
/// shared JetStream stream. A [JournalEntry::Write] of several records is published as a sequence
/// of messages; NATS has no cross-message transaction, so a mid-batch publish failure is reported
/// as an infrastructure error (the whole `write_batch` call fails) rather than as a
/// [JournalEntryOutcome::Rejected] for just the failing record.
#[derive(Clone)]
pub struct NatsEvtLog<Id, Evt, Bin> {
    evt_stream_name: String,
    type_name: &'static str,
    jetstream: Jetstream,
    binarize: Bin,
    _id_evt: PhantomData<(Id, Evt)>,
}

impl<Id, Evt, Bin> NatsEvtLog<Id, Evt, Bin> {
    pub async fn new(config: Config, type_name: &'static str, binarize: Bin) -> Result<Self, Error> {
        debug!(?config, type_name, "creating NatsEvtLog");

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
            jetstream
                .create_stream(jetstream::stream::Config {
                    name: config.evt_stream_name.clone(),
                    subjects: vec![format!("{}.>", config.evt_stream_name)],
                    max_bytes: config.evt_stream_max_bytes,
                    ..Default::default()
                })
                .await
                .map_err(|error| {
                    Error::Nats(format!("cannot create evt stream '{}'", config.evt_stream_name), error.into())
                })?;
        }

        Ok(Self {
            evt_stream_name: config.evt_stream_name,
            type_name,
            jetstream,
            binarize,
            _id_evt: PhantomData,
        })
    }

    async fn stream(&self) -> Result<JetstreamStream, Error> {
        self.jetstream.get_stream(&self.evt_stream_name).await.map_err(|error| {
            Error::Nats(format!("cannot get NATS stream '{}'", self.evt_stream_name), error.into())
        })
    }
}

impl<Id, Evt, Bin> std::fmt::Debug for NatsEvtLog<Id, Evt, Bin> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsEvtLog")
            .field("stream_name", &self.evt_stream_name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

impl<Id, Evt, Bin> LocalEvtLog for NatsEvtLog<Id, Evt, Bin>
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
        let subject = format!("{}.{}.{id}", self.evt_stream_name, self.type_name);
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry {
                JournalEntry::Write(records) => {
                    // JetStream has no cross-message transaction, so there is nothing to
                    // distinguish a logical rejection from an infrastructure error on: any
                    // publish/ACK failure fails the whole `write_batch` call (see struct docs).
                    for record in &records {
                        let bytes = self
                            .binarize
                            .evt_to_bytes(&record.payload)
                            .map_err(|error| Error::EvtToBytes(Box::new(error)))?;
                        let publish = Publish::build().payload(bytes);
                        self.jetstream
                            .send_publish(subject.clone(), publish)
                            .await
                            .map_err(|error| Error::Nats("cannot publish event".into(), error.into()))?
                            .await
                            .map_err(|error| Error::Nats("cannot get ACK for published event".into(), error.into()))?;
                    }
                    outcomes.push(JournalEntryOutcome::Accepted);
                }

                // A deferAsync payload is never actually published; it only needs to be
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
        let subject = format!("{}.{}.{id}", self.evt_stream_name, self.type_name);
        let stream = self.stream().await?;
        let consumer = stream
            .create_consumer(pull::Config {
                filter_subject: subject,
                ack_policy: AckPolicy::None,
                deliver_policy: DeliverPolicy::ByStartSequence {
                    start_sequence: from.as_u64(),
                },
                ..Default::default()
            })
            .await
            .map_err(|error| Error::Nats("cannot create NATS consumer".into(), error.into()))?;
        let msgs = consumer
            .stream()
            .heartbeat(Duration::ZERO)
            .messages()
            .await
            .map_err(|error| Error::Nats("cannot get message stream from NATS consumer".into(), error.into()))?;

        let binarize = self.binarize.clone();
        let to = to.map(|s| s.as_u64());
        let max = max.unwrap_or(u64::MAX);

        let evts = msgs
            .map(move |msg| {
                let msg = msg.map_err(|error| Error::Nats("cannot get message from NATS message stream".into(), error.into()))?;
                let seq_no = msg
                    .info()
                    .map_err(|error| Error::Nats("cannot get message info".into(), error))
                    .and_then(|info| SeqNo::new(info.stream_sequence).map_err(Error::InvalidSeqNo))?;
                let evt = binarize
                    .evt_from_bytes(msg.message.payload.clone())
                    .map_err(|error| Error::EvtFromBytes(Box::new(error)))?;
                Ok((seq_no, evt))
            })
            .take(max.min(usize::MAX as u64) as usize)
            .take_while(move |r| {
                let keep = match r {
                    Ok((seq_no, _)) => to.map_or(true, |to| seq_no.as_u64() <= to),
                    Err(_) => true,
                };
                futures::future::ready(keep)
            });

        Ok(evts)
    }

    #[instrument(skip(self))]
    async fn last_seq_no(&self, id: &Self::Id) -> Result<Option<SeqNo>, Self::Error> {
        let subject = format!("{}.{}.{id}", self.evt_stream_name, self.type_name);
        self.stream()
            .await?
            .get_last_raw_message_by_subject(&subject)
            .await
            .map_or_else(
                |error| {
                    if error.kind() == LastRawMessageErrorKind::NoMessageFound {
                        debug!(%id, "no last message found");
                        Ok(None)
                    } else {
                        Err(Error::Nats(
                            format!("cannot get last message for NATS stream '{}'", self.evt_stream_name),
                            error.into(),
                        ))
                    }
                },
                |msg| Some(SeqNo::new(msg.sequence).map_err(Error::InvalidSeqNo)).transpose(),
            )
    }

    #[instrument(skip(self))]
    async fn delete_to(&self, id: &Self::Id, to_seq_no: SeqNo) -> Result<(), Self::Error> {
        let subject = format!("{}.{}.{id}", self.evt_stream_name, self.type_name);
        self.stream()
            .await?
            .purge()
            .filter(subject)
            .keep(0)
            .sequence(to_seq_no.as_u64() + 1)
            .await
            .map_err(|error| Error::Nats("cannot purge NATS stream".into(), error.into()))?;
        Ok(())
    }
}

/// Configuration for the [NatsEvtLog].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_addr: String,

    pub credentials: Option<PathBuf>,

    #[serde(default = "evt_stream_name_default")]
    pub evt_stream_name: String,

    #[serde(default = "evt_stream_max_bytes_default")]
    pub evt_stream_max_bytes: i64,

    #[serde(default)]
    pub setup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "localhost:4222".into(),
            credentials: None,
            evt_stream_name: evt_stream_name_default(),
            evt_stream_max_bytes: evt_stream_max_bytes_default(),
            setup: false,
        }
    }
}

fn evt_stream_name_default() -> String {
    "evts".to_string()
}

fn evt_stream_max_bytes_default() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::NATS_VERSION;
    use eventsourced::{binarize::serde_json::SerdeJsonBinarize, EvtLog, PersistentRepr};
    use futures::TryStreamExt;
    use testcontainers::{clients::Cli, core::WaitFor};
    use testcontainers_modules::testcontainers::GenericImage;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_write_and_replay() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = Cli::default();
        let nats_image = GenericImage::new("nats", NATS_VERSION)
            .with_wait_for(WaitFor::message_on_stderr("Server is ready"));
        let container = client.run((nats_image, vec!["-js".to_string()]));
        let server_addr = format!("localhost:{}", container.get_host_port_ipv4(4222));

        let config = Config {
            server_addr,
            setup: true,
            ..Default::default()
        };
        let evt_log =
            NatsEvtLog::<Uuid, u32, _>::new(config, "counter", SerdeJsonBinarize::<u32, u32>::new()).await?;

        let id = Uuid::now_v7();

        assert_eq!(evt_log.last_seq_no(&id).await?, None);

        let records = [1u32, 2, 3]
            .into_iter()
            .enumerate()
            .map(|(i, n)| PersistentRepr {
                persistence_id: id,
                seq_no: SeqNo::new(i as u64 + 1).unwrap(),
                writer_uuid: "writer-1".to_string(),
                payload: n,
            })
            .collect();
        let outcomes = evt_log.write_batch(&id, vec![JournalEntry::Write(records)]).await?;
        assert!(matches!(outcomes.as_slice(), [JournalEntryOutcome::Accepted]));

        assert_eq!(evt_log.last_seq_no(&id).await?, Some(SeqNo::new(3)?));

        let replayed: Vec<_> = evt_log.replay(&id, SeqNo::new(1)?, None, None).await?.try_collect().await?;
        assert_eq!(replayed.into_iter().map(|(_, n)| n).collect::<Vec<_>>(), vec![1, 2, 3]);

        Ok(())
    }
}
