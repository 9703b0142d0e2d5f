//! Conversion of events and snapshot state to and from [Bytes].

use bytes::Bytes;
use std::error::Error as StdError;

/// Conversion of events and state to and from [Bytes], so the journal and snapshot store never
/// need to know anything about concrete event or state types.
pub trait Binarize<Evt, State> {
    /// Error for [evt_to_bytes](Self::evt_to_bytes) and [evt_from_bytes](Self::evt_from_bytes).
    type EvtError: StdError + Send + Sync + 'static;

    /// Error for [state_to_bytes](Self::state_to_bytes) and
    /// [state_from_bytes](Self::state_from_bytes).
    type StateError: StdError + Send + Sync + 'static;

    fn evt_to_bytes(&self, evt: &Evt) -> Result<Bytes, Self::EvtError>;

    fn evt_from_bytes(&self, bytes: Bytes) -> Result<Evt, Self::EvtError>;

    fn state_to_bytes(&self, state: &State) -> Result<Bytes, Self::StateError>;

    fn state_from_bytes(&self, bytes: Bytes) -> Result<State, Self::StateError>;
}

/// A [Binarize] implementation based on [serde_json].
#[cfg(feature = "serde_json")]
pub mod serde_json {
    use super::Binarize;
    use bytes::Bytes;
    use serde::{de::DeserializeOwned, Serialize};
    use std::marker::PhantomData;

    /// A [Binarize] implementation using [serde_json] for both events and state.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SerdeJsonBinarize<Evt, State>(PhantomData<(Evt, State)>);

    impl<Evt, State> SerdeJsonBinarize<Evt, State> {
        pub fn new() -> Self {
            Self(PhantomData)
        }
    }

    impl<Evt, State> Binarize<Evt, State> for SerdeJsonBinarize<Evt, State>
    where
        Evt: Serialize + DeserializeOwned,
        State: Serialize + DeserializeOwned,
    {
        type EvtError = ::serde_json::Error;
        type StateError = ::serde_json::Error;

        fn evt_to_bytes(&self, evt: &Evt) -> Result<Bytes, Self::EvtError> {
            to_bytes(evt)
        }

        fn evt_from_bytes(&self, bytes: Bytes) -> Result<Evt, Self::EvtError> {
            from_bytes(bytes)
        }

        fn state_to_bytes(&self, state: &State) -> Result<Bytes, Self::StateError> {
            to_bytes(state)
        }

        fn state_from_bytes(&self, bytes: Bytes) -> Result<State, Self::StateError> {
            from_bytes(bytes)
        }
    }

    /// Free function converting any [Serialize] value to [Bytes] via [serde_json].
    pub fn to_bytes<T>(value: &T) -> Result<Bytes, ::serde_json::Error>
    where
        T: Serialize,
    {
        ::serde_json::to_vec(value).map(Bytes::from)
    }

    /// Free function converting [Bytes] to any [DeserializeOwned] value via [serde_json].
    pub fn from_bytes<T>(bytes: Bytes) -> Result<T, ::serde_json::Error>
    where
        T: DeserializeOwned,
    {
        ::serde_json::from_slice(&bytes)
    }
}

/// A [Binarize] implementation based on [prost].
#[cfg(feature = "prost")]
pub mod prost {
    use super::Binarize;
    use bytes::{Bytes, BytesMut};
    use prost::Message;
    use std::marker::PhantomData;

    /// A [Binarize] implementation using [prost] for both events and state.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProstBinarize<Evt, State>(PhantomData<(Evt, State)>);

    impl<Evt, State> ProstBinarize<Evt, State> {
        pub fn new() -> Self {
            Self(PhantomData)
        }
    }

    impl<Evt, State> Binarize<Evt, State> for ProstBinarize<Evt, State>
    where
        Evt: Message + Default,
        State: Message + Default,
    {
        type EvtError = prost::DecodeError;
        type StateError = prost::DecodeError;

        fn evt_to_bytes(&self, evt: &Evt) -> Result<Bytes, Self::EvtError> {
            Ok(to_bytes(evt))
        }

        fn evt_from_bytes(&self, bytes: Bytes) -> Result<Evt, Self::EvtError> {
            from_bytes(bytes)
        }

        fn state_to_bytes(&self, state: &State) -> Result<Bytes, Self::StateError> {
            Ok(to_bytes(state))
        }

        fn state_from_bytes(&self, bytes: Bytes) -> Result<State, Self::StateError> {
            from_bytes(bytes)
        }
    }

    /// Free function converting any [Message] value to [Bytes] via [prost].
    pub fn to_bytes<T>(value: &T) -> Bytes
    where
        T: Message,
    {
        let mut bytes = BytesMut::new();
        // A BytesMut has unbounded capacity, so encoding cannot fail here.
        value.encode(&mut bytes).expect("encoding never fails for BytesMut");
        bytes.freeze()
    }

    /// Free function converting [Bytes] to any [Message] value via [prost].
    pub fn from_bytes<T>(bytes: Bytes) -> Result<T, prost::DecodeError>
    where
        T: Message + Default,
    {
        T::decode(bytes)
    }
}
