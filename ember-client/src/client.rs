//! The public client façade.
//!
//! `CacheClient` is a cheap-to-clone handle over the server pool. Every
//! operation transforms and validates the key, dispatches through the
//! locator, and shapes the outcome into an [`OperationResult`]: server
//! status codes verbatim, client-side failures as messages, never a retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::keys::KeyTransformer;
use crate::results::OperationResult;
use crate::server_pool::ServerPool;
use crate::transcoder::{Transcoder, Value};
use ember_proto::{
    ConcatDirection, DeltaDirection, ProtoError, Reply, Request, StoreMode, DELTA_NO_CREATE,
};

/// The protocol's relative/absolute expiration pivot: 30 days.
const THIRTY_DAYS_SECS: u64 = 30 * 24 * 60 * 60;

/// When a stored item expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// The item never expires.
    Never,
    /// The item expires this long from now. Must be positive.
    After(Duration),
    /// The item expires at this wall-clock instant. Must be in the future.
    At(SystemTime),
}

impl Expiration {
    /// Normalizes to the protocol's expiration word: seconds when the
    /// deadline is within 30 days, epoch seconds beyond that.
    fn normalize(self, now: SystemTime) -> ClientResult<u32> {
        match self {
            Self::Never => Ok(0),
            Self::After(duration) => {
                if duration.is_zero() {
                    return Err(ClientError::InvalidExpiration {
                        reason: "duration must be positive",
                    });
                }
                let secs = duration.as_secs().max(1);
                if secs <= THIRTY_DAYS_SECS {
                    #[allow(clippy::cast_possible_truncation)] // 30 days < u32::MAX
                    Ok(secs as u32)
                } else {
                    epoch_seconds(now.checked_add(duration).ok_or(
                        ClientError::InvalidExpiration {
                            reason: "duration overflows the clock",
                        },
                    )?)
                }
            }
            Self::At(when) => {
                let delta = when
                    .duration_since(now)
                    .map_err(|_| ClientError::InvalidExpiration {
                        reason: "timestamp is not in the future",
                    })?;
                if delta.is_zero() {
                    return Err(ClientError::InvalidExpiration {
                        reason: "timestamp is not in the future",
                    });
                }
                if delta.as_secs() <= THIRTY_DAYS_SECS {
                    #[allow(clippy::cast_possible_truncation)] // 30 days < u32::MAX
                    Ok(delta.as_secs().max(1) as u32)
                } else {
                    epoch_seconds(when)
                }
            }
        }
    }
}

fn epoch_seconds(when: SystemTime) -> ClientResult<u32> {
    let secs = when
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ClientError::InvalidExpiration {
            reason: "timestamp predates the epoch",
        })?
        .as_secs();
    u32::try_from(secs).map_err(|_| ClientError::InvalidExpiration {
        reason: "timestamp does not fit a 32-bit epoch",
    })
}

/// Async memcached client.
///
/// Clones share the underlying server pool; drop every clone and call
/// [`CacheClient::shutdown`] first for a clean goodbye.
#[derive(Debug, Clone)]
pub struct CacheClient {
    pool: Arc<ServerPool>,
    transcoder: Arc<dyn Transcoder>,
    keys: KeyTransformer,
}

impl CacheClient {
    /// Validates the configuration, builds the node set, warms the pools,
    /// and starts the maintenance task.
    ///
    /// Unreachable servers do not fail the connect: they start dead and
    /// enter the revival cycle.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate().map_err(ClientError::Config)?;
        let transcoder = config.transcoder.build();
        let keys = config.key_transformer.clone();
        let pool = ServerPool::start(&config).await?;
        Ok(Self {
            pool,
            transcoder,
            keys,
        })
    }

    /// Stops background maintenance and closes every socket.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Fetches a value.
    pub async fn get(&self, key: &str) -> OperationResult<Value> {
        let pkey = match self.keys.transform(key.as_bytes()) {
            Ok(pkey) => pkey,
            Err(error) => return OperationResult::client(&error),
        };
        let request = Request::Get { key: pkey.clone() };
        match self.run_one(&pkey, request).await {
            Ok(reply) => self.shape_get(reply),
            Err(error) => OperationResult::client(&error),
        }
    }

    /// Fetches a value together with its cas token.
    ///
    /// Identical to [`CacheClient::get`] on the wire; the cas token rides
    /// on every get result.
    pub async fn get_with_cas(&self, key: &str) -> OperationResult<Value> {
        self.get(key).await
    }

    /// Fetches many values in one parallel fan-out.
    ///
    /// The result maps each found key to its value; missing keys, keys on
    /// dead nodes, and undecodable payloads are simply absent.
    pub async fn multi_get<I, S>(&self, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.fetch_batch(keys)
            .await
            .into_iter()
            .filter_map(|(key, reply)| match self.transcoder.decode(&reply.payload()) {
                Ok(value) => Some((key, value)),
                Err(error) => {
                    debug!(%key, %error, "batch entry failed to decode");
                    None
                }
            })
            .collect()
    }

    /// Like [`CacheClient::multi_get`], with each entry's cas token.
    pub async fn multi_get_with_cas<I, S>(&self, keys: I) -> HashMap<String, (Value, u64)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.fetch_batch(keys)
            .await
            .into_iter()
            .filter_map(|(key, reply)| match self.transcoder.decode(&reply.payload()) {
                Ok(value) => Some((key, (value, reply.cas))),
                Err(error) => {
                    debug!(%key, %error, "batch entry failed to decode");
                    None
                }
            })
            .collect()
    }

    /// Stores a value under the given mode.
    pub async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        value: impl Into<Value>,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store_cas(mode, key, value, 0, expiration).await
    }

    /// Stores a value only if the item's cas token still matches.
    pub async fn store_cas(
        &self,
        mode: StoreMode,
        key: &str,
        value: impl Into<Value>,
        cas: u64,
        expiration: Expiration,
    ) -> OperationResult<()> {
        let prepared = self.keys.transform(key.as_bytes()).and_then(|pkey| {
            let payload = self.transcoder.encode(&value.into())?;
            let expiration = expiration.normalize(SystemTime::now())?;
            Ok((pkey, payload, expiration))
        });
        let (pkey, payload, expiration) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => return OperationResult::client(&error),
        };

        let request = Request::Store {
            mode,
            key: pkey.clone(),
            payload,
            expiration,
            cas,
        };
        match self.run_one(&pkey, request).await {
            Ok(reply) => shape_status(&reply),
            Err(error) => OperationResult::client(&error),
        }
    }

    /// Stores unconditionally.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Set, key, value, expiration).await
    }

    /// Stores only if the key is absent.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Value>,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Add, key, value, expiration).await
    }

    /// Stores only if the key is present.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Value>,
        expiration: Expiration,
    ) -> OperationResult<()> {
        self.store(StoreMode::Replace, key, value, expiration).await
    }

    /// Appends raw bytes to an existing value.
    pub async fn append(&self, key: &str, data: impl Into<Bytes>) -> OperationResult<()> {
        self.concat(ConcatDirection::Append, key, data.into()).await
    }

    /// Prepends raw bytes to an existing value.
    pub async fn prepend(&self, key: &str, data: impl Into<Bytes>) -> OperationResult<()> {
        self.concat(ConcatDirection::Prepend, key, data.into()).await
    }

    async fn concat(
        &self,
        direction: ConcatDirection,
        key: &str,
        data: Bytes,
    ) -> OperationResult<()> {
        let pkey = match self.keys.transform(key.as_bytes()) {
            Ok(pkey) => pkey,
            Err(error) => return OperationResult::client(&error),
        };
        let request = Request::Concat {
            direction,
            key: pkey.clone(),
            data,
            cas: 0,
        };
        match self.run_one(&pkey, request).await {
            Ok(reply) => shape_status(&reply),
            Err(error) => OperationResult::client(&error),
        }
    }

    /// Adds `delta` to a numeric value, returning the new value.
    ///
    /// With `initial` set, a missing key is seeded with that value (and
    /// the given expiration); with `initial` absent, a missing key fails
    /// with `KeyNotFound`.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        expiration: Expiration,
    ) -> OperationResult<u64> {
        self.delta(DeltaDirection::Increment, key, delta, initial, expiration)
            .await
    }

    /// Subtracts `delta` from a numeric value (floored at zero),
    /// returning the new value. `initial` works as in
    /// [`CacheClient::increment`].
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        expiration: Expiration,
    ) -> OperationResult<u64> {
        self.delta(DeltaDirection::Decrement, key, delta, initial, expiration)
            .await
    }

    async fn delta(
        &self,
        direction: DeltaDirection,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        expiration: Expiration,
    ) -> OperationResult<u64> {
        let prepared = self.keys.transform(key.as_bytes()).and_then(|pkey| {
            let expiration = match initial {
                Some(_) => expiration.normalize(SystemTime::now())?,
                None => DELTA_NO_CREATE,
            };
            Ok((pkey, expiration))
        });
        let (pkey, expiration) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => return OperationResult::client(&error),
        };

        let request = Request::Delta {
            direction,
            key: pkey.clone(),
            delta,
            initial: initial.unwrap_or(0),
            expiration,
        };
        match self.run_one(&pkey, request).await {
            Ok(reply) => shape_counter(&reply),
            Err(error) => OperationResult::client(&error),
        }
    }

    /// Removes a key. Removing an absent key fails with `KeyNotFound`.
    pub async fn delete(&self, key: &str) -> OperationResult<()> {
        let pkey = match self.keys.transform(key.as_bytes()) {
            Ok(pkey) => pkey,
            Err(error) => return OperationResult::client(&error),
        };
        let request = Request::Delete {
            key: pkey.clone(),
            cas: 0,
        };
        match self.run_one(&pkey, request).await {
            Ok(reply) => shape_status(&reply),
            Err(error) => OperationResult::client(&error),
        }
    }

    /// Invalidates every item on every live node, optionally after a
    /// delay.
    pub async fn flush(&self, delay: Option<Duration>) -> OperationResult<()> {
        let delay = match delay {
            None => 0,
            Some(duration) => u32::try_from(duration.as_secs()).unwrap_or(u32::MAX),
        };
        let outcomes = self.pool.broadcast(&Request::Flush { delay }).await;
        if outcomes.is_empty() {
            return OperationResult::client(&ClientError::NodeUnavailable);
        }
        for (node, outcome) in outcomes {
            match outcome.map(ember_proto::Response::into_one) {
                Ok(Some(reply)) if reply.status.is_success() => {}
                Ok(Some(reply)) => return OperationResult::server(reply.status, 0, reply.text()),
                Ok(None) => {
                    return OperationResult::client(&ClientError::Protocol(
                        ProtoError::UnexpectedResponse {
                            reason: "expected a single reply",
                        },
                    ))
                }
                Err(error) => {
                    debug!(%node, %error, "flush failed on node");
                    return OperationResult::client(&error);
                }
            }
        }
        OperationResult::ok(None, 0)
    }

    /// Collects the statistics table from every live node, keyed by
    /// server address. Failing nodes are absent from the result.
    pub async fn stats(&self) -> HashMap<String, Vec<(String, String)>> {
        let outcomes = self.pool.broadcast(&Request::Stats { key: None }).await;
        let mut tables = HashMap::new();
        for (node, outcome) in outcomes {
            match outcome {
                Ok(ember_proto::Response::Stats(table)) => {
                    tables.insert(node, table);
                }
                Ok(_) => debug!(%node, "stats paired with a non-stats response"),
                Err(error) => debug!(%node, %error, "stats failed on node"),
            }
        }
        tables
    }

    /// Collects the version string from every live node, keyed by server
    /// address. Failing nodes are absent from the result.
    pub async fn version(&self) -> HashMap<String, String> {
        let outcomes = self.pool.broadcast(&Request::Version).await;
        let mut versions = HashMap::new();
        for (node, outcome) in outcomes {
            match outcome.map(ember_proto::Response::into_one) {
                Ok(Some(reply)) if reply.status.is_success() => {
                    versions.insert(node, reply.text().unwrap_or_default());
                }
                Ok(_) => {}
                Err(error) => debug!(%node, %error, "version failed on node"),
            }
        }
        versions
    }

    /// Transforms keys, fans the batch out, and maps replies back onto
    /// the caller's key strings.
    async fn fetch_batch<I, S>(&self, keys: I) -> HashMap<String, Reply>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: HashMap<Bytes, String> = HashMap::new();
        let mut pkeys = Vec::new();
        for key in keys {
            let key = key.as_ref();
            match self.keys.transform(key.as_bytes()) {
                Ok(pkey) => {
                    if names.insert(pkey.clone(), key.to_string()).is_none() {
                        pkeys.push(pkey);
                    }
                }
                Err(error) => debug!(%key, %error, "batch key rejected"),
            }
        }
        if pkeys.is_empty() {
            return HashMap::new();
        }

        self.pool
            .get_batch(pkeys)
            .await
            .into_iter()
            .filter_map(|(pkey, reply)| names.remove(&pkey).map(|name| (name, reply)))
            .collect()
    }

    async fn run_one(&self, pkey: &Bytes, request: Request) -> ClientResult<Reply> {
        self.pool
            .execute(pkey, request)
            .await?
            .into_one()
            .ok_or(ClientError::Protocol(ProtoError::UnexpectedResponse {
                reason: "expected a single reply",
            }))
    }

    fn shape_get(&self, reply: Reply) -> OperationResult<Value> {
        if !reply.status.is_success() {
            return OperationResult::server(reply.status, reply.cas, describe(&reply));
        }
        let payload = reply.payload();
        match self.transcoder.decode(&payload) {
            Ok(value) => OperationResult::ok(Some(value), reply.cas),
            Err(error) => {
                // The bytes stay reachable even though decoding failed.
                OperationResult::client(&ClientError::Transcode(error))
                    .with_raw(payload)
                    .with_cas(reply.cas)
            }
        }
    }
}

fn describe(reply: &Reply) -> Option<String> {
    reply
        .text()
        .or_else(|| Some(reply.status.describe().to_string()))
}

fn shape_status(reply: &Reply) -> OperationResult<()> {
    if reply.status.is_success() {
        OperationResult::ok(None, reply.cas)
    } else {
        OperationResult::server(reply.status, reply.cas, describe(reply))
    }
}

fn shape_counter(reply: &Reply) -> OperationResult<u64> {
    if !reply.status.is_success() {
        return OperationResult::server(reply.status, reply.cas, describe(reply));
    }
    match reply.counter() {
        Some(value) => OperationResult::ok(Some(value), reply.cas),
        None => OperationResult::client(&ClientError::Protocol(ProtoError::MalformedFrame {
            reason: "counter reply without an 8-byte body",
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn test_never_is_zero() {
        assert_eq!(Expiration::Never.normalize(now()).unwrap(), 0);
    }

    #[test]
    fn test_short_durations_pass_as_seconds() {
        let exp = Expiration::After(Duration::from_secs(300));
        assert_eq!(exp.normalize(now()).unwrap(), 300);

        // Exactly 30 days still counts as relative.
        let exp = Expiration::After(Duration::from_secs(THIRTY_DAYS_SECS));
        assert_eq!(exp.normalize(now()).unwrap(), 2_592_000);
    }

    #[test]
    fn test_long_durations_become_epoch() {
        let exp = Expiration::After(Duration::from_secs(THIRTY_DAYS_SECS + 1));
        let word = exp.normalize(now()).unwrap();
        assert_eq!(u64::from(word), 1_700_000_000 + THIRTY_DAYS_SECS + 1);
    }

    #[test]
    fn test_near_timestamps_become_relative() {
        let exp = Expiration::At(now() + Duration::from_secs(120));
        assert_eq!(exp.normalize(now()).unwrap(), 120);
    }

    #[test]
    fn test_far_timestamps_stay_epoch() {
        let when = now() + Duration::from_secs(THIRTY_DAYS_SECS * 2);
        let exp = Expiration::At(when);
        assert_eq!(
            u64::from(exp.normalize(now()).unwrap()),
            1_700_000_000 + THIRTY_DAYS_SECS * 2
        );
    }

    #[test]
    fn test_zero_and_past_rejected() {
        assert!(Expiration::After(Duration::ZERO).normalize(now()).is_err());
        assert!(Expiration::At(now()).normalize(now()).is_err());
        assert!(Expiration::At(now() - Duration::from_secs(10))
            .normalize(now())
            .is_err());
    }

    #[test]
    fn test_sub_second_durations_round_up() {
        let exp = Expiration::After(Duration::from_millis(250));
        assert_eq!(exp.normalize(now()).unwrap(), 1);
    }
}
