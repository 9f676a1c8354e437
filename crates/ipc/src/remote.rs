//! Worker side of a context: connect back to the hub and serve an entry point

use std::future::Future;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use workhive_config::constants::{ENV_HUB_KEY, ENV_HUB_URI};
use workhive_config::HubConfig;
use workhive_errors::{ConfigError, Error, Result};

use crate::channel::Channel;
use crate::packet::{ExitResult, Packet, PanicReport};
use crate::transport::{self, Endpoint};

/// Connect to a hub and present `key`
///
/// # Errors
///
/// Returns an error if the endpoint cannot be reached or the key cannot be
/// written.
pub async fn connect(endpoint: &Endpoint, key: &[u8], config: &HubConfig) -> Result<Channel> {
    let (reader, writer) = transport::connect(endpoint).await?;
    let channel = Channel::new(reader, writer, config.max_frame_length);
    channel.send_raw(Bytes::copy_from_slice(key)).await?;
    Ok(channel)
}

/// Connect using the endpoint and hex key a process context placed in the
/// environment
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` if either variable is missing or
/// malformed, or any error from [`connect`].
pub async fn connect_from_env(config: &HubConfig) -> Result<Channel> {
    let uri = env_var(ENV_HUB_URI)?;
    let endpoint = Endpoint::parse(&uri)?;
    let key = hex::decode(env_var(ENV_HUB_KEY)?).map_err(|err| ConfigError::InvalidValue {
        field: ENV_HUB_KEY.to_string(),
        value: err.to_string(),
    })?;
    connect(&endpoint, &key, config).await
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|err| {
        ConfigError::InvalidValue {
            field: name.to_string(),
            value: err.to_string(),
        }
        .into()
    })
}

/// The remote end of a context channel as seen by the entry point
#[derive(Debug, Clone)]
pub struct RemoteChannel {
    channel: Channel,
}

impl RemoteChannel {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Send one message to the parent
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the message does not encode, or a
    /// channel error if the parent is gone.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.channel.send(&Packet::Data(value)).await
    }

    /// Receive one message from the parent
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the message does not decode as `T`,
    /// or a channel error if the parent is gone.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T> {
        match self.channel.receive::<Packet>().await? {
            Packet::Data(value) => serde_json::from_value(value).map_err(Error::from),
            Packet::Exit(_) => Err(Error::internal("parent sent an exit packet")),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

/// Run `entry` against `channel`, then report its outcome to the parent as
/// the final exit packet. Panics inside `entry` are reported, not propagated.
///
/// # Errors
///
/// Returns an error only if the exit packet cannot be delivered.
pub async fn serve<F, Fut>(channel: Channel, entry: F) -> Result<()>
where
    F: FnOnce(RemoteChannel) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let outcome = AssertUnwindSafe(entry(RemoteChannel::new(channel.clone())))
        .catch_unwind()
        .await;

    let exit = match outcome {
        Ok(Ok(value)) => ExitResult::Success(value),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "worker entry point failed");
            ExitResult::Failure(PanicReport::from_error(&err))
        }
        Err(payload) => {
            let report = PanicReport::from_panic(payload.as_ref());
            tracing::error!(message = %report.message, "worker entry point panicked");
            ExitResult::Failure(report)
        }
    };

    let delivered = channel.send(&Packet::Exit(exit)).await;
    channel.close();
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pair;
    use serde_json::json;

    #[tokio::test]
    async fn serve_reports_success_as_exit_packet() {
        let (parent, worker) = pair(1024);

        let serving = tokio::spawn(serve(worker, |remote| async move {
            let n: i64 = remote.receive().await?;
            remote.send(&(n * 2)).await?;
            Ok::<_, Error>(json!("done"))
        }));

        parent.send(&Packet::Data(json!(21))).await.unwrap();
        assert_eq!(
            parent.receive::<Packet>().await.unwrap(),
            Packet::Data(json!(42))
        );
        assert_eq!(
            parent.receive::<Packet>().await.unwrap(),
            Packet::Exit(ExitResult::Success(json!("done")))
        );
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serve_reports_panic_as_failure() {
        let (parent, worker) = pair(1024);

        let serving = tokio::spawn(serve(worker, |_remote| async move {
            if true {
                panic!("entry blew up");
            }
            Ok::<_, Error>(Value::Null)
        }));

        let Packet::Exit(ExitResult::Failure(report)) = parent.receive::<Packet>().await.unwrap()
        else {
            panic!("expected a failure exit");
        };
        assert_eq!(report.message, "entry blew up");
        serving.await.unwrap().unwrap();
    }
}
