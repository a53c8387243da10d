//! Turns broker messages into timestamped [`ProbeResult`]s.
//!
//! [`EventStream`] is a pull-based sequence: each call to
//! [`EventStream::next`] polls until a message arrives, the stream is
//! cancelled, or the broker reports an error. Errors end the stream; it is
//! never resumed past a message it could not handle.

use chrono::DateTime;
use log::{debug, info};
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::broker::{Consumer, Message, Position};
use crate::error::{Error, Result};
use crate::model::ProbeResult;

pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const GROUP_ID: &str = "checksite";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Subscribed,
    Stopped,
    Failed,
}

pub struct EventStream<C> {
    consumer: C,
    token: CancellationToken,
    poll_timeout: Duration,
    state: StreamState,
    last_position: Option<Position>,
}

impl<C: Consumer> EventStream<C> {
    pub async fn subscribe(
        mut consumer: C,
        topic: &str,
        token: CancellationToken,
    ) -> Result<Self> {
        consumer.subscribe(topic).await?;
        info!("Waiting for events on topic {topic}");
        Ok(Self {
            consumer,
            token,
            poll_timeout: POLL_TIMEOUT,
            state: StreamState::Subscribed,
            last_position: None,
        })
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Next decoded result, `None` once the stream is stopped or has failed.
    pub async fn next(&mut self) -> Option<Result<ProbeResult>> {
        while self.state == StreamState::Subscribed {
            if self.token.is_cancelled() {
                self.stop();
                break;
            }

            let polled = select! {
                biased;
                () = self.token.cancelled() => {
                    self.stop();
                    break;
                }
                polled = self.consumer.poll(self.poll_timeout) => polled,
            };

            match polled {
                None => {}
                Some(Err(err)) => {
                    self.state = StreamState::Failed;
                    return Some(Err(err.into()));
                }
                Some(Ok(message)) => match decode_message(&message) {
                    Ok(result) => {
                        self.last_position = Some(message.position);
                        return Some(Ok(result));
                    }
                    Err(err) => {
                        self.state = StreamState::Failed;
                        return Some(Err(err));
                    }
                },
            }
        }
        None
    }

    /// Commits the position of the last result returned by [`Self::next`].
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(position) = self.last_position.take() {
            self.consumer.commit(&position).await?;
            debug!("Committed {position}");
        }
        Ok(())
    }

    pub async fn close(mut self) {
        self.consumer.close().await;
        info!("Consumer closed");
    }

    fn stop(&mut self) {
        info!("Shutdown requested, stopping consumer");
        self.state = StreamState::Stopped;
    }
}

/// Decodes one message and stamps it with the broker timestamp, which every
/// stored status needs.
pub fn decode_message(message: &Message) -> Result<ProbeResult> {
    let position = &message.position;
    let payload = message
        .payload
        .as_deref()
        .ok_or_else(|| Error::MissingPayload(position.to_string()))?;
    let result = ProbeResult::from_json(payload)?;

    let timestamp = message
        .timestamp
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| Error::MissingTimestamp(position.to_string()))?;

    Ok(result.with_timestamp(timestamp))
}
