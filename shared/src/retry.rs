//! Bounded retry around message handlers.
//!
//! Any consumer-side component implements [`MessageHandler`]; wrapping it in a
//! [`RetryHandler`] gives it a fixed number of attempts with a fixed pause in
//! between. The wrapper holds the calling task for the whole retry window, so a
//! stuck dependency slows the consumer down rather than being rescheduled.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A message pulled off the bus, detached from the client that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, message: &Message) -> Result<()>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn process(&self, message: &Message) -> Result<()> {
        (**self).process(message).await
    }
}

pub struct RetryHandler<H> {
    inner: H,
    max_attempts: u32,
    delay: Duration,
}

impl<H: MessageHandler> RetryHandler<H> {
    pub fn new(inner: H, max_attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for RetryHandler<H> {
    async fn process(&self, message: &Message) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.process(message).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(e.context(format!(
                        "giving up on {} message after {} attempts",
                        message.topic, attempt
                    )));
                }
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        key = ?message.key,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Handler failed, retrying: {:#}",
                        e
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls it ever sees, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn process(&self, _message: &Message) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("transient error #{}", call);
            }
            Ok(())
        }
    }

    fn message() -> Message {
        Message::new("order.created", Some("o-1".to_string()), b"{}".to_vec())
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let flaky = Arc::new(Flaky::new(2));
        let handler = RetryHandler::new(flaky.clone(), 3, Duration::from_millis(5));

        handler.process(&message()).await.unwrap();

        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let flaky = Arc::new(Flaky::new(0));
        let handler = RetryHandler::new(flaky.clone(), 3, Duration::from_millis(5));

        handler.process(&message()).await.unwrap();

        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn returns_last_error_after_exhausting_attempts() {
        let flaky = Arc::new(Flaky::new(u32::MAX));
        let handler = RetryHandler::new(flaky.clone(), 3, Duration::from_millis(5));

        let err = handler.process(&message()).await.unwrap_err();

        assert_eq!(flaky.calls(), 3);
        assert!(format!("{:#}", err).contains("transient error #3"));
    }

    #[tokio::test]
    async fn each_message_gets_a_fresh_attempt_budget() {
        let flaky = Arc::new(Flaky::new(2));
        let handler = RetryHandler::new(flaky.clone(), 2, Duration::from_millis(5));

        assert!(handler.process(&message()).await.is_err());
        handler.process(&message()).await.unwrap();

        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let flaky = Arc::new(Flaky::new(0));
        let handler = RetryHandler::new(flaky.clone(), 0, Duration::from_millis(5));

        handler.process(&message()).await.unwrap();

        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn waits_between_attempts() {
        let flaky = Arc::new(Flaky::new(1));
        let handler = RetryHandler::new(flaky.clone(), 3, Duration::from_millis(30));

        let started = std::time::Instant::now();
        handler.process(&message()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
