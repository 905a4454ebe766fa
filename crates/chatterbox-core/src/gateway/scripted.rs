//! Deterministic gateway for tests: replays a fixed list of fragments and
//! then ends the way it was told to.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{GenerationStream, ModelGateway, STREAM_BUFFER, StreamChunk};
use crate::error::GatewayError;

#[derive(Debug, Clone)]
enum Ending {
    Done,
    Fail(GatewayError),
    /// Close the channel with no terminal chunk.
    HangUp,
}

#[derive(Debug)]
pub struct ScriptedGateway {
    fragments: Vec<String>,
    ending: Ending,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    /// Streams `fragments`, then completes. The blocking call returns their
    /// concatenation.
    pub fn streaming<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ending: Ending::Done,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Streams `fragments`, then fails with `error`. The blocking call fails.
    pub fn failing_after<I, S>(fragments: I, error: GatewayError) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { ending: Ending::Fail(error), ..Self::streaming(fragments) }
    }

    /// Streams `fragments`, then closes without a completion signal.
    pub fn hanging_up_after<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { ending: Ending::HangUp, ..Self::streaming(fragments) }
    }

    /// Sleep this long before every emitted chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn record(&self, prompt: &str) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_owned());
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate_complete(&self, prompt: &str) -> Result<String, GatewayError> {
        self.record(prompt);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.ending {
            Ending::Done => Ok(self.fragments.concat()),
            Ending::Fail(e) => Err(e.clone()),
            Ending::HangUp => Err(GatewayError::Incomplete),
        }
    }

    async fn generate_stream(&self, prompt: &str) -> Result<GenerationStream, GatewayError> {
        self.record(prompt);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let fragments = self.fragments.clone();
        let ending = self.ending.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            let last = match ending {
                Ending::Done => Some(StreamChunk::Done),
                Ending::Fail(e) => Some(StreamChunk::Error(e)),
                Ending::HangUp => None,
            };
            let chunks = fragments.into_iter().map(StreamChunk::Token).chain(last);
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
