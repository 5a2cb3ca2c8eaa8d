use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::plug::operator_prompt::OperatorPrompt;

/// A prompt text, and the sender the test uses to confirm it. Dropping the sender declines.
pub type PromptRequest = (String, oneshot::Sender<()>);

/// An [OperatorPrompt] that hands every prompt to the test code
pub struct ChannelPrompt {
    requests: mpsc::UnboundedSender<PromptRequest>,
}

impl ChannelPrompt {
    pub fn new() -> (ChannelPrompt, mpsc::UnboundedReceiver<PromptRequest>) {
        let (requests, receiver) = mpsc::unbounded_channel();
        (ChannelPrompt { requests }, receiver)
    }
}

#[async_trait]
impl OperatorPrompt for ChannelPrompt {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.requests.send((prompt.to_string(), sender))
            .map_err(|_| anyhow!("nobody is answering prompts"))?;
        receiver.await
            .map_err(|_| anyhow!("prompt was declined"))
    }
}
