use std::io::BufRead;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Asks the operator to confirm before a session continues. Implementations must suspend the
///  calling task rather than blocking the runtime thread, so other sessions (in particular the
///  Blit control listener) keep running while a prompt is pending.
#[async_trait]
pub trait OperatorPrompt: Send + Sync + 'static {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<()>;
}

/// Prompts on stderr and waits for a line on stdin. The read happens on tokio's blocking pool;
///  concurrent prompts are answered one after the other.
#[derive(Default)]
pub struct StdinPrompt {
    serializer: Mutex<()>,
}

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<()> {
        let _guard = self.serializer.lock().await;

        eprintln!("{}", prompt);
        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)
        }).await??;

        if read == 0 {
            bail!("stdin is closed");
        }
        Ok(())
    }
}
