use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::plug::operator_prompt::OperatorPrompt;
use crate::plug::peer::PeerOutlet;
use crate::plug::session::{Deferred, Session};
use crate::plug::shutdown::{Shutdown, StopReason};

/// Shared access to a data [Session]. Transport drivers and the Blit control server both go
///  through the same lock, so every event is processed atomically with respect to all others.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
    prompt: Arc<dyn OperatorPrompt>,
    stop: Shutdown,
}

impl SessionHandle {
    pub fn new(session: Session, prompt: Arc<dyn OperatorPrompt>) -> SessionHandle {
        SessionHandle {
            session: Arc::new(Mutex::new(session)),
            prompt,
            stop: Shutdown::new(),
        }
    }

    /// Triggered when the session is over, i.e. when a client lost its connection
    pub fn stop_signal(&self) -> &Shutdown {
        &self.stop
    }

    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    pub async fn name(&self) -> String {
        self.lock().await.name()
    }

    pub async fn on_connected(&self, addr: SocketAddr, outlet: &PeerOutlet) {
        if let Err(e) = self.lock().await.on_connected(addr, outlet) {
            warn!("error initiating conversation with {}: {}", addr, e);
        }
    }

    pub async fn initiate(&self, target: SocketAddr) -> anyhow::Result<()> {
        self.lock().await.initiate(target)
    }

    pub async fn on_inbound(&self, addr: SocketAddr, outlet: &PeerOutlet, data: Bytes) {
        let deferred = self.lock().await.on_inbound(addr, outlet, data);
        match deferred {
            Ok(None) => {}
            Ok(Some(deferred)) => self.spawn_deferred(deferred),
            Err(e) => warn!("error handling data from {}: {}", addr, e),
        }
    }

    pub async fn on_connection_closed(&self, addr: SocketAddr) {
        if self.lock().await.on_connection_closed(addr) {
            self.stop.trigger(StopReason::ConnectionClosed);
        }
    }

    pub async fn on_connect_failed(&self) {
        if self.lock().await.on_connect_failed() {
            self.stop.trigger(StopReason::ConnectionClosed);
        }
    }

    pub async fn on_socket_closed(&self) {
        if self.lock().await.on_socket_closed() {
            self.stop.trigger(StopReason::ConnectionClosed);
        }
    }

    /// Runs deferred work in a task of its own, so a pending operator prompt holds neither the
    ///  session lock nor the task that reads from the transport.
    fn spawn_deferred(&self, deferred: Deferred) {
        let handle = self.clone();
        tokio::spawn(async move {
            match deferred {
                Deferred::Confirm { peer, position } => {
                    let prompt = format!(">> Hit [enter] to continue at {}:", position);
                    if let Err(e) = handle.prompt.confirm(&prompt).await {
                        warn!("no confirmation from operator: {}", e);
                        return;
                    }
                    if handle.stop.is_triggered() {
                        debug!("session was stopped while waiting for the operator");
                        return;
                    }
                    if let Err(e) = handle.lock().await.feed_to(peer) {
                        warn!("error feeding {}: {}", peer, e);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::plug::behavior::Behavior;
    use crate::plug::feed::{FeedEngine, FeedOptions};
    use crate::plug::peer::StreamCommand;
    use crate::plug::peer_registry::PeerRegistry;
    use crate::plug::plug_config::SessionRole;
    use crate::test_util::{stream_outlet, test_addr, ChannelPrompt, PromptRequest, RecordingDumpSink};

    fn step_handle(role: SessionRole) -> (SessionHandle, tokio::sync::mpsc::UnboundedReceiver<PromptRequest>) {
        let feed = FeedEngine::new(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")], FeedOptions { step: true, ..FeedOptions::default() });
        let session = Session::new(role, PeerRegistry::new_tcp(Arc::new(RecordingDumpSink::default())), Behavior::Feed(feed));
        let (prompt, prompts) = ChannelPrompt::new();
        (SessionHandle::new(session, Arc::new(prompt)), prompts)
    }

    #[tokio::test]
    async fn test_step_waits_for_operator_without_holding_lock() {
        let (handle, mut prompts) = step_handle(SessionRole::Server);
        let (outlet, mut rx) = stream_outlet();

        handle.on_connected(test_addr(1), &outlet).await;
        handle.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"x")).await;

        let (prompt, confirm) = prompts.recv().await.unwrap();
        assert_eq!(prompt, ">> Hit [enter] to continue at 0:");
        assert!(rx.try_recv().is_err());

        // the session stays usable while the prompt is pending
        assert_eq!(handle.lock().await.peer_listing().len(), 1);

        confirm.send(()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), StreamCommand::Write(Bytes::from_static(b"one")));
    }

    #[tokio::test]
    async fn test_declined_prompt_does_not_advance() {
        let (handle, mut prompts) = step_handle(SessionRole::Server);
        let (outlet, mut rx) = stream_outlet();

        handle.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"x")).await;
        let (_, confirm) = prompts.recv().await.unwrap();
        drop(confirm);

        handle.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"y")).await;
        let (prompt, confirm) = prompts.recv().await.unwrap();
        assert_eq!(prompt, ">> Hit [enter] to continue at 0:");
        confirm.send(()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), StreamCommand::Write(Bytes::from_static(b"one")));
    }

    #[tokio::test]
    async fn test_client_close_triggers_stop() {
        let (handle, _) = step_handle(SessionRole::Client);
        let (outlet, _rx) = stream_outlet();
        handle.on_connected(test_addr(1), &outlet).await;

        handle.on_connection_closed(test_addr(1)).await;
        assert_eq!(handle.stop_signal().reason(), Some(StopReason::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_server_close_keeps_running() {
        let (handle, _) = step_handle(SessionRole::Server);
        let (outlet, _rx) = stream_outlet();
        handle.on_connected(test_addr(1), &outlet).await;

        handle.on_connection_closed(test_addr(1)).await;
        assert_eq!(handle.stop_signal().reason(), None);
    }
}
