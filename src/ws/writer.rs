use futures_util::{Sink, SinkExt};
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{HubError, HubResult, WsFrame};

/// Writer actor that owns the transport sink and serializes writes.
///
/// The mailbox is the single write-ownership token for one physical connection: concurrent
/// callers queue their frames and each frame is written whole before the next one starts.
pub struct WsWriterActor<W>
where
    W: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    shutdown: CancellationToken,
}

impl<W> WsWriterActor<W>
where
    W: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    pub fn new(writer: W, shutdown: CancellationToken) -> Self {
        Self { writer, shutdown }
    }
}

impl<W> Actor for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = HubError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> HubResult<()> {
        // Best effort: the peer may already be gone.
        let _ = self.writer.send(WsFrame::close(1000, "client closing")).await;
        let _ = self.writer.close().await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "WsWriterActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

#[derive(Clone)]
pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    type Reply = HubResult<()>;

    async fn handle(
        &mut self,
        msg: WriterWrite,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.shutdown.is_cancelled() {
            return Err(HubError::InvalidState("writer stopped".to_string()));
        }
        debug!(target: "hub-ws-writer", "sending websocket frame to wire");
        self.writer.send(msg.frame).await
    }
}

/// Write one frame through the writer actor and wait for the sink to accept it.
pub(crate) async fn write_frame<W>(writer: &ActorRef<WsWriterActor<W>>, frame: WsFrame) -> HubResult<()>
where
    W: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static,
{
    match writer.ask(WriterWrite { frame }).await {
        Ok(()) => Ok(()),
        Err(SendError::HandlerError(err)) => Err(err),
        Err(err) => Err(HubError::ActorError(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::WsTransport;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_are_forwarded_in_order() {
        let (transport, mut hub) = MockTransport::new();
        let (_reader, sink) = transport
            .connect(
                "ws://mock".to_string(),
                Default::default(),
                Default::default(),
            )
            .await
            .expect("connect");
        let mut server = hub.next_connection().await.expect("server");

        let writer = WsWriterActor::spawn(WsWriterActor::new(sink, CancellationToken::new()));
        write_frame(&writer, WsFrame::text("one")).await.expect("write");
        write_frame(&writer, WsFrame::text("two")).await.expect("write");

        assert_eq!(server.recv_frame().await, Some(WsFrame::text("one")));
        assert_eq!(server.recv_frame().await, Some(WsFrame::text("two")));
        assert_eq!(transport.write_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_writer_rejects_frames() {
        let (transport, _hub) = MockTransport::new();
        let (_reader, sink) = transport
            .connect(
                "ws://mock".to_string(),
                Default::default(),
                Default::default(),
            )
            .await
            .expect("connect");
        let shutdown = CancellationToken::new();
        let writer = WsWriterActor::spawn(WsWriterActor::new(sink, shutdown.clone()));
        shutdown.cancel();

        let err = write_frame(&writer, WsFrame::text("late")).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidState(_)));
        assert_eq!(transport.write_count(), 0);
    }
}
