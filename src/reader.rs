//! Inbound half of a socket session.
//!
//! The reader parses frames and handles the ones it can on its own: it
//! routes MSG/HMSG, answers PING and resolves PONGs. INFO, `-ERR` and the
//! end of the session are reported to the supervisor as [`InboundEvent`]s.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionInner;
use crate::error::{NatsError, Result};
use crate::handler::registry::RouteOutcome;
use crate::message::Message;
use crate::protocol::{Frame, FrameBuffer, ServerInfo};
use crate::writer::OutboundFrame;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What the reader tells the supervisor.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    /// The server sent a new INFO.
    ServerInfo(Box<ServerInfo>),
    /// The server sent `-ERR`.
    ServerError(String),
    /// The session ended with this error.
    Closed(NatsError),
}

/// Run until the socket fails or `cancel` fires.
///
/// `buffer` may already hold bytes read during the handshake.
pub(crate) async fn reader_loop<R>(
    mut reader: R,
    mut buffer: FrameBuffer,
    inner: Arc<ConnectionInner>,
    events: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    match read_frames(&mut reader, &mut buffer, &inner, &events, &cancel).await {
        Ok(()) => tracing::debug!("Reader cancelled"),
        Err(e) => {
            tracing::debug!("Reader stopped: {}", e);
            let _ = events.send(InboundEvent::Closed(e)).await;
        }
    }
}

async fn read_frames<R>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    inner: &ConnectionInner,
    events: &mpsc::Sender<InboundEvent>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        while let Some(frame) = buffer.try_next()? {
            dispatch_frame(frame, inner, events).await?;
        }

        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            n = reader.read(&mut buf) => n?,
        };
        if n == 0 {
            return Err(NatsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        buffer.extend(&buf[..n]);
    }
}

async fn dispatch_frame(
    frame: Frame,
    inner: &ConnectionInner,
    events: &mpsc::Sender<InboundEvent>,
) -> Result<()> {
    match frame {
        Frame::Msg(msg) => deliver(inner, msg.into()),
        Frame::HMsg(msg) => deliver(inner, msg.into()),
        Frame::Ping => {
            inner
                .writer
                .send_control(OutboundFrame::encode(&Frame::Pong)?)
                .await?
        }
        Frame::Pong => inner.pongs.resolve_next(),
        Frame::Ok => {}
        Frame::Info(info) => {
            let _ = events.send(InboundEvent::ServerInfo(info)).await;
        }
        Frame::Err(message) => {
            inner.diagnostics.server_error(&message);
            let _ = events.send(InboundEvent::ServerError(message)).await;
        }
        other => {
            return Err(NatsError::Parse(format!(
                "unexpected {} from server",
                other.verb().as_str()
            )))
        }
    }
    Ok(())
}

fn deliver(inner: &ConnectionInner, message: Message) {
    match inner.registry.route(message) {
        RouteOutcome::Delivered => {}
        RouteOutcome::Dropped { sid, subject } => inner.diagnostics.slow_consumer(&sid, &subject),
        RouteOutcome::Unknown => tracing::trace!("Message for a removed subscription"),
    }
}
