//! Transport module - how bytes reach a server.
//!
//! Provides:
//! - [`Transport`] - connects a [`ServerAddr`] and optionally upgrades the
//!   stream once the server's INFO is known (TLS lives here)
//! - [`TcpTransport`] - the default, plain TCP
//! - [`ServerAddr`] - parsed `nats://` / `tls://` addresses

mod addr;
mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{NatsError, Result};
use crate::handler::BoxFuture;
use crate::protocol::ServerInfo;

pub use addr::{ServerAddr, DEFAULT_PORT};
pub use tcp::TcpTransport;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream returned by transports.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to servers.
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `addr`.
    fn connect<'a>(&'a self, addr: &'a ServerAddr) -> BoxFuture<'a, Result<BoxedStream>>;

    /// Upgrade a freshly connected stream after INFO was read.
    ///
    /// The default passes the stream through and refuses servers that
    /// require TLS.
    fn upgrade<'a>(
        &'a self,
        stream: BoxedStream,
        addr: &'a ServerAddr,
        info: &'a ServerInfo,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            if info.requires_tls() || addr.tls {
                return Err(NatsError::Validation(format!(
                    "{} requires TLS; supply a Transport that implements upgrade",
                    addr
                )));
            }
            Ok(stream)
        })
    }
}
