//! Plain TCP transport.

use tokio::net::TcpStream;

use super::{BoxedStream, ServerAddr, Transport};
use crate::error::Result;
use crate::handler::BoxFuture;

/// Connects with `TcpStream` and disables Nagle's algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, addr: &'a ServerAddr) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
            stream.set_nodelay(true)?;
            tracing::debug!(server = %addr, "TCP connected");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
