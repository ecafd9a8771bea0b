//! UDP server loop with per-request dispatch to a handler.

use std::net::SocketAddr;

use coap_lite::{
    MessageClass,
    MessageType,
    Packet,
};
use tokio::net::{
    ToSocketAddrs,
    UdpSocket,
};
use tokio_util::sync::CancellationToken;

use crate::{
    MAX_DATAGRAM_LENGTH,
    Request,
    Response,
    uri_path,
};

#[derive(Debug, thiserror::Error)]
#[error("coap server error")]
pub enum Error {
    Io(#[from] std::io::Error),

    #[error("failed to encode response")]
    Encode(#[source] coap_lite::error::MessageError),
}

/// Application side of the server: one request in, one response out.
#[allow(async_fn_in_trait)]
pub trait Handler {
    async fn handle(&mut self, request: Request) -> Response;
}

/// A server bound to one UDP socket.
///
/// Requests are handled one at a time on the caller's task; the handler's
/// awaits are the only suspension points between receiving a request and
/// answering it.
#[derive(Debug)]
pub struct Server {
    socket: UdpSocket,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(address: A) -> Result<Self, Error> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self {
            socket,
            shutdown: CancellationToken::new(),
        })
    }

    /// Provide a [`CancellationToken`] with which the server can be shut
    /// down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives and answers requests until shut down.
    pub async fn serve<H: Handler>(self, mut handler: H) -> Result<(), Error> {
        tracing::debug!("waiting for requests");
        let mut buffer = [0; MAX_DATAGRAM_LENGTH];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buffer) => {
                    let (received, from) = result?;
                    if let Err(error) = self
                        .handle_datagram(&buffer[..received], from, &mut handler)
                        .await
                    {
                        tracing::error!(?error, %from, "failed to answer request");
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram<H: Handler>(
        &self,
        datagram: &[u8],
        from: SocketAddr,
        handler: &mut H,
    ) -> Result<(), Error> {
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::debug!(?error, %from, "undecodable datagram, ignoring");
                return Ok(());
            }
        };

        let method = match &packet.header.code {
            MessageClass::Request(method) => method.clone(),
            _ => {
                // stray ACK, response or empty message; nothing to answer
                return Ok(());
            }
        };

        let request_type = packet.header.get_type();
        if request_type != MessageType::Confirmable && request_type != MessageType::NonConfirmable {
            return Ok(());
        }

        let message_id = packet.header.message_id;
        let token = packet.get_token().to_vec();
        let request = Request {
            method,
            path: uri_path(&packet),
            payload: packet.payload,
            from,
        };

        let response = handler.handle(request).await;

        let mut reply = Packet::new();
        reply.header.set_type(match request_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        });
        reply.header.code = MessageClass::Response(response.code);
        reply.header.message_id = message_id;
        reply.set_token(token);
        reply.payload = response.payload;

        let datagram = reply.to_bytes().map_err(Error::Encode)?;
        self.socket.send_to(&datagram, from).await?;

        Ok(())
    }
}
