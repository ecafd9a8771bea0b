//! Confirmable CoAP client over a connected UDP socket.

use coap_lite::{
    MessageClass,
    MessageType,
    Packet,
    RequestType,
};
use tokio::{
    net::{
        ToSocketAddrs,
        UdpSocket,
    },
    time::{
        Instant,
        timeout_at,
    },
};

use crate::{
    MAX_DATAGRAM_LENGTH,
    Response,
    TransmissionParameters,
    set_uri_path,
};

#[derive(Debug, thiserror::Error)]
#[error("coap client error")]
pub enum Error {
    Io(#[from] std::io::Error),

    #[error("failed to encode message")]
    Encode(#[source] coap_lite::error::MessageError),

    /// The retransmission budget ran out without a response. Maps to the
    /// caller's transport-timeout handling.
    #[error("no response after {transmissions} transmissions")]
    Timeout { transmissions: u32 },

    /// The peer answered with a reset message.
    #[error("request rejected by peer")]
    Rejected,
}

/// Outcome of listening on the socket until a deadline.
enum Wait {
    Response(Response),
    Acknowledged,
    TimedOut,
}

/// A client bound to one server address.
///
/// The socket is connected, so stray datagrams from other peers never reach
/// us. One request is in flight at a time; retransmission and response
/// correlation happen inside [`post`][Self::post].
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    parameters: TransmissionParameters,
    next_message_id: u16,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(server: A) -> Result<Self, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;

        Ok(Self {
            socket,
            parameters: TransmissionParameters::default(),
            next_message_id: rand::random(),
        })
    }

    pub fn with_parameters(mut self, parameters: TransmissionParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sends a confirmable POST and waits for the matching response.
    pub async fn post(&mut self, path: &str, payload: Vec<u8>) -> Result<Response, Error> {
        self.request(RequestType::Post, path, payload).await
    }

    /// Sends a confirmable request and waits for the matching response.
    ///
    /// Retransmits with exponential backoff until a response or reset
    /// arrives, or the retransmission budget is exhausted. An empty ACK
    /// stops retransmission and extends the wait for a separate response.
    pub async fn request(
        &mut self,
        method: RequestType,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<Response, Error> {
        let message_id = self.next_message_id();
        let token: [u8; 8] = rand::random();
        let datagram = self.request_datagram(
            MessageType::Confirmable,
            method,
            message_id,
            &token,
            path,
            payload,
        )?;

        let mut timeout = self.parameters.initial_timeout();
        let mut transmissions = 0;

        loop {
            self.socket.send(&datagram).await?;
            transmissions += 1;
            tracing::trace!(message_id, transmissions, "request sent");

            let deadline = Instant::now() + timeout;
            match self.wait(message_id, &token, deadline).await? {
                Wait::Response(response) => return Ok(response),
                Wait::Acknowledged => {
                    // the server took the request and will answer in its
                    // own time; stop retransmitting
                    let deadline = Instant::now() + self.parameters.max_transmit_wait;
                    return match self.wait(message_id, &token, deadline).await? {
                        Wait::Response(response) => Ok(response),
                        _ => Err(Error::Timeout { transmissions }),
                    };
                }
                Wait::TimedOut => {
                    if transmissions > self.parameters.max_retransmit {
                        return Err(Error::Timeout { transmissions });
                    }
                    timeout *= 2;
                }
            }
        }
    }

    /// Sends a non-confirmable POST. Fire and forget: no retransmission,
    /// no response.
    pub async fn post_non_confirmable(
        &mut self,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let message_id = self.next_message_id();
        let token: [u8; 8] = rand::random();
        let datagram = self.request_datagram(
            MessageType::NonConfirmable,
            RequestType::Post,
            message_id,
            &token,
            path,
            payload,
        )?;

        self.socket.send(&datagram).await?;
        Ok(())
    }

    fn request_datagram(
        &self,
        message_type: MessageType,
        method: RequestType,
        message_id: u16,
        token: &[u8],
        path: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.code = MessageClass::Request(method);
        packet.header.message_id = message_id;
        packet.set_token(token.to_vec());
        set_uri_path(&mut packet, path);
        packet.payload = payload;

        packet.to_bytes().map_err(Error::Encode)
    }

    async fn wait(&self, message_id: u16, token: &[u8], deadline: Instant) -> Result<Wait, Error> {
        let mut buffer = [0; MAX_DATAGRAM_LENGTH];

        loop {
            let received = match timeout_at(deadline, self.socket.recv(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Ok(Wait::TimedOut),
            };

            let packet = match Packet::from_bytes(&buffer[..received]) {
                Ok(packet) => packet,
                Err(error) => {
                    tracing::debug!(?error, "undecodable datagram, ignoring");
                    continue;
                }
            };

            let code = packet.header.code.clone();
            match (packet.header.get_type(), code) {
                (MessageType::Reset, _) if packet.header.message_id == message_id => {
                    return Err(Error::Rejected);
                }
                (MessageType::Acknowledgement, MessageClass::Empty)
                    if packet.header.message_id == message_id =>
                {
                    return Ok(Wait::Acknowledged);
                }
                (message_type, MessageClass::Response(code)) if packet.get_token() == token => {
                    if message_type == MessageType::Confirmable {
                        self.acknowledge(packet.header.message_id).await?;
                    }
                    return Ok(Wait::Response(Response {
                        code,
                        payload: packet.payload,
                    }));
                }
                _ => {
                    tracing::trace!("unrelated datagram, ignoring");
                }
            }
        }
    }

    async fn acknowledge(&self, message_id: u16) -> Result<(), Error> {
        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.code = MessageClass::Empty;
        ack.header.message_id = message_id;

        self.socket
            .send(&ack.to_bytes().map_err(Error::Encode)?)
            .await?;
        Ok(())
    }

    fn next_message_id(&mut self) -> u16 {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        message_id
    }
}
