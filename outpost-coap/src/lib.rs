//! Minimal CoAP request/response transport over UDP.
//!
//! Message framing comes from [`coap_lite`]; this crate adds what that
//! library deliberately leaves out: sockets, confirmable retransmission
//! with exponential backoff, token correlation, and a server receive loop
//! that dispatches requests to a handler.
//!
//! Only the slice of RFC 7252 this system needs is implemented: piggybacked
//! and separate responses on the client side, piggybacked responses on the
//! server side, no observe, no block-wise transfers.

use std::{
    net::SocketAddr,
    time::Duration,
};

use coap_lite::{
    CoapOption,
    Packet,
};
pub use coap_lite::{
    RequestType,
    ResponseType,
};
use rand::Rng;

pub mod client;
pub mod server;

/// Largest datagram either side will send or accept.
///
/// Everything this transport carries is a few hundred bytes, so a single
/// ethernet-safe MTU is plenty.
pub const MAX_DATAGRAM_LENGTH: usize = 1472;

/// Retransmission parameters from RFC 7252 §4.8.
///
/// The defaults are the protocol defaults. Tests shrink them to keep
/// failure cases fast.
#[derive(Clone, Copy, Debug)]
pub struct TransmissionParameters {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,

    /// How long to keep waiting for a separate response after the request
    /// was acknowledged.
    pub max_transmit_wait: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_transmit_wait: Duration::from_secs(93),
        }
    }
}

impl TransmissionParameters {
    /// Initial retransmission timeout: `ack_timeout` scaled by a random
    /// factor in `1.0..=ack_random_factor`.
    fn initial_timeout(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        self.ack_timeout.mul_f64(factor)
    }
}

/// An incoming request as seen by a [`server::Handler`].
#[derive(Clone, Debug)]
pub struct Request {
    pub method: RequestType,
    pub path: String,
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

/// A response, either produced by a handler or returned to a client.
#[derive(Clone, Debug)]
pub struct Response {
    pub code: ResponseType,
    pub payload: Vec<u8>,
}

impl Response {
    /// A response with the given code and no payload.
    pub fn empty(code: ResponseType) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }
}

/// Joins the Uri-Path options of a packet into a `/`-separated path.
fn uri_path(packet: &Packet) -> String {
    let mut path = String::new();
    if let Some(segments) = packet.get_option(CoapOption::UriPath) {
        for segment in segments {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Adds a `/`-separated path to a packet as Uri-Path options.
fn set_uri_path(packet: &mut Packet, path: &str) {
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
}
