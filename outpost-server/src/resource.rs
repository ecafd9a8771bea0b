//! Request handling: the position resource and the health resource.

use outpost_coap::{
    Request,
    RequestType,
    Response,
    ResponseType,
    server::Handler,
};
use outpost_proto::{
    POSITION_PATH,
    batch,
    envelope::{
        self,
        Psk,
    },
};

use crate::sink::Sink;

pub const HEALTH_PATH: &str = "/health";

/// All resources the server answers for.
///
/// `POST /position` takes a sealed batch; `GET /health` reports sink
/// health. Every other method/path combination is answered with 4.05.
#[derive(Debug)]
pub struct Resources<S> {
    psk: Psk,
    sink: S,
}

impl<S: Sink> Resources<S> {
    pub fn new(psk: Psk, sink: S) -> Self {
        Self { psk, sink }
    }

    async fn position(&mut self, payload: &[u8]) -> Response {
        let plaintext = match envelope::open(&self.psk, payload) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                tracing::warn!(?error, "rejecting envelope");
                return Response::empty(ResponseType::Unauthorized);
            }
        };

        let fixes = match batch::decode(&plaintext) {
            Ok(fixes) => fixes,
            Err(error) => {
                // a valid key never produces a malformed batch, so this is
                // answered exactly like an authentication failure
                tracing::warn!(?error, "rejecting undecodable batch");
                return Response::empty(ResponseType::Unauthorized);
            }
        };

        match self.sink.append(&fixes).await {
            Ok(()) => {
                tracing::info!(samples = fixes.len(), "stored batch");
                Response::empty(ResponseType::Changed)
            }
            Err(error) => {
                tracing::error!(?error, "sink failed to store batch");
                Response::empty(ResponseType::InternalServerError)
            }
        }
    }

    async fn health(&mut self) -> Response {
        let status = if self.sink.healthy().await {
            "healthy"
        }
        else {
            "unhealthy"
        };

        Response {
            code: ResponseType::Content,
            payload: serde_json::json!({ "status": status })
                .to_string()
                .into_bytes(),
        }
    }
}

impl<S: Sink> Handler for Resources<S> {
    async fn handle(&mut self, request: Request) -> Response {
        match (request.method, request.path.as_str()) {
            (RequestType::Post, POSITION_PATH) => self.position(&request.payload).await,
            (RequestType::Get, HEALTH_PATH) => self.health().await,
            _ => Response::empty(ResponseType::MethodNotAllowed),
        }
    }
}
