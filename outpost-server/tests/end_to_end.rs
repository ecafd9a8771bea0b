//! Loopback scenarios: a real client transport against a real bound server
//! with the in-memory sink.

use std::net::SocketAddr;

use chrono::DateTime;
use outpost_coap::{
    RequestType,
    ResponseType,
    client::Client,
    server::Server,
};
use outpost_proto::{
    Fix,
    POSITION_PATH,
    batch,
    envelope::{
        self,
        Psk,
    },
};
use outpost_server::{
    resource::Resources,
    sink::MemorySink,
};
use tokio_util::sync::CancellationToken;

fn psk() -> Psk {
    Psk::from_bytes([0; 32])
}

fn fix(ts: i64, latitude: f64, longitude: f64, altitude: f64, speed: f64) -> Fix {
    Fix {
        time: DateTime::from_timestamp(ts, 0).unwrap(),
        latitude,
        longitude,
        altitude,
        speed,
    }
}

async fn start_server(sink: MemorySink) -> (SocketAddr, CancellationToken) {
    let shutdown = CancellationToken::new();
    let server = Server::bind("127.0.0.1:0")
        .await
        .unwrap()
        .with_shutdown(shutdown.clone());
    let address = server.local_addr().unwrap();

    tokio::spawn(async move {
        server.serve(Resources::new(psk(), sink)).await.unwrap();
    });

    (address, shutdown)
}

#[tokio::test]
async fn it_accepts_a_single_sample_batch() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let input = fix(1_700_000_000, 45.0, -120.0, 500.0, 0.0);
    let payload = batch::encode(&[input]).unwrap();
    assert_eq!(payload.len(), 16);
    let sealed = envelope::seal(&psk(), &payload);
    assert_eq!(sealed.len(), 44);

    let response = client.post(POSITION_PATH, sealed).await.unwrap();
    assert_eq!(response.code, ResponseType::Changed);
    assert!(response.payload.is_empty());

    let stored = sink.fixes();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].time, input.time);
    assert!((stored[0].latitude - input.latitude).abs() < 1e-7);
    assert!((stored[0].longitude - input.longitude).abs() < 1e-7);
    assert_eq!(stored[0].altitude, input.altitude);
    assert_eq!(stored[0].speed, input.speed);
}

#[tokio::test]
async fn it_accepts_a_full_batch() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let fixes: Vec<Fix> = (0..40)
        .map(|i| {
            fix(
                1_700_000_000 + i as i64,
                48.1 + i as f64 * 1e-4,
                11.5 + i as f64 * 1e-4,
                520.0,
                15.0,
            )
        })
        .collect();
    let payload = batch::encode(&fixes).unwrap();
    assert_eq!(payload.len(), 367);
    let sealed = envelope::seal(&psk(), &payload);
    assert_eq!(sealed.len(), 395);

    let response = client.post(POSITION_PATH, sealed).await.unwrap();
    assert_eq!(response.code, ResponseType::Changed);

    let stored = sink.fixes();
    assert_eq!(stored.len(), 40);
    for (output, input) in stored.iter().zip(&fixes) {
        assert_eq!(output.time, input.time);
        assert!((output.latitude - input.latitude).abs() < 1e-4);
        assert!((output.longitude - input.longitude).abs() < 1e-4);
    }
}

#[tokio::test]
async fn it_rejects_a_tampered_envelope() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let payload = batch::encode(&[fix(1_700_000_000, 45.0, -120.0, 500.0, 0.0)]).unwrap();
    let mut sealed = envelope::seal(&psk(), &payload);
    let last = sealed.len() - 1;
    sealed[last] ^= 1;

    let response = client.post(POSITION_PATH, sealed).await.unwrap();
    assert_eq!(response.code, ResponseType::Unauthorized);
    assert!(sink.fixes().is_empty());
}

#[tokio::test]
async fn it_rejects_an_envelope_under_a_different_key() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let payload = batch::encode(&[fix(1_700_000_000, 45.0, -120.0, 500.0, 0.0)]).unwrap();
    let sealed = envelope::seal(&Psk::from_bytes([7; 32]), &payload);

    let response = client.post(POSITION_PATH, sealed).await.unwrap();
    assert_eq!(response.code, ResponseType::Unauthorized);
    assert!(sink.fixes().is_empty());
}

#[tokio::test]
async fn it_rejects_garbage_payloads() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let response = client.post(POSITION_PATH, b"short".to_vec()).await.unwrap();
    assert_eq!(response.code, ResponseType::Unauthorized);
    assert!(sink.fixes().is_empty());
}

#[tokio::test]
async fn it_routes_only_post_on_the_position_path() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let payload = batch::encode(&[fix(1_700_000_000, 45.0, -120.0, 500.0, 0.0)]).unwrap();
    let sealed = envelope::seal(&psk(), &payload);

    let response = client.post("/elsewhere", sealed.clone()).await.unwrap();
    assert_eq!(response.code, ResponseType::MethodNotAllowed);

    let response = client
        .request(RequestType::Get, POSITION_PATH, sealed)
        .await
        .unwrap();
    assert_eq!(response.code, ResponseType::MethodNotAllowed);

    assert!(sink.fixes().is_empty());
}

#[tokio::test]
async fn it_answers_internal_server_error_when_the_sink_fails() {
    let sink = MemorySink::new();
    sink.set_failing(true);
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let payload = batch::encode(&[fix(1_700_000_000, 45.0, -120.0, 500.0, 0.0)]).unwrap();
    let sealed = envelope::seal(&psk(), &payload);

    let response = client.post(POSITION_PATH, sealed).await.unwrap();
    assert_eq!(response.code, ResponseType::InternalServerError);
    assert!(sink.fixes().is_empty());
}

#[tokio::test]
async fn it_reports_sink_health() {
    let sink = MemorySink::new();
    let (address, _shutdown) = start_server(sink.clone()).await;
    let mut client = Client::connect(address).await.unwrap();

    let response = client
        .request(RequestType::Get, "/health", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.code, ResponseType::Content);
    assert_eq!(response.payload, br#"{"status":"healthy"}"#);

    sink.set_failing(true);
    let response = client
        .request(RequestType::Get, "/health", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.payload, br#"{"status":"unhealthy"}"#);
}
