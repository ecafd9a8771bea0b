//! The client pipeline: sentences in, sealed batches out.
//!
//! Three cooperating tasks connected by channels:
//!
//! - [`Collector`] reads the sentence stream, assembles fixes (carrying the
//!   RMC date over to GGA sentences) and drops near-duplicates.
//! - [`Flusher`] owns the batch buffer and decides when to flush: at
//!   capacity, or when the oldest buffered fix exceeds the flush interval.
//! - [`Shipper`] encodes, seals and posts one batch at a time.
//!
//! The batch channel has capacity one, which is what bounds the pipeline to
//! a single in-flight send: while the shipper is busy the flusher keeps
//! buffering, and once the buffer is full it evicts the oldest fix. A batch
//! that fails to send is dropped, never requeued.

use std::{
    collections::VecDeque,
    time::Duration,
};

use chrono::NaiveDate;
use futures_util::{
    Stream,
    StreamExt,
    pin_mut,
};
use outpost_coap::{
    ResponseType,
    client::Client,
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
use tokio::{
    select,
    sync::mpsc,
    time::{
        Instant,
        sleep_until,
    },
};
use tokio_util::sync::CancellationToken;

use crate::nmea::{
    self,
    Sentence,
};

/// Samples per batch before a flush is forced.
pub const BATCH_CAPACITY: usize = batch::MAX_SAMPLES;

const KNOTS_TO_KMH: f64 = 1.852;

/// Turns sentences into filtered fixes.
#[derive(Debug)]
pub struct Collector {
    similarity_threshold: f64,
    current_date: Option<NaiveDate>,
    last_accepted: Option<Fix>,
}

impl Collector {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
            current_date: None,
            last_accepted: None,
        }
    }

    pub async fn run<S>(
        mut self,
        sentences: S,
        fixes: mpsc::Sender<Fix>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = Result<Sentence, nmea::Error>>,
    {
        pin_mut!(sentences);

        loop {
            let sentence = select! {
                _ = shutdown.cancelled() => break,
                sentence = sentences.next() => sentence,
            };

            match sentence {
                None => {
                    tracing::info!("sentence source ended");
                    break;
                }
                Some(Err(error)) => {
                    tracing::debug!(?error, "skipping unreadable sentence");
                }
                Some(Ok(sentence)) => {
                    if let Some(fix) = self.fix_from_sentence(sentence) {
                        if self.accept(fix) {
                            tracing::debug!(
                                latitude = fix.latitude,
                                longitude = fix.longitude,
                                "accepted fix"
                            );
                            if fixes.send(fix).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Assembles a fix from one sentence, if it carries a usable one.
    ///
    /// RMC updates the date carried over to GGA sentences, which only have
    /// a time of day. GGA fixes before the first dated RMC are skipped.
    fn fix_from_sentence(&mut self, sentence: Sentence) -> Option<Fix> {
        match sentence {
            Sentence::Rmc(rmc) => {
                if !rmc.valid {
                    return None;
                }
                let date = rmc.date?;
                self.current_date = Some(date);

                Some(Fix {
                    time: date.and_time(rmc.time?).and_utc(),
                    latitude: rmc.latitude?,
                    longitude: rmc.longitude?,
                    altitude: 0.0,
                    speed: rmc.speed_knots.map_or(0.0, |knots| knots * KNOTS_TO_KMH),
                })
            }
            Sentence::Gga(gga) => {
                if gga.fix_quality == 0 {
                    return None;
                }
                let date = self.current_date?;

                Some(Fix {
                    time: date.and_time(gga.time?).and_utc(),
                    latitude: gga.latitude?,
                    longitude: gga.longitude?,
                    altitude: gga.altitude.unwrap_or(0.0),
                    speed: 0.0,
                })
            }
            Sentence::Other => None,
        }
    }

    /// A fix is accepted only when it moved at least the threshold on both
    /// axes since the last accepted fix. The first fix is always accepted.
    fn accept(&mut self, fix: Fix) -> bool {
        if let Some(last) = &self.last_accepted {
            if (fix.latitude - last.latitude).abs() < self.similarity_threshold
                || (fix.longitude - last.longitude).abs() < self.similarity_threshold
            {
                return false;
            }
        }

        self.last_accepted = Some(fix);
        true
    }
}

/// Owns the batch buffer and the flush schedule.
#[derive(Debug)]
pub struct Flusher {
    flush_interval: Duration,
    buffer: VecDeque<Fix>,
    deadline: Option<Instant>,
    flush_requested: bool,
}

impl Flusher {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            buffer: VecDeque::with_capacity(BATCH_CAPACITY),
            deadline: None,
            flush_requested: false,
        }
    }

    pub async fn run(
        mut self,
        mut fixes: mpsc::Receiver<Fix>,
        batches: mpsc::Sender<Vec<Fix>>,
        shutdown: CancellationToken,
    ) {
        loop {
            select! {
                _ = shutdown.cancelled() => break,

                fix = fixes.recv() => {
                    match fix {
                        None => break,
                        Some(fix) => self.push(fix),
                    }
                }

                _ = sleep_until(self.deadline.unwrap_or_else(Instant::now)),
                    if self.deadline.is_some() && !self.flush_requested =>
                {
                    tracing::debug!(samples = self.buffer.len(), "flushing on timer");
                    self.flush_requested = true;
                }

                permit = batches.reserve(), if self.flush_requested => {
                    let Ok(permit) = permit else { break };
                    permit.send(self.buffer.drain(..).collect());
                    self.flush_requested = false;
                    self.deadline = None;
                }
            }
        }
    }

    fn push(&mut self, fix: Fix) {
        if self.buffer.is_empty() {
            self.deadline = Some(Instant::now() + self.flush_interval);
        }

        if self.buffer.len() >= BATCH_CAPACITY {
            // the previous batch is still in flight; ring semantics
            self.buffer.pop_front();
            tracing::warn!("buffer full while a send is in flight, evicting oldest fix");
        }
        self.buffer.push_back(fix);

        if self.buffer.len() >= BATCH_CAPACITY {
            tracing::debug!("flushing on capacity");
            self.flush_requested = true;
        }
    }
}

/// Encodes, seals and posts batches, one at a time.
#[derive(Debug)]
pub struct Shipper {
    client: Client,
    psk: Psk,
}

impl Shipper {
    pub fn new(client: Client, psk: Psk) -> Self {
        Self { client, psk }
    }

    pub async fn run(mut self, mut batches: mpsc::Receiver<Vec<Fix>>, shutdown: CancellationToken) {
        loop {
            select! {
                _ = shutdown.cancelled() => break,

                batch = batches.recv() => {
                    let Some(batch) = batch else { break };
                    select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.ship(batch) => {}
                    }
                }
            }
        }
    }

    /// One delivery attempt. Whatever the outcome, the batch is gone
    /// afterwards; steady state never blocks on a failing uplink.
    async fn ship(&mut self, batch: Vec<Fix>) {
        let samples = batch.len();

        let payload = match batch::encode(&batch) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(?error, "failed to encode batch");
                return;
            }
        };
        let sealed = envelope::seal(&self.psk, &payload);

        match self.client.post(POSITION_PATH, sealed).await {
            Ok(response) => {
                match response.code {
                    ResponseType::Changed => {
                        tracing::info!(samples, "batch delivered");
                    }
                    ResponseType::Unauthorized => {
                        tracing::error!(
                            samples,
                            "server rejected the batch; the pre-shared keys don't match"
                        );
                    }
                    code => {
                        tracing::warn!(?code, samples, "server couldn't store the batch, dropping it");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?error, samples, "send failed, dropping batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;
    use futures_util::stream;
    use outpost_coap::{
        TransmissionParameters,
        client::Client,
    };
    use outpost_proto::{
        Fix,
        envelope::Psk,
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{
        BATCH_CAPACITY,
        Collector,
        Flusher,
        Shipper,
    };
    use crate::nmea::{
        self,
        Sentence,
    };

    fn fix(latitude: f64, longitude: f64) -> Fix {
        Fix {
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            latitude,
            longitude,
            altitude: 0.0,
            speed: 0.0,
        }
    }

    #[test]
    fn it_accepts_only_the_first_of_identical_fixes() {
        let mut collector = Collector::new(0.0001);
        assert!(collector.accept(fix(45.0, -120.0)));
        assert!(!collector.accept(fix(45.0, -120.0)));
        assert!(!collector.accept(fix(45.0, -120.0)));
    }

    #[test]
    fn it_requires_movement_on_both_axes() {
        let mut collector = Collector::new(0.0001);
        assert!(collector.accept(fix(45.0, -120.0)));
        assert!(!collector.accept(fix(45.001, -120.0)));
        assert!(!collector.accept(fix(45.0, -120.001)));
        assert!(collector.accept(fix(45.001, -120.001)));
    }

    #[test]
    fn it_compares_against_the_last_accepted_fix() {
        let mut collector = Collector::new(0.0001);
        assert!(collector.accept(fix(45.0, -120.0)));
        assert!(!collector.accept(fix(45.00005, -120.00005)));
        // still compared against the first fix, not the rejected one
        assert!(collector.accept(fix(45.0001, -120.0001)));
    }

    #[test]
    fn it_carries_the_rmc_date_to_gga_fixes() {
        let mut collector = Collector::new(0.0001);

        let gga: Sentence = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47"
            .parse()
            .unwrap();
        assert_eq!(collector.fix_from_sentence(gga.clone()), None);

        let rmc: Sentence = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A"
            .parse()
            .unwrap();
        let from_rmc = collector.fix_from_sentence(rmc).unwrap();
        assert_eq!(from_rmc.altitude, 0.0);
        assert!((from_rmc.speed - 22.4 * 1.852).abs() < 1e-9);

        let from_gga = collector.fix_from_sentence(gga).unwrap();
        assert_eq!(from_gga.time, from_rmc.time);
        assert_eq!(from_gga.altitude, 545.4);
        assert_eq!(from_gga.speed, 0.0);
    }

    #[test]
    fn it_skips_void_sentences() {
        let mut collector = Collector::new(0.0001);
        let void: Sentence = "$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*7D"
            .parse()
            .unwrap();
        assert_eq!(collector.fix_from_sentence(void), None);
        let no_fix: Sentence = "$GPGGA,123520,4807.040,N,01131.002,E,0,08,0.9,545.4,M,46.9,M,,*41"
            .parse()
            .unwrap();
        assert_eq!(collector.fix_from_sentence(no_fix), None);
    }

    #[tokio::test]
    async fn it_streams_filtered_fixes() {
        let sentences: Vec<Result<Sentence, nmea::Error>> = vec![
            Ok("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A"
                .parse()
                .unwrap()),
            // same position: filtered
            Ok("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47"
                .parse()
                .unwrap()),
        ];

        let (sender, mut receiver) = mpsc::channel(8);
        Collector::new(0.0001)
            .run(stream::iter(sentences), sender, CancellationToken::new())
            .await;

        let first = receiver.recv().await.unwrap();
        assert!((first.latitude - 48.1173).abs() < 1e-6);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn it_flushes_at_capacity_and_starts_a_fresh_buffer() {
        let (fix_sender, fix_receiver) = mpsc::channel(64);
        let (batch_sender, mut batch_receiver) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        tokio::spawn(
            Flusher::new(Duration::from_secs(60)).run(fix_receiver, batch_sender, shutdown.clone()),
        );

        for i in 0..BATCH_CAPACITY {
            fix_sender.send(fix(45.0 + i as f64 * 1e-4, -120.0)).await.unwrap();
        }
        let batch = batch_receiver.recv().await.unwrap();
        assert_eq!(batch.len(), BATCH_CAPACITY);

        // the next fix starts a new buffer which flushes on the timer
        fix_sender.send(fix(46.0, -121.0)).await.unwrap();
        let batch = batch_receiver.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].latitude, 46.0);

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn it_flushes_a_partial_buffer_on_the_timer() {
        let (fix_sender, fix_receiver) = mpsc::channel(64);
        let (batch_sender, mut batch_receiver) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        tokio::spawn(
            Flusher::new(Duration::from_secs(60)).run(fix_receiver, batch_sender, shutdown.clone()),
        );

        fix_sender.send(fix(45.0, -120.0)).await.unwrap();
        let batch = batch_receiver.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        shutdown.cancel();
    }

    #[test]
    fn it_evicts_the_oldest_fix_when_full_and_blocked() {
        let mut flusher = Flusher::new(Duration::from_secs(60));
        for i in 0..=BATCH_CAPACITY {
            flusher.push(fix(45.0 + i as f64 * 1e-4, -120.0));
        }

        assert_eq!(flusher.buffer.len(), BATCH_CAPACITY);
        assert!(flusher.flush_requested);
        // the first fix is gone
        assert_eq!(flusher.buffer[0].latitude, 45.0001);
    }

    #[tokio::test]
    async fn it_drops_the_batch_when_the_send_times_out() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Client::connect(silent.local_addr().unwrap())
            .await
            .unwrap()
            .with_parameters(TransmissionParameters {
                ack_timeout: Duration::from_millis(10),
                ack_random_factor: 1.0,
                max_retransmit: 1,
                max_transmit_wait: Duration::from_millis(50),
            });

        let mut shipper = Shipper::new(client, Psk::from_bytes([0; 32]));
        let batch = (0..5).map(|i| fix(45.0 + i as f64 * 1e-4, -120.0)).collect();
        // completes by dropping the batch; the pipeline carries on
        shipper.ship(batch).await;
    }
}
