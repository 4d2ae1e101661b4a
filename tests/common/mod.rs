//! Shared collaborators for admission integration tests
//!
//! The real puller and sink talk HTTP. These stand-ins record what the
//! service asked for so tests can assert on pull sizes, quota effects and
//! forwarded letters without any network.

#![allow(dead_code)]

use async_trait::async_trait;
use bigbro::admission::QueueDepth;
use bigbro::letter::{DecodeError, DecodedLetter, Decoder, HexDecoder, Letter};
use bigbro::puller::Puller;
use bigbro::sink::Sink;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Puller that remembers every requested count
#[derive(Default)]
pub struct RecordingPuller {
    requests: Mutex<Vec<usize>>,
}

impl RecordingPuller {
    pub fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }
}

impl Puller for RecordingPuller {
    fn request_more(&self, count: usize) {
        self.requests.lock().unwrap().push(count);
    }
}

/// Sink that hands every letter to a channel
pub struct ChannelSink {
    tx: flume::Sender<DecodedLetter>,
}

impl ChannelSink {
    pub fn channel() -> (Self, flume::Receiver<DecodedLetter>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn send(&self, letter: DecodedLetter) {
        let _ = self.tx.send(letter);
    }
}

/// Decoder that tracks how many decodes run at once
pub struct CountingDecoder {
    delay: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingDecoder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for CountingDecoder {
    fn decode(&self, letter: &Letter) -> Result<DecodedLetter, DecodeError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Decodes run on the blocking pool
        std::thread::sleep(self.delay);
        let result = HexDecoder.decode(letter);

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Queue view that is always drained
pub struct IdleDepth {
    pub capacity: usize,
}

impl QueueDepth for IdleDepth {
    fn pending_count(&self) -> usize {
        0
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

pub fn letter(writer: &str, text: &str) -> Letter {
    Letter::encode(writer, "Victory Mansions", text)
}

pub fn undecodable(writer: &str) -> Letter {
    Letter {
        writer: writer.to_string(),
        location: String::new(),
        body: "not hex at all".to_string(),
    }
}
