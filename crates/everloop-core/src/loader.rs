//! Asset loading: fetching and caching decoded sample buffers.
//!
//! Asset loading is the engine's only asynchronous dependency. An
//! [`AssetLoader`] performs the (blocking) fetch and decode; a
//! [`FetchService`] runs it on a background thread and hands results back
//! over a channel; an [`AssetBroker`] owns the in-memory cache and
//! deduplicates in-flight requests so each sample id is fetched at most
//! once per miss.

use crate::errors::{EngineError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hound::SampleFormat;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

/// A decoded, playback-ready sample buffer.
#[derive(Clone, Debug)]
pub struct DecodedBuffer {
    /// The sample identifier this buffer was fetched for.
    pub id: String,
    /// Playback duration in seconds.
    pub duration: f64,
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Interleaved samples, shared cheaply between cache and sink.
    pub samples: Arc<[f32]>,
}

impl DecodedBuffer {
    /// A silent buffer of the given duration, for tests and placeholders.
    pub fn silent(id: impl Into<String>, duration: f64) -> Self {
        let sample_rate = 8_000u32;
        let frames = (duration.max(0.0) * f64::from(sample_rate)) as usize;
        Self {
            id: id.into(),
            duration,
            sample_rate,
            channels: 1,
            samples: vec![0.0; frames].into(),
        }
    }
}

/// Host-provided sample fetch and decode.
///
/// `fetch` may block; it always runs on the [`FetchService`] thread,
/// never on the engine's.
pub trait AssetLoader: Send {
    /// Fetch and decode one sample.
    fn fetch(&mut self, sample_id: &str, base_url: &str) -> Result<DecodedBuffer>;
}

/// Normalize a base URL: trim whitespace and ensure a single trailing
/// slash. An empty base stays empty.
pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// File-system loader reading WAV files relative to the base URL.
#[derive(Clone, Copy, Debug, Default)]
pub struct WavFileLoader;

impl AssetLoader for WavFileLoader {
    fn fetch(&mut self, sample_id: &str, base_url: &str) -> Result<DecodedBuffer> {
        let path = format!("{base_url}{sample_id}");
        let reader = hound::WavReader::open(&path)
            .map_err(|e| EngineError::asset(sample_id, e.to_string()))?;
        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| EngineError::asset(sample_id, e.to_string()))?,
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| EngineError::asset(sample_id, e.to_string()))?
            }
        };
        let frames = samples.len() / usize::from(spec.channels.max(1));
        Ok(DecodedBuffer {
            id: sample_id.to_string(),
            duration: frames as f64 / f64::from(spec.sample_rate.max(1)),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples: samples.into(),
        })
    }
}

struct FetchRequest {
    id: String,
    base_url: String,
}

/// Outcome of one background fetch.
pub struct FetchResult {
    /// The requested sample id.
    pub id: String,
    /// The decoded buffer, or the asset error that dropped it.
    pub result: Result<DecodedBuffer>,
}

/// Background fetch worker.
///
/// Requests go in over a channel, results come back over another; the
/// engine polls results on its own tick and never blocks. Dropping the
/// service disconnects the request channel and the worker exits after
/// its current fetch.
pub struct FetchService {
    request_tx: Sender<FetchRequest>,
    result_rx: Receiver<FetchResult>,
}

impl FetchService {
    /// Spawn the worker thread around a loader.
    pub fn spawn(mut loader: impl AssetLoader + 'static) -> Self {
        let (request_tx, request_rx) = unbounded::<FetchRequest>();
        let (result_tx, result_rx) = unbounded::<FetchResult>();
        thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                log::trace!("fetching sample '{}'", request.id);
                let result = loader.fetch(&request.id, &request.base_url);
                let outcome = FetchResult {
                    id: request.id,
                    result,
                };
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
        });
        Self {
            request_tx,
            result_rx,
        }
    }

    /// Queue a fetch. Results surface later via [`FetchService::poll`].
    pub fn request(&self, id: impl Into<String>, base_url: impl Into<String>) {
        let request = FetchRequest {
            id: id.into(),
            base_url: base_url.into(),
        };
        // A send failure means the worker died; the result simply never
        // arrives, which the caller treats as a stalled load.
        let _ = self.request_tx.send(request);
    }

    /// Drain all results that have arrived so far, without blocking.
    pub fn poll(&self) -> Vec<FetchResult> {
        self.result_rx.try_iter().collect()
    }
}

/// Owns the sample cache and the fetch pipeline for one loaded
/// composition.
pub struct AssetBroker {
    service: FetchService,
    cache: HashMap<String, DecodedBuffer>,
    in_flight: HashSet<String>,
    base_url: String,
}

impl AssetBroker {
    /// Create a broker around a loader, with an empty cache.
    pub fn new(loader: impl AssetLoader + 'static) -> Self {
        Self {
            service: FetchService::spawn(loader),
            cache: HashMap::new(),
            in_flight: HashSet::new(),
            base_url: String::new(),
        }
    }

    /// Set and normalize the base URL for subsequent fetches.
    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = normalize_base_url(base_url);
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Look up a cached buffer.
    pub fn get(&self, id: &str) -> Option<&DecodedBuffer> {
        self.cache.get(id)
    }

    /// Insert an already-decoded buffer, e.g. a host-side warm-up.
    pub fn preload(&mut self, buffer: DecodedBuffer) {
        self.in_flight.remove(&buffer.id);
        self.cache.insert(buffer.id.clone(), buffer);
    }

    /// Request a sample unless it is already cached or in flight.
    pub fn request(&mut self, id: &str) {
        if self.cache.contains_key(id) || !self.in_flight.insert(id.to_string()) {
            return;
        }
        self.service.request(id, self.base_url.clone());
    }

    /// Drain finished fetches into the cache and return them.
    ///
    /// Failed fetches are returned too (and logged); they are not cached,
    /// so the next miss re-fetches.
    pub fn poll(&mut self) -> Vec<FetchResult> {
        let results = self.service.poll();
        for result in &results {
            self.in_flight.remove(&result.id);
            match &result.result {
                Ok(buffer) => {
                    self.cache.insert(result.id.clone(), buffer.clone());
                }
                Err(e) => log::warn!("dropping sample '{}': {e}", result.id),
            }
        }
        results
    }
}
