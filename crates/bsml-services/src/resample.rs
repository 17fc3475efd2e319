//! Streaming sample-rate conversion.
//!
//! `RateConverter` accepts a signal's chunks one at a time and emits chunks
//! at the target rate. Output is continuous across chunk boundaries; after
//! `finish` the total output count is `round(inputs × target / source)`.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use bsml_core::{SampleChunk, Timing};

use crate::format::SignalError;

/// Input frames per resampler call.
const BLOCK_FRAMES: usize = 1024;

/// Flush iterations before giving up on reaching the expected count.
const MAX_FLUSH_ROUNDS: usize = 1024;

/// Relative tolerance under which source and target count as equal.
const SAME_RATE_EPSILON: f64 = 1e-12;

pub struct RateConverter {
    target: f64,
    state: Option<ConversionState>,
    finished: bool,
}

struct ConversionState {
    source: f64,
    /// Time of the first input sample.
    origin: f64,
    /// `None` when source and target rates are equal.
    resampler: Option<SincFixedIn<f64>>,
    pending: Vec<f64>,
    /// Output frames still to discard for the filter delay.
    delay: usize,
    consumed: u64,
    emitted: u64,
}

impl RateConverter {
    pub fn new(target: f64) -> Result<Self, SignalError> {
        if !target.is_finite() || target <= 0.0 {
            return Err(SignalError::Conversion(format!("invalid target rate {target}")));
        }
        Ok(Self {
            target,
            state: None,
            finished: false,
        })
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Convert one chunk. May return an empty chunk while input is buffered.
    pub fn convert(&mut self, chunk: SampleChunk) -> Result<SampleChunk, SignalError> {
        if self.finished {
            return Err(SignalError::Conversion("converter already finished".into()));
        }
        let rate = match chunk.timing {
            Timing::Rate(r) => r,
            Timing::Clock(_) => {
                return Err(SignalError::Conversion(
                    "explicitly clocked signals cannot be rate converted".into(),
                ))
            }
        };
        if chunk.is_empty() {
            return Ok(self.empty(chunk.start));
        }

        let target = self.target;
        let state = match self.state.take() {
            Some(state) => state,
            None => ConversionState::new(rate, target, chunk.start)?,
        };
        let state = self.state.insert(state);
        if (state.source - rate).abs() > SAME_RATE_EPSILON * rate {
            return Err(SignalError::Conversion(format!(
                "sample rate changed from {} to {rate} mid-signal",
                state.source
            )));
        }

        let start = state.output_time(target);
        state.consumed += chunk.len() as u64;
        let mut out = Vec::new();
        match state.resampler.as_mut() {
            None => out = chunk.samples,
            Some(resampler) => {
                state.pending.extend_from_slice(&chunk.samples);
                while state.pending.len() >= resampler.input_frames_next() {
                    let need = resampler.input_frames_next();
                    let block: Vec<f64> = state.pending.drain(..need).collect();
                    let produced = run(resampler, block)?;
                    trim_delay(&mut state.delay, produced, &mut out);
                }
            }
        }
        state.emitted += out.len() as u64;
        Ok(SampleChunk::uniform(start, target, out))
    }

    /// Flush buffered input. Idempotent: later calls return an empty chunk.
    pub fn finish(&mut self) -> Result<SampleChunk, SignalError> {
        let target = self.target;
        self.finished = true;
        let Some(mut state) = self.state.take() else {
            return Ok(self.empty(0.0));
        };

        let start = state.output_time(target);
        let expected = (state.consumed as f64 * target / state.source).round() as u64;
        let remaining = expected.saturating_sub(state.emitted) as usize;

        let mut out = Vec::with_capacity(remaining);
        if let Some(resampler) = state.resampler.as_mut() {
            let mut rounds = 0;
            while out.len() < remaining {
                if rounds == MAX_FLUSH_ROUNDS {
                    return Err(SignalError::Conversion(format!(
                        "flush produced {} of {remaining} samples",
                        out.len()
                    )));
                }
                let need = resampler.input_frames_next();
                let take = need.min(state.pending.len());
                let mut block: Vec<f64> = state.pending.drain(..take).collect();
                block.resize(need, 0.0);
                let produced = run(resampler, block)?;
                trim_delay(&mut state.delay, produced, &mut out);
                rounds += 1;
            }
        }
        out.truncate(remaining);
        tracing::trace!(
            consumed = state.consumed,
            emitted = state.emitted + out.len() as u64,
            "rate conversion finished"
        );
        Ok(SampleChunk::uniform(start, target, out))
    }

    fn empty(&self, start: f64) -> SampleChunk {
        let start = self
            .state
            .as_ref()
            .map_or(start, |s| s.output_time(self.target));
        SampleChunk::uniform(start, self.target, Vec::new())
    }
}

impl ConversionState {
    fn new(source: f64, target: f64, origin: f64) -> Result<Self, SignalError> {
        let ratio = target / source;
        let resampler = if (ratio - 1.0).abs() <= SAME_RATE_EPSILON {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f64>::new(ratio, 1.0, params, BLOCK_FRAMES, 1)
                .map_err(|e| SignalError::Conversion(e.to_string()))?;
            Some(resampler)
        };
        let delay = resampler.as_ref().map_or(0, |r| r.output_delay());
        tracing::debug!(source, target, delay, "rate converter initialised");
        Ok(Self {
            source,
            origin,
            resampler,
            pending: Vec::new(),
            delay,
            consumed: 0,
            emitted: 0,
        })
    }

    fn output_time(&self, target: f64) -> f64 {
        self.origin + self.emitted as f64 / target
    }
}

fn run(resampler: &mut SincFixedIn<f64>, block: Vec<f64>) -> Result<Vec<f64>, SignalError> {
    resampler
        .process(&[block], None)
        .map_err(|e| SignalError::Conversion(e.to_string()))
        .map(|channels| channels.into_iter().next().unwrap_or_default())
}

fn trim_delay(delay: &mut usize, produced: Vec<f64>, out: &mut Vec<f64>) {
    let skip = (*delay).min(produced.len());
    *delay -= skip;
    out.extend_from_slice(&produced[skip..]);
}
