//! Signal windowing: bounded chunks of a selected sample range.

use bsml_core::wire::{MAX_PAYLOAD, SAMPLE_WIDTH};
use bsml_core::{SampleChunk, Selection};

use crate::format::{ChunkIter, SignalError, SignalHandle};

/// Most samples a single SIGNAL_DATA payload can hold.
pub const PAYLOAD_POINTS: usize = MAX_PAYLOAD / SAMPLE_WIDTH;

/// Turns a signal selection into a lazy sequence of bounded chunks.
#[derive(Debug, Clone, Copy)]
pub struct SignalWindower {
    /// Subsystem cap on samples per chunk. 0 = no cap beyond the wire limit.
    max_points: usize,
}

impl SignalWindower {
    pub fn new(max_points: usize) -> Self {
        Self { max_points }
    }

    /// Effective per-chunk bound for a request.
    pub fn limit(&self, request_max: Option<usize>) -> usize {
        let mut limit = PAYLOAD_POINTS;
        if self.max_points > 0 {
            limit = limit.min(self.max_points);
        }
        if let Some(n) = request_max.filter(|&n| n > 0) {
            limit = limit.min(n);
        }
        limit
    }

    pub fn windows<'a>(
        &self,
        signal: &'a SignalHandle,
        selection: Selection,
        request_max: Option<usize>,
    ) -> Result<Windows<'a>, SignalError> {
        let limit = self.limit(request_max);
        let inner = signal.reader.read(selection, limit)?;
        Ok(Windows {
            inner,
            limit,
            pending: None,
        })
    }
}

/// Chunks from a reader, re-split so none exceeds the limit and none is empty.
pub struct Windows<'a> {
    inner: ChunkIter<'a>,
    limit: usize,
    pending: Option<SampleChunk>,
}

impl Windows<'_> {
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Iterator for Windows<'_> {
    type Item = Result<SampleChunk, SignalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(mut chunk) = self.pending.take() {
                if chunk.len() > self.limit {
                    let head = chunk.split_front(self.limit);
                    self.pending = Some(chunk);
                    return Some(Ok(head));
                }
                if !chunk.is_empty() {
                    return Some(Ok(chunk));
                }
            }
            match self.inner.next()? {
                Ok(chunk) => self.pending = Some(chunk),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bsml_core::{Segment, TimeInterval};

    use crate::format::{SampleBuffer, SignalRead};

    fn handle(reader: Arc<dyn SignalRead>) -> SignalHandle {
        SignalHandle {
            uri: "http://x/rec/signal/a".into(),
            recording: "http://x/rec".into(),
            reader,
        }
    }

    /// Reader that ignores `points` and returns everything in one chunk.
    struct Greedy(SampleBuffer);

    impl SignalRead for Greedy {
        fn read(&self, selection: Selection, _points: usize) -> Result<ChunkIter<'_>, SignalError> {
            self.0.read(selection, 0)
        }

        fn rate(&self) -> Option<f64> {
            self.0.rate()
        }
    }

    fn sizes(windows: Windows<'_>) -> Vec<usize> {
        windows.map(|c| c.unwrap().len()).collect()
    }

    #[test]
    fn chunks_are_bounded_and_cover_the_interval() {
        let sig = handle(Arc::new(SampleBuffer::uniform(100.0, vec![0.0; 2000])));
        let windower = SignalWindower::new(4096);
        let interval = TimeInterval::new(0.0, 10.0).unwrap();
        let w = windower.windows(&sig, Selection::Interval(interval), Some(100)).unwrap();
        let s = sizes(w);
        assert_eq!(s.len(), 10);
        assert!(s.iter().all(|&n| n == 100));
    }

    #[test]
    fn oversized_reader_chunks_are_resplit() {
        let samples: Vec<f64> = (0..250).map(f64::from).collect();
        let sig = handle(Arc::new(Greedy(SampleBuffer::uniform(10.0, samples))));
        let windower = SignalWindower::new(100);
        let chunks: Vec<_> = windower
            .windows(&sig, Selection::All, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.iter().map(SampleChunk::len).collect::<Vec<_>>(), [100, 100, 50]);
        assert_eq!(chunks[2].samples[0], 200.0);
        assert!((chunks[2].start - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_selection_yields_nothing() {
        let sig = handle(Arc::new(SampleBuffer::uniform(10.0, vec![1.0; 10])));
        let windower = SignalWindower::new(4096);
        let past_end = Selection::Segment(Segment::new(50, 10).unwrap());
        assert_eq!(windower.windows(&sig, past_end, None).unwrap().count(), 0);
    }

    #[test]
    fn limit_takes_the_smallest_bound() {
        let windower = SignalWindower::new(4096);
        assert_eq!(windower.limit(None), 4096);
        assert_eq!(windower.limit(Some(10)), 10);
        assert_eq!(windower.limit(Some(0)), 4096);
        assert_eq!(SignalWindower::new(0).limit(None), PAYLOAD_POINTS);
    }
}
