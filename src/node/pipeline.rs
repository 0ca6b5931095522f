use tracing::trace;

use crate::slam::frame::{FrameCorrector, RawFrame};
use crate::slam::system::MappingEngine;

/// Per-frame path from the transport into the mapping engine.
///
/// Every frame is corrected, labelled with the next sequence index and
/// submitted. The call then blocks until the engine has finished all mapping
/// work queued so far, so the transport can never run ahead of mapping.
pub struct IngestionPipeline<'a, E: MappingEngine + ?Sized> {
    corrector: FrameCorrector<'a>,
    engine: &'a mut E,
    sequence: usize,
}

impl<'a, E: MappingEngine + ?Sized> IngestionPipeline<'a, E> {
    pub fn new(corrector: FrameCorrector<'a>, engine: &'a mut E) -> Self {
        Self {
            corrector,
            engine,
            sequence: 0,
        }
    }

    pub fn on_frame(&mut self, frame: RawFrame) {
        let corrected = self.corrector.correct(frame);
        trace!("submitting frame {} (t={})", self.sequence, corrected.timestamp);
        self.engine.add_active_frame(corrected, self.sequence);
        self.sequence += 1;
        self.engine.block_until_mapping_is_finished();
    }

    /// Frames submitted so far.
    pub fn frames(&self) -> usize {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::node::testing::{gray_frame, undistorter, Event, RecordingEngine};
    use crate::settings::OperatingProfile;
    use crate::slam::frame::CorrectedFrame;
    use parking_lot::{Condvar, Mutex};
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sequence_indices_follow_arrival_order() {
        let undist = undistorter();
        let profile = OperatingProfile::default();
        let mut engine = RecordingEngine::default();
        let mut pipeline =
            IngestionPipeline::new(FrameCorrector::new(&undist, &profile), &mut engine);

        // jittery, non-monotonic timestamps do not affect the labels
        let stamps = [5.0, 4.9, 7.25, 7.25, 100.0, 0.0];
        for t in stamps {
            pipeline.on_frame(gray_frame(t));
        }
        assert_eq!(pipeline.frames(), stamps.len());

        let events = engine.events();
        let frames: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Frame { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(frames, (0..stamps.len()).collect::<Vec<_>>());
        // every submission is followed by a drain
        assert!(events
            .chunks(2)
            .all(|pair| matches!(pair, [Event::Frame { .. }, Event::Drain])));
    }

    #[test]
    fn timestamps_reach_the_engine_unchanged() {
        let undist = undistorter();
        let profile = OperatingProfile::default();
        let mut engine = RecordingEngine::default();
        let stamps = [1403636579.763555527, 0.1 + 0.2, f64::MIN_POSITIVE];
        {
            let mut pipeline =
                IngestionPipeline::new(FrameCorrector::new(&undist, &profile), &mut engine);
            for t in stamps {
                pipeline.on_frame(gray_frame(t));
            }
        }
        let seen: Vec<_> = engine
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Frame { timestamp, .. } => Some(timestamp.to_bits()),
                _ => None,
            })
            .collect();
        assert_eq!(seen, stamps.map(f64::to_bits).to_vec());
    }

    /// Finishes its mapping work on another thread some time after each
    /// submission.
    #[derive(Default)]
    struct SlowMapper {
        in_flight: Arc<(Mutex<bool>, Condvar)>,
        submitted: usize,
    }

    impl MappingEngine for SlowMapper {
        fn add_active_frame(&mut self, _frame: CorrectedFrame, _id: usize) {
            let (lock, _) = &*self.in_flight;
            let mut busy = lock.lock();
            assert!(!*busy, "frame submitted while mapping was still in flight");
            *busy = true;
            self.submitted += 1;

            let in_flight = Arc::clone(&self.in_flight);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let (lock, done) = &*in_flight;
                *lock.lock() = false;
                done.notify_all();
            });
        }

        fn block_until_mapping_is_finished(&mut self) {
            let (lock, done) = &*self.in_flight;
            let mut busy = lock.lock();
            while *busy {
                done.wait(&mut busy);
            }
        }

        fn export_trajectory(&mut self, _path: &Path, _apply_loop_correction: bool) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn submission_waits_for_mapping() {
        let undist = undistorter();
        let profile = OperatingProfile::default();
        let mut engine = SlowMapper::default();
        let mut pipeline =
            IngestionPipeline::new(FrameCorrector::new(&undist, &profile), &mut engine);
        for i in 0..5 {
            pipeline.on_frame(gray_frame(i as f64));
        }
        drop(pipeline);
        assert_eq!(engine.submitted, 5);
        assert!(!*engine.in_flight.0.lock());
    }
}
