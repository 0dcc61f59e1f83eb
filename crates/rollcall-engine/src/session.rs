//! The capture loop: frame source, detector and ledger, one frame at a time.

use crate::detect::Detector;
use crate::ledger::{AttendanceLedger, LedgerError, MarkOutcome, RecordSink};
use crate::source::FrameSource;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock time for attendance timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// What a stop condition gets to look at, checked before every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionProgress {
    /// Frames pulled from the source so far, including undecodable ones.
    pub frames_acquired: u64,
    pub records: usize,
    pub elapsed: Duration,
}

pub trait StopCondition {
    fn should_stop(&self, progress: &SessionProgress) -> bool;
}

impl<F> StopCondition for F
where
    F: Fn(&SessionProgress) -> bool,
{
    fn should_stop(&self, progress: &SessionProgress) -> bool {
        self(progress)
    }
}

/// Shared flag, set from another thread (e.g. a Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl StopCondition for StopFlag {
    fn should_stop(&self, _progress: &SessionProgress) -> bool {
        self.is_triggered()
    }
}

/// Stop once the session has run for this long.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimit(pub Duration);

impl StopCondition for TimeLimit {
    fn should_stop(&self, progress: &SessionProgress) -> bool {
        progress.elapsed >= self.0
    }
}

/// Stop after this many frames have been acquired.
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget(pub u64);

impl StopCondition for FrameBudget {
    fn should_stop(&self, progress: &SessionProgress) -> bool {
        progress.frames_acquired >= self.0
    }
}

/// Never stops; the session ends when the source runs dry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl StopCondition for Never {
    fn should_stop(&self, _progress: &SessionProgress) -> bool {
        false
    }
}

/// Stops as soon as any member condition does.
#[derive(Default)]
pub struct AnyOf(Vec<Box<dyn StopCondition + Send + Sync>>);

impl AnyOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: impl StopCondition + Send + Sync + 'static) -> Self {
        self.0.push(Box::new(condition));
        self
    }
}

impl StopCondition for AnyOf {
    fn should_stop(&self, progress: &SessionProgress) -> bool {
        self.0.iter().any(|c| c.should_stop(progress))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Analyse every Nth decoded frame. 0 behaves like 1.
    pub frame_stride: u32,
    /// Skip frames the capture layer flagged as dark.
    pub skip_dark_frames: bool,
    /// Analyse at most one frame per interval of session clock time.
    pub min_interval: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_stride: 1,
            skip_dark_frames: true,
            min_interval: None,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Termination {
    Stopped,
    SourceExhausted,
    SourceFailed(String),
    PersistenceFailed(String),
}

impl Termination {
    /// Stopped on request or ran out of frames, as opposed to failing.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stopped | Self::SourceExhausted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkippedFrames {
    pub decode_errors: u64,
    pub detection_errors: u64,
    pub dark: u64,
    pub stride: u64,
    /// Arrived before `min_interval` had passed since the last analysed frame.
    pub throttled: u64,
}

impl SkippedFrames {
    pub fn total(&self) -> u64 {
        self.decode_errors + self.detection_errors + self.dark + self.stride + self.throttled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub frames_acquired: u64,
    pub frames_analysed: u64,
    pub skipped: SkippedFrames,
    pub detections: u64,
    pub below_threshold: u64,
    pub records_written: u64,
    /// Confident detections of identities that were already marked.
    pub repeats: u64,
    pub termination: Termination,
}

/// Drives frames through a detector into a ledger until told to stop.
pub struct SessionLoop<C = SystemClock> {
    options: SessionOptions,
    clock: C,
}

impl SessionLoop<SystemClock> {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_clock(options, SystemClock)
    }
}

impl Default for SessionLoop<SystemClock> {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl<C: Clock> SessionLoop<C> {
    pub fn with_clock(options: SessionOptions, clock: C) -> Self {
        Self { options, clock }
    }

    /// Run one session. Never panics on source, detector or sink failures;
    /// the outcome is reported in [`SessionSummary::termination`].
    pub fn run<F, D, S, T>(
        &self,
        source: &mut F,
        detector: &mut D,
        ledger: &mut AttendanceLedger<S>,
        stop: &T,
    ) -> SessionSummary
    where
        F: FrameSource + ?Sized,
        D: Detector + ?Sized,
        S: RecordSink,
        T: StopCondition + ?Sized,
    {
        let started_at = self.clock.now();
        let threshold = detector.threshold();
        let stride = u64::from(self.options.frame_stride.max(1));
        tracing::info!(
            source = %source.describe(),
            threshold,
            stride,
            min_interval_ms = self.options.min_interval.map(|d| d.as_millis() as u64),
            already_marked = ledger.len(),
            "session started"
        );

        let mut frames_acquired = 0u64;
        let mut frames_decoded = 0u64;
        let mut frames_analysed = 0u64;
        let mut skipped = SkippedFrames::default();
        let mut detections_seen = 0u64;
        let mut below_threshold = 0u64;
        let mut records_written = 0u64;
        let mut repeats = 0u64;
        let mut last_analysed: Option<DateTime<Local>> = None;

        let termination = 'frames: loop {
            let now = self.clock.now();
            let progress = SessionProgress {
                frames_acquired,
                records: ledger.len(),
                elapsed: (now - started_at).to_std().unwrap_or_default(),
            };
            if stop.should_stop(&progress) {
                break Termination::Stopped;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Termination::SourceExhausted,
                Err(e) if e.is_recoverable() => {
                    frames_acquired += 1;
                    skipped.decode_errors += 1;
                    tracing::warn!(error = %e, "skipping undecodable frame");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame source failed");
                    break Termination::SourceFailed(e.to_string());
                }
            };
            frames_acquired += 1;
            frames_decoded += 1;

            if (frames_decoded - 1) % stride != 0 {
                skipped.stride += 1;
                continue;
            }
            if self.options.skip_dark_frames && frame.is_dark {
                tracing::trace!(sequence = frame.sequence, "dark frame skipped");
                skipped.dark += 1;
                continue;
            }
            if let (Some(min), Some(last)) = (self.options.min_interval, last_analysed) {
                // a clock that stepped back does not hold analysis off
                if matches!((now - last).to_std(), Ok(since) if since < min) {
                    skipped.throttled += 1;
                    continue;
                }
            }

            last_analysed = Some(now);
            frames_analysed += 1;
            let detections = match detector.detect(&frame) {
                Ok(detections) => detections,
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, error = %e, "detection failed; frame skipped");
                    skipped.detection_errors += 1;
                    continue;
                }
            };

            for detection in &detections {
                detections_seen += 1;
                if detection.confidence() < threshold {
                    below_threshold += 1;
                    continue;
                }

                let timestamp = self.timestamp_for(ledger);
                match ledger.mark_present(detection.identity(), timestamp, detection.confidence()) {
                    Ok(MarkOutcome::Recorded(_)) => records_written += 1,
                    Ok(MarkOutcome::AlreadyMarked) => repeats += 1,
                    Err(LedgerError::Persistence(e)) => {
                        tracing::error!(identity = %detection.identity(), error = %e, "cannot persist attendance");
                        break 'frames Termination::PersistenceFailed(e.to_string());
                    }
                    Err(e) => {
                        tracing::warn!(identity = %detection.identity(), error = %e, "detection not recorded");
                    }
                }
            }
        };

        let summary = SessionSummary {
            started_at,
            ended_at: self.clock.now(),
            frames_acquired,
            frames_analysed,
            skipped,
            detections: detections_seen,
            below_threshold,
            records_written,
            repeats,
            termination,
        };
        tracing::info!(
            frames = summary.frames_acquired,
            analysed = summary.frames_analysed,
            records = summary.records_written,
            termination = ?summary.termination,
            "session ended"
        );
        summary
    }

    /// Clock time, held at the ledger's last timestamp if the clock stepped back.
    fn timestamp_for<S: RecordSink>(&self, ledger: &AttendanceLedger<S>) -> DateTime<Local> {
        let now = self.clock.now();
        match ledger.last_timestamp() {
            Some(last) if now < last => last,
            _ => now,
        }
    }
}

/// Run a session with default options and the system clock.
pub fn run<F, D, S, T>(
    source: &mut F,
    detector: &mut D,
    ledger: &mut AttendanceLedger<S>,
    stop: &T,
) -> SessionSummary
where
    F: FrameSource + ?Sized,
    D: Detector + ?Sized,
    S: RecordSink,
    T: StopCondition + ?Sized,
{
    SessionLoop::default().run(source, detector, ledger, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionError;
    use crate::ledger::tests::{at, id, FlakySink};
    use crate::ledger::AttendanceRecord;
    use crate::source::SourceError;
    use image::{GrayImage, Luma};
    use rollcall_core::{Detection, ValidationError};
    use rollcall_hw::Frame;
    use std::cell::Cell;
    use std::collections::VecDeque;

    type Step = Result<Option<Frame>, SourceError>;

    struct ScriptedSource(VecDeque<Step>);

    impl ScriptedSource {
        fn frames(n: u64) -> Self {
            Self((0..n).map(|i| Ok(Some(lit(i)))).collect())
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Replays one scripted result per analysed frame, then sees nobody.
    struct ScriptedDetector {
        threshold: f32,
        script: VecDeque<Result<Vec<Detection>, DetectionError>>,
        calls: usize,
    }

    impl ScriptedDetector {
        fn new(threshold: f32, script: Vec<Result<Vec<Detection>, DetectionError>>) -> Self {
            Self { threshold, script: script.into(), calls: 0 }
        }
    }

    impl Detector for ScriptedDetector {
        fn threshold(&self) -> f32 {
            self.threshold
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
            self.calls += 1;
            self.script.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    /// Advances by `step` seconds on every read.
    struct FakeClock {
        secs: Cell<i64>,
        step: i64,
    }

    impl FakeClock {
        fn stepping(step: i64) -> Self {
            Self { secs: Cell::new(0), step }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Local> {
            let secs = self.secs.get();
            self.secs.set(secs + self.step);
            at(secs)
        }
    }

    fn lit(sequence: u64) -> Frame {
        Frame::new(GrayImage::from_pixel(4, 4, Luma([128])), sequence)
    }

    fn dark(sequence: u64) -> Frame {
        Frame::new(GrayImage::new(4, 4), sequence)
    }

    fn det(who: &str, confidence: f32) -> Detection {
        Detection::new(id(who), confidence).unwrap()
    }

    fn session() -> SessionLoop<FakeClock> {
        SessionLoop::with_clock(SessionOptions::default(), FakeClock::stepping(1))
    }

    fn names(records: &[AttendanceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.identity.as_str()).collect()
    }

    #[test]
    fn test_marks_each_identity_once_above_threshold() {
        let mut source = ScriptedSource::frames(3);
        let mut detector = ScriptedDetector::new(
            0.5,
            vec![
                Ok(vec![det("A", 0.9), det("B", 0.4)]),
                Ok(vec![det("A", 0.95)]),
                Ok(vec![det("B", 0.8)]),
            ],
        );
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);

        assert_eq!(names(ledger.records()), ["A", "B"]);
        assert_eq!(names(ledger.sink()), ["A", "B"]);
        assert_eq!(summary.termination, Termination::SourceExhausted);
        assert_eq!(summary.frames_acquired, 3);
        assert_eq!(summary.frames_analysed, 3);
        assert_eq!(summary.detections, 4);
        assert_eq!(summary.below_threshold, 1);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.repeats, 1);
    }

    #[test]
    fn test_confidence_equal_to_threshold_counts() {
        let mut source = ScriptedSource::frames(1);
        let mut detector = ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.5)])]);
        let mut ledger = AttendanceLedger::new(Vec::new());
        session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert!(ledger.is_marked(&id("A")));
    }

    #[test]
    fn test_decode_error_is_skipped() {
        let mut source = ScriptedSource(VecDeque::from(vec![
            Err(SourceError::Decode("truncated jpeg".into())),
            Ok(Some(lit(1))),
        ]));
        let mut detector = ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.9)])]);
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.skipped.decode_errors, 1);
        assert_eq!(summary.frames_acquired, 2);
        assert_eq!(summary.termination, Termination::SourceExhausted);
        assert!(ledger.is_marked(&id("A")));
    }

    #[test]
    fn test_detection_error_is_skipped() {
        let mut source = ScriptedSource::frames(2);
        let mut detector = ScriptedDetector::new(
            0.5,
            vec![
                Err(DetectionError::Invalid(ValidationError::EmptyIdentity)),
                Ok(vec![det("B", 0.7)]),
            ],
        );
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.skipped.detection_errors, 1);
        assert_eq!(names(ledger.records()), ["B"]);
        assert!(summary.termination.is_clean());
    }

    #[test]
    fn test_empty_source_ends_immediately() {
        let mut source = ScriptedSource::frames(0);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.termination, Termination::SourceExhausted);
        assert_eq!(summary.frames_acquired, 0);
        assert_eq!(detector.calls, 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_device_failure_ends_session() {
        let mut source = ScriptedSource(VecDeque::from(vec![
            Ok(Some(lit(0))),
            Err(SourceError::Device("unplugged".into())),
            Ok(Some(lit(2))),
        ]));
        let mut detector = ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.9)])]);
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert!(matches!(summary.termination, Termination::SourceFailed(ref r) if r.contains("unplugged")));
        assert!(!summary.termination.is_clean());
        assert_eq!(summary.frames_acquired, 1);
        assert_eq!(names(ledger.records()), ["A"]);
    }

    #[test]
    fn test_persistence_failure_aborts_session() {
        let mut source = ScriptedSource::frames(3);
        let mut detector = ScriptedDetector::new(
            0.5,
            vec![Ok(vec![det("A", 0.9), det("B", 0.9)]), Ok(vec![det("C", 0.9)])],
        );
        let mut ledger = AttendanceLedger::new(FlakySink { failures: 1, written: Vec::new() });

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert!(matches!(summary.termination, Termination::PersistenceFailed(_)));
        assert_eq!(summary.frames_acquired, 1);
        assert_eq!(detector.calls, 1);
        assert!(ledger.is_empty());
        assert!(ledger.sink().written.is_empty());
    }

    #[test]
    fn test_stop_flag_checked_before_each_frame() {
        let flag = StopFlag::new();
        flag.trigger();
        let mut source = ScriptedSource::frames(3);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());

        let summary = session().run(&mut source, &mut detector, &mut ledger, &flag);
        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(summary.frames_acquired, 0);
        assert_eq!(source.0.len(), 3);
    }

    #[test]
    fn test_frame_budget_and_closures() {
        let mut source = ScriptedSource::frames(10);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let summary = session().run(&mut source, &mut detector, &mut ledger, &FrameBudget(4));
        assert_eq!(summary.frames_acquired, 4);
        assert_eq!(summary.termination, Termination::Stopped);

        let mut source = ScriptedSource::frames(10);
        let stop = |p: &SessionProgress| p.frames_acquired == 2;
        let summary = session().run(&mut source, &mut detector, &mut ledger, &stop);
        assert_eq!(summary.frames_acquired, 2);
    }

    #[test]
    fn test_time_limit_uses_session_clock() {
        let mut source = ScriptedSource::frames(100);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let stop = AnyOf::new()
            .with(StopFlag::new())
            .with(TimeLimit(Duration::from_secs(5)));

        // one clock read per stop check, one second each
        let summary = session().run(&mut source, &mut detector, &mut ledger, &stop);
        assert_eq!(summary.termination, Termination::Stopped);
        assert_eq!(summary.frames_acquired, 4);
    }

    #[test]
    fn test_backwards_clock_does_not_abort() {
        let mut source = ScriptedSource::frames(2);
        let mut detector =
            ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.9)]), Ok(vec![det("B", 0.9)])]);
        let mut ledger = AttendanceLedger::new(Vec::new());
        let session = SessionLoop::with_clock(SessionOptions::default(), FakeClock::stepping(-10));

        let summary = session.run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.records_written, 2);
        let records = ledger.records();
        assert_eq!(records[0].timestamp, records[1].timestamp);
    }

    #[test]
    fn test_stride_and_dark_frames() {
        let mut source = ScriptedSource(VecDeque::from(vec![
            Ok(Some(lit(0))),
            Ok(Some(lit(1))),
            Ok(Some(dark(2))),
            Ok(Some(lit(3))),
            Ok(Some(lit(4))),
        ]));
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let options = SessionOptions { frame_stride: 2, ..SessionOptions::default() };
        let session = SessionLoop::with_clock(options, FakeClock::stepping(1));

        // frames 0, 2 and 4 fall on the stride; 2 is dark
        let summary = session.run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.skipped.stride, 2);
        assert_eq!(summary.skipped.dark, 1);
        assert_eq!(summary.frames_analysed, 2);
        assert_eq!(detector.calls, 2);
        assert_eq!(summary.skipped.total(), 3);
    }

    #[test]
    fn test_min_interval_throttles_by_clock_time() {
        let mut source = ScriptedSource::frames(6);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let options = SessionOptions { min_interval: Some(Duration::from_secs(2)), ..SessionOptions::default() };
        let session = SessionLoop::with_clock(options, FakeClock::stepping(1));

        // frames arrive one second apart: every other one is analysed
        let summary = session.run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.frames_acquired, 6);
        assert_eq!(summary.frames_analysed, 3);
        assert_eq!(summary.skipped.throttled, 3);
        assert_eq!(detector.calls, 3);
        assert_eq!(summary.skipped.total(), 3);
    }

    #[test]
    fn test_min_interval_ignores_backwards_clock() {
        let mut source = ScriptedSource::frames(4);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let options = SessionOptions { min_interval: Some(Duration::from_secs(2)), ..SessionOptions::default() };
        let session = SessionLoop::with_clock(options, FakeClock::stepping(-1));

        let summary = session.run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.frames_analysed, 4);
        assert_eq!(summary.skipped.throttled, 0);
    }

    #[test]
    fn test_dark_frames_analysed_when_not_skipping() {
        let mut source = ScriptedSource(VecDeque::from(vec![Ok(Some(dark(0)))]));
        let mut detector = ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.6)])]);
        let mut ledger = AttendanceLedger::new(Vec::new());
        let options = SessionOptions { frame_stride: 0, skip_dark_frames: false, min_interval: None };
        let session = SessionLoop::with_clock(options, FakeClock::stepping(1));

        let summary = session.run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.frames_analysed, 1);
        assert!(ledger.is_marked(&id("A")));
    }

    #[test]
    fn test_resumed_identities_count_as_repeats() {
        let earlier = AttendanceRecord { identity: id("A"), timestamp: at(-60), confidence: 0.9 };
        let mut ledger = AttendanceLedger::with_records(Vec::new(), vec![earlier]).unwrap();
        let mut source = ScriptedSource::frames(1);
        let mut detector = ScriptedDetector::new(0.5, vec![Ok(vec![det("A", 0.9)])]);

        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);
        assert_eq!(summary.repeats, 1);
        assert_eq!(summary.records_written, 0);
        assert!(ledger.sink().is_empty());
    }

    #[test]
    fn test_summary_serializes_termination() {
        let mut source = ScriptedSource::frames(0);
        let mut detector = ScriptedDetector::new(0.5, Vec::new());
        let mut ledger = AttendanceLedger::new(Vec::new());
        let summary = session().run(&mut source, &mut detector, &mut ledger, &Never);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["termination"]["kind"], "source_exhausted");
        let failed = serde_json::to_value(Termination::SourceFailed("gone".into())).unwrap();
        assert_eq!(failed["reason"], "gone");
    }
}
