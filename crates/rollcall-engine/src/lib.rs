//! rollcall-engine: turns recognized faces into an attendance record.
//!
//! A [`SessionLoop`] pulls frames from a [`FrameSource`], hands them to a
//! [`Detector`] and marks every confident identity in an
//! [`AttendanceLedger`], which persists each identity once per session.

pub mod config;
pub mod detect;
pub mod enroll;
pub mod ledger;
pub mod session;
pub mod source;
pub mod store;
pub mod summary;
pub mod unknowns;

pub use config::{Config, ConfigError};
pub use detect::{is_recognized, DetectionError, Detector, FaceIdentifier};
pub use enroll::{
    enroll_image, identity_from_filename, import_dir, register_unknown, EnrollError, FaceEmbedder, ImportReport,
    OnnxEmbedder,
};
pub use ledger::{
    read_records, AttendanceLedger, AttendanceRecord, CsvSink, LedgerError, MarkOutcome, PersistenceError,
    RecordSink,
};
pub use session::{
    AnyOf, Clock, FrameBudget, Never, SessionLoop, SessionOptions, SessionProgress, SessionSummary,
    SkippedFrames, StopCondition, StopFlag, SystemClock, Termination, TimeLimit,
};
pub use source::{FrameSource, SourceError};
pub use store::{GalleryStore, StoreError};
pub use summary::{backup, session_files, stats, summarize, AttendanceStats, SessionFileSummary};
pub use unknowns::{face_crop, list_unknowns, UnknownFaceError, UnknownFaces, UnknownSighting};
