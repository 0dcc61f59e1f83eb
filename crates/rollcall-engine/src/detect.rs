//! Frame to identities.

use crate::config::Config;
use crate::unknowns::{face_crop, UnknownFaces, UnknownSighting};
use chrono::Local;
use rollcall_core::detector::DetectorError;
use rollcall_core::recognizer::RecognizerError;
use rollcall_core::{
    BoundingBox, CosineMatcher, Detection, DetectorOptions, Embedding, FaceDetector, FaceModel, FaceRecognizer, Identity,
    Matcher, ValidationError,
};
use rollcall_hw::Frame;
use thiserror::Error;

/// Failure to analyse a single frame. The session skips the frame and moves on.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("face recognition failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("invalid detection: {0}")]
    Invalid(#[from] ValidationError),
}

/// Maps a frame to the identities visible in it.
pub trait Detector {
    /// Minimum confidence for a detection to count as attendance.
    fn threshold(&self) -> f32;

    /// Every identity seen in the frame, including ones below the threshold.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn threshold(&self) -> f32 {
        (**self).threshold()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        (**self).detect(frame)
    }
}

/// SCRFD + ArcFace detector matching faces against an enrolled gallery.
///
/// Confidence is the cosine similarity of the best gallery entry. Faces with
/// no entry at or above the threshold go to an [`UnknownFaces`] tracker.
pub struct FaceIdentifier {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    gallery: Vec<FaceModel>,
    threshold: f32,
    unknowns: UnknownFaces,
}

impl FaceIdentifier {
    pub fn new(
        detector: FaceDetector,
        recognizer: FaceRecognizer,
        gallery: Vec<FaceModel>,
        threshold: f32,
    ) -> Self {
        if gallery.is_empty() {
            tracing::warn!("face gallery is empty; nobody can be marked present");
        }
        Self {
            detector,
            recognizer,
            gallery,
            threshold,
            unknowns: UnknownFaces::new(threshold),
        }
    }

    /// Replace the unknown-face tracker, e.g. with one that saves crops.
    pub fn with_unknowns(mut self, unknowns: UnknownFaces) -> Self {
        self.unknowns = unknowns;
        self
    }

    /// Load both models from the configured model directory.
    pub fn load(config: &Config, gallery: Vec<FaceModel>) -> Result<Self, DetectionError> {
        let detector = FaceDetector::load(&config.scrfd_model_path(), DetectorOptions::default())?;
        let recognizer = FaceRecognizer::load(&config.arcface_model_path())?;
        tracing::info!(
            gallery = gallery.len(),
            threshold = config.similarity_threshold,
            "face identifier ready"
        );
        let mut unknowns = UnknownFaces::new(config.similarity_threshold);
        if config.save_unknowns {
            unknowns = unknowns.saving_to(&config.unknowns_dir);
        }
        Ok(Self::new(detector, recognizer, gallery, config.similarity_threshold).with_unknowns(unknowns))
    }

    /// Unmatched faces seen so far, counting every sighting.
    pub fn unknown_sightings(&self) -> u64 {
        self.unknowns.sightings()
    }

    /// Distinct unmatched faces this session.
    pub fn unknown_faces(&self) -> usize {
        self.unknowns.distinct()
    }

    pub fn gallery_len(&self) -> usize {
        self.gallery.len()
    }
}

impl Detector for FaceIdentifier {
    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let faces = self.detector.detect(&frame.image)?;
        let mut detections = Vec::with_capacity(faces.len());

        for face in &faces {
            if face.landmarks.is_none() {
                tracing::debug!(sequence = frame.sequence, "face without landmarks skipped");
                continue;
            }
            let embedding = self.recognizer.extract(&frame.image, face)?;
            let matched = identify(&CosineMatcher, &embedding, &self.gallery);
            if !is_recognized(matched.as_ref(), self.threshold) {
                self.note_unknown(&embedding, frame, face);
            }
            if let Some((identity, similarity)) = matched {
                tracing::debug!(identity = %identity, similarity, sequence = frame.sequence, "face matched");
                detections.push(Detection::new(identity, similarity)?);
            }
        }
        Ok(detections)
    }
}

impl FaceIdentifier {
    fn note_unknown(&mut self, embedding: &Embedding, frame: &Frame, face: &BoundingBox) {
        match self.unknowns.record(embedding, || face_crop(&frame.image, face), Local::now()) {
            Ok(UnknownSighting::New { .. }) => {
                tracing::debug!(sequence = frame.sequence, distinct = self.unknowns.distinct(), "new unknown face");
            }
            Ok(UnknownSighting::Repeat) => {}
            Err(e) => tracing::warn!(sequence = frame.sequence, error = %e, "unknown face not kept"),
        }
    }
}

/// Whether a match from [`identify`] is close enough to count as that person.
pub fn is_recognized(matched: Option<&(Identity, f32)>, threshold: f32) -> bool {
    matched.is_some_and(|(_, similarity)| *similarity >= threshold)
}

/// Best gallery identity for `query`, with the similarity clamped into
/// `[0, 1]`. `None` for an empty gallery or a negative best similarity.
pub fn identify(
    matcher: &impl Matcher,
    query: &Embedding,
    gallery: &[FaceModel],
) -> Option<(Identity, f32)> {
    let best = matcher.best_match(query, gallery)?;
    if best.similarity.is_nan() || best.similarity < 0.0 {
        return None;
    }
    let model = gallery.get(best.index)?;
    Some((model.identity.clone(), best.similarity.min(1.0)))
}
