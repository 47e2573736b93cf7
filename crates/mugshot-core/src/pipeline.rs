//! Enrollment and recognition: locate → crop → normalize → embed.

use crate::detector::DetectorError;
use crate::face::{self, FaceSelection, DEFAULT_THUMBNAIL_QUALITY};
use crate::index::EmbeddingIndex;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Embedding, RecognitionResult};
use image::RgbImage;
use thiserror::Error;

/// Finds faces in an image. Order of the returned boxes is the detection order.
pub trait FaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Maps one square face crop of [`input_size`](Self::input_size) pixels to an embedding.
pub trait EmbeddingExtractor {
    fn input_size(&self) -> u32;
    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected in image {0}")]
    NoFaceDetected(usize),
    #[error("face box lies outside the image")]
    EmptyCrop,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("thumbnail encoding failed: {0}")]
    Thumbnail(#[source] image::ImageError),
}

impl PipelineError {
    /// Errors caused by the caller's input rather than the models.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImage(_) | Self::NoFaceDetected(_))
    }
}

/// Everything an enrollment produces before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentSample {
    /// One embedding per enrollment image, in input order.
    pub embeddings: Vec<Embedding>,
    /// Grayscale JPEG of the first image's face, base64 encoded.
    pub thumbnail: Option<String>,
}

/// Decode raw image bytes, mapping failures to [`PipelineError::InvalidImage`].
pub fn decode(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    face::decode_image(bytes).map_err(|e| PipelineError::InvalidImage(e.to_string()))
}

/// A face locator and an embedding extractor wired together.
pub struct FacePipeline<L, E> {
    locator: L,
    extractor: E,
    selection: FaceSelection,
    thumbnail_quality: u8,
}

impl<L: FaceLocator, E: EmbeddingExtractor> FacePipeline<L, E> {
    pub fn new(locator: L, extractor: E) -> Self {
        Self {
            locator,
            extractor,
            selection: FaceSelection::default(),
            thumbnail_quality: DEFAULT_THUMBNAIL_QUALITY,
        }
    }

    pub fn with_selection(mut self, selection: FaceSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_thumbnail_quality(mut self, quality: u8) -> Self {
        self.thumbnail_quality = quality.clamp(1, 100);
        self
    }

    pub fn selection(&self) -> FaceSelection {
        self.selection
    }

    /// Embed every enrollment image, one face each.
    ///
    /// Stops at the first image without a face; nothing is returned for a
    /// partially processed batch.
    pub fn enroll(&mut self, images: &[RgbImage]) -> Result<EnrollmentSample, PipelineError> {
        let mut embeddings = Vec::with_capacity(images.len());
        let mut thumbnail = None;

        for (i, image) in images.iter().enumerate() {
            let faces = self.locator.locate(image)?;
            let face = self
                .selection
                .select(&faces)
                .ok_or(PipelineError::NoFaceDetected(i))?;

            tracing::debug!(
                image = i,
                faces = faces.len(),
                confidence = face.confidence,
                policy = %self.selection,
                "enroll: face selected"
            );

            let normalized = self.normalized_crop(image, face)?;
            embeddings.push(self.extractor.extract(&normalized)?);

            if i == 0 {
                thumbnail = Some(
                    face::encode_thumbnail(&normalized, self.thumbnail_quality)
                        .map_err(PipelineError::Thumbnail)?,
                );
            }
        }

        Ok(EnrollmentSample {
            embeddings,
            thumbnail,
        })
    }

    /// Recognize every face in `image` against `index`, in detection order.
    ///
    /// An empty index short-circuits to a single "No registered faces" result
    /// without running the locator.
    pub fn recognize(
        &mut self,
        image: &RgbImage,
        index: &EmbeddingIndex,
        threshold: f64,
    ) -> Result<Vec<RecognitionResult>, PipelineError> {
        if index.is_empty() {
            return Ok(vec![RecognitionResult::no_registered_faces()]);
        }

        let faces = self.locator.locate(image)?;
        let mut results = Vec::with_capacity(faces.len());

        for (i, face) in faces.iter().enumerate() {
            // A box entirely off the image still gets its slot in the results.
            let Some(crop) = face::crop_face(image, face) else {
                tracing::warn!(face = i, x = face.x, y = face.y, "recognize: face box outside the image");
                results.push(RecognitionResult::unknown(0.0));
                continue;
            };
            let normalized = face::normalize_face(&crop, self.extractor.input_size());
            let embedding = self.extractor.extract(&normalized)?;
            results.push(index.resolve(&embedding, threshold));
        }

        tracing::debug!(
            faces = faces.len(),
            matched = results.iter().filter(|r| r.is_match()).count(),
            "recognize: complete"
        );

        Ok(results)
    }

    fn normalized_crop(&self, image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, PipelineError> {
        let crop = face::crop_face(image, face).ok_or(PipelineError::EmptyCrop)?;
        Ok(face::normalize_face(&crop, self.extractor.input_size()))
    }
}
