use crate::config::Config;
use image::RgbImage;
use mugshot_core::detector::DetectorError;
use mugshot_core::pipeline::{self, EmbeddingExtractor, FaceLocator};
use mugshot_core::recognizer::RecognizerError;
use mugshot_core::{
    EmbeddingIndex, EnrollmentSample, FaceDetector, FacePipeline, FaceRecognizer, PipelineError,
    RecognitionResult,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from the identity service to the engine thread.
enum EngineRequest {
    Enroll {
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<EnrollmentSample, EngineError>>,
    },
    Recognize {
        image: Vec<u8>,
        index: Arc<EmbeddingIndex>,
        threshold: f64,
        reply: oneshot::Sender<Result<Vec<RecognitionResult>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode every image, then embed one face per image.
    pub async fn enroll(&self, images: Vec<Vec<u8>>) -> Result<EnrollmentSample, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Recognize every face in `image` against the given index snapshot.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        index: Arc<EmbeddingIndex>,
        threshold: f64,
    ) -> Result<Vec<RecognitionResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                index,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load both ONNX models and wire them into a pipeline. Fails fast if
/// either model is missing.
pub fn load_pipeline(config: &Config) -> Result<FacePipeline<FaceDetector, FaceRecognizer>, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&scrfd_path)?.with_confidence_threshold(config.detection_threshold);
    tracing::info!(path = %scrfd_path, threshold = config.detection_threshold, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    Ok(FacePipeline::new(detector, recognizer)
        .with_selection(config.face_selection)
        .with_thumbnail_quality(config.thumbnail_quality))
}

/// Spawn the engine on a dedicated OS thread that owns `pipeline`.
///
/// The models need exclusive access, so requests are served one at a time
/// in arrival order.
pub fn spawn_engine<L, E>(mut pipeline: FacePipeline<L, E>) -> Result<EngineHandle, EngineError>
where
    L: FaceLocator + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("mugshot-engine".into())
        .spawn(move || {
            tracing::info!(selection = %pipeline.selection(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { images, reply } => {
                        let result = run_enroll(&mut pipeline, &images);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize {
                        image,
                        index,
                        threshold,
                        reply,
                    } => {
                        let result = run_recognize(&mut pipeline, &image, &index, threshold);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_enroll<L: FaceLocator, E: EmbeddingExtractor>(
    pipeline: &mut FacePipeline<L, E>,
    images: &[Vec<u8>],
) -> Result<EnrollmentSample, EngineError> {
    // An undecodable image fails the request before any detection runs.
    let decoded = images
        .iter()
        .map(|bytes| pipeline::decode(bytes))
        .collect::<Result<Vec<RgbImage>, _>>()?;
    tracing::debug!(images = decoded.len(), "enroll: images decoded");

    Ok(pipeline.enroll(&decoded)?)
}

fn run_recognize<L: FaceLocator, E: EmbeddingExtractor>(
    pipeline: &mut FacePipeline<L, E>,
    image: &[u8],
    index: &EmbeddingIndex,
    threshold: f64,
) -> Result<Vec<RecognitionResult>, EngineError> {
    let image = pipeline::decode(image)?;
    Ok(pipeline.recognize(&image, index, threshold)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mugshot_core::testing::{strips_png, FakeExtractor, StripLocator, BLUE, GREEN, RED};
    use mugshot_core::{Identity, IdentityId};

    fn engine() -> EngineHandle {
        spawn_engine(FacePipeline::new(StripLocator, FakeExtractor::default())).unwrap()
    }

    fn index_of(entries: &[(&str, [u8; 3])]) -> Arc<EmbeddingIndex> {
        let identities: Vec<Identity> = entries
            .iter()
            .enumerate()
            .map(|(i, (name, color))| Identity {
                id: IdentityId::new(format!("id-{i}")),
                username: name.to_string(),
                embeddings: vec![FakeExtractor::embedding_of(*color)],
                thumbnail: None,
                created_at: String::new(),
            })
            .collect();
        Arc::new(EmbeddingIndex::build(&identities))
    }

    #[tokio::test]
    async fn test_enroll_through_engine() {
        let images = vec![strips_png(&[RED]); 3];
        let sample = engine().enroll(images).await.unwrap();
        assert_eq!(sample.embeddings.len(), 3);
        assert_eq!(sample.embeddings[0], FakeExtractor::embedding_of(RED));
    }

    #[tokio::test]
    async fn test_invalid_image_precedes_detection() {
        // Image 0 has no face, image 1 is not an image at all.
        let images = vec![strips_png(&[]), b"not an image".to_vec()];
        let err = engine().enroll(images).await.unwrap_err();
        assert!(
            matches!(err, EngineError::Pipeline(PipelineError::InvalidImage(_))),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_enroll_reports_faceless_image() {
        let images = vec![strips_png(&[RED]), strips_png(&[RED]), strips_png(&[])];
        let err = engine().enroll(images).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::NoFaceDetected(2))));
    }

    #[tokio::test]
    async fn test_recognize_in_detection_order() {
        let index = index_of(&[("alice", RED), ("bob", BLUE)]);
        let results = engine()
            .recognize(strips_png(&[BLUE, RED, GREEN]), index, 0.7)
            .await
            .unwrap();
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bob", "alice", "Unknown"]);
    }

    #[tokio::test]
    async fn test_recognize_empty_index() {
        let results = engine()
            .recognize(strips_png(&[RED]), Arc::new(EmbeddingIndex::default()), 0.7)
            .await
            .unwrap();
        assert_eq!(results, vec![RecognitionResult::no_registered_faces()]);
    }

    #[tokio::test]
    async fn test_recognize_rejects_garbage() {
        let err = engine()
            .recognize(vec![0xde, 0xad], index_of(&[("alice", RED)]), 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::InvalidImage(_))));
    }

    #[tokio::test]
    async fn test_handle_is_shared_across_tasks() {
        let handle = engine();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.enroll(vec![strips_png(&[GREEN])]).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().embeddings.len(), 1);
        }
    }
}
