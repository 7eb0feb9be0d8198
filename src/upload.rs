//! The upload pipeline: probe the stored blob, cut preview frames, save the
//! record, then optionally hang it off a tutorial.
//!
//! The blob itself is streamed to disk while the request body is read, so it
//! already exists when the pipeline starts. A form rejected for a missing
//! field has its blob removed; past that point every stage short-circuits on
//! failure and nothing is rolled back.

use std::sync::Arc;

use tokio::task;
use tracing::{debug, info, warn};

use crate::frames::{FrameError, FrameExtractor, FrameRequest};
use crate::storage::{MediaStorage, StoredFile};
use crate::store::{NewVideo, VideoRecord, VideoStore};

pub const PREVIEW_FRAME_COUNT: u32 = 5;
pub const PREVIEW_FRAME_RATE_HZ: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no file part in upload")]
    MissingFile,

    #[error("missing form field `{0}`")]
    MissingField(&'static str),

    #[error("probing duration: {0}")]
    Probe(FrameError),

    #[error("extracting preview frames: {0}")]
    Frames(FrameError),

    #[error("{0:#}")]
    Persist(anyhow::Error),

    #[error("task join error: {0}")]
    Join(#[from] task::JoinError),
}

/// Parsed multipart form of a video upload.
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    pub file: Option<StoredFile>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tutorial_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadPipeline {
    storage: Arc<MediaStorage>,
    frames: Arc<FrameExtractor>,
    store: Arc<VideoStore>,
}

impl UploadPipeline {
    pub fn new(
        storage: Arc<MediaStorage>,
        frames: Arc<FrameExtractor>,
        store: Arc<VideoStore>,
    ) -> Self {
        Self {
            storage,
            frames,
            store,
        }
    }

    pub async fn run(&self, form: UploadForm) -> Result<VideoRecord, UploadError> {
        let stored = form.file.ok_or(UploadError::MissingFile)?;
        let Some(name) = form.name else {
            self.storage.remove(&stored).await;
            return Err(UploadError::MissingField("name"));
        };
        info!(path = %stored.path.display(), bytes = stored.bytes, "processing upload");

        let seconds = self
            .frames
            .probe_duration(&stored.path)
            .await
            .map_err(UploadError::Probe)?;

        let request = FrameRequest {
            rate_hz: PREVIEW_FRAME_RATE_HZ,
            count: PREVIEW_FRAME_COUNT,
            output_dir: self.storage.preview_dir(&stored),
            stem: stored.token.clone(),
        };
        let frames = self
            .frames
            .extract_frames(&stored.path, &request)
            .await
            .map_err(UploadError::Frames)?;
        let preview_frames_url: Vec<String> = frames
            .iter()
            .filter_map(|path| self.storage.public_url(path))
            .collect();
        if preview_frames_url.is_empty() {
            info!(token = %stored.token, "no preview frames created");
        } else {
            debug!(token = %stored.token, frames = ?preview_frames_url, "created preview frames");
        }

        let new_video = NewVideo {
            name,
            description: form.description,
            url: stored.url,
            length_seconds: seconds.trunc() as i64,
            preview_frames_url,
        };
        let store = Arc::clone(&self.store);
        let record = task::spawn_blocking(move || store.insert_video(new_video))
            .await?
            .map_err(UploadError::Persist)?;
        info!(video_id = %record.id, length_seconds = record.length_seconds, "created video");

        if let Some(tutorial_id) = form.tutorial_id.filter(|id| !id.trim().is_empty()) {
            self.link_tutorial(tutorial_id, record.id.clone()).await;
        }

        Ok(record)
    }

    /// Best effort: the video already exists, so a failed link is only logged.
    async fn link_tutorial(&self, tutorial_id: String, video_id: String) {
        let store = Arc::clone(&self.store);
        let outcome = task::spawn_blocking({
            let tutorial_id = tutorial_id.clone();
            let video_id = video_id.clone();
            move || store.append_video_to_tutorial(&tutorial_id, &video_id)
        })
        .await;

        match outcome {
            Ok(Ok(true)) => info!(%tutorial_id, %video_id, "linked video to tutorial"),
            Ok(Ok(false)) => {
                warn!(%tutorial_id, %video_id, "tutorial not found; video left unlinked")
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                warn!(%tutorial_id, %video_id, error = %message, "linking video to tutorial failed")
            }
            Err(err) => {
                warn!(%tutorial_id, %video_id, error = %err, "linking video to tutorial failed")
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::frames::test_support::*;
    use tempfile::TempDir;

    struct Harness {
        _bin: TempDir,
        root: TempDir,
        storage: Arc<MediaStorage>,
        store: Arc<VideoStore>,
        pipeline: UploadPipeline,
    }

    fn harness(duration: &str, frames: u32) -> Harness {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let extractor = FrameExtractor::new(
            install_ffmpeg_stub(bin.path(), frames),
            install_ffprobe_stub(bin.path(), duration),
        );
        harness_with(bin, root, extractor)
    }

    fn harness_with(bin: TempDir, root: TempDir, extractor: FrameExtractor) -> Harness {
        let store = Arc::new(VideoStore::open_in_memory().unwrap());
        let storage = Arc::new(MediaStorage::new(root.path()));
        let pipeline = UploadPipeline::new(
            Arc::clone(&storage),
            Arc::new(extractor),
            Arc::clone(&store),
        );
        Harness {
            _bin: bin,
            root,
            storage,
            store,
            pipeline,
        }
    }

    impl Harness {
        async fn stage(&self, original_name: Option<&str>) -> StoredFile {
            let mut pending = self.storage.create(original_name).await.unwrap();
            pending.write(b"not really a video").await.unwrap();
            pending.finish().await.unwrap()
        }

        async fn form(&self, tutorial_id: Option<&str>) -> UploadForm {
            self.form_named(Some("clip.mp4"), tutorial_id).await
        }

        async fn form_named(
            &self,
            original_name: Option<&str>,
            tutorial_id: Option<&str>,
        ) -> UploadForm {
            UploadForm {
                file: Some(self.stage(original_name).await),
                name: Some("Intro".into()),
                description: Some("Getting started".into()),
                tutorial_id: tutorial_id.map(str::to_owned),
            }
        }
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn upload_creates_record_with_previews() {
        let h = harness("10.04", 5);
        let record = h.pipeline.run(h.form(None).await).await.unwrap();

        assert_eq!(record.name, "Intro");
        assert_eq!(record.description.as_deref(), Some("Getting started"));
        assert_eq!(record.length_seconds, 10);
        assert_eq!(record.view_count, 0);
        assert!(record.url.starts_with("/static/") && record.url.ends_with(".mp4"));

        let token = record
            .url
            .trim_start_matches("/static/")
            .trim_end_matches(".mp4");
        assert_eq!(record.preview_frames_url.len(), 5);
        assert_eq!(
            record.preview_frames_url[0],
            format!("/static/{token}/{token}_1.jpg")
        );
        assert!(h.root.path().join(format!("{token}.mp4")).is_file());
        assert_eq!(h.store.get_video(&record.id).unwrap(), Some(record));
    }

    #[tokio::test]
    async fn upload_without_frames_still_succeeds() {
        let h = harness("1.5", 0);
        let record = h.pipeline.run(h.form(None).await).await.unwrap();
        assert_eq!(record.length_seconds, 1);
        assert!(record.preview_frames_url.is_empty());
    }

    #[tokio::test]
    async fn probe_failure_creates_no_record_but_keeps_blob() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let extractor = FrameExtractor::new(
            install_ffmpeg_stub(bin.path(), 5),
            install_failing_ffprobe(bin.path()),
        );
        let h = harness_with(bin, root, extractor);

        let err = h.pipeline.run(h.form(None).await).await.unwrap_err();
        assert!(matches!(err, UploadError::Probe(_)));
        assert!(err.to_string().contains("Invalid data found"));
        assert!(h.store.list_videos().unwrap().is_empty());
        assert_eq!(files_in(h.root.path()), 1);
    }

    #[tokio::test]
    async fn missing_parts_leave_nothing_on_disk() {
        let h = harness("10", 5);

        let no_file = UploadForm {
            name: Some("Intro".into()),
            ..UploadForm::default()
        };
        let err = h.pipeline.run(no_file).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingFile));

        let mut no_name = h.form(None).await;
        no_name.name = None;
        let err = h.pipeline.run(no_name).await.unwrap_err();
        assert_eq!(err.to_string(), "missing form field `name`");

        assert_eq!(files_in(h.root.path()), 0);
        assert!(h.store.list_videos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_without_usable_extension_gets_previews() {
        let h = harness("10", 5);
        for original_name in [Some("clip"), Some("clip.m p4"), None] {
            let form = h.form_named(original_name, None).await;
            let record = h.pipeline.run(form).await.unwrap();
            assert!(record.url.ends_with(".bin"), "{}", record.url);
            assert_eq!(record.preview_frames_url.len(), 5);
        }
        assert_eq!(h.store.list_videos().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn frame_failure_creates_no_record() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let extractor = FrameExtractor::new(
            install_failing_ffmpeg(bin.path()),
            install_ffprobe_stub(bin.path(), "10"),
        );
        let h = harness_with(bin, root, extractor);

        let err = h.pipeline.run(h.form(None).await).await.unwrap_err();
        assert!(matches!(err, UploadError::Frames(FrameError::Failed { .. })));
        assert!(err.to_string().starts_with("extracting preview frames"));
        assert!(h.store.list_videos().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_links_into_existing_tutorial() {
        let h = harness("10", 2);
        let tutorial = h.store.insert_tutorial("Rust basics").unwrap();

        let first = h.pipeline.run(h.form(Some(&tutorial.id)).await).await.unwrap();
        let second = h.pipeline.run(h.form(Some(&tutorial.id)).await).await.unwrap();

        let videos = h.store.get_tutorial(&tutorial.id).unwrap().unwrap().videos;
        assert_eq!(videos, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn failed_tutorial_link_does_not_fail_upload() {
        let h = harness("10", 2);
        let unknown = uuid::Uuid::new_v4().to_string();

        let record = h.pipeline.run(h.form(Some(&unknown)).await).await.unwrap();
        assert!(h.store.get_video(&record.id).unwrap().is_some());

        let record = h.pipeline.run(h.form(Some("not-an-id")).await).await.unwrap();
        assert!(h.store.get_video(&record.id).unwrap().is_some());
    }
}
