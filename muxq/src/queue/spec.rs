//! Track/output description submitted with a mux job.
//!
//! A [`MuxSpec`] is frozen once the job exists; editing means removing the
//! job and submitting a new one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The video track of a mux job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTrack {
    pub path: PathBuf,
    /// ISO 639-2 code, e.g. `eng`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub delay_ms: i64,
}

/// One audio track of a mux job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub delay_ms: i64,
    #[serde(default)]
    pub default: bool,
    /// Track to pick from a multi-track input; `None` takes the first audio track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u32>,
}

/// One subtitle track of a mux job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u32>,
}

/// Everything the external tool needs to produce one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoTrack>,
    #[serde(default)]
    pub audio: Vec<AudioTrack>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    /// OGM-style chapter text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<String>,
    pub output: PathBuf,
}

impl MuxSpec {
    /// Start a spec that writes to `output` with no tracks yet.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            video: None,
            audio: Vec::new(),
            subtitles: Vec::new(),
            chapters: None,
            output: output.into(),
        }
    }

    pub fn with_video(mut self, path: impl Into<PathBuf>) -> Self {
        self.video = Some(VideoTrack {
            path: path.into(),
            language: None,
            title: String::new(),
            delay_ms: 0,
        });
        self
    }

    pub fn with_audio(mut self, track: AudioTrack) -> Self {
        self.audio.push(track);
        self
    }

    pub fn with_subtitle(mut self, track: SubtitleTrack) -> Self {
        self.subtitles.push(track);
        self
    }

    pub fn with_chapters(mut self, chapters: impl Into<String>) -> Self {
        self.chapters = Some(chapters.into());
        self
    }

    /// Number of media tracks (chapters excluded).
    pub fn track_count(&self) -> usize {
        usize::from(self.video.is_some()) + self.audio.len() + self.subtitles.len()
    }

    /// Check the spec is something the queue can accept.
    ///
    /// Returns a human-readable reason on rejection.
    pub fn validate(&self) -> Result<(), String> {
        if is_blank(&self.output) {
            return Err("output path is empty".to_string());
        }
        if self.track_count() == 0 {
            return Err("at least one video, audio or subtitle track is required".to_string());
        }

        if let Some(video) = &self.video
            && is_blank(&video.path)
        {
            return Err("video track has an empty path".to_string());
        }
        if let Some(idx) = self.audio.iter().position(|t| is_blank(&t.path)) {
            return Err(format!("audio track #{} has an empty path", idx + 1));
        }
        if let Some(idx) = self.subtitles.iter().position(|t| is_blank(&t.path)) {
            return Err(format!("subtitle track #{} has an empty path", idx + 1));
        }

        Ok(())
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(path: &str) -> AudioTrack {
        AudioTrack {
            path: path.into(),
            language: Some("eng".to_string()),
            title: String::new(),
            delay_ms: 0,
            default: false,
            track_id: None,
        }
    }

    #[test]
    fn test_validate_accepts_video_only() {
        let spec = MuxSpec::new("out1.mp4").with_video("a.mp4");
        assert!(spec.validate().is_ok());
        assert_eq!(spec.track_count(), 1);
    }

    #[test]
    fn test_validate_accepts_audio_only() {
        let spec = MuxSpec::new("out.m4a").with_audio(audio("a.aac"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_output() {
        let spec = MuxSpec::new("  ").with_video("a.mp4");
        assert_eq!(spec.validate().unwrap_err(), "output path is empty");
    }

    #[test]
    fn test_validate_rejects_no_tracks() {
        let spec = MuxSpec::new("out.mp4").with_chapters("CHAPTER01=00:00:00.000");
        assert!(spec.validate().unwrap_err().contains("at least one"));
    }

    #[test]
    fn test_validate_rejects_blank_track_path() {
        let spec = MuxSpec::new("out.mp4")
            .with_video("a.mp4")
            .with_audio(audio("b.aac"))
            .with_audio(audio(""));
        assert_eq!(spec.validate().unwrap_err(), "audio track #2 has an empty path");
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let json = r#"{
            "video": { "path": "a.mp4" },
            "audio": [{ "path": "b.ac3", "language": "jpn", "default": true }],
            "output": "out.mp4"
        }"#;

        let spec: MuxSpec = serde_json::from_str(json).unwrap();
        let video = spec.video.as_ref().unwrap();
        assert_eq!(video.delay_ms, 0);
        assert!(video.title.is_empty());
        assert_eq!(spec.audio[0].language.as_deref(), Some("jpn"));
        assert!(spec.audio[0].default);
        assert!(spec.subtitles.is_empty());
        assert!(spec.chapters.is_none());
    }
}
