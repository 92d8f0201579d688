//! MP4Box-backed execution worker.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{TerminateOutcome, terminate, tokio_command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::lines::{OutputLine, OutputSource, OutputTail, spawn_line_reader};
use super::progress::{MonotonicProgress, ProgressReporter, parse_progress_line};
use super::{ExecutionError, MuxExecutor};
use crate::queue::{AudioTrack, MuxSpec, SubtitleTrack};

/// Program name looked up on `PATH` when no explicit path is configured.
pub const DEFAULT_MP4BOX_PROGRAM: &str = "MP4Box";

/// How long to keep reading output after the tool exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tx3g flag value marking every sample as forced.
const FORCED_TXTFLAGS: &str = "0xC0000000";

/// Settings for [`Mp4BoxExecutor`].
#[derive(Debug, Clone)]
pub struct Mp4BoxConfig {
    /// Path to the MP4Box binary.
    pub program: PathBuf,
    /// Time between SIGTERM and a forced kill on cancellation.
    pub cancel_grace: Duration,
    /// Output lines kept for failure reports.
    pub tail_lines: usize,
}

impl Default for Mp4BoxConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_MP4BOX_PROGRAM),
            cancel_grace: Duration::from_secs(3),
            tail_lines: 40,
        }
    }
}

/// Runs GPAC's MP4Box to mux a [`MuxSpec`].
pub struct Mp4BoxExecutor {
    config: Mp4BoxConfig,
}

impl Mp4BoxExecutor {
    pub fn new(config: Mp4BoxConfig) -> Self {
        Self { config }
    }

    /// Create with a custom MP4Box path and default timings.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self::new(Mp4BoxConfig {
            program: program.into(),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &Mp4BoxConfig {
        &self.config
    }

    /// Build MP4Box arguments for `spec`.
    ///
    /// `chapters_file` is the OGM chapter file to attach, if any.
    pub fn build_args(spec: &MuxSpec, chapters_file: Option<&Path>) -> Vec<String> {
        // -new creates a fresh output instead of appending to an existing file
        let mut args = vec!["-new".to_string()];

        if let Some(video) = &spec.video {
            let mut opts = format!("{}#video", video.path.display());
            push_common_opts(&mut opts, video.language.as_deref(), &video.title);
            if video.delay_ms != 0 {
                opts.push_str(&format!(":delay={}", video.delay_ms));
            }
            args.extend(["-add".to_string(), opts]);
        }

        let audio_has_default = spec.audio.iter().any(|t| t.default);
        for track in &spec.audio {
            args.extend(["-add".to_string(), audio_opts(track, audio_has_default)]);
        }

        let subs_have_default = spec.subtitles.iter().any(|t| t.default);
        for track in &spec.subtitles {
            args.extend(["-add".to_string(), subtitle_opts(track, subs_have_default)]);
        }

        if let Some(chapters) = chapters_file {
            args.extend(["-chap".to_string(), chapters.display().to_string()]);
        }

        args.push(spec.output.display().to_string());
        args
    }

    /// Write chapter text to a temp file that lives as long as the returned handle.
    fn write_chapters(spec: &MuxSpec) -> Result<Option<tempfile::NamedTempFile>, ExecutionError> {
        let Some(chapters) = spec.chapters.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };

        let mut file = tempfile::Builder::new()
            .prefix("muxq-chapters-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(chapters.as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }

    fn spawn_error(&self, e: std::io::Error) -> ExecutionError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecutionError::NotFound {
                program: DEFAULT_MP4BOX_PROGRAM,
                path: self.config.program.clone(),
            }
        } else {
            ExecutionError::Launch {
                path: self.config.program.clone(),
                source: e,
            }
        }
    }
}

impl Default for Mp4BoxExecutor {
    fn default() -> Self {
        Self::new(Mp4BoxConfig::default())
    }
}

fn push_common_opts(opts: &mut String, language: Option<&str>, title: &str) {
    if let Some(lang) = language.filter(|l| !l.is_empty()) {
        opts.push_str(&format!(":lang={}", lang));
    }
    // An explicit empty name clears whatever title the source carried.
    opts.push_str(&format!(":name={}", title));
}

fn audio_opts(track: &AudioTrack, group_has_default: bool) -> String {
    let mut opts = match track.track_id {
        Some(id) => format!("{}#trackID={}", track.path.display(), id),
        None => format!("{}#audio", track.path.display()),
    };
    push_common_opts(&mut opts, track.language.as_deref(), &track.title);
    if track.delay_ms != 0 {
        opts.push_str(&format!(":delay={}", track.delay_ms));
    }
    if group_has_default && !track.default {
        opts.push_str(":disable");
    }
    opts
}

fn subtitle_opts(track: &SubtitleTrack, group_has_default: bool) -> String {
    let mut opts = match track.track_id {
        Some(id) => format!("{}#trackID={}", track.path.display(), id),
        None => track.path.display().to_string(),
    };
    push_common_opts(&mut opts, track.language.as_deref(), &track.title);
    if track.forced {
        opts.push_str(&format!(":txtflags={}", FORCED_TXTFLAGS));
    }
    if group_has_default && !track.default {
        opts.push_str(":disable");
    }
    opts
}

/// Bookkeeping for one run's output stream.
struct RunOutput {
    tail: OutputTail,
    progress: MonotonicProgress,
    saw_terminator: bool,
}

impl RunOutput {
    fn new(tail_lines: usize) -> Self {
        Self {
            tail: OutputTail::new(tail_lines),
            progress: MonotonicProgress::new(),
            saw_terminator: false,
        }
    }

    fn on_line(&mut self, line: OutputLine, reporter: &ProgressReporter) {
        match line.source {
            OutputSource::Stdout => trace!("stdout: {}", line.text),
            OutputSource::Stderr => trace!("stderr: {}", line.text),
        }

        if let Some(parsed) = parse_progress_line(&line.text) {
            if parsed.is_terminal() {
                self.saw_terminator = true;
            }
            if let Some(percent) = self.progress.accept(parsed.percent) {
                reporter.report(percent, parsed.message);
            }
            // Bars are redrawn constantly; keep only real messages in the tail.
            return;
        }

        self.tail.push(line.text);
    }
}

#[async_trait]
impl MuxExecutor for Mp4BoxExecutor {
    async fn run(
        &self,
        spec: &MuxSpec,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ExecutionError> {
        let chapters = Self::write_chapters(spec)?;
        let args = Self::build_args(spec, chapters.as_ref().map(|f| f.path()));
        debug!(program = %self.config.program.display(), ?args, "Launching MP4Box");

        let mut cmd = tokio_command(&self.config.program);
        cmd.args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputSource::Stderr, tx.clone());
        }
        // Readers hold the remaining senders; the channel closes once both pipes hit EOF.
        drop(tx);

        let mut output = RunOutput::new(self.config.tail_lines);
        let mut lines_open = true;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(output = %spec.output.display(), "Cancel requested, stopping MP4Box");
                    match terminate(&mut child, self.config.cancel_grace).await {
                        Ok(TerminateOutcome::Killed) => warn!("MP4Box had to be killed"),
                        Ok(outcome) => debug!(?outcome, "MP4Box stopped"),
                        Err(e) => warn!(error = %e, "Failed to stop MP4Box"),
                    }
                    return Err(ExecutionError::Canceled);
                }
                line = rx.recv(), if lines_open => match line {
                    Some(line) => output.on_line(line, &progress),
                    None => lines_open = false,
                },
                status = child.wait() => break status?,
            }
        };

        let drain = async {
            while let Some(line) = rx.recv().await {
                output.on_line(line, &progress);
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("MP4Box output still open after exit, ignoring the rest");
        }

        if status.success() {
            info!(output = %spec.output.display(), "MP4Box finished");
            return Ok(spec.output.clone());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none (terminated by signal)".to_string());

        if output.saw_terminator {
            warn!(code = %code, "MP4Box exited unsuccessfully after writing the output");
            return Ok(spec.output.clone());
        }

        let details = if output.tail.is_empty() {
            "no output".to_string()
        } else {
            output.tail.join()
        };
        Err(ExecutionError::ToolFailed(format!(
            "MP4Box exited with code {}\n{}",
            code, details
        )))
    }

    fn name(&self) -> &'static str {
        "Mp4BoxExecutor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{SubtitleTrack, VideoTrack};

    fn audio(path: &str, default: bool) -> AudioTrack {
        AudioTrack {
            path: path.into(),
            language: Some("jpn".to_string()),
            title: "Stereo".to_string(),
            delay_ms: 0,
            default,
            track_id: None,
        }
    }

    #[test]
    fn test_build_args_simple() {
        let spec = MuxSpec::new("out1.mp4").with_video("a.mp4");
        let args = Mp4BoxExecutor::build_args(&spec, None);
        assert_eq!(args, vec!["-new", "-add", "a.mp4#video:name=", "out1.mp4"]);
    }

    #[test]
    fn test_build_args_video_options() {
        let mut spec = MuxSpec::new("/out/movie.mp4");
        spec.video = Some(VideoTrack {
            path: "/in/video.h264".into(),
            language: Some("eng".to_string()),
            title: "Main".to_string(),
            delay_ms: -40,
        });

        let args = Mp4BoxExecutor::build_args(&spec, None);
        assert_eq!(args[2], "/in/video.h264#video:lang=eng:name=Main:delay=-40");
        assert_eq!(args.last().unwrap(), "/out/movie.mp4");
    }

    #[test]
    fn test_build_args_track_order_and_default_flags() {
        let mut second = audio("b.ac3", false);
        second.track_id = Some(3);
        second.delay_ms = 120;

        let spec = MuxSpec::new("out.mp4")
            .with_video("a.mp4")
            .with_audio(audio("a.aac", true))
            .with_audio(second);

        let args = Mp4BoxExecutor::build_args(&spec, None);
        assert_eq!(
            args,
            vec![
                "-new",
                "-add",
                "a.mp4#video:name=",
                "-add",
                "a.aac#audio:lang=jpn:name=Stereo",
                "-add",
                "b.ac3#trackID=3:lang=jpn:name=Stereo:delay=120:disable",
                "out.mp4",
            ]
        );
    }

    #[test]
    fn test_build_args_without_default_keeps_all_tracks_enabled() {
        let spec = MuxSpec::new("out.mp4")
            .with_audio(audio("a.aac", false))
            .with_audio(audio("b.aac", false));
        let args = Mp4BoxExecutor::build_args(&spec, None);
        assert!(args.iter().all(|a| !a.contains(":disable")));
    }

    #[test]
    fn test_build_args_subtitles_and_chapters() {
        let spec = MuxSpec::new("out.mp4")
            .with_video("a.mp4")
            .with_subtitle(SubtitleTrack {
                path: "signs.srt".into(),
                language: Some("eng".to_string()),
                title: "Signs".to_string(),
                default: false,
                forced: true,
                track_id: None,
            });

        let args = Mp4BoxExecutor::build_args(&spec, Some(Path::new("/tmp/ch.txt")));
        assert!(args.contains(&"signs.srt:lang=eng:name=Signs:txtflags=0xC0000000".to_string()));
        let chap = args.iter().position(|a| a == "-chap").unwrap();
        assert_eq!(args[chap + 1], "/tmp/ch.txt");
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_write_chapters_skips_blank_text() {
        let spec = MuxSpec::new("out.mp4").with_video("a.mp4").with_chapters("  ");
        assert!(Mp4BoxExecutor::write_chapters(&spec).unwrap().is_none());

        let text = "CHAPTER01=00:00:00.000\nCHAPTER01NAME=Intro\n";
        let spec = MuxSpec::new("out.mp4").with_video("a.mp4").with_chapters(text);
        let file = Mp4BoxExecutor::write_chapters(&spec).unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), text);
    }

    #[tokio::test]
    async fn test_missing_program_reports_not_found() {
        let executor = Mp4BoxExecutor::with_program("/definitely/not/here/MP4Box");
        let spec = MuxSpec::new("out.mp4").with_video("a.mp4");

        let err = executor
            .run(&spec, ProgressReporter::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }
}
