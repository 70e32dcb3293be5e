#![forbid(unsafe_code)]

//! Wrapper around the external `yt-dlp` binary.
//!
//! Two invocations exist: a JSON probe that lists the logical entries behind
//! a URL (one for a single video, several for a playlist) and the actual
//! download. The download is driven through a line-oriented protocol on the
//! child's stdout: progress templates become [`ProgressEvent`]s and an
//! `after_move` print reports the exact final path per entry, which feeds the
//! first step of file-identity resolution.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::catalog::MediaType;
use crate::job::CancelToken;

const PROGRESS_TAG: &str = "VAULT_PROGRESS|";
const SAVED_TAG: &str = "VAULT_SAVED|";

const PROGRESS_TEMPLATE: &str = "download:VAULT_PROGRESS|%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s|%(progress.filename)s";
const SAVED_TEMPLATE: &str = "after_move:VAULT_SAVED|%(id)s|%(filepath)s";

/// Target format for a job: the download arguments and post-processing both
/// follow from this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatPolicy {
    Video,
    Audio,
}

impl FormatPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    /// Extension the post-processors leave behind, used when reconstructing
    /// an expected output path.
    pub fn target_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    pub fn media_type(self) -> MediaType {
        match self {
            Self::Video => MediaType::Video,
            Self::Audio => MediaType::Audio,
        }
    }

    fn format_args(self) -> &'static [&'static str] {
        match self {
            Self::Video => &[
                "-f",
                "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best",
                "--merge-output-format",
                "mp4",
            ],
            Self::Audio => &[
                "-f",
                "bestaudio/best",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "--embed-thumbnail",
                "--embed-metadata",
            ],
        }
    }
}

/// One logical item behind a URL, as reported by the probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub title: String,
}

/// Progress fields relayed into the job snapshot, one per template line.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub percent: String,
    pub speed: String,
    pub eta: String,
    pub filename: String,
}

/// How a download invocation ended. `Finished` maps each entry id to the
/// exact path yt-dlp reported after post-processing; entries that failed
/// mid-batch simply have no key here.
#[derive(Debug)]
pub enum DownloadOutcome {
    Finished { saved: HashMap<String, PathBuf> },
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct ProbePayload {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Option<ProbeEntry>>>,
}

#[derive(Debug, Deserialize)]
struct ProbeEntry {
    id: Option<String>,
    title: Option<String>,
}

/// Handle to the yt-dlp program. The server keeps one instance; tests point
/// it at a stub script instead.
#[derive(Clone, Debug)]
pub struct Ytdlp {
    program: PathBuf,
}

impl Ytdlp {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }

    /// Resolves the program from `MEDIAVAULT_YTDLP` when set, otherwise from
    /// PATH lookup of `yt-dlp`.
    pub fn from_env() -> Self {
        if let Ok(value) = std::env::var("MEDIAVAULT_YTDLP") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Self::with_program(trimmed);
            }
        }
        Self::new()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// Runs `--version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> Result<()> {
        let status = self
            .command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    /// Lists the logical entries behind `url` without downloading anything.
    pub fn probe(&self, url: &str) -> Result<Vec<Entry>> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--ignore-errors")
            .arg(url)
            .output()
            .with_context(|| format!("probing {url}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let cause = last_line(&stderr).unwrap_or("yt-dlp probe failed");
            bail!("{cause}");
        }

        let payload: ProbePayload =
            serde_json::from_slice(&output.stdout).context("parsing yt-dlp probe response")?;

        let mut entries = Vec::new();
        if let Some(listed) = payload.entries {
            for entry in listed.into_iter().flatten() {
                if let Some(id) = entry.id {
                    let title = entry.title.unwrap_or_else(|| id.clone());
                    entries.push(Entry { id, title });
                }
            }
        } else if let Some(id) = payload.id {
            let title = payload.title.unwrap_or_else(|| id.clone());
            entries.push(Entry { id, title });
        }

        if entries.is_empty() {
            bail!("no downloadable entries found for {url}");
        }
        Ok(entries)
    }

    /// Downloads `url` into `media_dir`, invoking `on_progress` per progress
    /// line. The token is checked before every line is processed; once it
    /// trips, the child is killed and the call unwinds as `Cancelled` without
    /// reporting any saved file.
    pub fn download(
        &self,
        url: &str,
        policy: FormatPolicy,
        media_dir: &Path,
        token: &CancelToken,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<DownloadOutcome> {
        let output_template = media_dir.join("%(title)s.%(ext)s");

        let mut command = self.command();
        command
            .arg("--newline")
            .arg("--no-warnings")
            .arg("--ignore-errors")
            .arg("--restrict-filenames")
            .arg("--output")
            .arg(output_template.as_os_str())
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--print")
            .arg(SAVED_TEMPLATE)
            .args(policy.format_args())
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("starting yt-dlp for {url}"))?;
        let stdout = child
            .stdout
            .take()
            .context("capturing yt-dlp stdout for progress tracking")?;
        let stderr = child
            .stderr
            .take()
            .context("capturing yt-dlp stderr")?;

        // Drained on its own thread so a chatty stderr cannot fill the pipe
        // and stall the child; only the last non-empty line is kept.
        let stderr_tail: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let tail_for_thread = Arc::clone(&stderr_tail);
        let stderr_handle = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            let mut last = None;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    last = Some(trimmed.to_string());
                }
            }
            if let Ok(mut guard) = tail_for_thread.lock() {
                *guard = last;
            }
        });

        let mut saved = HashMap::new();
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = line.context("reading yt-dlp progress stream")?;

            if token.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_handle.join();
                return Ok(DownloadOutcome::Cancelled);
            }

            if let Some(rest) = line.strip_prefix(PROGRESS_TAG) {
                if let Some(event) = parse_progress(rest) {
                    on_progress(event);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix(SAVED_TAG)
                && let Some((id, path)) = rest.split_once('|')
            {
                saved.insert(id.to_string(), PathBuf::from(path.trim()));
            }
        }

        let status = child.wait().context("waiting for yt-dlp")?;
        let _ = stderr_handle.join();

        if token.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled);
        }

        if !status.success() && saved.is_empty() {
            let tail = stderr_tail
                .lock()
                .ok()
                .and_then(|guard| guard.clone())
                .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
            bail!("{tail}");
        }
        if !status.success() {
            // Partial batch: --ignore-errors kept going past bad entries but
            // the exit code still reports them. The saved files are real.
            eprintln!(
                "  Warning: yt-dlp reported failures for {} (status {}), continuing with {} saved file(s)",
                url,
                status,
                saved.len()
            );
        }

        Ok(DownloadOutcome::Finished { saved })
    }
}

impl Default for Ytdlp {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `percent|speed|eta|filename`; the filename keeps any later pipes.
fn parse_progress(rest: &str) -> Option<ProgressEvent> {
    let mut parts = rest.splitn(4, '|');
    let percent = parts.next()?.trim().to_string();
    let speed = parts.next()?.trim().to_string();
    let eta = parts.next()?.trim().to_string();
    let filename = parts
        .next()
        .map(|value| {
            Path::new(value.trim())
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| value.trim().to_string())
        })
        .unwrap_or_default();
    Some(ProgressEvent {
        percent,
        speed,
        eta,
        filename,
    })
}

fn last_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
}
