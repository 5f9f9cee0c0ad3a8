//! ffmpeg argument construction per operation kind
//!
//! Everything here is pure: validation and argument building happen before
//! the backend touches the filesystem or spawns anything.

use super::encoder::{quality_args, EncoderChoice};
use super::RenderError;
use crate::config::EncodingConfig;
use crate::startup::check_args_for_hardware_flags;
use crate::task::{Operation, TaskId};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flags every invocation carries so progress arrives as key=value lines on stdout
const COMMON_ARGS: &[&str] = &["-hide_banner", "-nostdin", "-y", "-progress", "pipe:1", "-nostats"];

/// File name pattern for extracted frames inside the output directory
pub const FRAME_PATTERN: &str = "frame_%06d.jpg";

/// Everything the backend needs to run one task
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub task_id: TaskId,
    pub operation: Operation,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Fully resolved settings, thread hint included
    pub encoding: EncodingConfig,
    pub timeout: Option<Duration>,
}

/// Concat demuxer list to write before spawning
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatList {
    pub path: PathBuf,
    pub contents: String,
}

/// A validated ffmpeg invocation
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub args: Vec<OsString>,
    /// Non-path arguments, as checked by the software-only guard
    pub options: Vec<String>,
    pub encoder: Option<EncoderChoice>,
    pub concat_list: Option<ConcatList>,
    /// Directories to create before spawning
    pub create_dirs: Vec<PathBuf>,
}

impl PreparedCommand {
    /// Arguments as lossy strings, for logging
    pub fn display_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

#[derive(Default)]
struct ArgList {
    args: Vec<OsString>,
    options: Vec<String>,
}

impl ArgList {
    fn opt(&mut self, arg: impl Into<String>) -> &mut Self {
        let arg = arg.into();
        self.args.push(OsString::from(&arg));
        self.options.push(arg);
        self
    }

    fn opts<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.opt(arg);
        }
        self
    }

    fn path(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.args.push(path.as_ref().as_os_str().to_os_string());
        self
    }
}

/// Whether the operation re-encodes video and so needs an encoder choice
pub fn uses_encoder(operation: &Operation) -> bool {
    matches!(
        operation,
        Operation::Transcode(_) | Operation::Resize(_) | Operation::ApplyFilter(_)
    )
}

/// Check the task's parameters without building anything
pub fn validate(job: &RenderJob) -> Result<(), RenderError> {
    let invalid = |msg: &str| Err(RenderError::Validation(msg.to_string()));

    if job.output_path.as_os_str().is_empty() {
        return invalid("output path is empty");
    }
    let needs_input = !matches!(job.operation, Operation::Concat(_));
    if needs_input && job.input_path.as_os_str().is_empty() {
        return invalid("input path is empty");
    }

    match &job.operation {
        Operation::Transcode(_) => Ok(()),
        Operation::Resize(p) => {
            if p.width == 0 || p.height == 0 {
                return invalid("resize requires non-zero target width and height");
            }
            Ok(())
        }
        Operation::Concat(p) => {
            if p.sources.is_empty() {
                return invalid("concat requires at least one source");
            }
            if p.sources.iter().any(|s| s.as_os_str().is_empty()) {
                return invalid("concat source path is empty");
            }
            Ok(())
        }
        Operation::ExtractFrames(p) => {
            if !p.fps.is_finite() || p.fps <= 0.0 {
                return invalid("extract_frames requires a positive frame rate");
            }
            Ok(())
        }
        Operation::ApplyFilter(p) => {
            if p.filters.is_empty() {
                return invalid("apply_filter requires at least one filter");
            }
            if p.filters.iter().any(|f| f.trim().is_empty()) {
                return invalid("apply_filter filter expression is empty");
            }
            Ok(())
        }
        Operation::Thumbnail(p) => {
            if p.width == 0 || p.height == 0 {
                return invalid("thumbnail requires non-zero width and height");
            }
            if !p.timestamp_secs.is_finite() || p.timestamp_secs < 0.0 {
                return invalid("thumbnail timestamp must be a non-negative number");
            }
            Ok(())
        }
    }
}

/// Build the ffmpeg invocation for `job`
///
/// `choice` is consulted only by operations that re-encode video. When
/// `disallow_hardware` is set, any option naming a hardware path is
/// rejected as a validation error.
pub fn build_command(
    job: &RenderJob,
    choice: &EncoderChoice,
    temp_dir: &Path,
    disallow_hardware: bool,
) -> Result<PreparedCommand, RenderError> {
    validate(job)?;

    let mut list = ArgList::default();
    list.opts(COMMON_ARGS.iter().copied());

    let mut encoder = None;
    let mut concat_list = None;
    let mut create_dirs = Vec::new();
    if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dirs.push(parent.to_path_buf());
    }

    let encoding = &job.encoding;
    match &job.operation {
        Operation::Transcode(p) => {
            if choice.hardware {
                if let Some(hwaccel) = choice.vendor.hwaccel() {
                    list.opts(["-hwaccel", hwaccel]);
                }
            }
            list.opt("-i").path(&job.input_path);
            list.opts(["-c:v", choice.encoder.as_str()]);
            list.opts(quality_args(choice, encoding));
            list.opt("-g").opt(encoding.keyframe_interval.to_string());
            list.opts(["-pix_fmt", encoding.pixel_format.as_str()]);
            if encoding.threads > 0 {
                list.opt("-threads").opt(encoding.threads.to_string());
            }
            if p.copy_audio {
                list.opts(["-c:a", "copy"]);
            } else {
                list.opts(["-c:a", "aac", "-b:a", encoding.audio_bitrate.as_str()]);
            }
            list.path(&job.output_path);
            encoder = Some(choice.clone());
        }
        Operation::Resize(p) => {
            list.opt("-i").path(&job.input_path);
            list.opt("-vf").opt(format!("scale={}:{}", p.width, p.height));
            push_video_encoder(&mut list, choice, encoding);
            list.opts(["-c:a", "copy"]);
            list.path(&job.output_path);
            encoder = Some(choice.clone());
        }
        Operation::Concat(p) => {
            let path = temp_dir.join(format!("concat-{}.txt", job.task_id));
            concat_list = Some(ConcatList {
                contents: concat_list_contents(&p.sources),
                path: path.clone(),
            });
            create_dirs.push(temp_dir.to_path_buf());
            list.opts(["-f", "concat", "-safe", "0", "-i"]);
            list.path(&path);
            list.opts(["-c", "copy"]);
            list.path(&job.output_path);
        }
        Operation::ExtractFrames(p) => {
            create_dirs.push(job.output_path.clone());
            list.opt("-i").path(&job.input_path);
            list.opt("-vf").opt(format!("fps={}", p.fps));
            list.opts(["-q:v", "2"]);
            list.path(job.output_path.join(FRAME_PATTERN));
        }
        Operation::ApplyFilter(p) => {
            list.opt("-i").path(&job.input_path);
            list.opt("-vf").opt(p.filters.join(","));
            push_video_encoder(&mut list, choice, encoding);
            list.opts(["-c:a", "copy"]);
            list.path(&job.output_path);
            encoder = Some(choice.clone());
        }
        Operation::Thumbnail(p) => {
            list.opt("-ss").opt(format!("{:.3}", p.timestamp_secs));
            list.opt("-i").path(&job.input_path);
            list.opts(["-vframes", "1"]);
            list.opt("-s").opt(format!("{}x{}", p.width, p.height));
            list.opts(["-q:v", "2"]);
            list.path(&job.output_path);
        }
    }

    check_args_for_hardware_flags(&list.options, disallow_hardware)
        .map_err(|e| RenderError::Validation(e.to_string()))?;

    Ok(PreparedCommand {
        args: list.args,
        options: list.options,
        encoder,
        concat_list,
        create_dirs,
    })
}

fn push_video_encoder(list: &mut ArgList, choice: &EncoderChoice, encoding: &EncodingConfig) {
    list.opts(["-c:v", choice.encoder.as_str()]);
    list.opts(quality_args(choice, encoding));
    if encoding.threads > 0 {
        list.opt("-threads").opt(encoding.threads.to_string());
    }
}

/// Concat demuxer list with one `file '<path>'` line per source
///
/// Relative sources are anchored at the working directory, since the
/// demuxer resolves them against the list file's own location.
fn concat_list_contents(sources: &[PathBuf]) -> String {
    let cwd = std::env::current_dir().ok();
    sources
        .iter()
        .map(|source| {
            let absolute = match &cwd {
                Some(cwd) if source.is_relative() => cwd.join(source),
                _ => source.clone(),
            };
            let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}
