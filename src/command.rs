//! Argument-vector construction for the external media tools.
//!
//! Every builder here is pure: same input, same output, no filesystem access.
//! Callers check that device and video paths exist before building.

use crate::error::MASK;
use crate::stream::{SourceKind, StreamConfig};
use std::path::{Path, PathBuf};
use url::Url;

/// File name pattern written by the frame producer into the staging dir.
pub const FRAME_PATTERN: &str = "frame_%06d.jpg";

/// A program plus its arguments, with a parallel rendering safe to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: PathBuf,
    args: Vec<String>,
    shown: Vec<String>,
    /// Text scrubbed from anything the process prints.
    secrets: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shown: Vec::new(),
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.shown.push(arg.clone());
        self.args.push(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// An argument carrying a secret, with the text to log in its place.
    pub fn secret_arg(mut self, raw: impl Into<String>, shown: impl Into<String>) -> Self {
        self.args.push(raw.into());
        self.shown.push(shown.into());
        self
    }

    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Credential-free rendering for logs and error messages.
    pub fn redacted(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.shown.iter().map(|a| {
                if a.contains(char::is_whitespace) {
                    format!("\"{}\"", a)
                } else {
                    a.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 质量百分比 -> ffmpeg `-q:v` (1 最好, 31 最差)，越界输入被钳制
pub fn quality_to_qscale(quality: i32) -> u8 {
    let q = quality.clamp(0, 100) as u32;
    (31 - q * 30 / 100) as u8
}

/// ffmpeg decoding a looping file into numbered JPEGs inside `staging_dir`.
pub fn frame_producer(ffmpeg: &Path, cfg: &StreamConfig, video: &Path, staging_dir: &Path) -> CommandLine {
    CommandLine::new(ffmpeg)
        .args(["-hide_banner", "-nostdin", "-y"])
        .args(["-stream_loop", "-1", "-re"])
        .arg("-i")
        .arg(video.to_string_lossy())
        .arg("-vf")
        .arg(format!(
            "fps={},scale={}:{}",
            cfg.framerate, cfg.resolution.width, cfg.resolution.height
        ))
        .arg("-q:v")
        .arg(quality_to_qscale(cfg.quality).to_string())
        .arg(staging_dir.join(FRAME_PATTERN).to_string_lossy())
}

/// mjpg_streamer serving either a capture device or the staging dir.
pub fn mjpg_streamer(binary: &Path, cfg: &StreamConfig, staging_dir: &Path) -> CommandLine {
    let input = match cfg.source_type {
        SourceKind::Device => format!(
            "input_uvc.so -d {} -r {} -f {} -q {}",
            cfg.device.display(),
            cfg.resolution,
            cfg.framerate,
            cfg.quality.clamp(0, 100)
        ),
        SourceKind::File => format!("input_file.so -folder {} -d 0 -r", staging_dir.display()),
    };

    let output = format!("output_http.so -p {} -n", cfg.port);
    let cmd = CommandLine::new(binary)
        .with_secrets(cfg.secrets())
        .arg("-i")
        .arg(input)
        .arg("-o");

    match cfg.credentials() {
        Some((user, pass)) => cmd.secret_arg(
            format!("{} -c {}:{}", output, user, pass),
            format!("{} -c {}:{}", output, user, MASK),
        ),
        None => cmd.arg(output),
    }
}

/// Ingest address on the relay, with and without the password.
pub fn ingest_url(cfg: &StreamConfig, host: &str, path: &str) -> (String, String) {
    let base = format!("rtsp://{}:{}/{}", host, cfg.port, path.trim_start_matches('/'));
    let Some((user, pass)) = cfg.credentials() else {
        return (base.clone(), base);
    };

    let with_auth = |password: &str| -> String {
        match Url::parse(&base) {
            Ok(mut url) => {
                let _ = url.set_username(user);
                let _ = url.set_password(Some(password));
                url.to_string()
            }
            Err(_) => base.clone(),
        }
    };
    (with_auth(pass), with_auth(MASK))
}

/// ffmpeg encoding the source to H.264 and pushing it to the relay.
pub fn rtsp_encoder(ffmpeg: &Path, cfg: &StreamConfig, host: &str, path: &str) -> CommandLine {
    let cmd = CommandLine::new(ffmpeg)
        .with_secrets(cfg.secrets())
        .args(["-hide_banner", "-nostdin"]);

    let cmd = match cfg.source_type {
        SourceKind::Device => cmd
            .args(["-f", "v4l2", "-input_format", "mjpeg", "-video_size"])
            .arg(cfg.resolution.to_string())
            .arg("-framerate")
            .arg(cfg.framerate.to_string())
            .arg("-i")
            .arg(cfg.device.to_string_lossy())
            .args(encoder_flags(&cfg.bitrate)),
        SourceKind::File => cmd
            .args(["-stream_loop", "-1", "-re", "-i"])
            .arg(
                cfg.video_path
                    .as_deref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
            .args(encoder_flags(&cfg.bitrate))
            .arg("-s")
            .arg(cfg.resolution.to_string())
            .arg("-r")
            .arg(cfg.framerate.to_string()),
    };

    let (url, shown) = ingest_url(cfg, host, path);
    cmd.args(["-f", "rtsp"]).secret_arg(url, shown)
}

fn encoder_flags(bitrate: &str) -> [String; 8] {
    [
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-b:v".into(),
        bitrate.into(),
    ]
}
