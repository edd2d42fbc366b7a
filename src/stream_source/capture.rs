//! Blocking capture backends
//!
//! `FfmpegOpener` decodes any feed ffmpeg understands into raw RGB24 frames
//! read from the child's stdout. Dimensions and frame rate come from an
//! ffprobe call made before decoding starts.

use super::{StreamError, StreamInfo, StreamKind};
use image::RgbImage;
use serde::Deserialize;
use std::io::{BufReader, ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

/// An opened feed; every call blocks the calling thread
pub trait VideoCapture: Send {
    fn info(&self) -> StreamInfo;

    /// Next decoded frame, `Ok(None)` at end-of-stream
    fn read(&mut self) -> Result<Option<RgbImage>, StreamError>;

    /// Release the underlying handle
    fn close(&mut self);
}

/// Factory for capture handles
pub trait CaptureOpener: Send + Sync {
    fn open(&self, url: &str, kind: StreamKind) -> Result<Box<dyn VideoCapture>, StreamError>;
}

/// ffmpeg/ffprobe subprocess backend
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    ffmpeg_path: String,
    ffprobe_path: String,
    io_timeout: Option<Duration>,
}

impl FfmpegOpener {
    pub fn new(io_timeout: Option<Duration>) -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            io_timeout,
        }
    }

    pub fn with_binaries(mut self, ffmpeg_path: &str, ffprobe_path: &str) -> Self {
        self.ffmpeg_path = ffmpeg_path.to_string();
        self.ffprobe_path = ffprobe_path.to_string();
        self
    }

    fn probe(&self, url: &str, kind: StreamKind) -> Result<StreamInfo, StreamError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error"])
            .args(input_args(kind, self.io_timeout))
            .args([
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,avg_frame_rate,r_frame_rate",
                "-of",
                "json",
            ])
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| StreamError::Connect(format!("ffprobe spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StreamError::Connect(format!(
                "ffprobe failed: {}",
                stderr.trim()
            )));
        }

        parse_probe(&output.stdout)
    }
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(30)))
    }
}

impl CaptureOpener for FfmpegOpener {
    fn open(&self, url: &str, kind: StreamKind) -> Result<Box<dyn VideoCapture>, StreamError> {
        let info = self.probe(url, kind)?;

        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(input_args(kind, self.io_timeout))
            .arg("-i")
            .arg(url)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StreamError::Connect(format!("ffmpeg spawn failed: {}", e)))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StreamError::Connect("ffmpeg stdout unavailable".to_string()));
            }
        };

        let frame_len = info.width as usize * info.height as usize * 3;
        tracing::debug!(
            url = %url,
            width = info.width,
            height = info.height,
            fps = info.fps,
            "ffmpeg capture started"
        );

        Ok(Box::new(FfmpegCapture {
            child,
            stdout: BufReader::with_capacity(frame_len, stdout),
            info,
            frame_len,
            closed: false,
        }))
    }
}

/// Running ffmpeg decoder
pub struct FfmpegCapture {
    child: Child,
    stdout: BufReader<ChildStdout>,
    info: StreamInfo,
    frame_len: usize,
    closed: bool,
}

impl VideoCapture for FfmpegCapture {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<RgbImage>, StreamError> {
        if self.closed {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            // Partial trailing frame counts as end-of-stream
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(StreamError::Read(e.to_string())),
        }

        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| StreamError::Read("frame buffer size mismatch".to_string()))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Demuxer options placed before `-i`
fn input_args(kind: StreamKind, io_timeout: Option<Duration>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(transport) = kind.transport_hint() {
        args.push("-rtsp_transport".to_string());
        args.push(transport.to_string());
    }
    if let Some(limit) = io_timeout {
        let micros = limit.as_micros().to_string();
        match kind {
            StreamKind::Rtsp => args.push("-timeout".to_string()),
            StreamKind::Http => args.push("-rw_timeout".to_string()),
        }
        args.push(micros);
    }
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> Result<StreamInfo, StreamError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| StreamError::Connect(format!("unreadable ffprobe output: {}", e)))?;

    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| StreamError::Connect("no video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(StreamError::Connect(
                "video stream has no dimensions".to_string(),
            ))
        }
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);

    Ok(StreamInfo { width, height, fps })
}

/// "30000/1001" -> 29.97; zero or malformed rates are None
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("15"), Some(15.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("garbage"), None);
    }

    #[test]
    fn test_parse_probe() {
        let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"0/0","r_frame_rate":"25/1"}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.fps, 25.0);
    }

    #[test]
    fn test_parse_probe_without_video() {
        assert!(matches!(
            parse_probe(br#"{"streams":[]}"#),
            Err(StreamError::Connect(_))
        ));
        assert!(matches!(
            parse_probe(br#"{"streams":[{"avg_frame_rate":"25/1"}]}"#),
            Err(StreamError::Connect(_))
        ));
        assert!(matches!(parse_probe(b"not json"), Err(StreamError::Connect(_))));
    }

    #[test]
    fn test_input_args() {
        let args = input_args(StreamKind::Rtsp, Some(Duration::from_secs(5)));
        assert_eq!(args, vec!["-rtsp_transport", "tcp", "-timeout", "5000000"]);

        let args = input_args(StreamKind::Http, Some(Duration::from_secs(2)));
        assert_eq!(args, vec!["-rw_timeout", "2000000"]);

        assert!(input_args(StreamKind::Http, None).is_empty());
    }

    #[test]
    fn test_missing_binary_is_connect_error() {
        let opener = FfmpegOpener::new(None)
            .with_binaries("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let result = opener.open("rtsp://cam/live", StreamKind::Rtsp);
        assert!(matches!(result, Err(StreamError::Connect(_))));
    }
}
