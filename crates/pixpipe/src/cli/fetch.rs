//! The `pixpipe fetch` command: load images concurrently through one pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use futures_util::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use pixpipe_core::{
    BlurPostprocessor, Config, GrayscalePostprocessor, ImagePipeline, ImageRef, ImageRequest,
    Origin, Outcome,
};
use serde::Serialize;

use super::build_pipeline;

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// URIs or file paths to load
    #[arg(required = true)]
    pub uris: Vec<String>,

    /// Target width for downsampling (height defaults to the same value)
    #[arg(long)]
    pub width: Option<u32>,

    /// Target height for downsampling (width defaults to the same value)
    #[arg(long)]
    pub height: Option<u32>,

    /// Ignore the EXIF orientation
    #[arg(long)]
    pub no_auto_rotate: bool,

    /// Decode progressive JPEG scans as they arrive
    #[arg(long)]
    pub progressive: bool,

    /// Convert to grayscale after decoding
    #[arg(long, conflicts_with = "blur")]
    pub grayscale: bool,

    /// Gaussian blur with this sigma after decoding
    #[arg(long)]
    pub blur: Option<f32>,

    /// Directory to write the decoded images to, as PNG
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print one JSON object per image instead of text
    #[arg(long)]
    pub json: bool,
}

/// Per-image result line.
#[derive(Debug, Serialize)]
struct FetchSummary {
    uri: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<Origin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FetchSummary {
    fn new(uri: &str, status: &'static str, elapsed: Duration) -> Self {
        Self {
            uri: uri.to_string(),
            status,
            origin: None,
            width: None,
            height: None,
            elapsed_ms: elapsed.as_millis() as u64,
            saved_to: None,
            error: None,
        }
    }

    fn failed(uri: &str, elapsed: Duration, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(uri, "failed", elapsed)
        }
    }
}

pub async fn execute(args: FetchArgs, config: Config) -> anyhow::Result<()> {
    if let Some(dir) = &args.output {
        std::fs::create_dir_all(expand(dir))?;
    }
    let pipeline = build_pipeline(config)?;
    let progress = create_progress_bar(args.uris.len() as u64);

    let jobs = args.uris.iter().enumerate().map(|(index, uri)| {
        let pipeline = &pipeline;
        let args = &args;
        let progress = progress.clone();
        async move {
            let summary = fetch_one(pipeline, args, index, uri).await;
            progress.inc(1);
            summary
        }
    });
    let summaries = join_all(jobs).await;
    progress.finish_and_clear();

    let failed = summaries.iter().filter(|s| s.status == "failed").count();
    for summary in &summaries {
        if args.json {
            println!("{}", serde_json::to_string(summary)?);
        } else {
            print_summary(summary);
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} images failed to load", summaries.len());
    }
    Ok(())
}

async fn fetch_one(
    pipeline: &ImagePipeline,
    args: &FetchArgs,
    index: usize,
    uri: &str,
) -> FetchSummary {
    let start = Instant::now();
    let request = match build_request(uri, args) {
        Ok(request) => request,
        Err(e) => return FetchSummary::failed(uri, start.elapsed(), e),
    };

    let outcome = match pipeline.fetch_decoded_image(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::debug!("Fetch of {uri} failed: {e}");
            return FetchSummary::failed(uri, start.elapsed(), e);
        }
    };
    let elapsed = start.elapsed();

    match outcome {
        Outcome::Ready { payload, origin } => {
            let mut summary = FetchSummary {
                origin: Some(origin),
                width: Some(payload.width()),
                height: Some(payload.height()),
                ..FetchSummary::new(uri, "ok", elapsed)
            };
            if let Some(dir) = &args.output {
                match save_png(&payload, &expand(dir), index, uri) {
                    Ok(path) => summary.saved_to = Some(path),
                    Err(e) => {
                        summary.status = "failed";
                        summary.error = Some(format!("Failed to save: {e}"));
                    }
                }
            }
            summary
        }
        Outcome::Empty { origin } => FetchSummary {
            origin: Some(origin),
            ..FetchSummary::new(uri, "empty", elapsed)
        },
        Outcome::Cancelled => FetchSummary::new(uri, "cancelled", elapsed),
    }
}

fn build_request(uri: &str, args: &FetchArgs) -> anyhow::Result<ImageRequest> {
    let mut builder = ImageRequest::builder(uri)?
        .auto_rotate(!args.no_auto_rotate)
        .progressive_rendering(args.progressive);

    if let Some((width, height)) = target_size(args.width, args.height) {
        builder = builder.resize(width, height);
    }
    if args.grayscale {
        builder = builder.postprocessor(Arc::new(GrayscalePostprocessor));
    } else if let Some(sigma) = args.blur {
        if sigma <= 0.0 {
            anyhow::bail!("--blur must be positive, got {sigma}");
        }
        builder = builder.postprocessor(Arc::new(BlurPostprocessor::new(sigma)));
    }
    Ok(builder.build())
}

/// A single given dimension bounds both sides.
fn target_size(width: Option<u32>, height: Option<u32>) -> Option<(u32, u32)> {
    match (width, height) {
        (Some(w), Some(h)) => Some((w, h)),
        (Some(side), None) | (None, Some(side)) => Some((side, side)),
        (None, None) => None,
    }
}

fn expand(dir: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).into_owned())
}

fn save_png(image: &ImageRef, dir: &Path, index: usize, uri: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join(output_name(index, uri));
    image.rendered().save(&path)?;
    Ok(path)
}

/// `003-photo.png` for the fourth URI `https://host/dir/photo.jpg?x=1`.
fn output_name(index: usize, uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let file = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("image");
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    let stem = if stem.is_empty() { "image".to_string() } else { stem };
    format!("{index:03}-{stem}.png")
}

fn print_summary(summary: &FetchSummary) {
    match summary.status {
        "ok" => {
            let origin = summary.origin.map_or("-", Origin::as_str);
            print!(
                "  ok     {}  {}x{}  from {}  in {} ms",
                summary.uri,
                summary.width.unwrap_or(0),
                summary.height.unwrap_or(0),
                origin,
                summary.elapsed_ms
            );
            if let Some(path) = &summary.saved_to {
                print!("  -> {}", path.display());
            }
            println!();
        }
        "failed" => println!(
            "  FAIL   {}  {}",
            summary.uri,
            summary.error.as_deref().unwrap_or("unknown error")
        ),
        other => println!("  {other:<6} {}  in {} ms", summary.uri, summary.elapsed_ms),
    }
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("##-"));
    }
    pb.set_message("loading...");
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_name() {
        assert_eq!(output_name(3, "https://host/dir/photo.jpg?x=1"), "003-photo.png");
        assert_eq!(output_name(0, "/tmp/my pic.final.png"), "000-my_pic_final.png");
        assert_eq!(output_name(12, "https://host/"), "012-host.png");
        assert_eq!(output_name(1, "res:///7"), "001-7.png");
    }

    #[test]
    fn test_target_size() {
        assert_eq!(target_size(Some(100), None), Some((100, 100)));
        assert_eq!(target_size(Some(100), Some(50)), Some((100, 50)));
        assert_eq!(target_size(None, None), None);
    }

    fn args(uris: &[&str]) -> FetchArgs {
        FetchArgs {
            uris: uris.iter().map(|u| u.to_string()).collect(),
            width: Some(64),
            height: None,
            no_auto_rotate: true,
            progressive: false,
            grayscale: true,
            blur: None,
            output: None,
            json: false,
        }
    }

    #[test]
    fn test_build_request_applies_flags() {
        let request = build_request("https://example.com/a.jpg", &args(&[])).unwrap();
        assert_eq!(request.resize().map(|r| (r.width, r.height)), Some((64, 64)));
        assert!(!request.auto_rotate());
        assert!(request.postprocessor().is_some());
    }

    #[test]
    fn test_build_request_rejects_bad_blur() {
        let mut args = args(&[]);
        args.grayscale = false;
        args.blur = Some(0.0);
        assert!(build_request("https://example.com/a.jpg", &args).is_err());
    }
}
