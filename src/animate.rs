use std::env;
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use tempfile::{Builder, NamedTempFile};

use crate::assets::{source_exists, Source};
use crate::compose::{BannerRequest, Composer};
use crate::filtergraph::{self, to_filter_complex, Overlay};

/// ffmpeg binary resolution: explicit env override, else PATH lookup.
pub fn ffmpeg_bin() -> String {
    env::var("FFMPEG_PATH")
        .or_else(|_| env::var("FFMPEG_BIN"))
        .unwrap_or_else(|_| "ffmpeg".to_owned())
}

/// Cheap probe so a missing binary fails before any rendering work starts.
pub fn ensure_ffmpeg_available() -> Result<()> {
    let bin = ffmpeg_bin();
    let probe = Command::new(&bin)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match probe {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!("ffmpeg probe `{bin} -version` exited with {status}"),
        Err(error) if error.kind() == ErrorKind::NotFound => bail!(
            "ffmpeg executable not found (resolved_path={bin}). Install ffmpeg or point FFMPEG_PATH at a binary."
        ),
        Err(error) => Err(error).context(format!("failed to probe ffmpeg at {bin}")),
    }
}

/// Renders the animated banner: transparent overlay PNG composited over the
/// background video by one ffmpeg invocation, returned as GIF bytes.
///
/// Both intermediates (overlay PNG, output GIF) live in scoped temp files
/// and are removed on every exit path, success or failure.
pub fn compose_animated(composer: &Composer, request: &BannerRequest) -> Result<Vec<u8>> {
    let Some(background) = &request.background else {
        bail!("animated banner requires a background source");
    };
    // Validate the background before probing ffmpeg so a bad request fails
    // the same way whether or not ffmpeg is installed.
    source_exists(background)?;
    ensure_ffmpeg_available()?;

    let background_file = LocalBackground::materialize(composer, background)?;

    let overlay_png = composer.compose_overlay(request)?;
    let mut overlay_file = Builder::new()
        .prefix("bannerc-overlay-")
        .suffix(".png")
        .tempfile()
        .context("failed to create overlay temp file")?;
    overlay_file
        .write_all(&overlay_png)
        .and_then(|()| overlay_file.flush())
        .context("failed to write overlay temp file")?;

    let output_path = Builder::new()
        .prefix("bannerc-banner-")
        .suffix(".gif")
        .tempfile()
        .context("failed to create output temp file")?
        .into_temp_path();

    let graph = to_filter_complex(&filtergraph::build(
        background_file.path(),
        Some(Overlay::FullCanvas),
        &request.layout,
        &request.title,
        &request.subtitle,
        composer.fonts(),
    )?);
    run_ffmpeg(
        background_file.path(),
        overlay_file.path(),
        &graph,
        &output_path,
    )?;

    fs::read(&output_path).context("failed to read encoded gif")
}

/// A background ffmpeg can open by path: either the caller's file as-is or
/// a temp copy of downloaded bytes.
enum LocalBackground {
    Existing(PathBuf),
    Temp(NamedTempFile),
}

impl LocalBackground {
    fn materialize(composer: &Composer, source: &Source) -> Result<Self> {
        match source {
            Source::File(path) => Ok(Self::Existing(path.clone())),
            Source::Url(url) => {
                let bytes = composer.store().fetch_cached(url)?;
                let mut file = Builder::new()
                    .prefix("bannerc-bg-")
                    .tempfile()
                    .context("failed to create background temp file")?;
                file.write_all(&bytes)
                    .and_then(|()| file.flush())
                    .context("failed to write background temp file")?;
                Ok(Self::Temp(file))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Existing(path) => path,
            Self::Temp(file) => file.path(),
        }
    }
}

fn run_ffmpeg(background: &Path, overlay: &Path, graph: &str, output: &Path) -> Result<()> {
    let bin = ffmpeg_bin();
    let mut command = Command::new(&bin);
    command
        .arg("-y")
        .arg("-i")
        .arg(background)
        .arg("-i")
        .arg(overlay)
        .arg("-filter_complex")
        .arg(graph)
        .arg("-map")
        .arg("[outv]")
        .arg("-loop")
        .arg("0")
        .arg("-f")
        .arg("gif")
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output_info = command.output().map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            anyhow!("ffmpeg executable not found (resolved_path={bin})")
        } else {
            anyhow!("failed to spawn ffmpeg process (resolved_path={bin}): {error}")
        }
    })?;

    if !output_info.status.success() {
        let stderr = String::from_utf8_lossy(&output_info.stderr);
        bail!(
            "ffmpeg failed with status {} (stderr_tail='{}')",
            output_info.status,
            last_n_chars(stderr.trim_end(), 500)
        );
    }
    Ok(())
}

fn last_n_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{resolve, RawLayout};

    fn request_with_background(background: Option<Source>) -> BannerRequest {
        BannerRequest {
            background,
            title: "Welcome".to_owned(),
            subtitle: "someone joined".to_owned(),
            avatar: None,
            layout: resolve(&RawLayout::default()),
        }
    }

    fn composer() -> Composer {
        let dir = tempfile::tempdir().unwrap();
        Composer::new(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn animate_without_background_is_rejected() {
        let error = compose_animated(&composer(), &request_with_background(None)).unwrap_err();
        assert!(error.to_string().contains("requires a background"));
    }

    #[test]
    fn missing_background_fails_before_ffmpeg_probe() {
        let source = Source::File("/nope/clip.gif".into());
        let error =
            compose_animated(&composer(), &request_with_background(Some(source))).unwrap_err();
        // The path error must win even on hosts without ffmpeg installed.
        assert!(error.to_string().contains("background not found"));
    }

    #[test]
    fn last_n_chars_keeps_the_tail() {
        assert_eq!(last_n_chars("abcdef", 3), "def");
        assert_eq!(last_n_chars("ab", 5), "ab");
        assert_eq!(last_n_chars("", 5), "");
    }
}
