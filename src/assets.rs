use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::FilterType;
use image::{AnimationDecoder, RgbaImage};
use sha2::{Digest, Sha256};
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const CACHE_KEY_HEX_LEN: usize = 16;

/// Where an image comes from: a local file (existence-checked at use) or a
/// remote URL (fetched once, then served from the on-disk content cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Url(String),
}

impl Source {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_owned())
        } else {
            Self::File(PathBuf::from(raw))
        }
    }

    /// Stable identity string used as the in-memory cache key. Local files
    /// include the mtime so edits invalidate the entry.
    pub fn cache_key(&self) -> String {
        match self {
            Self::File(path) => {
                let mtime = fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis())
                    .unwrap_or(0);
                format!("file:{}:{}", path.display(), mtime)
            }
            Self::Url(url) => format!("url:{url}"),
        }
    }
}

/// Fetches and decodes image sources. Remote bytes are persisted to a
/// content-addressed cache directory so repeated renders skip the network.
pub struct AssetStore {
    http: reqwest::blocking::Client,
    cache_dir: PathBuf,
}

impl AssetStore {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, cache_dir })
    }

    pub fn read_source(&self, source: &Source) -> Result<Vec<u8>> {
        match source {
            Source::File(path) => {
                if !path.exists() {
                    bail!("background not found: {}", path.display());
                }
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))
            }
            Source::Url(url) => self.fetch_cached(url),
        }
    }

    /// Downloads `url`, persisting the bytes under the cache directory. A
    /// cache hit returns the stored bytes without touching the network.
    /// Cache write failures are non-fatal.
    pub fn fetch_cached(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.url_cache_path(url);
        if path.exists() {
            return fs::read(&path)
                .with_context(|| format!("failed to read cached asset {}", path.display()));
        }

        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("download failed: {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read bytes from {url}"))?
            .to_vec();

        if let Err(error) = fs::create_dir_all(&self.cache_dir)
            .and_then(|_| fs::write(&path, &bytes))
        {
            eprintln!(
                "[bannerc] could not persist {} to disk cache: {error}",
                path.display()
            );
        }
        Ok(bytes)
    }

    fn url_cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(url_cache_file_name(url))
    }
}

/// `<sha256[..16]>.<ext>` where the extension comes from the URL path,
/// defaulting to `bin`.
pub fn url_cache_file_name(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut hex = String::with_capacity(CACHE_KEY_HEX_LEN);
    for byte in digest.iter().take(CACHE_KEY_HEX_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }

    let ext = Url::parse(url)
        .ok()
        .map(|parsed| parsed.path().to_owned())
        .and_then(|path| {
            Path::new(&path)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| "bin".to_owned());

    format!("{hex}.{ext}")
}

/// Center-crop window mapping a `src_w` x `src_h` image onto the target
/// aspect ratio: returns `(x, y, w, h)` of the region to keep.
pub fn center_crop_window(
    src_w: u32,
    src_h: u32,
    target_w: u32,
    target_h: u32,
) -> (u32, u32, u32, u32) {
    let src_aspect = f64::from(src_w) / f64::from(src_h);
    let target_aspect = f64::from(target_w) / f64::from(target_h);
    if src_aspect > target_aspect {
        let keep_w = (f64::from(src_h) * target_aspect).round() as u32;
        let keep_w = keep_w.clamp(1, src_w);
        (((src_w - keep_w) / 2), 0, keep_w, src_h)
    } else {
        let keep_h = (f64::from(src_w) / target_aspect).round() as u32;
        let keep_h = keep_h.clamp(1, src_h);
        (0, (src_h - keep_h) / 2, src_w, keep_h)
    }
}

/// Decodes an image and scales it to exactly `target_w` x `target_h`,
/// cropping centered to preserve aspect ratio.
pub fn decode_cover(bytes: &[u8], target_w: u32, target_h: u32) -> Result<RgbaImage> {
    let decoded = image::load_from_memory(bytes)
        .context("failed to decode background image")?
        .to_rgba8();
    Ok(cover_resize(&decoded, target_w, target_h))
}

pub fn cover_resize(img: &RgbaImage, target_w: u32, target_h: u32) -> RgbaImage {
    let (x, y, w, h) = center_crop_window(img.width(), img.height(), target_w, target_h);
    let cropped = image::imageops::crop_imm(img, x, y, w, h).to_image();
    image::imageops::resize(&cropped, target_w, target_h, FilterType::Lanczos3)
}

/// Decodes every frame of an animated GIF. Single-image formats are not
/// accepted here; callers route them through `decode_cover`.
pub fn decode_gif_frames(bytes: &[u8]) -> Result<Vec<RgbaImage>> {
    let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(bytes))
        .context("failed to open gif decoder")?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .context("failed to decode gif frames")?;
    if frames.is_empty() {
        bail!("gif contains no frames");
    }
    Ok(frames.into_iter().map(|frame| frame.into_buffer()).collect())
}

pub fn is_gif(bytes: &[u8]) -> bool {
    bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")
}

pub fn source_exists(source: &Source) -> Result<()> {
    if let Source::File(path) = source {
        if !path.exists() {
            return Err(anyhow!("background not found: {}", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_file_name_derives_hash_and_extension() {
        let name = url_cache_file_name("https://cdn.example.com/avatars/u1.png?size=256");
        assert!(name.ends_with(".png"), "got {name}");
        assert_eq!(name.len(), CACHE_KEY_HEX_LEN + ".png".len());

        // Same URL, same name; different URL, different name.
        assert_eq!(
            name,
            url_cache_file_name("https://cdn.example.com/avatars/u1.png?size=256")
        );
        assert_ne!(
            name,
            url_cache_file_name("https://cdn.example.com/avatars/u2.png")
        );
    }

    #[test]
    fn cache_file_name_falls_back_to_bin() {
        let name = url_cache_file_name("https://example.com/no-extension");
        assert!(name.ends_with(".bin"), "got {name}");
    }

    #[test]
    fn center_crop_trims_the_wider_axis() {
        // Wider than 3:1 target: crop left/right.
        assert_eq!(center_crop_window(4000, 1000, 1200, 400), (500, 0, 3000, 1000));
        // Taller than target: crop top/bottom.
        assert_eq!(center_crop_window(1200, 800, 1200, 400), (0, 200, 1200, 400));
        // Already matching.
        assert_eq!(center_crop_window(2400, 800, 1200, 400), (0, 0, 2400, 800));
    }

    #[test]
    fn cover_resize_hits_exact_canvas_dimensions() {
        let img = RgbaImage::from_pixel(37, 211, image::Rgba([10, 20, 30, 255]));
        let out = cover_resize(&img, 1200, 400);
        assert_eq!((out.width(), out.height()), (1200, 400));
    }

    #[test]
    fn file_source_cache_key_includes_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.png");
        fs::write(&path, b"x").unwrap();
        let key = Source::File(path.clone()).cache_key();
        assert!(key.starts_with("file:"));
        assert!(key.contains("bg.png"));
        assert!(!key.ends_with(":0"), "mtime should be captured: {key}");
    }

    #[test]
    fn missing_file_source_is_an_error() {
        let source = Source::File(PathBuf::from("/definitely/not/here.png"));
        assert!(source_exists(&source).is_err());
        let store = AssetStore::new(std::env::temp_dir()).unwrap();
        assert!(store.read_source(&source).is_err());
    }

    #[test]
    fn gif_magic_detection() {
        assert!(is_gif(b"GIF89a\x01"));
        assert!(!is_gif(b"\x89PNG\r\n"));
    }
}
