use std::path::{Path, PathBuf};
use std::sync::Arc;

use usvg::fontdb;

/// Candidate font files probed in order: (regular, bold, family name).
/// The first pair whose regular face exists wins.
const FONT_CANDIDATES: &[(&str, &str, &str)] = &[
    (
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
        "DejaVu Sans",
    ),
    (
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
        "Liberation Sans",
    ),
    (
        "/usr/share/fonts/noto/NotoSans-Regular.ttf",
        "/usr/share/fonts/noto/NotoSans-Bold.ttf",
        "Noto Sans",
    ),
    (
        "C:/Windows/Fonts/segoeui.ttf",
        "C:/Windows/Fonts/segoeuib.ttf",
        "Segoe UI",
    ),
    (
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
        "Arial",
    ),
];

/// Resolved text-rendering fonts. `family` is what SVG text asks for (with
/// a generic sans-serif fallback appended); the concrete file paths feed
/// ffmpeg's drawtext when the engine burns text in directly. A machine with
/// no probed candidate still renders through whatever the system database
/// maps to sans-serif.
pub struct FontSet {
    pub family: Option<String>,
    pub regular_file: Option<PathBuf>,
    pub bold_file: Option<PathBuf>,
    pub db: Arc<fontdb::Database>,
}

impl FontSet {
    pub fn load() -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();

        let mut family = None;
        let mut regular_file = None;
        let mut bold_file = None;
        for (regular, bold, name) in FONT_CANDIDATES {
            let regular = Path::new(regular);
            if !regular.exists() {
                continue;
            }
            let _ = db.load_font_file(regular);
            regular_file = Some(regular.to_path_buf());
            let bold = Path::new(bold);
            if bold.exists() {
                let _ = db.load_font_file(bold);
                bold_file = Some(bold.to_path_buf());
            } else {
                // Bold text falls back to the regular face.
                bold_file = Some(regular.to_path_buf());
            }
            family = Some((*name).to_owned());
            break;
        }

        if family.is_none() {
            eprintln!("[bannerc] no candidate font found; relying on system sans-serif");
        }

        Self {
            family,
            regular_file,
            bold_file,
            db: Arc::new(db),
        }
    }

    /// CSS font-family list for SVG text nodes.
    pub fn svg_family(&self) -> String {
        match &self.family {
            Some(name) => format!("{name}, sans-serif"),
            None => "sans-serif".to_owned(),
        }
    }
}
