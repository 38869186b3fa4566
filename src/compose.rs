use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tiny_skia::{
    FillRule, GradientStop, IntSize, LinearGradient, Mask, Paint, Path, PathBuilder, Pixmap,
    PixmapPaint, Point, PremultipliedColorU8, Rect, SpreadMode, Transform,
};

use crate::assets::{decode_cover, AssetStore, Source};
use crate::cache::AssetCaches;
use crate::fonts::FontSet;
use crate::layout::{AvatarLayout, Color, Layout, CANVAS_HEIGHT, CANVAS_WIDTH};

pub const CORNER_RADIUS: f32 = 28.0;
const RING_COLOR: Color = Color::rgb(0x00, 0xE5, 0xFF);
const BADGE_INSET: i32 = 5;
const GRADIENT_START: Color = Color::rgb(0xF5, 0x9E, 0x0B);
const GRADIENT_END: Color = Color::rgb(0xEF, 0x44, 0x44);

/// Everything one render needs. The layout is already resolved; the
/// composer never mutates it.
pub struct BannerRequest {
    pub background: Option<Source>,
    pub title: String,
    pub subtitle: String,
    pub avatar: Option<Source>,
    pub layout: Layout,
}

/// Opaque-filled vs transparent-none background, the only difference
/// between the full composite and the overlay render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundMode {
    Opaque,
    Transparent,
}

pub struct Composer {
    caches: AssetCaches,
    store: AssetStore,
    fonts: FontSet,
}

impl Composer {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            caches: AssetCaches::new(),
            store: AssetStore::new(cache_dir)?,
            fonts: FontSet::load(),
        })
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn fonts(&self) -> &FontSet {
        &self.fonts
    }

    /// Opaque banner: background + badge + shade + text, rounded corners.
    pub fn compose_full(&self, request: &BannerRequest) -> Result<Vec<u8>> {
        let mut canvas = self.compose_layers(BackgroundMode::Opaque, request)?;
        apply_rounded_mask(&mut canvas, CORNER_RADIUS);
        encode_png(&canvas)
    }

    /// Transparent overlay: badge + shade + text only, for compositing onto
    /// an externally supplied animated background.
    pub fn compose_overlay(&self, request: &BannerRequest) -> Result<Vec<u8>> {
        let canvas = self.compose_layers(BackgroundMode::Transparent, request)?;
        encode_png(&canvas)
    }

    /// Layer order is fixed: background, badge, shade, text. Later layers
    /// occlude earlier ones.
    fn compose_layers(&self, mode: BackgroundMode, request: &BannerRequest) -> Result<Pixmap> {
        let layout = &request.layout;
        let mut canvas = match mode {
            BackgroundMode::Opaque => self.background_pixmap(request.background.as_ref())?,
            BackgroundMode::Transparent => new_canvas()?,
        };

        if let Some(avatar) = &request.avatar {
            // Decoration is best-effort: an unreachable avatar skips the
            // badge instead of failing the render.
            match self.badge(avatar, &layout.avatar) {
                Ok(badge) => {
                    canvas.draw_pixmap(
                        layout.avatar.x.round() as i32,
                        layout.avatar.y.round() as i32,
                        badge.as_ref(),
                        &PixmapPaint::default(),
                        Transform::identity(),
                        None,
                    );
                }
                Err(error) => eprintln!("[bannerc] skipping avatar badge: {error:#}"),
            }
        }

        draw_shade(&mut canvas, mode, layout.overlay_opacity);

        let spans = [
            TextSpan {
                text: &request.title,
                x: layout.title.anchor_x(),
                y: layout.title.y,
                center: layout.title.center,
                size: layout.title.size,
                weight: 700,
                fill: layout.title.color,
                stroke: layout.title.stroke_color,
                stroke_width: layout.title.stroke_width,
                opacity: 1.0,
            },
            TextSpan {
                text: &request.subtitle,
                x: layout.subtitle.anchor_x(),
                y: layout.subtitle.y,
                center: layout.subtitle.center,
                size: layout.subtitle.size,
                weight: 400,
                fill: layout.subtitle.color,
                stroke: layout.subtitle.stroke_color,
                stroke_width: layout.subtitle.stroke_width,
                opacity: 1.0,
            },
        ];
        render_text(&mut canvas, &self.fonts, &spans)?;

        Ok(canvas)
    }

    /// Canvas-sized background: resolved source (cached by content identity)
    /// or the diagonal gradient fallback when none was requested.
    fn background_pixmap(&self, source: Option<&Source>) -> Result<Pixmap> {
        let Some(source) = source else {
            return gradient_background();
        };

        let key = source.cache_key();
        let raw = self.caches.backgrounds.get_or_try_insert(&key, || {
            let bytes = self.store.read_source(source)?;
            let img = decode_cover(&bytes, CANVAS_WIDTH, CANVAS_HEIGHT)?;
            Ok(img.into_raw())
        })?;
        raw_rgba_to_pixmap(&raw, CANVAS_WIDTH, CANVAS_HEIGHT)
    }

    /// Circular avatar on a ring disc, cached by (source, diameter).
    fn badge(&self, source: &Source, avatar: &AvatarLayout) -> Result<Pixmap> {
        let size_px = avatar.size.round() as u32;
        let badge_px = avatar.badge_size().round() as u32;
        let key = format!("{}|{}", source.cache_key(), size_px);

        let raw = self.caches.badges.get_or_try_insert(&key, || {
            let badge = self.build_badge(source, size_px, badge_px)?;
            Ok(badge.take())
        })?;
        premultiplied_to_pixmap(raw, badge_px, badge_px)
    }

    fn build_badge(&self, source: &Source, size_px: u32, badge_px: u32) -> Result<Pixmap> {
        let bytes = self.store.read_source(source)?;
        let avatar = image::load_from_memory(&bytes)
            .context("failed to decode avatar image")?
            .to_rgba8();
        let avatar = image::imageops::resize(&avatar, size_px, size_px, FilterType::Lanczos3);
        let avatar = raw_rgba_to_pixmap(avatar.as_raw(), size_px, size_px)?;

        let mut badge = Pixmap::new(badge_px, badge_px)
            .ok_or_else(|| anyhow!("failed to allocate badge pixmap"))?;

        // Ring disc first, then the avatar clipped to a circle on top.
        let center = f32::from(badge_px as u16) / 2.0;
        let ring = PathBuilder::from_circle(center, center, center)
            .ok_or_else(|| anyhow!("degenerate ring circle"))?;
        let mut paint = Paint::default();
        paint.anti_alias = true;
        paint.set_color(skia_color(RING_COLOR));
        badge.fill_path(&ring, &paint, FillRule::Winding, Transform::identity(), None);

        let mut clip = Mask::new(badge_px, badge_px)
            .ok_or_else(|| anyhow!("failed to allocate badge mask"))?;
        let avatar_center = BADGE_INSET as f32 + f32::from(size_px as u16) / 2.0;
        let circle =
            PathBuilder::from_circle(avatar_center, avatar_center, f32::from(size_px as u16) / 2.0)
                .ok_or_else(|| anyhow!("degenerate avatar circle"))?;
        clip.fill_path(&circle, FillRule::Winding, true, Transform::identity());

        badge.draw_pixmap(
            BADGE_INSET,
            BADGE_INSET,
            avatar.as_ref(),
            &PixmapPaint::default(),
            Transform::identity(),
            Some(&clip),
        );
        Ok(badge)
    }
}

/// One text element; rendered stroke pass first, fill pass second.
pub struct TextSpan<'a> {
    pub text: &'a str,
    pub x: f64,
    pub y: f64,
    pub center: bool,
    pub size: f64,
    pub weight: u16,
    pub fill: Color,
    pub stroke: Color,
    pub stroke_width: f64,
    pub opacity: f64,
}

/// Rasterizes the spans as an SVG fragment over the pixmap. User text goes
/// through `escape_xml` before embedding.
pub fn render_text(pixmap: &mut Pixmap, fonts: &FontSet, spans: &[TextSpan]) -> Result<()> {
    if spans.iter().all(|span| span.text.trim().is_empty()) {
        return Ok(());
    }

    let svg = text_svg(&fonts.svg_family(), spans);
    let options = usvg::Options {
        fontdb: fonts.db.clone(),
        ..usvg::Options::default()
    };
    let tree = usvg::Tree::from_str(&svg, &options).context("failed to parse text layer svg")?;
    resvg::render(&tree, Transform::identity(), &mut pixmap.as_mut());
    Ok(())
}

fn text_svg(family: &str, spans: &[TextSpan]) -> String {
    let mut svg = format!(
        r#"<svg width="{CANVAS_WIDTH}" height="{CANVAS_HEIGHT}" xmlns="http://www.w3.org/2000/svg">"#
    );
    for span in spans {
        if span.text.trim().is_empty() {
            continue;
        }
        let text = escape_xml(span.text);
        let anchor = if span.center { "middle" } else { "start" };
        let family = escape_xml(family);
        let common = format!(
            r#"x="{}" y="{}" text-anchor="{}" font-family="{}" font-weight="{}" font-size="{}""#,
            span.x, span.y, anchor, family, span.weight, span.size
        );
        // Stroke-only pass under the fill pass gives the outlined look.
        svg.push_str(&format!(
            r#"<text {} fill="none" stroke="{}" stroke-opacity="{}" stroke-width="{}">{}</text>"#,
            common,
            span.stroke.hex(),
            span.stroke.a * span.opacity,
            span.stroke_width,
            text
        ));
        svg.push_str(&format!(
            r#"<text {} fill="{}" fill-opacity="{}">{}</text>"#,
            common,
            span.fill.hex(),
            span.fill.a * span.opacity,
            text
        ));
    }
    svg.push_str("</svg>");
    svg
}

/// Ampersand first, then the rest; later replacements must not re-escape
/// entities introduced by earlier ones.
pub fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn new_canvas() -> Result<Pixmap> {
    Pixmap::new(CANVAS_WIDTH, CANVAS_HEIGHT).ok_or_else(|| anyhow!("failed to allocate canvas"))
}

pub fn encode_png(pixmap: &Pixmap) -> Result<Vec<u8>> {
    pixmap.encode_png().context("failed to encode png")
}

fn draw_shade(canvas: &mut Pixmap, mode: BackgroundMode, opacity: f64) {
    let Some(rect) = Rect::from_xywh(0.0, 0.0, CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32) else {
        return;
    };
    let mut paint = Paint::default();
    match mode {
        // Flat contrast rectangle over an opaque background.
        BackgroundMode::Opaque => {
            paint.set_color(
                tiny_skia::Color::from_rgba(0.0, 0.0, 0.0, opacity as f32)
                    .unwrap_or(tiny_skia::Color::TRANSPARENT),
            );
        }
        // Bottom-weighted gradient on the transparent overlay.
        BackgroundMode::Transparent => {
            let Some(shader) = LinearGradient::new(
                Point::from_xy(0.0, 0.0),
                Point::from_xy(0.0, CANVAS_HEIGHT as f32),
                vec![
                    GradientStop::new(0.0, tiny_skia::Color::from_rgba8(0, 0, 0, 0)),
                    GradientStop::new(
                        1.0,
                        tiny_skia::Color::from_rgba8(0, 0, 0, (opacity * 255.0).round() as u8),
                    ),
                ],
                SpreadMode::Pad,
                Transform::identity(),
            ) else {
                return;
            };
            paint.shader = shader;
        }
    }
    canvas.fill_rect(rect, &paint, Transform::identity(), None);
}

fn gradient_background() -> Result<Pixmap> {
    let mut canvas = new_canvas()?;
    let rect = Rect::from_xywh(0.0, 0.0, CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32)
        .ok_or_else(|| anyhow!("degenerate canvas rect"))?;
    let shader = LinearGradient::new(
        Point::from_xy(0.0, 0.0),
        Point::from_xy(CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32),
        vec![
            GradientStop::new(0.0, skia_color(GRADIENT_START)),
            GradientStop::new(1.0, skia_color(GRADIENT_END)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    )
    .ok_or_else(|| anyhow!("failed to build gradient shader"))?;
    let mut paint = Paint::default();
    paint.shader = shader;
    canvas.fill_rect(rect, &paint, Transform::identity(), None);
    Ok(canvas)
}

/// Destination-in alpha mask with rounded corners.
pub fn apply_rounded_mask(canvas: &mut Pixmap, radius: f32) {
    let (w, h) = (canvas.width(), canvas.height());
    let Some(path) = rounded_rect_path(0.0, 0.0, w as f32, h as f32, radius) else {
        return;
    };
    let Some(mut mask) = Mask::new(w, h) else {
        return;
    };
    mask.fill_path(&path, FillRule::Winding, true, Transform::identity());

    for (pixel, coverage) in canvas.pixels_mut().iter_mut().zip(mask.data()) {
        let scale = |channel: u8| ((u16::from(channel) * u16::from(*coverage) + 127) / 255) as u8;
        *pixel = PremultipliedColorU8::from_rgba(
            scale(pixel.red()),
            scale(pixel.green()),
            scale(pixel.blue()),
            scale(pixel.alpha()),
        )
        .unwrap_or(PremultipliedColorU8::TRANSPARENT);
    }
}

/// Rounded rectangle outline via cubic corner arcs.
pub fn rounded_rect_path(x: f32, y: f32, w: f32, h: f32, radius: f32) -> Option<Path> {
    const K: f32 = 0.552_284_8;
    let r = radius.min(w / 2.0).min(h / 2.0).max(0.0);
    let k = K * r;
    let (right, bottom) = (x + w, y + h);

    let mut pb = PathBuilder::new();
    pb.move_to(x + r, y);
    pb.line_to(right - r, y);
    pb.cubic_to(right - r + k, y, right, y + r - k, right, y + r);
    pb.line_to(right, bottom - r);
    pb.cubic_to(right, bottom - r + k, right - r + k, bottom, right - r, bottom);
    pb.line_to(x + r, bottom);
    pb.cubic_to(x + r - k, bottom, x, bottom - r + k, x, bottom - r);
    pb.line_to(x, y + r);
    pb.cubic_to(x, y + r - k, x + r - k, y, x + r, y);
    pb.close();
    pb.finish()
}

fn skia_color(color: Color) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba8(color.r, color.g, color.b, (color.a * 255.0).round() as u8)
}

/// Straight-alpha RGBA bytes (as `image` produces) into a premultiplied
/// tiny-skia pixmap.
pub fn raw_rgba_to_pixmap(raw: &[u8], width: u32, height: u32) -> Result<Pixmap> {
    let mut pixmap =
        Pixmap::new(width, height).ok_or_else(|| anyhow!("failed to allocate pixmap"))?;
    anyhow::ensure!(
        raw.len() == (width * height * 4) as usize,
        "pixel buffer size mismatch"
    );
    for (pixel, chunk) in pixmap.pixels_mut().iter_mut().zip(raw.chunks_exact(4)) {
        *pixel = tiny_skia::ColorU8::from_rgba(chunk[0], chunk[1], chunk[2], chunk[3]).premultiply();
    }
    Ok(pixmap)
}

fn premultiplied_to_pixmap(raw: Arc<Vec<u8>>, width: u32, height: u32) -> Result<Pixmap> {
    let size = IntSize::from_wh(width, height).ok_or_else(|| anyhow!("degenerate pixmap size"))?;
    Pixmap::from_vec(raw.as_ref().clone(), size)
        .ok_or_else(|| anyhow!("cached badge buffer has wrong size"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{resolve, RawLayout};

    fn composer() -> Composer {
        let dir = tempfile::tempdir().unwrap();
        Composer::new(dir.path().to_path_buf()).unwrap()
    }

    fn request(title: &str, subtitle: &str) -> BannerRequest {
        BannerRequest {
            background: None,
            title: title.to_owned(),
            subtitle: subtitle.to_owned(),
            avatar: None,
            layout: resolve(&RawLayout::default()),
        }
    }

    #[test]
    fn no_background_no_avatar_composes_gradient_banner() {
        let png = composer()
            .compose_full(&request("Welcome", "someone joined"))
            .expect("gradient fallback should never fail");
        assert!(png.starts_with(b"\x89PNG\r\n"));

        let pixmap = Pixmap::decode_png(&png).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (1200, 400));
        // Rounded corner is punched out, center is opaque gradient.
        assert_eq!(pixmap.pixel(0, 0).unwrap().alpha(), 0);
        assert_eq!(pixmap.pixel(600, 200).unwrap().alpha(), 255);
    }

    #[test]
    fn overlay_is_transparent_outside_drawn_layers() {
        let png = composer().compose_overlay(&request("Hi", "there")).unwrap();
        let pixmap = Pixmap::decode_png(&png).unwrap();
        // Top of the shade gradient has zero opacity and no text sits there.
        assert_eq!(pixmap.pixel(1199, 0).unwrap().alpha(), 0);
        // Bottom rows carry the contrast shade.
        assert!(pixmap.pixel(1199, 399).unwrap().alpha() > 0);
    }

    #[test]
    fn markup_significant_text_is_escaped_not_dropped() {
        assert_eq!(
            escape_xml(r#"a & <b> "c" 'd'"#),
            "a &amp; &lt;b&gt; &quot;c&quot; &apos;d&apos;"
        );
        // Ampersand escaping runs first; entities are not double-escaped.
        assert_eq!(escape_xml("&lt;"), "&amp;lt;");

        // A hostile title must not break the SVG parse.
        let png = composer()
            .compose_overlay(&request("<script>&'\"", "x=y"))
            .expect("escaped markup must stay well-formed");
        assert!(png.starts_with(b"\x89PNG\r\n"));
    }

    #[test]
    fn unreachable_avatar_is_best_effort() {
        let mut req = request("Welcome", "sub");
        req.avatar = Some(Source::File("/nope/avatar.png".into()));
        let png = composer().compose_full(&req).unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n"));
    }

    #[test]
    fn missing_background_file_is_fatal_in_full_mode() {
        let mut req = request("Welcome", "sub");
        req.background = Some(Source::File("/nope/bg.png".into()));
        let error = composer().compose_full(&req).unwrap_err();
        assert!(error.to_string().contains("background not found"));
    }

    #[test]
    fn rounded_mask_preserves_premultiplied_invariant() {
        let mut pixmap = Pixmap::new(64, 64).unwrap();
        pixmap.fill(tiny_skia::Color::from_rgba8(200, 100, 50, 255));
        apply_rounded_mask(&mut pixmap, 16.0);
        for pixel in pixmap.pixels() {
            assert!(pixel.red() <= pixel.alpha());
            assert!(pixel.green() <= pixel.alpha());
            assert!(pixel.blue() <= pixel.alpha());
        }
        assert_eq!(pixmap.pixel(0, 0).unwrap().alpha(), 0);
        assert_eq!(pixmap.pixel(32, 32).unwrap().alpha(), 255);
    }
}
