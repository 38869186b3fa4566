use std::borrow::Cow;
use std::f64::consts::PI;

use anyhow::{anyhow, Context, Result};
use tiny_skia::{
    FillRule, GradientStop, LinearGradient, Mask, Paint, PathBuilder, Pixmap, PixmapPaint, Point,
    SpreadMode, Stroke, Transform,
};

use crate::assets::{cover_resize, decode_cover, decode_gif_frames, is_gif, Source};
use crate::compose::{
    encode_png, new_canvas, raw_rgba_to_pixmap, render_text, rounded_rect_path, Composer, TextSpan,
};
use crate::layout::{Color, CANVAS_HEIGHT, CANVAS_WIDTH};

pub const DEFAULT_FRAMES: usize = 8;
pub const DEFAULT_DELAY_MS: u32 = 80;

const AVATAR_SIZE: i32 = 180;
const PANEL_PAD: i32 = 28;
const PANEL_RADIUS: f32 = 18.0;
const TITLE_SIZE: f64 = 80.0;
const NAME_SIZE: f64 = 48.0;
const LINE_SPACING: f64 = 18.0;
const GLOW_COLOR: Color = Color::rgba(140, 50, 220, 0.85);
const GRADIENT_TOP: Color = Color::rgb(0x6A, 0x11, 0xCB);
const GRADIENT_BOTTOM: Color = Color::rgb(0x25, 0x75, 0xFC);

pub struct LoopOptions {
    pub frames: usize,
    pub delay_ms: u32,
    pub title: String,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            frames: DEFAULT_FRAMES,
            delay_ms: DEFAULT_DELAY_MS,
            title: "Welcome!".to_owned(),
        }
    }
}

/// `extension` is "gif" for the animated loop, "png" when the encoder
/// degraded to a still of the last frame.
pub struct LoopOutput {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

/// Renders and packs the pulsating welcome loop without any subprocess.
/// The avatar is best-effort; a failing animated pack degrades to a still
/// PNG of the last frame rather than erroring.
pub fn encode_loop(
    composer: &Composer,
    username: &str,
    avatar: Option<&Source>,
    background: Option<&Source>,
    opts: &LoopOptions,
) -> Result<LoopOutput> {
    let frame_count = opts.frames.max(1);
    let backgrounds = load_backgrounds(composer, background)?;
    let avatar_img = avatar.and_then(|source| match load_avatar(composer, source) {
        Ok(img) => Some(img),
        Err(error) => {
            eprintln!("[bannerc] skipping loop avatar: {error:#}");
            None
        }
    });

    let mut frames = Vec::with_capacity(frame_count);
    for i in 0..frame_count {
        let phase = (i as f64 / frame_count as f64) * 2.0 * PI;
        let background = &backgrounds[i % backgrounds.len()];
        frames.push(render_frame(
            composer,
            background,
            avatar_img.as_ref(),
            username,
            &opts.title,
            phase,
        )?);
    }

    let last = frames.last().ok_or_else(|| anyhow!("no frames rendered"))?;
    match pack_gif(&frames, opts.delay_ms) {
        Ok(bytes) => Ok(LoopOutput {
            bytes,
            extension: "gif",
        }),
        Err(error) => {
            eprintln!("[bannerc] animated pack failed, emitting still frame: {error:#}");
            Ok(LoopOutput {
                bytes: encode_png(last)?,
                extension: "png",
            })
        }
    }
}

fn load_backgrounds(composer: &Composer, source: Option<&Source>) -> Result<Vec<Pixmap>> {
    let Some(source) = source else {
        return Ok(vec![gradient_backdrop()?]);
    };
    let bytes = composer.store().read_source(source)?;
    if is_gif(&bytes) {
        let decoded = decode_gif_frames(&bytes)?;
        let mut frames = Vec::with_capacity(decoded.len());
        for frame in &decoded {
            let scaled = cover_resize(frame, CANVAS_WIDTH, CANVAS_HEIGHT);
            frames.push(raw_rgba_to_pixmap(
                scaled.as_raw(),
                CANVAS_WIDTH,
                CANVAS_HEIGHT,
            )?);
        }
        if frames.is_empty() {
            return Ok(vec![gradient_backdrop()?]);
        }
        return Ok(frames);
    }
    let img = decode_cover(&bytes, CANVAS_WIDTH, CANVAS_HEIGHT)?;
    Ok(vec![raw_rgba_to_pixmap(
        img.as_raw(),
        CANVAS_WIDTH,
        CANVAS_HEIGHT,
    )?])
}

fn load_avatar(composer: &Composer, source: &Source) -> Result<image::RgbaImage> {
    let bytes = composer.store().read_source(source)?;
    Ok(image::load_from_memory(&bytes)
        .context("failed to decode avatar image")?
        .to_rgba8())
}

fn gradient_backdrop() -> Result<Pixmap> {
    let mut canvas = new_canvas()?;
    let rect = tiny_skia::Rect::from_xywh(0.0, 0.0, CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32)
        .ok_or_else(|| anyhow!("degenerate canvas rect"))?;
    let shader = LinearGradient::new(
        Point::from_xy(0.0, 0.0),
        Point::from_xy(0.0, CANVAS_HEIGHT as f32),
        vec![
            GradientStop::new(0.0, color(GRADIENT_TOP)),
            GradientStop::new(1.0, color(GRADIENT_BOTTOM)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    )
    .ok_or_else(|| anyhow!("failed to build backdrop gradient"))?;
    let mut paint = Paint::default();
    paint.shader = shader;
    canvas.fill_rect(rect, &paint, Transform::identity(), None);
    Ok(canvas)
}

fn render_frame(
    composer: &Composer,
    background: &Pixmap,
    avatar: Option<&image::RgbaImage>,
    username: &str,
    title: &str,
    phase: f64,
) -> Result<Pixmap> {
    let mut canvas = background.clone();

    let panel_w = CANVAS_WIDTH as f32 - 2.0 * PANEL_PAD as f32;
    let panel_h = CANVAS_HEIGHT as f32 - 2.0 * PANEL_PAD as f32;
    if let Some(panel) = rounded_rect_path(
        PANEL_PAD as f32,
        PANEL_PAD as f32,
        panel_w,
        panel_h,
        PANEL_RADIUS,
    ) {
        let mut paint = Paint::default();
        paint.anti_alias = true;
        paint.set_color(color(Color::rgba(0, 0, 0, 0.35)));
        canvas.fill_path(&panel, &paint, FillRule::Winding, Transform::identity(), None);
    }

    let av_x = PANEL_PAD + 36;
    let av_y = PANEL_PAD + ((panel_h as i32 - AVATAR_SIZE) / 2);

    if let Some(avatar) = avatar {
        let pulse = 1.0 + 0.05 * phase.sin();
        let draw_size = (f64::from(AVATAR_SIZE) * pulse).round() as i32;
        let draw_x = av_x - (draw_size - AVATAR_SIZE) / 2;
        let draw_y = av_y - (draw_size - AVATAR_SIZE) / 2;
        draw_avatar_badge(&mut canvas, avatar, draw_x, draw_y, draw_size)?;
    }

    // Canvas top-baseline text: approximate the baseline at 0.8em below
    // the declared top edge.
    let text_x = f64::from(av_x + AVATAR_SIZE + 36);
    let block_h = TITLE_SIZE + LINE_SPACING + NAME_SIZE;
    let text_y = f64::from(av_y) + ((f64::from(AVATAR_SIZE) - block_h) / 2.0).round();
    let title_pulse = 0.6 + 0.4 * phase.sin();
    let name_pulse = 0.55 + 0.45 * (phase + PI / 4.0).sin();
    let name_offset = (6.0 * phase.sin()).round();

    let spans = [
        TextSpan {
            text: title,
            x: text_x,
            y: text_y + TITLE_SIZE * 0.8,
            center: false,
            size: TITLE_SIZE,
            weight: 700,
            fill: Color::rgb(0xFF, 0xFF, 0xFF),
            stroke: Color::rgba(0, 0, 0, 0.45),
            stroke_width: (TITLE_SIZE / 12.0).round().max(6.0),
            opacity: title_pulse,
        },
        TextSpan {
            text: username,
            x: text_x + name_offset,
            y: text_y + TITLE_SIZE + LINE_SPACING + NAME_SIZE * 0.8,
            center: false,
            size: NAME_SIZE,
            weight: 600,
            fill: Color::rgb(0xFF, 0xFF, 0xFF),
            stroke: Color::rgba(0, 0, 0, 0.0),
            stroke_width: 0.0,
            opacity: name_pulse,
        },
    ];
    render_text(&mut canvas, composer.fonts(), &spans)?;

    draw_sweep(&mut canvas, phase);
    Ok(canvas)
}

fn draw_avatar_badge(
    canvas: &mut Pixmap,
    avatar: &image::RgbaImage,
    x: i32,
    y: i32,
    size: i32,
) -> Result<()> {
    let size_px = size.max(1) as u32;
    let scaled = image::imageops::resize(
        avatar,
        size_px,
        size_px,
        image::imageops::FilterType::Lanczos3,
    );
    let scaled = raw_rgba_to_pixmap(scaled.as_raw(), size_px, size_px)?;

    let cx = x as f32 + size as f32 / 2.0;
    let cy = y as f32 + size as f32 / 2.0;

    // Glow disc behind the avatar.
    if let Some(glow) = PathBuilder::from_circle(cx, cy, (size as f32 + 12.0) / 2.0) {
        let mut paint = Paint::default();
        paint.anti_alias = true;
        paint.set_color(color(GLOW_COLOR));
        canvas.fill_path(&glow, &paint, FillRule::Winding, Transform::identity(), None);
    }

    let Some(mut clip) = Mask::new(canvas.width(), canvas.height()) else {
        return Ok(());
    };
    if let Some(circle) = PathBuilder::from_circle(cx, cy, size as f32 / 2.0) {
        clip.fill_path(&circle, FillRule::Winding, true, Transform::identity());
    }
    canvas.draw_pixmap(
        x,
        y,
        scaled.as_ref(),
        &PixmapPaint::default(),
        Transform::identity(),
        Some(&clip),
    );

    // Thin white ring around the clipped avatar.
    if let Some(ring) = PathBuilder::from_circle(cx, cy, size as f32 / 2.0 + 3.0) {
        let mut paint = Paint::default();
        paint.anti_alias = true;
        paint.set_color(color(Color::rgba(255, 255, 255, 0.85)));
        let stroke = Stroke {
            width: 4.0,
            ..Stroke::default()
        };
        canvas.stroke_path(&ring, &paint, &stroke, Transform::identity(), None);
    }
    Ok(())
}

/// Faint diagonal white gradient whose origin slides with the phase,
/// giving the loop its motion even over a static background.
fn draw_sweep(canvas: &mut Pixmap, phase: f64) {
    let offset = (80.0 * phase.sin()).round() as f32;
    let Some(rect) =
        tiny_skia::Rect::from_xywh(0.0, 0.0, CANVAS_WIDTH as f32, CANVAS_HEIGHT as f32)
    else {
        return;
    };
    let Some(shader) = LinearGradient::new(
        Point::from_xy(-offset, 0.0),
        Point::from_xy(CANVAS_WIDTH as f32 - offset, CANVAS_HEIGHT as f32),
        vec![
            GradientStop::new(0.0, tiny_skia::Color::from_rgba8(255, 255, 255, 5)),
            GradientStop::new(0.5, tiny_skia::Color::from_rgba8(255, 255, 255, 13)),
            GradientStop::new(1.0, tiny_skia::Color::from_rgba8(255, 255, 255, 5)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    ) else {
        return;
    };
    let mut paint = Paint::default();
    paint.shader = shader;
    canvas.fill_rect(rect, &paint, Transform::identity(), None);
}

/// Fixed 6x6x6 color cube padded with zeros to 256 entries. Process
/// constant, so every frame and every run shares the same palette.
pub fn cube_palette() -> Vec<u8> {
    let mut palette = Vec::with_capacity(256 * 3);
    for r in 0..6u16 {
        for g in 0..6u16 {
            for b in 0..6u16 {
                palette.push((r * 51) as u8);
                palette.push((g * 51) as u8);
                palette.push((b * 51) as u8);
            }
        }
    }
    palette.resize(256 * 3, 0);
    palette
}

/// Nearest cube level for one channel: round(c / 255 * 5) in integers.
pub fn channel_level(c: u8) -> u8 {
    ((u16::from(c) * 5 + 127) / 255) as u8
}

pub fn quantize_index(r: u8, g: u8, b: u8) -> u8 {
    channel_level(r) * 36 + channel_level(g) * 6 + channel_level(b)
}

fn quantize_frame(pixmap: &Pixmap) -> Vec<u8> {
    pixmap
        .pixels()
        .iter()
        .map(|pixel| {
            let c = pixel.demultiply();
            quantize_index(c.red(), c.green(), c.blue())
        })
        .collect()
}

fn pack_gif(frames: &[Pixmap], delay_ms: u32) -> Result<Vec<u8>> {
    let palette = cube_palette();
    let delay_cs = ((delay_ms + 5) / 10) as u16;
    let mut bytes = Vec::new();
    {
        let mut encoder = gif::Encoder::new(
            &mut bytes,
            CANVAS_WIDTH as u16,
            CANVAS_HEIGHT as u16,
            &palette,
        )
        .context("failed to start gif encoder")?;
        encoder
            .set_repeat(gif::Repeat::Infinite)
            .context("failed to set gif loop count")?;
        for pixmap in frames {
            let indexed = quantize_frame(pixmap);
            let mut frame = gif::Frame::default();
            frame.width = CANVAS_WIDTH as u16;
            frame.height = CANVAS_HEIGHT as u16;
            frame.delay = delay_cs;
            frame.buffer = Cow::Owned(indexed);
            encoder
                .write_frame(&frame)
                .context("failed to write gif frame")?;
        }
    }
    Ok(bytes)
}

fn color(c: Color) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba8(c.r, c.g, c.b, (c.a * 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composer() -> Composer {
        let dir = tempfile::tempdir().unwrap();
        Composer::new(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn palette_is_padded_cube() {
        let palette = cube_palette();
        assert_eq!(palette.len(), 768);
        // Entry 215 is white, everything after is the zero pad.
        assert_eq!(&palette[215 * 3..215 * 3 + 3], &[255, 255, 255]);
        assert!(palette[216 * 3..].iter().all(|&c| c == 0));
    }

    #[test]
    fn quantizer_is_idempotent_on_cube_colors() {
        for level in 0..6u8 {
            let snapped = level * 51;
            assert_eq!(channel_level(snapped), level);
        }
        // Midpoints round to the nearer level.
        assert_eq!(channel_level(0), 0);
        assert_eq!(channel_level(255), 5);
        assert_eq!(channel_level(127), 2);
        assert_eq!(channel_level(128), 3);
        assert_eq!(quantize_index(255, 255, 255), 215);
        assert_eq!(quantize_index(0, 0, 0), 0);
    }

    #[test]
    fn missing_avatar_still_yields_animated_gif() {
        let out = encode_loop(
            &composer(),
            "newcomer",
            Some(&Source::File("/nope/avatar.png".into())),
            None,
            &LoopOptions::default(),
        )
        .unwrap();
        assert_eq!(out.extension, "gif");
        assert!(out.bytes.starts_with(b"GIF89a"));
    }

    #[test]
    fn delay_converts_to_centiseconds() {
        assert_eq!((80u32 + 5) / 10, 8);
        assert_eq!((44u32 + 5) / 10, 4);
        assert_eq!((45u32 + 5) / 10, 5);
    }

    #[test]
    fn single_frame_option_is_respected() {
        let opts = LoopOptions {
            frames: 1,
            ..LoopOptions::default()
        };
        let out = encode_loop(&composer(), "solo", None, None, &opts).unwrap();
        assert_eq!(out.extension, "gif");
    }
}
