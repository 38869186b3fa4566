use serde::Deserialize;

pub const CANVAS_WIDTH: u32 = 1200;
pub const CANVAS_HEIGHT: u32 = 400;

/// Extra pixels the ring adds around the avatar disc.
pub const BADGE_MARGIN: f64 = 10.0;

const DEFAULT_AVATAR_SIZE: f64 = 190.0;
const DEFAULT_AVATAR_X: f64 = 80.0;
const DEFAULT_AVATAR_Y: f64 = 90.0;
const DEFAULT_TITLE_SIZE: f64 = 100.0;
const DEFAULT_TITLE_Y: f64 = 205.0;
const DEFAULT_SUBTITLE_SIZE: f64 = 50.0;
const DEFAULT_SUBTITLE_Y: f64 = 265.0;
const DEFAULT_TITLE_STROKE_WIDTH: f64 = 3.0;
const DEFAULT_SUBTITLE_STROKE_WIDTH: f64 = 2.0;
const DEFAULT_OVERLAY_OPACITY: f64 = 0.20;

const AVATAR_SIZE_RANGE: (f64, f64) = (32.0, 300.0);
const FONT_SIZE_RANGE: (f64, f64) = (12.0, 200.0);
const STROKE_WIDTH_RANGE: (f64, f64) = (0.0, 20.0);
const OVERLAY_OPACITY_RANGE: (f64, f64) = (0.0, 0.6);

/// Loosely structured layout payload. Every field is optional; malformed or
/// missing values resolve to documented defaults rather than erroring.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLayout {
    #[serde(default)]
    pub avatar: RawAvatar,
    #[serde(default)]
    pub title: RawText,
    #[serde(default)]
    pub subtitle: RawText,
    #[serde(default, rename = "overlayOpacity", alias = "overlay_opacity")]
    pub overlay_opacity: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAvatar {
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawText {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub center: Option<bool>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default, rename = "strokeColor", alias = "stroke_color")]
    pub stroke_color: Option<String>,
    #[serde(default, rename = "strokeWidth", alias = "stroke_width")]
    pub stroke_width: Option<f64>,
}

/// Fully resolved layout. Immutable once produced; every numeric field is
/// inside its clamp range.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub avatar: AvatarLayout,
    pub title: TextLayout,
    pub subtitle: TextLayout,
    pub overlay_opacity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvatarLayout {
    pub size: f64,
    pub x: f64,
    pub y: f64,
}

impl AvatarLayout {
    /// Outer diameter of the composited ring+avatar badge.
    pub fn badge_size(&self) -> f64 {
        self.size + BADGE_MARGIN
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub x: f64,
    pub y: f64,
    pub size: f64,
    pub center: bool,
    pub color: Color,
    pub stroke_color: Color,
    pub stroke_width: f64,
}

/// Straight-alpha color. The alpha channel stays fractional so it can feed
/// both SVG opacity attributes and ffmpeg `0xRRGGBB@a` color strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f64,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: f64) -> Self {
        Self { r, g, b, a }
    }

    /// Parses `#RGB`, `#RRGGBB` or `#RRGGBBAA`. Returns `None` for anything
    /// else; callers fall back to their default color.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex = raw.trim().strip_prefix('#')?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            3 => {
                let channel = |i: usize| {
                    let d = u8::from_str_radix(&hex[i..i + 1], 16).ok()?;
                    Some(d * 17)
                };
                Some(Self::rgb(channel(0)?, channel(1)?, channel(2)?))
            }
            6 | 8 => {
                let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
                let a = if hex.len() == 8 {
                    f64::from(channel(6)?) / 255.0
                } else {
                    1.0
                };
                Some(Self::rgba(channel(0)?, channel(2)?, channel(4)?, a))
            }
            _ => None,
        }
    }

    pub fn hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

const DEFAULT_TITLE_COLOR: Color = Color::rgb(0x00, 0xE5, 0xFF);
const DEFAULT_SUBTITLE_COLOR: Color = Color::rgb(0xFF, 0xD1, 0x66);
const DEFAULT_STROKE_COLOR: Color = Color::rgba(0, 0, 0, 0.85);

/// Clamps a possibly-missing, possibly-non-finite value into `[min, max]`.
/// Missing and non-finite values resolve to the default first.
fn clamp_or(value: Option<f64>, default: f64, (min, max): (f64, f64)) -> f64 {
    let v = value.filter(|v| v.is_finite()).unwrap_or(default);
    v.clamp(min, max)
}

fn color_or(value: Option<&str>, default: Color) -> Color {
    value.and_then(Color::parse).unwrap_or(default)
}

/// Total function: any payload resolves to a valid layout. Malformed input
/// degrades to defaults instead of failing.
pub fn resolve(raw: &RawLayout) -> Layout {
    let canvas_w = f64::from(CANVAS_WIDTH);
    let canvas_h = f64::from(CANVAS_HEIGHT);

    let size = clamp_or(raw.avatar.size, DEFAULT_AVATAR_SIZE, AVATAR_SIZE_RANGE);
    let badge = size + BADGE_MARGIN;
    let avatar = AvatarLayout {
        size,
        x: clamp_or(raw.avatar.x, DEFAULT_AVATAR_X, (0.0, canvas_w - badge)),
        y: clamp_or(raw.avatar.y, DEFAULT_AVATAR_Y, (0.0, canvas_h - badge)),
    };

    let text = |raw: &RawText, default_y: f64, default_size: f64, fill: Color, stroke_w: f64| {
        TextLayout {
            x: clamp_or(raw.x, canvas_w / 2.0, (0.0, canvas_w)),
            y: clamp_or(raw.y, default_y, (0.0, canvas_h)),
            size: clamp_or(raw.size, default_size, FONT_SIZE_RANGE),
            center: raw.center.unwrap_or(true),
            color: color_or(raw.color.as_deref(), fill),
            stroke_color: color_or(raw.stroke_color.as_deref(), DEFAULT_STROKE_COLOR),
            stroke_width: clamp_or(raw.stroke_width, stroke_w, STROKE_WIDTH_RANGE),
        }
    };

    Layout {
        avatar,
        title: text(
            &raw.title,
            DEFAULT_TITLE_Y,
            DEFAULT_TITLE_SIZE,
            DEFAULT_TITLE_COLOR,
            DEFAULT_TITLE_STROKE_WIDTH,
        ),
        subtitle: text(
            &raw.subtitle,
            DEFAULT_SUBTITLE_Y,
            DEFAULT_SUBTITLE_SIZE,
            DEFAULT_SUBTITLE_COLOR,
            DEFAULT_SUBTITLE_STROKE_WIDTH,
        ),
        overlay_opacity: clamp_or(
            raw.overlay_opacity,
            DEFAULT_OVERLAY_OPACITY,
            OVERLAY_OPACITY_RANGE,
        ),
    }
}

impl TextLayout {
    /// Horizontal anchor: canvas midpoint when centered, explicit x otherwise.
    pub fn anchor_x(&self) -> f64 {
        if self.center {
            f64::from(CANVAS_WIDTH) / 2.0
        } else {
            self.x
        }
    }
}
