use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Result};

use crate::fonts::FontSet;
use crate::layout::{Layout, TextLayout, CANVAS_HEIGHT, CANVAS_WIDTH};

const FPS: u32 = 15;

/// Option value kinds for a filter argument. The kind decides how the value
/// is escaped when the graph is serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(i64),
    /// Free text wrapped in single quotes, fully escaped.
    Quoted(String),
    /// Expression or keyword emitted verbatim.
    Expr(String),
}

/// One node of a -filter_complex graph.
#[derive(Debug, Clone)]
pub struct FilterNode {
    pub name: &'static str,
    pub options: Vec<(&'static str, OptionValue)>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl FilterNode {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            options: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn opt(mut self, key: &'static str, value: OptionValue) -> Self {
        self.options.push((key, value));
        self
    }

    fn from_pads(mut self, pads: &[&str]) -> Self {
        self.inputs = pads.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    fn to_pads(mut self, pads: &[&str]) -> Self {
        self.outputs = pads.iter().map(|p| (*p).to_owned()).collect();
        self
    }
}

/// How a pre-rendered overlay (engine input `1:v`) is composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    /// Canvas-sized transparent PNG placed at the origin.
    FullCanvas,
    /// Badge-sized graphic placed at the avatar position.
    Badge,
}

/// Builds the animated-banner filter graph. `0:v` is the background video,
/// `1:v` (when present) the pre-rendered overlay. When no overlay carries
/// the captions, two drawtext nodes burn them in instead. Every
/// intermediate pad is consumed exactly once and the graph ends at `[outv]`.
pub fn build(
    background: &Path,
    overlay: Option<Overlay>,
    layout: &Layout,
    title: &str,
    subtitle: &str,
    fonts: &FontSet,
) -> Result<Vec<FilterNode>> {
    if !background.exists() {
        bail!("background not found: {}", background.display());
    }

    let mut nodes = vec![
        FilterNode::new("fps")
            .opt("fps", OptionValue::Int(i64::from(FPS)))
            .from_pads(&["0:v"])
            .to_pads(&["bg0"]),
        FilterNode::new("scale")
            .opt("w", OptionValue::Int(i64::from(CANVAS_WIDTH)))
            .opt("h", OptionValue::Int(i64::from(CANVAS_HEIGHT)))
            .opt("flags", OptionValue::Expr("lanczos".to_owned()))
            .from_pads(&["bg0"])
            .to_pads(&["bg1"]),
        FilterNode::new("format")
            .opt("pix_fmts", OptionValue::Expr("rgba".to_owned()))
            .from_pads(&["bg1"])
            .to_pads(&["bg2"]),
    ];

    match overlay {
        Some(mode) => {
            nodes.push(
                FilterNode::new("fps")
                    .opt("fps", OptionValue::Int(i64::from(FPS)))
                    .from_pads(&["1:v"])
                    .to_pads(&["ov0"]),
            );
            let mut tail = "ov0";
            if mode == Overlay::Badge {
                let badge = layout.avatar.badge_size().round() as i64;
                nodes.push(
                    FilterNode::new("scale")
                        .opt("w", OptionValue::Int(badge))
                        .opt("h", OptionValue::Int(badge))
                        .from_pads(&[tail])
                        .to_pads(&["ov1"]),
                );
                tail = "ov1";
            }
            nodes.push(
                FilterNode::new("format")
                    .opt("pix_fmts", OptionValue::Expr("rgba".to_owned()))
                    .from_pads(&[tail])
                    .to_pads(&["ov2"]),
            );
            let (x, y) = match mode {
                Overlay::FullCanvas => (0, 0),
                Overlay::Badge => (
                    layout.avatar.x.round() as i64,
                    layout.avatar.y.round() as i64,
                ),
            };
            nodes.push(
                FilterNode::new("overlay")
                    .opt("x", OptionValue::Int(x))
                    .opt("y", OptionValue::Int(y))
                    .opt("eof_action", OptionValue::Expr("repeat".to_owned()))
                    .opt("shortest", OptionValue::Int(0))
                    .from_pads(&["bg2", "ov2"])
                    .to_pads(&["comp0"]),
            );
        }
        None => {
            nodes.push(FilterNode::new("copy").from_pads(&["bg2"]).to_pads(&["comp0"]));
        }
    }

    nodes.push(
        FilterNode::new("drawbox")
            .opt("x", OptionValue::Int(0))
            .opt("y", OptionValue::Int(0))
            .opt("w", OptionValue::Expr("iw".to_owned()))
            .opt("h", OptionValue::Expr("ih".to_owned()))
            .opt(
                "color",
                OptionValue::Expr(format!("black@{}", layout.overlay_opacity)),
            )
            .opt("t", OptionValue::Expr("fill".to_owned()))
            .from_pads(&["comp0"])
            .to_pads(&["comp1"]),
    );

    // Captions ride the overlay when one exists; otherwise the engine
    // burns them in.
    let mut tail = "comp1";
    if overlay.is_none() {
        nodes.push(
            drawtext(&layout.title, title, fonts.bold_file.as_deref())
                .from_pads(&["comp1"])
                .to_pads(&["txt0"]),
        );
        nodes.push(
            drawtext(&layout.subtitle, subtitle, fonts.regular_file.as_deref())
                .from_pads(&["txt0"])
                .to_pads(&["txt1"]),
        );
        tail = "txt1";
    }

    nodes.push(
        FilterNode::new("split")
            .from_pads(&[tail])
            .to_pads(&["pal_in", "use_in"]),
    );
    nodes.push(
        FilterNode::new("palettegen")
            .opt("stats_mode", OptionValue::Expr("full".to_owned()))
            .from_pads(&["pal_in"])
            .to_pads(&["palette"]),
    );
    nodes.push(
        FilterNode::new("paletteuse")
            .opt("new", OptionValue::Int(1))
            .opt("diff_mode", OptionValue::Expr("rectangle".to_owned()))
            .from_pads(&["use_in", "palette"])
            .to_pads(&["outv"]),
    );

    validate(&nodes)?;
    Ok(nodes)
}

fn drawtext(text: &TextLayout, content: &str, font: Option<&Path>) -> FilterNode {
    let x = if text.center {
        OptionValue::Expr("(w-text_w)/2".to_owned())
    } else {
        OptionValue::Int(text.x.round() as i64)
    };
    let mut node = FilterNode::new("drawtext");
    if let Some(font) = font {
        node = node.opt("fontfile", OptionValue::Quoted(font.display().to_string()));
    }
    node.opt("text", OptionValue::Quoted(content.to_owned()))
        .opt("x", x)
        .opt("y", OptionValue::Int(text.y.round() as i64))
        .opt("fontsize", OptionValue::Int(text.size.round() as i64))
        .opt("fontcolor", OptionValue::Quoted(text.color.hex()))
        .opt("borderw", OptionValue::Int(text.stroke_width.round() as i64))
        .opt("bordercolor", OptionValue::Quoted(text.stroke_color.hex()))
}

/// Rejects graphs with dangling intermediate pads or duplicate pad
/// definitions before they reach ffmpeg, where the same mistakes surface as
/// opaque parse errors.
pub fn validate(nodes: &[FilterNode]) -> Result<()> {
    let mut produced: HashSet<&str> = HashSet::new();
    let mut consumed: HashSet<&str> = HashSet::new();

    for node in nodes {
        for input in &node.inputs {
            let external = input.contains(':');
            if !external && !produced.contains(input.as_str()) {
                bail!("filter '{}' reads dangling pad [{input}]", node.name);
            }
            if !external && !consumed.insert(input.as_str()) {
                bail!("pad [{input}] consumed more than once");
            }
        }
        for output in &node.outputs {
            if !produced.insert(output.as_str()) {
                bail!("pad [{output}] produced more than once");
            }
        }
    }

    for pad in &produced {
        if *pad != "outv" && !consumed.contains(pad) {
            bail!("pad [{pad}] is never consumed");
        }
    }
    if !produced.contains("outv") {
        bail!("graph does not produce [outv]");
    }
    Ok(())
}

/// Serializes nodes into a single -filter_complex string:
/// `[in]name=k=v:k=v[out];...`.
pub fn to_filter_complex(nodes: &[FilterNode]) -> String {
    let mut out = String::new();
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        for input in &node.inputs {
            let _ = write!(out, "[{input}]");
        }
        out.push_str(node.name);
        for (j, (key, value)) in node.options.iter().enumerate() {
            out.push(if j == 0 { '=' } else { ':' });
            let _ = write!(out, "{key}={}", render_value(value));
        }
        for output in &node.outputs {
            let _ = write!(out, "[{output}]");
        }
    }
    out
}

fn render_value(value: &OptionValue) -> String {
    match value {
        OptionValue::Int(v) => v.to_string(),
        OptionValue::Quoted(v) => format!("'{}'", escape_quoted(v)),
        OptionValue::Expr(v) => v.clone(),
    }
}

/// Escapes a value for use inside a single-quoted filter option. Order is
/// load-bearing: backslash first, quote last, so no pass rewrites the
/// escapes introduced by an earlier one.
pub fn escape_quoted(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('=', "\\=")
        .replace(';', "\\;")
        .replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{resolve, RawLayout};

    fn default_layout() -> Layout {
        resolve(&RawLayout::default())
    }

    fn no_fonts() -> FontSet {
        FontSet {
            family: None,
            regular_file: None,
            bold_file: None,
            db: std::sync::Arc::new(usvg::fontdb::Database::new()),
        }
    }

    fn background_fixture(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("bg.gif");
        std::fs::write(&path, b"GIF89a").unwrap();
        path
    }

    #[test]
    fn overlay_graph_composites_and_skips_drawtext() {
        let dir = tempfile::tempdir().unwrap();
        let bg = background_fixture(dir.path());
        let nodes = build(
            &bg,
            Some(Overlay::FullCanvas),
            &default_layout(),
            "Welcome",
            "someone joined",
            &no_fonts(),
        )
        .unwrap();
        assert!(nodes.iter().all(|n| n.name != "drawtext"));

        let graph = to_filter_complex(&nodes);
        assert!(graph.starts_with("[0:v]fps=fps=15[bg0];"));
        assert!(graph.contains("[bg2][ov2]overlay=x=0:y=0:eof_action=repeat:shortest=0[comp0]"));
        assert!(graph.contains("drawbox=x=0:y=0:w=iw:h=ih:color=black@0.2:t=fill"));
        assert!(graph.contains("palettegen=stats_mode=full[palette]"));
        assert!(graph.ends_with("[use_in][palette]paletteuse=new=1:diff_mode=rectangle[outv]"));
    }

    #[test]
    fn badge_overlay_is_scaled_and_placed_at_avatar_position() {
        let dir = tempfile::tempdir().unwrap();
        let bg = background_fixture(dir.path());
        let nodes = build(
            &bg,
            Some(Overlay::Badge),
            &default_layout(),
            "",
            "",
            &no_fonts(),
        )
        .unwrap();
        let graph = to_filter_complex(&nodes);
        // Default avatar: 190 wide badge of 200 at (80, 90).
        assert!(graph.contains("[ov0]scale=w=200:h=200[ov1]"), "{graph}");
        assert!(graph.contains("overlay=x=80:y=90"));
    }

    #[test]
    fn graph_without_overlay_burns_captions_in() {
        let dir = tempfile::tempdir().unwrap();
        let bg = background_fixture(dir.path());
        let nodes = build(
            &bg,
            None,
            &default_layout(),
            "Welcome",
            "someone joined",
            &no_fonts(),
        )
        .unwrap();
        assert_eq!(nodes.iter().filter(|n| n.name == "drawtext").count(), 2);

        let graph = to_filter_complex(&nodes);
        assert!(graph.contains("[bg2]copy[comp0]"));
        assert!(graph.contains("[comp1]drawtext=text='Welcome'"));
        assert!(graph.contains("x=(w-text_w)/2"));
        assert!(graph.contains("[txt1]split[pal_in][use_in]"));
    }

    #[test]
    fn caption_metacharacters_are_escaped() {
        let dir = tempfile::tempdir().unwrap();
        let bg = background_fixture(dir.path());
        let nodes = build(
            &bg,
            None,
            &default_layout(),
            r"a\b:c=d;e'f",
            "",
            &no_fonts(),
        )
        .unwrap();
        let graph = to_filter_complex(&nodes);
        assert!(graph.contains(r"text='a\\b\:c\=d\;e\'f'"), "{graph}");
        // Font color hex keeps its leading hash untouched.
        assert!(graph.contains("fontcolor='#00E5FF'"));
    }

    #[test]
    fn escape_order_never_double_escapes() {
        // A backslash already in the input must not swallow the colon pass.
        assert_eq!(escape_quoted(r"\:"), r"\\\:");
        assert_eq!(escape_quoted("a=b;c"), r"a\=b\;c");
        assert_eq!(escape_quoted("plain"), "plain");
    }

    // The engine's option parser: a backslash makes the next character
    // literal.
    fn engine_unescape(raw: &str) -> String {
        let mut out = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn escaped_values_survive_the_engine_parser() {
        for raw in [
            r"a\b:c=d;e'f",
            r"\\already\:escaped",
            "plain text",
            ";;==::''",
            r"trailing backslash \",
        ] {
            assert_eq!(engine_unescape(&escape_quoted(raw)), raw, "input: {raw}");
        }
    }

    #[test]
    fn missing_background_fails_the_build() {
        let error = build(
            Path::new("/nope/clip.gif"),
            None,
            &default_layout(),
            "t",
            "s",
            &no_fonts(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("background not found"));
    }

    #[test]
    fn validation_rejects_dangling_and_duplicate_pads() {
        let dir = tempfile::tempdir().unwrap();
        let bg = background_fixture(dir.path());
        let good = build(
            &bg,
            Some(Overlay::FullCanvas),
            &default_layout(),
            "t",
            "s",
            &no_fonts(),
        )
        .unwrap();

        // Rename the terminal pad: its producer now dangles.
        let mut nodes = good.clone();
        nodes.last_mut().unwrap().outputs = vec!["wrong".to_owned()];
        let error = validate(&nodes).unwrap_err().to_string();
        assert!(error.contains("[wrong]") || error.contains("outv"), "{error}");

        let mut nodes = good.clone();
        nodes[1].outputs.push("bg0".to_owned());
        assert!(validate(&nodes)
            .unwrap_err()
            .to_string()
            .contains("produced more than once"));

        let mut nodes = good;
        nodes[2].inputs = vec!["missing".to_owned()];
        assert!(validate(&nodes)
            .unwrap_err()
            .to_string()
            .contains("dangling pad"));
    }
}
