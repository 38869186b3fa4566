mod animate;
mod assets;
mod cache;
mod compose;
mod filtergraph;
mod fonts;
mod layout;
mod pulse;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::animate::compose_animated;
use crate::assets::Source;
use crate::compose::{BannerRequest, Composer};
use crate::filtergraph::{to_filter_complex, Overlay};
use crate::layout::{resolve, RawLayout};
use crate::pulse::{encode_loop, LoopOptions};

#[derive(Debug, Parser)]
#[command(name = "bannerc")]
#[command(about = "Banner compositor and animated-loop encoder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RenderArgs {
    /// Background image or video, as a path or http(s) URL.
    #[arg(long)]
    background: Option<String>,
    /// Avatar image, as a path or http(s) URL.
    #[arg(long)]
    avatar: Option<String>,
    #[arg(long, default_value = "Welcome!")]
    title: String,
    #[arg(long, default_value = "")]
    subtitle: String,
    /// JSON layout overrides; omitted or malformed fields fall back to
    /// defaults.
    #[arg(long)]
    layout: Option<PathBuf>,
    #[arg(long, default_value = "data/cache")]
    cache_dir: PathBuf,
    #[arg(short = 'o', long = "output")]
    output: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render the full opaque banner PNG.
    Compose(RenderArgs),
    /// Render only the transparent overlay PNG.
    Overlay(RenderArgs),
    /// Composite the overlay onto an animated background via ffmpeg.
    Animate(RenderArgs),
    /// Print the ffmpeg filter graph without running anything.
    Graph {
        /// Background file the graph would consume as input 0.
        #[arg(long)]
        background: PathBuf,
        /// Assume a pre-rendered full-canvas overlay as input 1 instead of
        /// burning captions in with drawtext.
        #[arg(long)]
        overlay: bool,
        #[arg(long)]
        layout: Option<PathBuf>,
        #[arg(long, default_value = "Welcome!")]
        title: String,
        #[arg(long, default_value = "")]
        subtitle: String,
    },
    /// Encode the self-contained pulsating welcome loop.
    Pulse {
        #[arg(long)]
        username: String,
        #[arg(long)]
        avatar: Option<String>,
        #[arg(long)]
        background: Option<String>,
        #[arg(long, default_value_t = pulse::DEFAULT_FRAMES)]
        frames: usize,
        #[arg(long, default_value_t = pulse::DEFAULT_DELAY_MS)]
        delay_ms: u32,
        #[arg(long, default_value = "Welcome!")]
        title: String,
        #[arg(long, default_value = "data/cache")]
        cache_dir: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compose(args) => run_compose(&args, RenderMode::Full),
        Commands::Overlay(args) => run_compose(&args, RenderMode::Overlay),
        Commands::Animate(args) => run_animate(&args),
        Commands::Graph {
            background,
            overlay,
            layout,
            title,
            subtitle,
        } => run_graph(&background, overlay, layout.as_deref(), &title, &subtitle),
        Commands::Pulse {
            username,
            avatar,
            background,
            frames,
            delay_ms,
            title,
            cache_dir,
            output,
        } => run_pulse(
            &username,
            avatar.as_deref(),
            background.as_deref(),
            frames,
            delay_ms,
            title,
            &cache_dir,
            &output,
        ),
    }
}

enum RenderMode {
    Full,
    Overlay,
}

fn run_compose(args: &RenderArgs, mode: RenderMode) -> Result<()> {
    let composer = Composer::new(args.cache_dir.clone())?;
    let request = banner_request(args);
    let png = match mode {
        RenderMode::Full => composer.compose_full(&request)?,
        RenderMode::Overlay => composer.compose_overlay(&request)?,
    };
    fs::write(&args.output, &png)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("Wrote {} ({} bytes)", args.output.display(), png.len());
    Ok(())
}

fn run_animate(args: &RenderArgs) -> Result<()> {
    let composer = Composer::new(args.cache_dir.clone())?;
    let request = banner_request(args);
    let gif = compose_animated(&composer, &request)?;
    fs::write(&args.output, &gif)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("Wrote {} ({} bytes)", args.output.display(), gif.len());
    Ok(())
}

fn run_graph(
    background: &Path,
    overlay: bool,
    layout_path: Option<&Path>,
    title: &str,
    subtitle: &str,
) -> Result<()> {
    let layout = resolve(&load_layout(layout_path));
    let fonts = fonts::FontSet::load();
    let mode = overlay.then_some(Overlay::FullCanvas);
    let nodes = filtergraph::build(background, mode, &layout, title, subtitle, &fonts)?;
    println!("{}", to_filter_complex(&nodes));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_pulse(
    username: &str,
    avatar: Option<&str>,
    background: Option<&str>,
    frames: usize,
    delay_ms: u32,
    title: String,
    cache_dir: &Path,
    output: &Path,
) -> Result<()> {
    let composer = Composer::new(cache_dir.to_path_buf())?;
    let avatar = avatar.map(Source::parse);
    let background = background.map(Source::parse);
    let opts = LoopOptions {
        frames,
        delay_ms,
        title,
    };
    let result = encode_loop(
        &composer,
        username,
        avatar.as_ref(),
        background.as_ref(),
        &opts,
    )?;

    // A degraded still frame gets the extension it actually is.
    let mut path = output.to_path_buf();
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(result.extension) => {}
        _ => {
            path.set_extension(result.extension);
        }
    }
    fs::write(&path, &result.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} ({} bytes)", path.display(), result.bytes.len());
    Ok(())
}

fn banner_request(args: &RenderArgs) -> BannerRequest {
    let layout = resolve(&load_layout(args.layout.as_deref()));
    BannerRequest {
        background: args.background.as_deref().map(Source::parse),
        title: args.title.clone(),
        subtitle: args.subtitle.clone(),
        avatar: args.avatar.as_deref().map(Source::parse),
        layout,
    }
}

/// Layout configuration is advisory: a missing or malformed file logs a
/// warning and falls back to defaults instead of failing the render.
fn load_layout(path: Option<&Path>) -> RawLayout {
    let Some(path) = path else {
        return RawLayout::default();
    };
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) => {
            eprintln!(
                "[bannerc] unreadable layout {} ({error}), using defaults",
                path.display()
            );
            return RawLayout::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(raw) => raw,
        Err(error) => {
            eprintln!(
                "[bannerc] malformed layout {} ({error}), using defaults",
                path.display()
            );
            RawLayout::default()
        }
    }
}
