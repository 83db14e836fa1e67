//! Thin command-surface binary driving [`vidflow::controller::PipelineController`].
//!
//! The CLI entry point is kept out of the pipeline core itself, but a
//! runnable crate needs some externally invokable surface — this binary
//! contains no pipeline logic of its own, the same relationship the
//! teacher's thin `cap` binary had to the `hybrid_screen_capture` library
//! it drove.
//!
//! Commands are read one per line from stdin, whitespace-tokenized, until
//! EOF or an explicit `quit`/`exit` — a REPL rather than a single-shot
//! invocation, since `stop` only makes sense against a process that is
//! still running a previous command.

use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use vidflow::controller::PipelineController;
use vidflow::hardware::HardwareAccel;
use vidflow::latency::LatencyClass;
use vidflow::preview::PreviewSurface;

/// One line of the command surface. All three pipeline-building commands
/// share the same trailing optional parameters; `clap` derives the REPL
/// grammar directly from those command shapes.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, multicall = false)]
struct ReplLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// play url [hwType] [latencyLevel]
    Play {
        url: String,
        hw_type: Option<String>,
        latency_level: Option<String>,
    },
    /// publish input output encoder [hwType] [fps] [latencyLevel] [echo]
    Publish {
        input: String,
        output: String,
        encoder: String,
        hw_type: Option<String>,
        fps: Option<u32>,
        latency_level: Option<String>,
        echo: Option<String>,
    },
    /// serve source port name encoder [hwType] [fps] [latencyLevel] [echo]
    Serve {
        source: String,
        port: u16,
        name: String,
        encoder: String,
        hw_type: Option<String>,
        fps: Option<u32>,
        latency_level: Option<String>,
        echo: Option<String>,
    },
    /// stop
    Stop,
    /// quit / exit the REPL (needed to end the loop, not a pipeline command)
    #[command(alias = "exit")]
    Quit,
}

/// Logs what it would have displayed. A real display surface is GUI
/// wiring, out of scope for this core, but the CLI still needs a concrete
/// `PreviewSurface` to drive `play`/echo end to end.
struct ConsolePreviewSurface;

impl PreviewSurface for ConsolePreviewSurface {
    fn present(&self, width: u32, height: u32, stride: u32, bgra: &[u8]) {
        tracing::debug!(width, height, stride, bytes = bgra.len(), "preview frame");
    }
}

fn parse_hw(s: &Option<String>) -> HardwareAccel {
    s.as_deref()
        .map(|s| {
            HardwareAccel::from_str(s).unwrap_or_else(|e| {
                tracing::warn!("{e}; falling back to hwType=None");
                HardwareAccel::None
            })
        })
        .unwrap_or(HardwareAccel::None)
}

fn parse_latency(s: &Option<String>) -> LatencyClass {
    s.as_deref()
        .map(|s| {
            LatencyClass::from_str(s).unwrap_or_else(|e| {
                tracing::warn!("{e}; falling back to Standard");
                LatencyClass::Standard
            })
        })
        .unwrap_or_default()
}

fn parse_echo(s: &Option<String>) -> bool {
    matches!(
        s.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("true") | Some("1") | Some("echo") | Some("yes")
    )
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let controller = PipelineController::new();
    let preview: Arc<dyn PreviewSurface> = Arc::new(ConsolePreviewSurface);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        // A broken stdin pipe is a fatal I/O error, not a clean EOF; surface
        // it to the caller's exit code rather than silently treating it the
        // same as end-of-input.
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        match ReplLine::try_parse_from(tokens) {
            Ok(parsed) => match parsed.command {
                Command::Play {
                    url,
                    hw_type,
                    latency_level,
                } => {
                    controller.play(&url, parse_hw(&hw_type), parse_latency(&latency_level), preview.clone());
                }
                Command::Publish {
                    input,
                    output,
                    encoder,
                    hw_type,
                    fps,
                    latency_level,
                    echo,
                } => {
                    let echo = parse_echo(&echo);
                    controller.publish(
                        &input,
                        &output,
                        &encoder,
                        parse_hw(&hw_type),
                        fps.unwrap_or(30),
                        parse_latency(&latency_level),
                        echo,
                        echo.then(|| preview.clone()),
                    );
                }
                Command::Serve {
                    source,
                    port,
                    name,
                    encoder,
                    hw_type,
                    fps,
                    latency_level,
                    echo,
                } => {
                    let echo = parse_echo(&echo);
                    controller.serve(
                        &source,
                        port,
                        &name,
                        &encoder,
                        parse_hw(&hw_type),
                        fps.unwrap_or(30),
                        parse_latency(&latency_level),
                        echo,
                        echo.then(|| preview.clone()),
                    );
                }
                Command::Stop => controller.stop_all(),
                Command::Quit => break,
            },
            Err(e) => {
                let _ = writeln!(stdout, "{e}");
            }
        }
    }

    controller.stop_all();
    Ok(())
}
