//! CLI entry point for desk-hands.

mod cli;

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use desk_hands::browser::{ChromiumConfig, ChromiumDesktop};
use desk_hands::coords::Point;
use desk_hands::desktop::{Desktop, ElementQuery, MouseButton};
use desk_hands::{Agent, CuaError, Options, ProgressEvent, ProgressFn, TaskResult};

use cli::{Args, Command};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    desk_hands::config::load_dotenv();

    let verbose = matches!(args.command, Command::Do { verbose: true, .. });
    let default_level = if verbose { "desk_hands=debug" } else { "desk_hands=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32, CuaError> {
    let chromium = ChromiumConfig { headless: args.headless, ..ChromiumConfig::default() };
    let desktop = Arc::new(ChromiumDesktop::launch(chromium).await?);
    if let Some(url) = &args.url {
        desktop.goto(url).await?;
    }

    match args.command {
        Command::Do { task, verbose, model, timeout, max_actions, safety, audit_log, patterns } => {
            let mut opts = Options {
                verbose,
                headless: args.headless,
                audit_log_path: audit_log,
                patterns_path: patterns,
                ..Options::default()
            };
            if let Some(m) = model {
                opts.model = m;
            }
            if let Some(t) = timeout {
                opts.timeout = t;
            }
            if let Some(n) = max_actions {
                opts.max_actions = n;
            }
            if let Some(s) = safety {
                opts.safety_level = s;
            }
            let agent = Agent::new(opts, desktop)?;
            let token = CancellationToken::new();
            let on_interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted; stopping");
                    on_interrupt.cancel();
                }
            });
            let progress: ProgressFn =
                Arc::new(move |event: &ProgressEvent| print_progress(event, verbose));
            let result = agent.run_with_progress_cancel(&token, &task, progress).await?;
            print_result(&result);
            Ok(if result.success { 0 } else { 1 })
        }
        Command::Click { x, y } => {
            desktop.click(Point::new(x, y), MouseButton::Left).await?;
            println!("clicked ({x}, {y})");
            Ok(0)
        }
        Command::Type { text } => {
            desktop.type_text(&text).await?;
            println!("typed {} chars", text.chars().count());
            Ok(0)
        }
        Command::Screenshot { file } => {
            let frame = desktop.capture(0).await?;
            frame
                .image
                .save(&file)
                .map_err(|e| CuaError::Backend(format!("save {}: {e}", file.display())))?;
            println!("{} ({}x{})", file.display(), frame.image.width(), frame.image.height());
            Ok(0)
        }
        Command::Elements { role, name } => {
            let query = ElementQuery {
                role,
                name_contains: name,
                max_results: 200,
                ..ElementQuery::default()
            };
            for el in desktop.find_elements(&query).await? {
                println!(
                    "{:<12} {:<40} ({:.0}, {:.0}){}",
                    el.role,
                    el.name,
                    el.center_x,
                    el.center_y,
                    if el.focused { " *" } else { "" }
                );
            }
            Ok(0)
        }
        Command::Screen => {
            for d in desktop.displays().await? {
                println!(
                    "display {}: {}x{} at ({}, {}) scale {}{}",
                    d.index,
                    d.width,
                    d.height,
                    d.x,
                    d.y,
                    d.scale_factor,
                    if d.is_primary { " primary" } else { "" }
                );
            }
            Ok(0)
        }
    }
}

fn print_progress(event: &ProgressEvent, verbose: bool) {
    match event {
        ProgressEvent::Thinking(t) if verbose => eprintln!("  … {t}"),
        ProgressEvent::Thinking(_) => {}
        ProgressEvent::Message(m) => eprintln!("  {m}"),
        ProgressEvent::Step(s) => {
            let mark = if s.success { "✓" } else { "✗" };
            eprintln!("{mark} [{}] {}", s.number, s.description);
            if let Some(err) = &s.error {
                eprintln!("    {}", err.source);
            }
        }
    }
}

fn print_result(result: &TaskResult) {
    let status = if result.success { "done" } else { "failed" };
    println!(
        "{status} in {:.1}s after {} step(s): {}",
        result.duration.as_secs_f64(),
        result.steps.len(),
        result.summary
    );
    if let Some(err) = &result.error {
        println!("error: {}", err.source);
    }
    if result.needs_help {
        println!("the agent needs a human to continue");
    }
}
