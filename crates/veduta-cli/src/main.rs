use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use veduta_contracts::chat::{parse_intent, SESSION_HELP_COMMANDS};
use veduta_contracts::errors::WorkflowError;
use veduta_contracts::runs::job::RunOutcome;
use veduta_contracts::styles::UPLOAD_SLOT;
use veduta_engine::{
    resolve_server, CatalogInstall, DryrunRenderService, HttpRenderService, RenderConfig,
    RenderService, StudioEngine,
};

#[derive(Debug, Parser)]
#[command(name = "veduta", version, about = "Sketch-to-render studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session with the gallery rail and slash commands.
    Session(SessionArgs),
    /// One-shot run: sketch + style + prompt, artifacts written to disk.
    Generate(GenerateArgs),
    /// Fetch and list the server's style catalog.
    Styles(StylesArgs),
    /// Upload a style image and list the refreshed catalog.
    Upload(UploadArgs),
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    sketch: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    sketch: PathBuf,
    #[arg(long)]
    style: String,
    #[arg(long, default_value = "")]
    prompt: String,
    /// Ask the service to rewrite the prompt from the sketch first.
    #[arg(long)]
    auto_prompt: bool,
    /// Number of render slots to fill this run.
    #[arg(long)]
    slots: Option<usize>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct StylesArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(run()));
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("veduta error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Session(args) => {
            run_session(args).await?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(args).await,
        Command::Styles(args) => run_styles(args).await,
        Command::Upload(args) => run_upload(args).await,
    }
}

fn build_service(server: Option<&str>, dryrun: bool) -> Box<dyn RenderService> {
    if dryrun {
        Box::new(DryrunRenderService::new())
    } else {
        Box::new(HttpRenderService::new(resolve_server(server)))
    }
}

fn build_engine(
    out: &Path,
    events: Option<&Path>,
    server: Option<&str>,
    dryrun: bool,
    config: RenderConfig,
) -> Result<StudioEngine> {
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out.join("events.jsonl"));
    StudioEngine::new(out, &events_path, build_service(server, dryrun), config)
}

async fn run_session(args: SessionArgs) -> Result<()> {
    let mut engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.server.as_deref(),
        args.dryrun,
        RenderConfig::default(),
    )?;

    println!("Veduta session started ({}).", engine.service_description());
    let events = engine.event_writer();
    println!("Events: {}", events.path().display());
    println!("Type /help for commands.");

    match engine.reload_catalog().await {
        Ok(_) => print_gallery(&engine),
        Err(err) => {
            println!("Style catalog load failed: {err:#}");
            println!("Use /styles to retry once the server is reachable.");
        }
    }
    if let Some(count) = engine.probe_counter().await? {
        println!("Service visits: {count}");
    }
    if let Some(path) = args.sketch.as_deref() {
        match engine.attach_sketch(path) {
            Ok(handle) => println!("Sketch attached: {} ({handle})", path.display()),
            Err(err) => report_failure("Sketch attach", &err),
        }
    }

    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", SESSION_HELP_COMMANDS.join(" "));
            }
            "status" => print_status(&engine),
            "attach_sketch" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("Usage: /sketch <path>");
                    continue;
                };
                match engine.attach_sketch(Path::new(&path)) {
                    Ok(handle) => println!("Sketch attached: {path} ({handle})"),
                    Err(err) => report_failure("Sketch attach", &err),
                }
            }
            "detach_sketch" => {
                if engine.detach_sketch()? {
                    println!("Sketch detached.");
                } else {
                    println!("No sketch attached.");
                }
            }
            "list_styles" => match engine.reload_catalog().await {
                Ok(CatalogInstall::Installed { styles }) => {
                    println!("Loaded {styles} styles.");
                    print_styles(&engine);
                }
                Ok(CatalogInstall::Superseded) => {
                    println!("Style reload superseded by a newer one.");
                }
                Err(err) => report_failure("Style catalog load", &err),
            },
            "show_gallery" => print_gallery(&engine),
            "gallery_next" => {
                let target = engine.gallery_position() + 1;
                report_gallery_move(&mut engine, target)?;
            }
            "gallery_prev" => {
                let target = engine.gallery_position().saturating_sub(1);
                report_gallery_move(&mut engine, target)?;
            }
            "goto_position" => {
                let position = value_as_non_empty_string(intent.command_args.get("position"))
                    .and_then(|value| value.parse::<usize>().ok());
                let Some(position) = position else {
                    println!("Usage: /goto <position>");
                    continue;
                };
                report_gallery_move(&mut engine, position)?;
            }
            "select_style" => {
                let Some(reference) = value_as_non_empty_string(intent.command_args.get("style"))
                else {
                    println!("Usage: /select <name|label|index>");
                    continue;
                };
                match engine.select_style(&reference) {
                    Ok((selected, _)) => println!(
                        "Selected {} (position {}).",
                        selected.name,
                        engine.gallery_position()
                    ),
                    Err(err) => report_failure("Select", &err),
                }
            }
            "prompt" => match value_as_non_empty_string(intent.command_args.get("text")) {
                Some(text) => {
                    engine.set_prompt(&text)?;
                    println!("Prompt set.");
                }
                None => {
                    if engine.prompt().is_empty() {
                        println!("Prompt is empty.");
                    } else {
                        println!("Prompt: {}", engine.prompt());
                    }
                }
            },
            "set_prompt" => {
                if let Some(prompt) = intent.prompt.as_deref() {
                    engine.set_prompt(prompt)?;
                    println!("Prompt set.");
                }
            }
            "augment_prompt" => match engine.augment_prompt().await {
                Ok(prompt) => println!("Prompt: {prompt}"),
                Err(err) => report_failure("Augment", &err),
            },
            "upload_style" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("Usage: /upload <path>");
                    continue;
                };
                match engine.upload_style(Path::new(&path)).await {
                    Ok(()) => {
                        println!("Uploaded {path}.");
                        print_gallery(&engine);
                    }
                    Err(err) => report_failure("Upload", &err),
                }
            }
            "generate" => match engine.run_generation().await {
                Ok(RunOutcome::Completed { slots }) => {
                    println!("Generation complete: {slots} artifacts.");
                    print_results(&engine);
                }
                Ok(RunOutcome::FailedAt { slot }) => {
                    println!("Generation stopped at slot {slot}; earlier results kept.");
                    print_results(&engine);
                }
                Ok(RunOutcome::AlreadyRunning) => {
                    println!("A generation run is already in progress.");
                }
                Err(err) => report_failure("Generation", &err),
            },
            "show_results" => print_results(&engine),
            "export" => {
                let dir = value_as_non_empty_string(intent.command_args.get("dir"))
                    .unwrap_or_else(|| "renders".to_string());
                let target = engine.session_dir().join(dir);
                match engine.export_artifacts(&target) {
                    Ok(written) if written.is_empty() => println!("No artifacts to export."),
                    Ok(written) => {
                        for path in &written {
                            println!("Wrote {}", path.display());
                        }
                    }
                    Err(err) => report_failure("Export", &err),
                }
            }
            "quit" => break,
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_else(|| "unknown".to_string());
                engine.emit_event(
                    "unknown_command",
                    json_object(json!({ "command": command.clone() })),
                )?;
                println!("Unknown command: {command}");
            }
            _ => {
                println!("Unsupported command: {}", intent.action);
            }
        }
    }

    let summary = engine.finish()?;
    println!(
        "Session closed: {} runs, {} artifacts, handles {} created / {} revoked.",
        summary.total_runs,
        summary.total_artifacts,
        summary.handles_created,
        summary.handles_revoked
    );
    if summary.handles_created != summary.handles_revoked {
        println!("Warning: display handle imbalance recorded in summary.json.");
        for leak in &summary.leaked {
            println!("  leaked: h{} ({})", leak.token, leak.origin);
        }
    }
    Ok(())
}

async fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut config = RenderConfig::default();
    if let Some(slots) = args.slots {
        config.slot_count = slots;
    }
    let mut engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.server.as_deref(),
        args.dryrun,
        config,
    )?;
    let driven = drive_batch(&mut engine, &args).await;
    let summary = engine.finish()?;
    let outcome = driven?;

    println!(
        "Done: {} artifacts ({} handles created, {} revoked).",
        summary.total_artifacts, summary.handles_created, summary.handles_revoked
    );
    match outcome {
        RunOutcome::FailedAt { slot } => {
            println!("Run stopped at slot {slot}.");
            Ok(1)
        }
        _ => Ok(0),
    }
}

async fn drive_batch(engine: &mut StudioEngine, args: &GenerateArgs) -> Result<RunOutcome> {
    engine.reload_catalog().await?;
    engine.select_style(&args.style)?;
    engine.attach_sketch(&args.sketch)?;
    engine.set_prompt(&args.prompt)?;
    if args.auto_prompt {
        let prompt = engine.augment_prompt().await?;
        println!("Prompt: {prompt}");
    }
    let outcome = engine.run_generation().await?;
    let exported = engine.export_artifacts(&args.out.join("artifacts"))?;
    for path in &exported {
        println!("Wrote {}", path.display());
    }
    Ok(outcome)
}

async fn run_styles(args: StylesArgs) -> Result<i32> {
    let mut engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.server.as_deref(),
        args.dryrun,
        RenderConfig::default(),
    )?;
    let loaded = engine.reload_catalog().await;
    if loaded.is_ok() {
        print_styles(&engine);
    }
    engine.finish()?;
    loaded?;
    Ok(0)
}

async fn run_upload(args: UploadArgs) -> Result<i32> {
    let mut engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.server.as_deref(),
        args.dryrun,
        RenderConfig::default(),
    )?;
    let uploaded = engine.upload_style(&args.image).await;
    if uploaded.is_ok() {
        println!(
            "Uploaded {} ({} styles now).",
            args.image.display(),
            engine.catalog().len()
        );
        print_styles(&engine);
    }
    engine.finish()?;
    uploaded?;
    Ok(0)
}

/// Hint shown after a failed session command when retrying without changing
/// local state could succeed. Precondition failures get no hint; the error
/// text already says what to fix.
fn retry_hint(err: &anyhow::Error) -> Option<&'static str> {
    let retryable = err
        .downcast_ref::<WorkflowError>()
        .map(WorkflowError::is_retryable)
        .unwrap_or(false);
    retryable.then_some("The command can be retried as-is.")
}

fn report_failure(action: &str, err: &anyhow::Error) {
    println!("{action} failed: {err:#}");
    if let Some(hint) = retry_hint(err) {
        println!("{hint}");
    }
}

fn report_gallery_move(engine: &mut StudioEngine, position: usize) -> Result<()> {
    match engine.gallery_moved(position)? {
        Some(style) => println!("Position {}: {}", engine.gallery_position(), style.name),
        None => println!("Position {}: upload card", engine.gallery_position()),
    }
    Ok(())
}

/// One-line rail with the upload placeholder at slot 0 and the cursor in
/// brackets.
fn print_gallery(engine: &StudioEngine) {
    let position = engine.gallery_position();
    let mut cells = Vec::with_capacity(engine.catalog().len() + 1);
    cells.push(if position == UPLOAD_SLOT {
        "[+upload]".to_string()
    } else {
        "+upload".to_string()
    });
    for record in engine.catalog().iter() {
        if record.index + 1 == position {
            cells.push(format!("[{}]", record.label));
        } else {
            cells.push(record.label.clone());
        }
    }
    println!("Gallery: {}", cells.join(" | "));
    match engine.selected_style() {
        Some(style) => println!("Selected: {} (#{})", style.name, style.index),
        None => println!("Selected: none"),
    }
}

fn print_styles(engine: &StudioEngine) {
    let selected = engine.selected_style().map(|style| style.index);
    for record in engine.catalog().iter() {
        let marker = if selected == Some(record.index) {
            "*"
        } else {
            " "
        };
        println!(" {marker} {:>2}  {} ({})", record.index, record.label, record.name);
    }
}

fn print_status(engine: &StudioEngine) {
    println!("Service: {}", engine.service_description());
    println!(
        "Catalog: {} ({} styles)",
        engine.catalog_state().as_str(),
        engine.catalog().len()
    );
    if let Some(error) = engine.catalog_error() {
        println!("Catalog error: {error}");
    }
    match engine.sketch() {
        Some(sketch) => println!("Sketch: {} ({})", sketch.name, sketch.handle),
        None => println!("Sketch: none"),
    }
    match engine.selected_style() {
        Some(style) => println!("Style: {} (#{})", style.name, style.index),
        None => println!("Style: none"),
    }
    if engine.prompt().is_empty() {
        println!("Prompt: (empty)");
    } else {
        println!("Prompt: {}", engine.prompt());
    }
    let filled = engine.results().iter().filter(|slot| slot.is_some()).count();
    println!(
        "Results: {}/{} slots filled; {} handles live",
        filled,
        engine.results().len(),
        engine.handles_live()
    );
}

fn print_results(engine: &StudioEngine) {
    for (slot, entry) in engine.results().iter().enumerate() {
        match entry {
            Some(handle) => {
                let size = engine
                    .resolve_bytes(*handle)
                    .map(|bytes| bytes.len())
                    .unwrap_or(0);
                println!("  slot {slot}: {handle} ({size} bytes)");
            }
            None => println!("  slot {slot}: empty"),
        }
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn json_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use veduta_contracts::errors::WorkflowError;
    use veduta_engine::RenderService;

    use super::{build_service, retry_hint, value_as_non_empty_string};

    #[test]
    fn non_empty_string_trims_and_rejects_blank() {
        let value = json!("  gothic.png  ");
        assert_eq!(
            value_as_non_empty_string(Some(&value)),
            Some("gothic.png".to_string())
        );

        let blank = json!("   ");
        assert_eq!(value_as_non_empty_string(Some(&blank)), None);
        assert_eq!(value_as_non_empty_string(None), None);
    }

    #[test]
    fn retry_hint_skips_precondition_failures() {
        let transient = anyhow::Error::new(WorkflowError::PromptAugmentFailed {
            reason: "status 500: model offline".to_string(),
        });
        assert!(retry_hint(&transient).is_some());

        assert!(retry_hint(&anyhow::Error::new(WorkflowError::NoSketchSelected)).is_none());
        assert!(retry_hint(&anyhow::anyhow!("disk full")).is_none());
    }

    #[test]
    fn dryrun_flag_selects_offline_service() {
        assert_eq!(build_service(None, true).describe(), "dryrun");
        assert!(build_service(Some("http://render.example"), false)
            .describe()
            .contains("http://render.example"));
    }
}
