use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use generator::{FrameEvent, GenerationEngine, GenerationError, RunOutcome, SessionController};
use image_api::BackendFactory;
use project::{ImageBlob, ImageSize, ProjectDb, ProjectId, ProjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

mod config;

use config::AppConfig;

const API_KEY_ENV: &str = "NEXTFRAME_API_KEY";

#[derive(Parser)]
#[command(name = "nextframe")]
#[command(about = "Chained image-sequence generation with resumable progress")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to config.json in the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project database, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project
    New {
        #[arg(short, long)]
        name: String,

        /// Prompt template, annotated with the frame number per request
        #[arg(short, long)]
        prompt: String,

        /// Number of frames to generate
        #[arg(short, long)]
        frames: u32,

        /// Output size, e.g. 1024x1024
        #[arg(long, default_value = "1024x1024")]
        size: ImageSize,

        /// API key; falls back to NEXTFRAME_API_KEY
        #[arg(long)]
        api_key: Option<String>,

        /// Reference image for frame 1
        #[arg(short, long)]
        reference: Option<PathBuf>,
    },

    /// List saved projects
    List,

    /// Show one project
    Show {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Edit fields of a saved project
    Set {
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        prompt: Option<String>,

        #[arg(short, long)]
        frames: Option<u32>,

        #[arg(long)]
        size: Option<ImageSize>,

        #[arg(long)]
        api_key: Option<String>,

        #[arg(short, long, conflicts_with = "clear_reference")]
        reference: Option<PathBuf>,

        #[arg(long)]
        clear_reference: bool,
    },

    /// Generate frames from the start (or from --from)
    Generate {
        id: String,

        /// First frame to (re)generate; earlier frames are kept
        #[arg(long, default_value = "1")]
        from: u32,
    },

    /// Continue after the last saved frame
    Resume { id: String },

    /// Delete a project and its frames
    Delete { id: String },

    /// Write the generated frames to a directory
    Export {
        id: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

struct AppContext {
    config: AppConfig,
    store: Arc<ProjectDb>,
}

impl AppContext {
    fn open(config: AppConfig, db_override: Option<PathBuf>) -> Result<Self> {
        let db_path = db_override.unwrap_or_else(|| config.db_path());
        let store = ProjectDb::open_or_create(&db_path)
            .with_context(|| format!("open project database {}", db_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    fn controller(&self) -> SessionController {
        SessionController::new(self.store.clone(), self.config.autosave_policy())
    }

    fn engine(&self) -> Result<GenerationEngine> {
        let api = BackendFactory::create(self.config.backend.clone())?;
        Ok(GenerationEngine::new(
            api,
            self.store.clone(),
            self.config.engine_config(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let config = AppConfig::load_or_default(cli.config.as_deref())?;

    if let Commands::InitConfig { force } = cli.command {
        return init_config_command(config, cli.config, force);
    }

    let ctx = AppContext::open(config, cli.db)?;

    match cli.command {
        Commands::New {
            name,
            prompt,
            frames,
            size,
            api_key,
            reference,
        } => new_command(&ctx, name, prompt, frames, size, api_key, reference),
        Commands::List => list_command(&ctx),
        Commands::Show { id, json } => show_command(&ctx, &ProjectId::from(id), json),
        Commands::Set {
            id,
            name,
            prompt,
            frames,
            size,
            api_key,
            reference,
            clear_reference,
        } => {
            let edits = Edits {
                name,
                prompt,
                frames,
                size,
                api_key,
                reference,
                clear_reference,
            };
            set_command(&ctx, &ProjectId::from(id), edits)
        }
        Commands::Generate { id, from } => {
            generate_command(&ctx, &ProjectId::from(id), Some(from)).await
        }
        Commands::Resume { id } => generate_command(&ctx, &ProjectId::from(id), None).await,
        Commands::Delete { id } => delete_command(&ctx, &ProjectId::from(id)),
        Commands::Export { id, output } => export_command(&ctx, &ProjectId::from(id), &output),
        Commands::InitConfig { .. } => unreachable!("handled before opening the database"),
    }
}

fn read_reference(path: &Path) -> Result<ImageBlob> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let blob = ImageBlob::from_bytes(bytes);
    let (w, h) = generator::chain::decode_dimensions(&blob)
        .with_context(|| format!("{} is not a readable image", path.display()))?;
    info!("Reference image {:?}: {}x{}", path, w, h);
    Ok(blob)
}

fn resolve_api_key(api_key: Option<String>) -> Option<String> {
    api_key.or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty()))
}

fn new_command(
    ctx: &AppContext,
    name: String,
    prompt: String,
    frames: u32,
    size: ImageSize,
    api_key: Option<String>,
    reference: Option<PathBuf>,
) -> Result<()> {
    let mut controller = ctx.controller();
    controller.new_project()?;
    controller.set_name(name)?;
    controller.set_prompt(prompt)?;
    controller.set_frame_count(frames)?;
    controller.set_size(size)?;
    match resolve_api_key(api_key) {
        Some(key) => controller.set_credentials(key)?,
        None => warn!("No API key given; set one with `set --api-key` or {API_KEY_ENV}"),
    }
    if let Some(path) = reference {
        controller.set_reference_image(read_reference(&path)?)?;
    }
    controller.flush()?;

    let id = controller
        .session()
        .project_id()
        .context("project was not saved")?;
    if let Err(errors) = controller
        .session()
        .snapshot()
        .validate(ctx.config.backend.variant.requires_reference())
    {
        warn!("Project is not ready to generate yet: {}", errors);
    }
    info!("Project created");
    println!("{id}");
    Ok(())
}

fn list_command(ctx: &AppContext) -> Result<()> {
    let projects = ctx.controller().list_projects()?;
    if projects.is_empty() {
        println!("No projects saved.");
        return Ok(());
    }
    for p in projects {
        let updated = chrono::DateTime::from_timestamp_millis(p.updated_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!(
            "{}  {:<24} {:>3}/{:<3} {}",
            p.id, p.name, p.last_success_frame, p.frame_count, updated
        );
    }
    Ok(())
}

fn show_command(ctx: &AppContext, id: &ProjectId, json: bool) -> Result<()> {
    let mut controller = ctx.controller();
    controller.load_project(id)?;
    let record = controller.session().snapshot();
    let missing = record
        .validate(ctx.config.backend.variant.requires_reference())
        .err()
        .map(|e| e.to_string());

    if json {
        let view = serde_json::json!({
            "id": id,
            "name": record.name,
            "prompt": record.prompt_template,
            "frame_count": record.frame_count,
            "size": record.size,
            "has_credentials": !record.credentials.is_blank(),
            "has_reference_image": record.reference_image.is_some(),
            "last_success_frame": record.last_success_frame,
            "complete": record.is_complete(),
            "problems": missing,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("id:        {id}");
    println!("name:      {}", record.name);
    println!("prompt:    {}", record.prompt_template);
    println!("size:      {}", record.size);
    println!(
        "progress:  {}/{} frames",
        record.last_success_frame, record.frame_count
    );
    println!(
        "reference: {}",
        match &record.reference_image {
            Some(img) => format!("{} ({} bytes)", img.mime_type(), img.len()),
            None => "none".to_string(),
        }
    );
    println!(
        "api key:   {}",
        if record.credentials.is_blank() { "missing" } else { "set" }
    );
    if let Some(problems) = missing {
        println!("problems:  {problems}");
    }
    Ok(())
}

struct Edits {
    name: Option<String>,
    prompt: Option<String>,
    frames: Option<u32>,
    size: Option<ImageSize>,
    api_key: Option<String>,
    reference: Option<PathBuf>,
    clear_reference: bool,
}

fn set_command(ctx: &AppContext, id: &ProjectId, edits: Edits) -> Result<()> {
    let mut controller = ctx.controller();
    controller.load_project(id)?;
    if let Some(name) = edits.name {
        controller.set_name(name)?;
    }
    if let Some(prompt) = edits.prompt {
        controller.set_prompt(prompt)?;
    }
    if let Some(frames) = edits.frames {
        let before = controller.session().snapshot().last_success_frame;
        controller.set_frame_count(frames)?;
        if frames < before {
            warn!("Dropped frames {}..={} beyond the new frame count", frames + 1, before);
        }
    }
    if let Some(size) = edits.size {
        controller.set_size(size)?;
    }
    if let Some(key) = edits.api_key {
        controller.set_credentials(key)?;
    }
    if let Some(path) = edits.reference {
        controller.set_reference_image(read_reference(&path)?)?;
    }
    if edits.clear_reference {
        controller.clear_reference_image()?;
    }
    controller.flush()?;
    info!("Project {} updated", id);
    Ok(())
}

fn log_event(event: &FrameEvent) {
    match event {
        FrameEvent::RunStarted {
            start_frame,
            frame_count,
            ..
        } => info!("Generating frames {}..={}", start_frame, frame_count),
        FrameEvent::FrameStarted { frame } => info!("Frame {}: requesting", frame),
        FrameEvent::FrameCompleted { frame, image, .. } => {
            info!("Frame {}: saved ({} bytes)", frame, image.len())
        }
        FrameEvent::FrameFailed(failure) => warn!("{}", failure),
        FrameEvent::RunFinished(_) => {}
    }
}

async fn generate_command(ctx: &AppContext, id: &ProjectId, from: Option<u32>) -> Result<()> {
    let mut controller = ctx.controller();
    controller.load_project(id)?;
    let session = controller.session().clone();
    let mut engine = ctx.engine()?;

    let events = engine.events();
    let printer = std::thread::spawn(move || {
        for event in events.iter() {
            log_event(&event);
        }
    });

    let cancel = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current frame");
            cancel.cancel();
        }
    });

    let result = match from {
        Some(start) => engine.generate(&session, start).await,
        None => engine.resume(&session).await,
    };
    // closes the event channel so the printer drains and exits
    drop(engine);
    let _ = printer.join();

    match result {
        Ok(RunOutcome::Completed { frames }) => {
            info!("All {} frames generated", frames);
            Ok(())
        }
        Ok(RunOutcome::Failed(failure)) => {
            let (saved, total) = saved_progress(ctx, id)?;
            bail!(
                "{}; {} of {} frames saved, run `nextframe resume {}` to continue",
                failure,
                saved,
                total,
                id
            )
        }
        Ok(RunOutcome::Cancelled { next_frame }) => {
            warn!(
                "Stopped before frame {}; run `nextframe resume {}` to continue",
                next_frame, id
            );
            Ok(())
        }
        Ok(RunOutcome::AlreadyRunning) => bail!("a generation run is already in progress"),
        Err(GenerationError::Validation(errors)) => {
            for e in &errors.0 {
                warn!("{}: {}", e.field, e.message);
            }
            bail!("project {} is not ready to generate", id)
        }
        Err(e) => Err(e.into()),
    }
}

/// Progress as stored, which is where `resume` picks up. A fresh run that
/// fails before its first frame leaves the earlier frames stored.
fn saved_progress(ctx: &AppContext, id: &ProjectId) -> Result<(u32, u32)> {
    let record = ctx
        .store
        .get(id)?
        .with_context(|| format!("project {} not found", id))?;
    Ok((record.last_success_frame, record.frame_count))
}

fn delete_command(ctx: &AppContext, id: &ProjectId) -> Result<()> {
    let mut controller = ctx.controller();
    if controller.delete_project(id)? {
        info!("Deleted project {}", id);
        Ok(())
    } else {
        bail!("project {} not found", id)
    }
}

fn export_command(ctx: &AppContext, id: &ProjectId, output: &Path) -> Result<()> {
    let record = ctx
        .store
        .get(id)?
        .with_context(|| format!("project {} not found", id))?;
    if record.frames.is_empty() {
        bail!("project {} has no generated frames", id);
    }
    std::fs::create_dir_all(output)?;
    for (idx, frame) in record.frames.iter().enumerate() {
        let ext = match frame.mime_type() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        };
        let path = output.join(format!("frame_{:04}.{}", idx + 1, ext));
        std::fs::write(&path, frame.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
    }
    info!(
        "Exported {} frames to {:?}",
        record.frames.len(),
        output
    );
    Ok(())
}

fn init_config_command(config: AppConfig, path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(AppConfig::default_path);
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    config.save(&path)?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use project::ProjectRecord;

    #[test]
    fn test_saved_progress_reads_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::open(AppConfig::default(), Some(dir.path().join("p.db"))).unwrap();
        let mut record = ProjectRecord {
            name: "kept".to_string(),
            frame_count: 3,
            frames: vec![ImageBlob::from_bytes(vec![1]), ImageBlob::from_bytes(vec![2])],
            last_success_frame: 2,
            ..Default::default()
        };
        let id = record.ensure_id().clone();
        ctx.store.put(&id, &record).unwrap();

        // a fresh run resets only the in-memory copy
        let mut controller = ctx.controller();
        controller.load_project(&id).unwrap();
        controller.session().lock().record.reset_progress();

        assert_eq!(saved_progress(&ctx, &id).unwrap(), (2, 3));
        assert!(saved_progress(&ctx, &ProjectId::new()).is_err());
    }
}
