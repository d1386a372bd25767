use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use retouch_contracts::events::EventWriter;
use retouch_contracts::knowledge::{
    rank_entries, JsonKnowledgeBase, KbCategory, KnowledgeBase, NewEntry,
};
use retouch_contracts::media::{ArtifactRef, ImageData};
use retouch_contracts::session::SessionSummary;
use retouch_engine::{
    fetch_artifact, ProcessingMode, ProviderRouter, ServiceConfig, Studio, StudioConfig,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "retouch-rs", version, about = "Retouch studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate (and optionally modify) a master image from reference photos.
    Master(MasterArgs),
    /// Generate a master image, then one derived picture per prompt.
    Batch(BatchArgs),
    /// Manage the prompt knowledge base.
    Kb(KbArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Reference image; repeat for several.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long)]
    consistent: Option<String>,
    /// Analyze the references and seed the prompts before generating.
    #[arg(long)]
    analyze: bool,
    /// Clean references only when a watermark is detected, during analysis.
    #[arg(long)]
    deferred: bool,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    vision_model: Option<String>,
    #[arg(long, default_value_t = 600)]
    timeout_s: u64,
}

#[derive(Debug, Args)]
struct MasterArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    prompt: Option<String>,
    /// Instruction applied to the master after it is generated.
    #[arg(long)]
    modify: Option<String>,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Per-picture prompt; repeat once per picture.
    #[arg(long = "prompt")]
    prompts: Vec<String>,
}

#[derive(Debug, Args)]
struct KbArgs {
    #[arg(long, env = "RETOUCH_KB_ROOT")]
    root: PathBuf,
    #[arg(long, default_value = "default")]
    user: String,
    #[command(subcommand)]
    action: KbAction,
}

#[derive(Debug, Subcommand)]
enum KbAction {
    List {
        #[arg(long)]
        deleted: bool,
    },
    Search {
        query: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 0.3)]
        min_score: f32,
    },
    Save {
        #[arg(long)]
        category: String,
        text: String,
        /// Variable half of a full prompt; `text` is the consistent half.
        #[arg(long)]
        variable: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    Delete {
        ids: Vec<String>,
        #[arg(long)]
        permanent: bool,
    },
    Restore {
        ids: Vec<String>,
    },
    Purge,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("retouch-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Master(args) => run_master(args),
        Command::Batch(args) => run_batch(args),
        Command::Kb(args) => run_kb(args),
    }
}

fn run_master(args: MasterArgs) -> Result<i32> {
    let timeout = Duration::from_secs(args.session.timeout_s);
    let mut studio = open_studio(&args.session)?;
    let user_prompts: Vec<String> = args.prompt.into_iter().collect();
    seed_prompts(&mut studio, &args.session, &user_prompts, timeout)?;

    studio.generate_master()?;
    settle(&mut studio, timeout)?;
    if let Some(instruction) = args.modify.as_deref() {
        if studio.master_state().artifact.is_some() {
            studio.set_modification_instruction(instruction);
            studio.modify_master()?;
            settle(&mut studio, timeout)?;
        }
    }

    let master = studio.master_state().artifact;
    if let Some(artifact) = master.as_ref() {
        let path = export_artifact(artifact, &args.session.out.join("master"))?;
        println!("master: {}", path.display());
    }
    let summary = finish(&studio, &args.session.out)?;
    Ok(if summary.master_artifact.is_some() { 0 } else { 1 })
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let timeout = Duration::from_secs(args.session.timeout_s);
    let mut studio = open_studio(&args.session)?;
    seed_prompts(&mut studio, &args.session, &args.prompts, timeout)?;

    studio.generate_master()?;
    settle(&mut studio, timeout)?;
    let Some(master) = studio.master_state().artifact else {
        finish(&studio, &args.session.out)?;
        return Ok(1);
    };
    let path = export_artifact(&master, &args.session.out.join("master"))?;
    println!("master: {}", path.display());

    let count = studio.generate_all()?;
    println!("generating {count} picture(s)");
    settle(&mut studio, timeout)?;

    for (idx, unit) in studio.prompts().units().enumerate() {
        let Some(slot) = studio.slot(&unit.id) else {
            continue;
        };
        match (&slot.artifact, &slot.error) {
            (Some(artifact), _) => {
                let stem = args.session.out.join(format!("picture-{:02}", idx + 1));
                let path = export_artifact(artifact, &stem)?;
                println!("picture {}: {}", idx + 1, path.display());
            }
            (None, Some(error)) => println!("picture {}: failed ({error})", idx + 1),
            (None, None) => {}
        }
    }
    let summary = finish(&studio, &args.session.out)?;
    Ok(if summary.failed_count() > 0 { 1 } else { 0 })
}

fn open_studio(args: &SessionArgs) -> Result<Studio> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));

    let mut config = ServiceConfig::from_env();
    if args.image_model.is_some() {
        config.image_model = args.image_model.clone();
    }
    if args.vision_model.is_some() {
        config.vision_model = args.vision_model.clone();
    }
    let studio_config = StudioConfig {
        processing_mode: if args.deferred {
            ProcessingMode::Deferred
        } else {
            ProcessingMode::Immediate
        },
        ..StudioConfig::default()
    };
    let input_images = args.images.len().min(studio_config.reference_capacity);
    let router = ProviderRouter::from_config(&config, input_images)?;
    for note in router.notes() {
        eprintln!("note: {note}");
    }
    println!(
        "models: image={} vision={}",
        router.image_model(),
        router.vision_model()
    );

    let events = EventWriter::new(events_path, format!("session-{}", compact_timestamp()));
    let mut studio = Studio::new(Arc::new(router), studio_config, events);

    let uploads = args
        .images
        .iter()
        .map(|path| ImageData::from_path(path))
        .collect::<Result<Vec<_>>>()?;
    let offered = uploads.len();
    let accepted = studio.add_reference_images(uploads);
    if accepted.len() < offered {
        eprintln!(
            "note: only {} of {offered} reference images fit; the rest were dropped",
            accepted.len()
        );
    }
    Ok(studio)
}

/// Cleans and optionally analyzes the references, then lays the user's own
/// text over whatever analysis produced.
fn seed_prompts(
    studio: &mut Studio,
    args: &SessionArgs,
    prompts: &[String],
    timeout: Duration,
) -> Result<()> {
    settle(studio, timeout)?;
    if args.analyze || args.deferred {
        studio.start_analysis(prompts.is_empty())?;
        settle(studio, timeout)?;
    }
    if let Some(consistent) = args.consistent.as_deref() {
        studio.set_consistent_text(consistent);
    }
    let existing = studio.prompts().unit_ids();
    for (idx, prompt) in prompts.iter().enumerate() {
        match existing.get(idx) {
            Some(id) => studio.set_unit_prompt(id, prompt.as_str())?,
            None => {
                studio.add_unit(prompt.as_str());
            }
        }
    }
    Ok(())
}

fn settle(studio: &mut Studio, timeout: Duration) -> Result<()> {
    if !studio.wait_idle(timeout) {
        bail!(
            "timed out waiting for {} generation call(s)",
            studio.in_flight()
        );
    }
    for notice in studio.take_notices() {
        eprintln!("{}", notice.message);
    }
    Ok(())
}

fn finish(studio: &Studio, out: &Path) -> Result<SessionSummary> {
    let path = out.join("summary.json");
    let summary = studio.finish(&path)?;
    println!(
        "summary: {} ({} generated, {} failed)",
        path.display(),
        summary.generated_count(),
        summary.failed_count()
    );
    Ok(summary)
}

fn export_artifact(artifact: &ArtifactRef, stem: &Path) -> Result<PathBuf> {
    let image = fetch_artifact(artifact, 120.0)?;
    let path = stem.with_extension(image.extension());
    fs::write(&path, &image.bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}

fn run_kb(args: KbArgs) -> Result<i32> {
    let kb = JsonKnowledgeBase::new(&args.root, &args.user);
    match args.action {
        KbAction::List { deleted } => {
            print_json(&json!(kb.list(deleted)?))?;
        }
        KbAction::Search {
            query,
            category,
            min_score,
        } => {
            let category = category.as_deref().map(parse_category).transpose()?;
            let ranked = rank_entries(&kb.list(false)?, &query, category, min_score);
            let rows: Vec<Value> = ranked
                .into_iter()
                .map(|row| json!({ "score": row.score, "entry": row.entry }))
                .collect();
            print_json(&Value::Array(rows))?;
        }
        KbAction::Save {
            category,
            text,
            variable,
            image,
        } => {
            let category = parse_category(&category)?;
            let entry = if category.is_full_prompt() {
                NewEntry::full_prompt(text, variable.unwrap_or_default())
            } else {
                NewEntry::fragment(category, text)
            };
            let image = image.as_deref().map(ImageData::from_path).transpose()?;
            let saved = kb.save(entry, image.as_ref())?;
            print_json(&json!(saved))?;
        }
        KbAction::Delete { ids, permanent } => {
            let count = if permanent {
                kb.permanently_delete(&ids)?
            } else {
                kb.soft_delete(&ids)?
            };
            println!("{count} entr{} deleted", if count == 1 { "y" } else { "ies" });
        }
        KbAction::Restore { ids } => {
            let count = kb.restore(&ids)?;
            println!("{count} entr{} restored", if count == 1 { "y" } else { "ies" });
        }
        KbAction::Purge => {
            let count = kb.purge_expired_trash()?;
            println!("{count} expired entr{} purged", if count == 1 { "y" } else { "ies" });
        }
    }
    Ok(0)
}

fn parse_category(raw: &str) -> Result<KbCategory> {
    KbCategory::parse(raw).with_context(|| {
        let known: Vec<&str> = KbCategory::ALL.iter().map(|item| item.as_str()).collect();
        format!("unknown category '{raw}' (expected one of {})", known.join(", "))
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn compact_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
