mod backend;
mod collab;
mod config;
mod document;
mod error;
mod events;
mod fs_store;
mod logging;
mod project;
mod refine;
mod request;
mod session;
mod templates;
mod terminal;
mod validators;

use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use crate::backend::ClaudeCliBackend;
use crate::collab::{Editor, PickItem};
use crate::config::{Config, ConfigLoadStatus, LoadedConfig};
use crate::fs_store::FsDocumentStore;
use crate::project::{FragmentStore, Identifier};
use crate::request::RequestController;
use crate::session::{Outcome, Session, SessionSettings};
use crate::templates::{TemplateCatalog, present};
use crate::terminal::{StreamPrinter, TerminalEditor, render_fragment_tree};

#[derive(Debug, Parser)]
#[command(name = "specprompt", version, about = "Run prompt templates against specification fragments")]
struct Cli {
    /// Project root containing the specification documents. Relative targets are read from the
    /// working directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a template against a fragment, then offer to refine or repeat it.
    Run {
        /// `file.spec.md#id`, `file.spec.md:LINE`, a spec file, or a file a spec references.
        target: Option<String>,
        /// Template id; skips the picker.
        #[arg(short, long)]
        template: Option<String>,
        /// Label passed to the template, defaults to the template title.
        #[arg(short, long)]
        label: Option<String>,
        /// Exit after the first generation.
        #[arg(long)]
        once: bool,
    },
    /// List templates, or the ones applicable to a target.
    Templates { target: Option<String> },
    /// Print the fragment outline of one or all specification documents.
    Fragments { path: Option<String> },
}

/// Anchor the path part of a relative command-line target at `cwd`, so it means the same file
/// whatever `--root` is.
fn anchor_identifier(identifier: Identifier, cwd: &Path) -> Identifier {
    let anchor = |path: &str| {
        if Path::new(path).is_absolute() {
            path.to_string()
        } else {
            cwd.join(path).to_string_lossy().into_owned()
        }
    };
    match identifier {
        Identifier::Path(path) => Identifier::Path(anchor(&path)),
        Identifier::Position { path, line } => Identifier::Position {
            path: anchor(&path),
            line,
        },
        Identifier::Id(id) => match id.split_once('#') {
            Some((path, rest)) => Identifier::Id(format!("{}#{}", anchor(path), rest)),
            None => Identifier::Id(id),
        },
        other => other,
    }
}

/// Contract a path by replacing the home directory with `~` for display.
fn contract_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir()
        && let Ok(suffix) = path.strip_prefix(&home)
    {
        return format!("~/{}", suffix.display());
    }
    path.display().to_string()
}

fn report_config(loaded: &LoadedConfig) {
    debug!(
        config_path = %loaded.config_path.display(),
        project_config = ?loaded.project_config_path,
        status = ?loaded.status,
        "config_loaded"
    );
    match &loaded.status {
        ConfigLoadStatus::Loaded => {}
        ConfigLoadStatus::Created => eprintln!(
            "Created default config at {}",
            contract_path(&loaded.config_path)
        ),
        ConfigLoadStatus::Error(message) => eprintln!("Warning: {}", message),
    }
    for warning in validators::config_warnings(&loaded.config) {
        warn!(warning = %warning, "config_warning");
        eprintln!("Warning: {}", warning);
    }
}

async fn build_session(root: &Path, config: &Config, editor: Arc<TerminalEditor>) -> Result<Session> {
    let templates_dir = config.templates_dir();
    let catalog = TemplateCatalog::load(templates_dir.as_deref())
        .context("failed to load prompt templates")?;
    let backend = Arc::new(ClaudeCliBackend::from_config(config));
    let controller = RequestController::new(backend, config.cancel_timeout());
    let settings = SessionSettings {
        templates_dir,
        discussion_url: config.community.discussion_url.clone(),
    };

    let mut session = Session::new(
        editor,
        Arc::new(FsDocumentStore::new(root)),
        FragmentStore::new(root, config.paths.spec_suffix.clone()),
        catalog,
        controller,
        settings,
    );
    session
        .reload()
        .await
        .context("failed to read specification documents")?;
    let project = session.fragments().project();
    info!(
        documents = project.documents().count(),
        fragments = project.fragment_count(),
        templates = session.catalog().templates().len(),
        "session_ready"
    );
    Ok(session)
}

/// Print generation output until it ends or Ctrl-C cancels it.
async fn stream(session: &mut Session, printer: &mut StreamPrinter<Stdout>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                session.controller().cancel().await;
                printer.interrupt()?;
                eprintln!("Cancelled.");
                return Ok(());
            }
            event = session.controller().next_event() => match event {
                Some(event) => printer.event(&event)?,
                None => break,
            },
        }
    }

    match session.controller().finish().await {
        Some(Ok(summary)) => printer.finish(&summary)?,
        Some(Err(e)) => {
            printer.interrupt()?;
            eprintln!("error: {}", e);
        }
        None => {}
    }

    let state = session.controller().state();
    debug!(
        state = state.label(),
        sequence = ?state.request().map(|request| request.sequence),
        "stream_settled"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Refine,
    Repeat,
    OtherTemplate,
}

const NEXT_STEPS: [(NextStep, &str, &str); 3] = [
    (NextStep::Refine, "Refine", "Add a note to the section and run again"),
    (NextStep::Repeat, "Run again", "Same section, template and label"),
    (NextStep::OtherTemplate, "Another template", "Pick a different template for the section"),
];

async fn choose_next(editor: &dyn Editor) -> Option<NextStep> {
    let items: Vec<PickItem> = NEXT_STEPS
        .iter()
        .map(|(_, label, detail)| PickItem::Choice {
            key: label.to_string(),
            label: label.to_string(),
            detail: Some(detail.to_string()),
        })
        .collect();
    let index = editor.choose_pick("Next", &items).await?;
    NEXT_STEPS.get(index).map(|(step, _, _)| *step)
}

async fn run(
    mut session: Session,
    editor: Arc<TerminalEditor>,
    target: Option<Identifier>,
    template: Option<&str>,
    label: Option<&str>,
    once: bool,
) -> Result<()> {
    let mut printer = StreamPrinter::new(io::stdout());
    let mut outcome = session
        .run_template(target, template, label)
        .await;

    while let Some(request) = outcome.request().cloned() {
        println!("── {} ── {}", request.label, request.fragment.full_id);
        stream(&mut session, &mut printer).await?;
        if once {
            break;
        }
        outcome = match choose_next(editor.as_ref()).await {
            Some(NextStep::Refine) => session.refine(None).await,
            Some(NextStep::Repeat) => session.repeat_previous().await,
            Some(NextStep::OtherTemplate) => session.run_template(None, None, None).await,
            None => Outcome::DidNotProceed,
        };
    }
    Ok(())
}

fn list_templates(session: &Session, target: Option<Identifier>) -> Result<()> {
    let templates = match target {
        Some(target) => {
            let fragment = session
                .fragments()
                .resolve(&target)?
                .into_fragment()?;
            println!("Templates for {}", fragment.full_id);
            session.catalog().applicable_templates(&fragment)
        }
        None => session.catalog().templates().iter().collect(),
    };
    let mut current_group = None;
    for item in present(&templates) {
        if let PickItem::Template { template, group } = item {
            if current_group.as_ref() != Some(&group) {
                println!("{}", group);
                current_group = Some(group);
            }
            println!("  {:<16} {}", template.id, template.title);
        }
    }
    Ok(())
}

fn print_fragments(session: &Session, path: Option<&Path>) -> Result<()> {
    let project = session.fragments().project();
    match path {
        Some(path) => {
            let key = session.fragments().key(&path.to_string_lossy());
            let document = project
                .document(&key)
                .with_context(|| format!("{} is not a parsed specification document", key))?;
            print!("{}", render_fragment_tree(document));
        }
        None => {
            for document in project.documents() {
                print!("{}", render_fragment_tree(document));
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("project root {} not found", cli.root.display()))?;
    let cwd = std::env::current_dir()
        .and_then(|dir| dir.canonicalize())
        .context("failed to read the working directory")?;
    let anchored = |raw: &Option<String>| {
        raw.as_deref()
            .map(|raw| anchor_identifier(Identifier::parse(raw), &cwd))
    };

    // Logging level comes from config, so config is read first.
    let loaded = config::load_config(&root);
    let logging = match logging::init(&loaded.config.logging.level) {
        Ok(ctx) => {
            let removed = logging::cleanup_old_logs(&ctx.log_directory);
            debug!(removed, "old_logs_removed");
            Some(ctx)
        }
        Err(e) => {
            eprintln!("Warning: Failed to initialize logging: {}", e);
            None
        }
    };
    report_config(&loaded);

    let editor = Arc::new(TerminalEditor::new());
    let session = build_session(&root, &loaded.config, editor.clone()).await?;

    let result = match &cli.command {
        Command::Run {
            target,
            template,
            label,
            once,
        } => {
            run(
                session,
                editor,
                anchored(target),
                template.as_deref(),
                label.as_deref(),
                *once,
            )
            .await
        }
        Command::Templates { target } => list_templates(&session, anchored(target)),
        Command::Fragments { path } => {
            let path = path.as_deref().map(|path| cwd.join(path));
            print_fragments(&session, path.as_deref())
        }
    };

    if let Some(ctx) = &logging {
        info!(
            session_id = %ctx.session_id,
            duration_secs = start_time.elapsed().as_secs_f64(),
            "session_end"
        );
    }

    result
}
