use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, info};
use orgnote::core::{BlockNode, Document, LogbookEntry, ParseOptions, RenderOutcome};
use orgnote::format::{entry_summary, format_minutes, plain_text, total_clocked_minutes};
use orgnote::{parse_logbook, render_document_with_options};

#[derive(Debug, Parser)]
#[command(
    name = "orgnote",
    about = "Render org notes and their logbooks",
    version
)]
struct Cli {
    /// Log debug output to stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse notes into documents.
    Parse(ParseArgs),

    /// List logbook entries, most recent first.
    Logbook(LogbookArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of an outline.
    #[arg(long)]
    json: bool,
    /// Reject notes larger than this many bytes.
    #[arg(long, conflicts_with = "no_limit")]
    max_bytes: Option<usize>,
    /// Disable the input size limit.
    #[arg(long)]
    no_limit: bool,
}

#[derive(Debug, Args)]
struct LogbookArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of summary lines.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Logbook(args) => handle_logbook(args),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    Logger::try_with_env_or_str(level)
        .with_context(|| format!("invalid log level {level:?}"))?
        .log_to_stderr()
        .start()
        .context("starting logger")
}

impl ParseArgs {
    fn options(&self) -> ParseOptions {
        if self.no_limit {
            ParseOptions::unlimited()
        } else {
            match self.max_bytes {
                Some(limit) => ParseOptions {
                    max_input_bytes: Some(limit),
                },
                None => ParseOptions::default(),
            }
        }
    }
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let options = args.options();
    let expanded = expand_inputs(&args.inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut rendered = Vec::new();
    for path in expanded {
        debug!("event=parse_start path={}", path.display());
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        rendered.push((path, render_document_with_options(&raw, &options)));
    }

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            note: &'a RenderOutcome,
        }

        let payload: Vec<JsonOutput<'_>> = rendered
            .iter()
            .map(|(path, outcome)| JsonOutput {
                path: path.display().to_string(),
                note: outcome,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, outcome)) in rendered.iter().enumerate() {
            if rendered.len() > 1 {
                println!("== {} ==", path.display());
            }
            match outcome {
                RenderOutcome::Parsed(doc) => {
                    for line in outline_lines(doc) {
                        println!("{line}");
                    }
                }
                RenderOutcome::Failed { message } => println!("failed: {message}"),
            }
            if rendered.len() > 1 && idx + 1 < rendered.len() {
                println!();
            }
        }
    }

    let failed = rendered.iter().filter(|(_, o)| o.is_failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} notes failed to parse", rendered.len());
    }
    Ok(())
}

fn outline_lines(doc: &Document) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(title) = &doc.metadata.title {
        out.push(format!("title: {title}"));
    }
    if !doc.metadata.tags.is_empty() {
        out.push(format!("tags: {}", doc.metadata.tags.join(", ")));
    }
    for block in &doc.blocks {
        let line = match block {
            BlockNode::Heading { level, children } => {
                format!("{} {}", "*".repeat(*level as usize), plain_text(children))
            }
            BlockNode::Paragraph { children } => plain_text(children),
            BlockNode::List { items } => items
                .iter()
                .map(|item| format!("- {}", plain_text(item)))
                .collect::<Vec<_>>()
                .join("\n"),
            BlockNode::CodeBlock { language, code } => format!(
                "[code {}: {} lines]",
                language.as_deref().unwrap_or("text"),
                code.lines().count()
            ),
            BlockNode::HorizontalRule => "-----".to_string(),
        };
        out.push(line);
    }
    out
}

fn handle_logbook(args: LogbookArgs) -> Result<()> {
    let expanded = expand_inputs(&args.inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut books: Vec<(PathBuf, Vec<LogbookEntry>)> = Vec::new();
    for path in expanded {
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let entries = parse_logbook(&raw);
        debug!(
            "event=logbook_parsed path={} entries={}",
            path.display(),
            entries.len()
        );
        books.push((path, entries));
    }

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            entries: &'a [LogbookEntry],
        }

        let payload: Vec<JsonOutput<'_>> = books
            .iter()
            .map(|(path, entries)| JsonOutput {
                path: path.display().to_string(),
                entries,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (path, entries) in &books {
        if books.len() > 1 {
            println!("== {} ==", path.display());
        }
        for entry in entries {
            println!("{}", entry_summary(entry));
        }
        println!("total: {}", format_minutes(total_clocked_minutes(entries)));
    }
    Ok(())
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            info!("event=scan_dir path={}", canonical.display());
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "org").unwrap_or(false)
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_notes(dir, &mut out)?;
    out.sort();
    Ok(out)
}

/// `dir` is canonical and symlinks are never followed, so every path found below it is too.
fn walk_notes(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("listing {:?}", dir))?;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk_notes(&path, out)?;
        } else if file_type.is_file() && is_org_file(&path) {
            debug!("event=found_note path={}", path.display());
            out.push(path);
        }
    }
    Ok(())
}
