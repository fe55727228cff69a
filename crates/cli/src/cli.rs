use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use glob::{glob, Pattern};
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::info;
use walkdir::WalkDir;

use triage_core::{
    answer_from_result, run_batch, BatchInput, Category, Collaborators, Gate, Orchestrator,
    PipelineResult, RatingOutcome, RuntimeSettings, Ticket, TriageConfig,
};
use triage_rag::{ingest_path, DEFAULT_CHUNK_CHARS};

#[derive(Parser, Debug)]
#[command(name = "triage", version, about = "Support ticket triage pipeline")]
pub struct Cli {
    /// Pipeline settings (TOML). Defaults to $TRIAGE_CONFIG or triage.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Knowledge-base database. Defaults to $TRIAGE_DB or knowledge.sqlite.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one ticket through the pipeline and print the result as JSON
    Ask { ticket: String },
    /// Answer every question of a batch file
    Batch {
        input: PathBuf,
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Index documents (files, directories or glob patterns)
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        category: String,
        /// Only index files whose name matches this glob
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long = "chunk-chars", default_value_t = DEFAULT_CHUNK_CHARS)]
        chunk_chars: usize,
    },
    /// Run only the admission checks
    Precheck { text: String },
    /// Interactive session, one ticket per line
    Chat,
}

/// A runtime plus connected collaborators, for commands that need them.
struct Session {
    runtime: Runtime,
    config: TriageConfig,
    collaborators: Collaborators,
}

impl Session {
    fn connect(settings: &RuntimeSettings) -> Result<Self> {
        let config = TriageConfig::load(&settings.config_path)?;
        let runtime = Runtime::new().context("failed to start async runtime")?;
        let collaborators = Collaborators::from_settings(settings)?;
        Ok(Self {
            runtime,
            config,
            collaborators,
        })
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            self.collaborators.model.clone(),
            self.collaborators.search(),
        )
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let mut settings = RuntimeSettings::from_env()?;
    if let Some(path) = cli.config {
        settings.config_path = path;
    }
    if let Some(path) = cli.db {
        settings.db_path = path;
    }

    match cli.command {
        Commands::Precheck { text } => print_json(&Gate::default().run_precheck(&text)),
        Commands::Ask { ticket } => {
            let session = Session::connect(&settings)?;
            let orchestrator = session.orchestrator();
            let result = session.runtime.block_on(orchestrator.process_ticket(&ticket));
            print_json(&result)
        }
        Commands::Batch { input, team, out } => {
            let raw = fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let batch: BatchInput = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid batch file", input.display()))?;
            let session = Session::connect(&settings)?;
            let team = team.unwrap_or_else(|| session.config.team_name.clone());
            let orchestrator = session.orchestrator();
            let output = session
                .runtime
                .block_on(run_batch(&orchestrator, &batch, &team));
            let json = serde_json::to_string_pretty(&output)?;
            match out {
                Some(path) => {
                    fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!(
                        "wrote {} answers to {}",
                        output.answers.len(),
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Ingest {
            paths,
            category,
            pattern,
            chunk_chars,
        } => {
            let category = Category::parse(&category)
                .ok_or_else(|| anyhow!("unknown category {category}"))?;
            let filter = pattern
                .as_deref()
                .map(Pattern::new)
                .transpose()
                .context("invalid --pattern")?;
            let files = gather_input_files(&paths, filter.as_ref())?;
            if files.is_empty() {
                bail!("no input files matched");
            }
            let session = Session::connect(&settings)?;
            let knowledge = &session.collaborators.knowledge;
            let mut total = 0usize;
            for file in &files {
                let chunks = session.runtime.block_on(ingest_path(
                    knowledge,
                    file,
                    category.label(),
                    chunk_chars,
                ))?;
                info!(file = %file.display(), chunks, "indexed");
                total += chunks;
            }
            eprintln!(
                "indexed {} chunks from {} files under \"{}\" ({} chunks in store)",
                total,
                files.len(),
                category.label(),
                knowledge.store().count()?
            );
            Ok(())
        }
        Commands::Chat => {
            let session = Session::connect(&settings)?;
            chat(&session.runtime, &session.orchestrator())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn chat(runtime: &Runtime, orchestrator: &Orchestrator) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    println!("Type a ticket, or \"exit\" to quit.");
    loop {
        prompt("> ")?;
        let Some(line) = lines.next() else { break };
        let text = line?;
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if is_exit(text) {
            break;
        }

        let ticket = Ticket::new(text);
        let result = runtime.block_on(orchestrator.process(&ticket));
        println!("{}", answer_from_result(&result));

        let PipelineResult::Success(success) = &result else {
            continue;
        };
        prompt("Rate this answer (1-5, Enter to skip): ")?;
        let Some(line) = lines.next() else { break };
        let Some(stars) = parse_stars(&line?) else {
            continue;
        };
        match orchestrator.handle_rating(
            ticket.trace_id(),
            stars,
            &success.analysis,
            &success.precheck,
        ) {
            RatingOutcome::Completed { message } => println!("{message}"),
            RatingOutcome::Escalated(escalated) => {
                println!("{}", answer_from_result(&PipelineResult::Escalated(escalated)))
            }
        }
    }
    Ok(())
}

fn prompt(text: &str) -> Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "{text}")?;
    stdout.flush()?;
    Ok(())
}

fn is_exit(line: &str) -> bool {
    matches!(line.to_lowercase().as_str(), "exit" | "quit")
}

fn parse_stars(raw: &str) -> Option<u8> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|stars| (1..=5).contains(stars))
}

/// Expands globs and walks directories. `filter` applies to file names of
/// walked directories and expanded globs, not to files named explicitly.
fn gather_input_files(inputs: &[PathBuf], filter: Option<&Pattern>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let input_str = input.to_string_lossy();
        if input_str.contains('*') || input_str.contains('?') || input_str.contains('[') {
            for entry in glob(&input_str)? {
                let path = entry?;
                if path.is_file() && name_matches(&path, filter) {
                    files.push(path);
                }
            }
            continue;
        }
        let meta = fs::metadata(input)
            .with_context(|| format!("failed to inspect {}", input.display()))?;
        if meta.is_dir() {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if name_matches(entry.path(), filter) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else if meta.is_file() {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn name_matches(path: &Path, filter: Option<&Pattern>) -> bool {
    let Some(pattern) = filter else {
        return true;
    };
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| pattern.matches(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "triage",
            "batch",
            "questions.json",
            "--team",
            "TEAM 9",
            "--db",
            "kb.sqlite",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("kb.sqlite")));
        match cli.command {
            Commands::Batch { input, team, out } => {
                assert_eq!(input, PathBuf::from("questions.json"));
                assert_eq!(team.as_deref(), Some("TEAM 9"));
                assert!(out.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ingest_requires_category() {
        assert!(Cli::try_parse_from(["triage", "ingest", "docs"]).is_err());
        let cli =
            Cli::try_parse_from(["triage", "ingest", "a.txt", "b.pdf", "--category", "Other"])
                .unwrap();
        match cli.command {
            Commands::Ingest {
                paths, chunk_chars, ..
            } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(chunk_chars, DEFAULT_CHUNK_CHARS);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn gathers_directory_files_matching_pattern() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("guides");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("cgv.pdf"), b"%PDF").unwrap();
        fs::write(nested.join("login.txt"), "Reset your password.").unwrap();
        fs::write(nested.join("notes.md"), "# Notes").unwrap();

        let all = gather_input_files(&[dir.path().to_path_buf()], None).unwrap();
        assert_eq!(all.len(), 3);

        let pattern = Pattern::new("*.txt").unwrap();
        let txt = gather_input_files(&[dir.path().to_path_buf()], Some(&pattern)).unwrap();
        assert_eq!(txt, vec![nested.join("login.txt")]);
    }

    #[test]
    fn explicit_files_bypass_pattern() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("faq.md");
        fs::write(&file, "FAQ").unwrap();
        let pattern = Pattern::new("*.pdf").unwrap();
        let files = gather_input_files(&[file.clone()], Some(&pattern)).unwrap();
        assert_eq!(files, vec![file]);
        assert!(gather_input_files(&[dir.path().join("missing.txt")], None).is_err());
    }

    #[test]
    fn chat_helpers() {
        assert!(is_exit("Quit"));
        assert!(is_exit("exit"));
        assert!(!is_exit("exit please"));
        assert_eq!(parse_stars(" 4\n"), Some(4));
        assert_eq!(parse_stars("0"), None);
        assert_eq!(parse_stars("6"), None);
        assert_eq!(parse_stars(""), None);
    }
}
