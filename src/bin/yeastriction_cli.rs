use anyhow::{Context, Result, anyhow, bail};
use log::{LevelFilter, info};
use rayon::prelude::*;
use serde::Serialize;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::{env, fs, path::Path, sync::Arc};
use yeastriction::{
    about,
    config::DesignConfig,
    model::{Candidate, Locus, LocusId, RecognitionSystem, SystemId},
    pipeline::{
        DesignContext, SearchPhase, assemble_primer_table, diagnostic_primers,
        oligos_for_candidate, primer_table_tsv, search_candidates, spawn_candidate_search,
    },
    store::{CandidateStore, JsonFileStore, ProjectState},
};

const DEFAULT_STATE_PATH: &str = ".yeastriction_state.json";

#[derive(Serialize)]
struct SystemSummary {
    id: SystemId,
    name: String,
    description: Option<String>,
    target_filter: String,
    build_methods: Vec<String>,
}

#[derive(Serialize)]
struct LocusSummary {
    id: LocusId,
    name: String,
    orf: String,
    strain: String,
    length: usize,
    coding_length: usize,
}

#[derive(Serialize)]
struct CandidateRow {
    rank: usize,
    strand: String,
    position: usize,
    sequence: String,
    gc_content: f64,
    at_content: f64,
    accessibility: f64,
    structure: String,
    score: f64,
}

#[derive(Serialize)]
struct StrainSearchOutcome {
    locus_id: LocusId,
    name: String,
    candidates: Option<usize>,
    error: Option<String>,
}

struct GlobalArgs {
    state_path: String,
    config_path: Option<String>,
    verbosity: i8,
    rest: Vec<String>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  yeastriction_cli --version\n  \
  yeastriction_cli [--state PATH] [--config PATH] [-v|-q] init\n  \
  yeastriction_cli [...] import-state PATH\n  \
  yeastriction_cli [...] export-state PATH\n  \
  yeastriction_cli [...] add-locus '<locus-json>'\n  \
  yeastriction_cli [...] add-system '<system-json>'\n  \
  yeastriction_cli [...] systems\n  \
  yeastriction_cli [...] loci [STRAIN]\n  \
  yeastriction_cli [...] search LOCUS_ID SYSTEM_ID\n  \
  yeastriction_cli [...] search-strain STRAIN SYSTEM_ID\n  \
  yeastriction_cli [...] oligos LOCUS_ID SYSTEM_ID METHOD [RANK]\n  \
  yeastriction_cli [...] diagnostic-primers LOCUS_ID\n  \
  yeastriction_cli [...] primer-table SYSTEM_ID METHOD LOCUS_ID[,LOCUS_ID...] [--tsv]\n\n  \
  Tip: pass @file.json instead of inline JSON"
    );
}

fn parse_global_args(args: &[String]) -> Result<GlobalArgs> {
    let mut global = GlobalArgs {
        state_path: DEFAULT_STATE_PATH.to_string(),
        config_path: None,
        verbosity: 0,
        rest: vec![],
    };
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--state" => {
                global.state_path = iter.next().context("--state requires a path")?.clone();
            }
            "--config" => {
                global.config_path = Some(iter.next().context("--config requires a path")?.clone());
            }
            "-v" => global.verbosity += 1,
            "-vv" => global.verbosity += 2,
            "-q" => global.verbosity -= 1,
            _ => {
                global.rest.push(arg.clone());
                global.rest.extend(iter.cloned());
                break;
            }
        }
    }
    Ok(global)
}

fn init_logging(verbosity: i8) {
    let level = match verbosity {
        i8::MIN..=-1 => LevelFilter::Warn,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // A logger may already be installed when embedded; keep that one.
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

fn load_json_arg(value: &str) -> Result<String> {
    if let Some(path) = value.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
    } else {
        Ok(value.to_string())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text =
        serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn arg<'a>(rest: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    rest.get(index).map(String::as_str).ok_or_else(|| {
        usage();
        anyhow!("Missing {what} for {}", rest[0])
    })
}

fn parse_id(value: &str, what: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {what} '{value}'"))
}

fn candidate_rows(candidates: &[Candidate]) -> Vec<CandidateRow> {
    candidates
        .iter()
        .enumerate()
        .map(|(rank, c)| CandidateRow {
            rank,
            strand: c.strand.to_string(),
            position: c.position,
            sequence: c.sequence.clone(),
            gc_content: c.gc_content,
            at_content: c.at_content(),
            accessibility: c.fold.accessibility,
            structure: c.fold.notation_binding_only.clone(),
            score: c.composite_score,
        })
        .collect()
}

fn open_context(global: &GlobalArgs) -> Result<(Arc<JsonFileStore>, DesignContext)> {
    let config = DesignConfig::load(global.config_path.as_deref())?;
    let store = Arc::new(
        JsonFileStore::open(&global.state_path)
            .with_context(|| format!("Could not open state '{}'", global.state_path))?,
    );
    let ctx = DesignContext::from_config(&config, store.clone());
    Ok((store, ctx))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }
    let global = parse_global_args(&args)?;
    init_logging(global.verbosity);
    let rest = &global.rest;
    let Some(command) = rest.first() else {
        usage();
        bail!("Missing command");
    };

    match command.as_str() {
        "init" => {
            if Path::new(&global.state_path).exists() {
                bail!("State file '{}' already exists", global.state_path);
            }
            ProjectState::seeded().save_to_path(&global.state_path)?;
            println!("Created '{}'", global.state_path);
            Ok(())
        }
        "import-state" => {
            let source = arg(rest, 1, "path")?;
            let state = ProjectState::load_from_path(source)?;
            state.save_to_path(&global.state_path)?;
            println!("Loaded state from '{source}' into '{}'", global.state_path);
            Ok(())
        }
        "export-state" => {
            let target = arg(rest, 1, "path")?;
            let (store, _) = open_context(&global)?;
            store.snapshot().save_to_path(target)?;
            println!("Saved state from '{}' to '{target}'", store.path().display());
            Ok(())
        }
        "add-locus" => {
            let json = load_json_arg(arg(rest, 1, "locus JSON")?)?;
            let locus: Locus = serde_json::from_str(&json).context("Invalid locus JSON")?;
            let (store, _) = open_context(&global)?;
            let name = locus.display_name().to_string();
            store.update(|s| s.upsert_locus(locus))?;
            println!("Stored locus '{name}'");
            Ok(())
        }
        "add-system" => {
            let json = load_json_arg(arg(rest, 1, "system JSON")?)?;
            let system: RecognitionSystem =
                serde_json::from_str(&json).context("Invalid recognition system JSON")?;
            let (store, _) = open_context(&global)?;
            let name = system.name.clone();
            store.update(|s| {
                s.upsert_system(system);
                Ok(())
            })?;
            println!("Stored recognition system '{name}'");
            Ok(())
        }
        "systems" => {
            let (store, _) = open_context(&global)?;
            let systems: Vec<SystemSummary> = store
                .systems()?
                .into_iter()
                .map(|s| SystemSummary {
                    build_methods: s.build_method_names().iter().map(|m| m.to_string()).collect(),
                    id: s.id,
                    name: s.name,
                    description: s.description,
                    target_filter: s.target_filter,
                })
                .collect();
            print_json(&systems)
        }
        "loci" => {
            let strain = rest.get(1);
            let (store, _) = open_context(&global)?;
            let loci: Vec<LocusSummary> = store
                .loci()?
                .iter()
                .filter(|l| strain.is_none_or(|s| &l.strain == s))
                .map(|l| LocusSummary {
                    id: l.id,
                    name: l.display_name().to_string(),
                    orf: l.orf.clone(),
                    strain: l.strain.clone(),
                    length: l.sequence.len(),
                    coding_length: l.end_orf.saturating_sub(l.start_orf),
                })
                .collect();
            print_json(&loci)
        }
        "search" => {
            let locus_id = parse_id(arg(rest, 1, "locus id")?, "locus id")?;
            let system_id = parse_id(arg(rest, 2, "system id")?, "system id")?;
            let (_, ctx) = open_context(&global)?;
            let handle = spawn_candidate_search(&ctx, locus_id, system_id);
            for progress in handle.progress.iter() {
                if progress.phase != SearchPhase::Cached {
                    info!(
                        "{} {}/{}",
                        progress.phase, progress.done, progress.total
                    );
                }
            }
            let candidates = handle.join()?;
            print_json(&candidate_rows(&candidates))
        }
        "search-strain" => {
            let strain = arg(rest, 1, "strain")?;
            let system_id = parse_id(arg(rest, 2, "system id")?, "system id")?;
            let (store, ctx) = open_context(&global)?;
            let loci: Vec<Locus> = store
                .loci()?
                .into_iter()
                .filter(|l| l.strain == strain)
                .collect();
            info!("Searching {} loci of {strain}", loci.len());
            let outcomes: Vec<StrainSearchOutcome> = loci
                .par_iter()
                .map(|locus| {
                    let result = search_candidates(&ctx, locus.id, system_id, &mut |_| {});
                    StrainSearchOutcome {
                        locus_id: locus.id,
                        name: locus.display_name().to_string(),
                        candidates: result.as_ref().ok().map(Vec::len),
                        error: result.err().map(|e| e.to_string()),
                    }
                })
                .collect();
            print_json(&outcomes)
        }
        "oligos" => {
            let locus_id = parse_id(arg(rest, 1, "locus id")?, "locus id")?;
            let system_id = parse_id(arg(rest, 2, "system id")?, "system id")?;
            let method = arg(rest, 3, "build method")?;
            let rank = match rest.get(4) {
                Some(rank) => parse_id(rank, "rank")? as usize,
                None => 0,
            };
            let (_, ctx) = open_context(&global)?;
            print_json(&oligos_for_candidate(&ctx, locus_id, system_id, method, rank)?)
        }
        "diagnostic-primers" => {
            let locus_id = parse_id(arg(rest, 1, "locus id")?, "locus id")?;
            let (_, ctx) = open_context(&global)?;
            print_json(&diagnostic_primers(&ctx, locus_id)?)
        }
        "primer-table" => {
            let system_id = parse_id(arg(rest, 1, "system id")?, "system id")?;
            let method = arg(rest, 2, "build method")?;
            let locus_ids = arg(rest, 3, "locus ids")?
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_id(s, "locus id"))
                .collect::<Result<Vec<_>>>()?;
            let tsv = rest[4..].iter().any(|a| a == "--tsv");
            let (_, ctx) = open_context(&global)?;
            let rows = assemble_primer_table(&ctx, system_id, method, &locus_ids)?;
            if tsv {
                print!("{}", primer_table_tsv(&rows));
                Ok(())
            } else {
                print_json(&rows)
            }
        }
        other => {
            usage();
            Err(anyhow!("Unknown command '{other}'"))
        }
    }
}
