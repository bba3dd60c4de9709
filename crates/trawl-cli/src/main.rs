use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};
use trawl_config::TrawlConfig;
use trawl_core::{parse_repository_revisions, Repo, RepoId, RepositoryRevisions};
use trawl_endpoint::EndpointMap;
use trawl_index::{IndexCatalog, IndexMode, PartitionOptions, QueryCompiler, RepoPartitioner};
use trawl_proto::{PatternInfo, SearchFrame, StreamDecoder};
use trawl_scheduler::RequestContext;

#[derive(Parser)]
#[command(name = "trawl", version, about = "trawl (routing, partitioning, query and stream tools)")]
struct Cli {
    /// Path to a trawl.toml (defaults to $TRAWL_CONFIG or ./trawl.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which searchers a routing key maps to
    Route(RouteArgs),
    /// Split repository revisions between the index and remote searchers
    Partition(PartitionArgs),
    /// Compile a search pattern into an index query
    Compile(CompileArgs),
    /// Decode a searcher event stream and print its frames as JSON lines
    Decode(DecodeArgs),
}

#[derive(Args)]
struct RouteArgs {
    /// Endpoint spec: space-separated searcher URLs
    spec: String,
    /// Routing key, usually `<repo>@<commit>`
    key: String,
    /// Number of candidates to print
    #[arg(short = 'n', default_value_t = 1)]
    n: usize,
}

#[derive(Args)]
struct PartitionArgs {
    /// Index catalog as a JSON array of indexed repositories
    #[arg(long)]
    catalog: PathBuf,
    /// Whether to use the index: yes, only or no
    #[arg(long, default_value = "yes")]
    mode: IndexMode,
    /// Only treat repositories indexed with symbols as indexed
    #[arg(long)]
    require_symbols: bool,
    /// Repositories as `name[@rev[:rev...]]`
    #[arg(required = true)]
    repos: Vec<String>,
}

#[derive(Args)]
struct CompileArgs {
    pattern: String,
    /// Treat the pattern as a regular expression
    #[arg(long)]
    regex: bool,
    /// Match case-sensitively
    #[arg(long)]
    case: bool,
    /// Match whole words only
    #[arg(long)]
    word: bool,
    /// Find files that do not match
    #[arg(long)]
    negate: bool,
    /// Only files whose path matches this regex (repeatable)
    #[arg(short = 'f', long = "include")]
    include: Vec<String>,
    /// Skip files whose path matches this regex
    #[arg(long)]
    exclude: Option<String>,
    /// Only files in this language (repeatable)
    #[arg(long = "lang")]
    languages: Vec<String>,
}

#[derive(Args)]
struct DecodeArgs {
    /// File to decode (defaults to stdin)
    file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_ref())?;
    trawl_config::init_tracing(&config.logging);
    tracing::debug!(
        target: "trawl.cli",
        searcher_url = %config.search.searcher_url,
        "config loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    match cli.command {
        Command::Route(args) => runtime.block_on(route(args)),
        Command::Partition(args) => runtime.block_on(partition(&config, args)),
        Command::Compile(args) => compile(args),
        Command::Decode(args) => runtime.block_on(decode(args)),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TrawlConfig> {
    match path {
        Some(path) => TrawlConfig::load_from_path(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            trawl_config::load_for_dir(&cwd).context("failed to load config")
        }
    }
}

async fn route(args: RouteArgs) -> Result<i32> {
    let map = EndpointMap::from_spec(&args.spec, None)?;
    tracing::debug!(target: "trawl.cli", key = %args.key, n = args.n, "routing key");
    for endpoint in map.get_n(&args.key, args.n.max(1)).await? {
        println!("{endpoint}");
    }
    Ok(0)
}

#[derive(Serialize)]
struct PartitionReport {
    indexed: Vec<RepositoryRevisions>,
    repo_branches: HashMap<String, Vec<RepoId>>,
    unindexed: Vec<RepositoryRevisions>,
    missing: Vec<RepositoryRevisions>,
}

async fn partition(config: &TrawlConfig, args: PartitionArgs) -> Result<i32> {
    let catalog = IndexCatalog::load_from_path(&args.catalog)
        .with_context(|| format!("failed to load catalog {}", args.catalog.display()))?;

    // Repositories are identified by name on the command line; reuse catalog ids where known.
    let ids: HashMap<&str, RepoId> = catalog
        .iter()
        .map(|repo| (repo.name.as_str(), repo.id))
        .collect();
    let mut next_id = catalog.iter().map(|repo| repo.id).max().unwrap_or(0);
    let repos = args
        .repos
        .iter()
        .map(|spec| {
            let (name, revs) = parse_repository_revisions(spec);
            let id = match ids.get(name.as_str()) {
                Some(id) => *id,
                None => {
                    next_id += 1;
                    next_id
                }
            };
            RepositoryRevisions::new(Repo::new(id, name), revs)
        })
        .collect();

    let partitioner = RepoPartitioner::new(
        std::sync::Arc::new(StaticCatalog(catalog)),
        PartitionOptions {
            mode: args.mode,
            require_symbols: args.require_symbols,
            catalog_timeout: config.search.catalog_timeout(),
        },
    );
    let partition = partitioner
        .partition(&RequestContext::background(), repos)
        .await?;
    if partition.index_unavailable {
        tracing::warn!(
            target: "trawl.cli",
            "index catalog unavailable; every revision is unindexed"
        );
    }
    tracing::info!(
        target: "trawl.cli",
        indexed = partition.indexed.len(),
        unindexed = partition.unindexed.len(),
        missing = partition.missing.len(),
        "partitioned repositories"
    );

    let report = PartitionReport {
        indexed: partition.indexed.repo_revs().cloned().collect(),
        repo_branches: partition
            .indexed
            .repo_branches()
            .iter()
            .map(|(branch, ids)| (branch.clone(), ids.iter().copied().collect()))
            .collect(),
        unindexed: partition.unindexed,
        missing: partition.missing,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.missing.is_empty() { 0 } else { 1 })
}

/// Serves a catalog loaded from disk.
struct StaticCatalog(IndexCatalog);

#[async_trait::async_trait]
impl trawl_index::IndexBackend for StaticCatalog {
    async fn list_indexed_repos(&self) -> Result<IndexCatalog, trawl_core::Error> {
        Ok(self.0.clone())
    }

    async fn search(
        &self,
        _query: &trawl_index::Q,
        _options: &trawl_index::IndexSearchOptions,
        _on_matches: &(dyn Fn(trawl_index::IndexedMatches) + Send + Sync),
    ) -> Result<trawl_index::IndexSearchStats, trawl_core::Error> {
        Err(trawl_core::Error::permanent("a catalog file cannot be searched"))
    }
}

fn compile(args: CompileArgs) -> Result<i32> {
    let pattern = PatternInfo {
        is_regexp: args.regex,
        is_case_sensitive: args.case,
        is_word_match: args.word,
        is_negated: args.negate,
        include_patterns: args.include,
        exclude_pattern: args.exclude,
        languages: args.languages,
        ..PatternInfo::literal(args.pattern)
    };
    let q = QueryCompiler::new().compile(&pattern)?;
    println!("{q}");
    Ok(0)
}

async fn decode(args: DecodeArgs) -> Result<i32> {
    match &args.file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            print_frames(BufReader::new(file)).await
        }
        None => print_frames(BufReader::new(tokio::io::stdin())).await,
    }
}

async fn print_frames<R: AsyncBufRead + Unpin>(reader: R) -> Result<i32> {
    let mut decoder = StreamDecoder::new(reader);
    while let Some(frame) = decoder.next_frame().await? {
        let line = match frame {
            SearchFrame::Matches(matches) => {
                serde_json::json!({ "event": "matches", "data": matches })
            }
            SearchFrame::Done(done) => serde_json::json!({ "event": "done", "data": done }),
            SearchFrame::Unknown { event, data } => {
                tracing::debug!(target: "trawl.cli", event = %event, "unknown event");
                serde_json::json!({ "event": event, "raw": data })
            }
        };
        println!("{line}");
    }
    Ok(0)
}
