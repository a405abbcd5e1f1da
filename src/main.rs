use std::{
    collections::BTreeMap,
    fs,
    path::{self, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, debug, info};
use nexus_tags::{
    Credentials, ImageRecord, LatestPolicy, Nexus, RetentionPolicy, SearchMode, group,
};
use serde::Serialize;

/// Find Docker images in Nexus and list the tags worth retaining
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Verbose mode (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search the registry for images matching the patterns
    Search(SearchArgs),
    /// Reduce raw search results saved with `search --raw`
    Reduce(ReduceArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Nexus server URL
    #[arg(long, env = "NEXUS_URL", default_value = "http://localhost:8081")]
    url: String,
    /// Docker repository name
    #[arg(long, env = "NEXUS_REPOSITORY", default_value = "my-private-docker-repo")]
    repository: String,
    /// Nexus username
    #[arg(long, env = "NEXUS_USERNAME")]
    username: Option<String>,
    /// Nexus password
    #[arg(long, env = "NEXUS_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
    /// Treat patterns as regular expressions over every image name
    #[arg(long)]
    regex: bool,
    /// Output the raw search results without reducing tags
    #[arg(long, conflicts_with_all = ["keep", "strict_latest", "drop_empty"])]
    raw: bool,
    /// Write the results as JSON to this file
    #[arg(short, long)]
    output: Option<String>,
    #[command(flatten)]
    policy: PolicyArgs,
    /// Image name patterns
    #[arg(required = true)]
    patterns: Vec<String>,
}

#[derive(Debug, Args)]
struct ReduceArgs {
    /// JSON file with raw search results
    #[arg(short, long)]
    input: String,
    /// Write the results as JSON to this file instead of stdout
    #[arg(short, long)]
    output: Option<String>,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Args)]
struct PolicyArgs {
    /// Number of numeric tags to retain per image
    #[arg(long, default_value_t = 2)]
    keep: usize,
    /// Retain `latest` only when its digest matches the highest version
    #[arg(long)]
    strict_latest: bool,
    /// Leave out images without any retained tag
    #[arg(long)]
    drop_empty: bool,
}

impl From<&PolicyArgs> for RetentionPolicy {
    fn from(args: &PolicyArgs) -> Self {
        RetentionPolicy {
            keep: args.keep,
            latest: if args.strict_latest {
                LatestPolicy::Strict
            } else {
                LatestPolicy::Fallback
            },
            keep_empty: !args.drop_empty,
        }
    }
}

fn write_json<T: Serialize>(value: &T, output: &str) -> Result<PathBuf> {
    let path = path::absolute(&*shellexpand::tilde(output))
        .with_context(|| format!("Failed to resolve output path {output:?}"))?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let mut json = serde_json::to_string_pretty(value).context("Failed to encode results")?;
    json.push('\n');
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn print_images(images: &[ImageRecord]) {
    println!("\nFound {} matching images:", images.len());
    for image in images {
        println!("\nImage: {}", image.name);
        println!("Version: {}", image.version);
        println!("SHA256: {}", image.digest);
    }
}

fn print_retained(retained: &BTreeMap<String, Vec<String>>) {
    println!("\nFound {} matching images:", retained.len());
    for (name, tags) in retained {
        println!("\nImage: {name}");
        println!("Tags: {}", tags.join(", "));
    }
}

async fn search(args: &SearchArgs) -> Result<()> {
    let credentials = match (&args.username, &args.password) {
        (Some(username), Some(password)) => Some(Credentials::basic(username, password)),
        _ => Credentials::from_docker_config(&args.url)?,
    };
    let mode = if args.regex {
        SearchMode::Regex
    } else {
        SearchMode::Search
    };

    let nexus = Nexus::new(&args.url, &args.repository, credentials, !args.insecure)?;
    let context = || format!("Failed to search images in {}", nexus.repository());

    let path = if args.raw {
        let images = nexus
            .search_images(&args.patterns, mode)
            .await
            .with_context(context)?;
        print_images(&images);
        args.output
            .as_deref()
            .map(|output| write_json(&images, output))
            .transpose()?
    } else {
        let retained = nexus
            .search_and_reduce(&args.patterns, mode, &RetentionPolicy::from(&args.policy))
            .await
            .with_context(context)?;
        for (name, tags) in &retained {
            debug!("Retained tags for {name}: {tags:?}");
        }
        print_retained(&retained);
        args.output
            .as_deref()
            .map(|output| write_json(&retained, output))
            .transpose()?
    };

    if let Some(path) = path {
        println!("\nResults saved to {}", path.display());
    }
    Ok(())
}

fn reduce(args: &ReduceArgs) -> Result<()> {
    let contents = fs::read_to_string(&args.input)
        .with_context(|| format!("Input file {:?} not found", args.input))?;
    let images: Vec<ImageRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid JSON in input file {:?}", args.input))?;
    info!("Loaded {} records from {}", images.len(), args.input);

    let retained = group(&images, &RetentionPolicy::from(&args.policy));
    match &args.output {
        Some(output) => {
            let path = write_json(&retained, output)?;
            info!("Results saved to {}", path.display());
        }
        None => println!(
            "{}",
            serde_json::to_string_pretty(&retained).context("Failed to encode results")?
        ),
    }
    Ok(())
}

/// Level forced by `-v` flags; without them `RUST_LOG` decides.
fn log_level(verbose: u8) -> Option<LevelFilter> {
    match verbose {
        0 => None,
        1 => Some(LevelFilter::Info),
        2 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Search(args) => search(args).await,
        Command::Reduce(args) => reduce(args),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));
    if let Some(level) = log_level(cli.verbose) {
        logger.filter_level(level);
    }
    logger.init();

    if let Err(err) = run(&cli).await {
        eprintln!("Error: {err}");
        for (level, cause) in err.chain().skip(1).enumerate() {
            eprintln!(
                "{:indent$}Caused by: {}",
                "",
                cause,
                indent = (level + 1) * 2
            );
        }
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_search() {
        let cli = Cli::try_parse_from([
            "nexus-tags",
            "-vv",
            "search",
            "--url",
            "https://nexus.local",
            "--repository",
            "docker-hosted",
            "--keep",
            "3",
            "--strict-latest",
            "team/*",
            "base/*",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);

        let Command::Search(args) = cli.command else {
            panic!("expected search command");
        };
        assert_eq!(args.url, "https://nexus.local");
        assert_eq!(args.patterns, ["team/*", "base/*"]);
        assert!(!args.raw && !args.regex && !args.insecure);
        assert_eq!(
            RetentionPolicy::from(&args.policy),
            RetentionPolicy {
                keep: 3,
                latest: LatestPolicy::Strict,
                keep_empty: true,
            }
        );
    }

    #[test]
    fn test_cli_raw_rejects_policy_flags() {
        for flag in [
            &["--keep", "3"][..],
            &["--strict-latest"][..],
            &["--drop-empty"][..],
        ] {
            let mut args = vec!["nexus-tags", "search", "--raw"];
            args.extend_from_slice(flag);
            args.push("app");
            assert!(Cli::try_parse_from(args).is_err(), "accepted --raw with {flag:?}");
        }

        let cli = Cli::try_parse_from(["nexus-tags", "search", "--raw", "app"]).unwrap();
        assert!(matches!(cli.command, Command::Search(args) if args.raw));
    }

    #[test]
    fn test_log_level_defers_to_environment() {
        assert_eq!(log_level(0), None);
        assert_eq!(log_level(1), Some(LevelFilter::Info));
        assert_eq!(log_level(2), Some(LevelFilter::Debug));
        assert_eq!(log_level(5), Some(LevelFilter::Trace));
    }

    #[test]
    fn test_cli_search_requires_patterns() {
        assert!(Cli::try_parse_from(["nexus-tags", "search"]).is_err());
    }

    #[test]
    fn test_cli_reduce_defaults() {
        let cli = Cli::try_parse_from(["nexus-tags", "reduce", "-i", "images.json"]).unwrap();
        let Command::Reduce(args) = cli.command else {
            panic!("expected reduce command");
        };
        assert_eq!(args.input, "images.json");
        assert_eq!(args.output, None);
        assert_eq!(RetentionPolicy::from(&args.policy), RetentionPolicy::default());
    }

    #[test]
    fn test_write_json_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/out/result.json");

        let mut retained = BTreeMap::new();
        retained.insert("app".to_string(), vec!["latest".to_string(), "2".to_string()]);
        let path = write_json(&retained, output.to_str().unwrap()).unwrap();

        assert_eq!(path, output);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("}\n"));
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, retained);
    }

    #[test]
    fn test_reduce_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("images.json");
        let output = dir.path().join("retained.json");
        fs::write(
            &input,
            r#"[
                {"name": "test/image", "version": "1", "sha256": "abc123"},
                {"name": "test/image", "version": "2", "sha256": "def456"},
                {"name": "test/image", "version": "latest", "sha256": "def456"}
            ]"#,
        )
        .unwrap();

        let args = ReduceArgs {
            input: input.to_str().unwrap().to_string(),
            output: Some(output.to_str().unwrap().to_string()),
            policy: PolicyArgs {
                keep: 2,
                strict_latest: false,
                drop_empty: false,
            },
        };
        reduce(&args).unwrap();

        let parsed: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(parsed["test/image"], ["latest", "2", "1"]);
    }

    #[test]
    fn test_reduce_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("images.json");
        fs::write(&input, "not json").unwrap();

        let args = ReduceArgs {
            input: input.to_str().unwrap().to_string(),
            output: None,
            policy: PolicyArgs {
                keep: 2,
                strict_latest: false,
                drop_empty: false,
            },
        };
        let err = reduce(&args).unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON in input file"));
    }
}
