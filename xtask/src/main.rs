//! Build automation tasks for the sqlpool workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for sqlpool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, feature matrix)
    Ci,
    /// Run cargo fmt --check
    Fmt,
    /// Run clippy on every target with all features
    Clippy,
    /// Run tests, optionally for a single package
    Test {
        /// Package to test, e.g. `sqlpool-driver`
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Run the test suite with and without the `serde` feature
    Features,
    /// Repeat the multi-threaded tests to shake out ordering bugs
    Stress {
        /// Number of repetitions
        #[arg(short, long, default_value_t = 20)]
        rounds: u32,
    },
    /// Generate documentation
    Doc,
    /// Run the statement pool benchmarks
    Bench,
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Change to workspace root
    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            features(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Features => features(&sh)?,
        Command::Stress { rounds } => stress(&sh, rounds)?,
        Command::Doc => doc(&sh)?,
        Command::Bench => bench(&sh)?,
        Command::Clean => clean(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    println!("Formatting check passed.");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;
    println!("Clippy check passed.");
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => {
            println!("Running tests for {package}...");
            cmd!(sh, "cargo test -p {package} --all-features").run()?;
        }
        None => {
            println!("Running tests...");
            cmd!(sh, "cargo test --workspace --all-features").run()?;
        }
    }
    println!("All tests passed.");
    Ok(())
}

fn features(sh: &Shell) -> Result<()> {
    println!("Testing without optional features...");
    cmd!(sh, "cargo test --workspace --no-default-features").run()?;
    println!("Testing with serde...");
    cmd!(sh, "cargo test -p sqlpool -p sqlpool-driver --features serde").run()?;
    println!("Feature matrix passed.");
    Ok(())
}

fn stress(sh: &Shell, rounds: u32) -> Result<()> {
    if rounds == 0 {
        bail!("rounds must be at least 1");
    }
    println!("Running concurrency tests {rounds} times...");
    cmd!(sh, "cargo build -p sqlpool --tests").run()?;
    for round in 1..=rounds {
        cmd!(sh, "cargo test -p sqlpool --test concurrency -q")
            .quiet()
            .run()
            .with_context(|| format!("concurrency tests failed in round {round}"))?;
    }
    println!("{rounds} rounds passed.");
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Generating documentation...");
    cmd!(sh, "cargo doc --workspace --all-features --no-deps").run()?;
    println!("Documentation generated.");
    Ok(())
}

fn bench(sh: &Shell) -> Result<()> {
    println!("Running benchmarks...");
    cmd!(sh, "cargo bench -p sqlpool --bench statement_reuse").run()?;
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("Clean complete.");
    Ok(())
}
