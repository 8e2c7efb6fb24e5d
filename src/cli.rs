use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::analyzer::Analyzer;
use crate::config::{Config, Credentials, DEFAULT_RUNS};
use crate::reproducer::dispatcher::JobDispatcher;

#[derive(Parser)]
#[command(name = "bugswarm")]
#[command(author, version, about = "CI Build Pair Reproducer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a credentials TOML file (defaults to ./bugswarm.toml).
    #[arg(short, long, global = true)]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reproduce mined fail-pass pairs and classify their stability.
    Reproduce {
        /// Path to a JSON file containing fail-pass pairs to reproduce.
        #[arg(short, long)]
        input_file: PathBuf,

        /// Name of the task folder for this reproduction run.
        #[arg(short = 'o', long)]
        task_name: String,

        /// Number of worker threads.
        #[arg(short, long, default_value_t = 1)]
        threads: usize,

        /// Number of reproduce runs per pair.
        #[arg(short = 'n', long, default_value_t = DEFAULT_RUNS)]
        runs: u32,

        /// Keep reproduction images and the per-job build directories.
        #[arg(short, long, default_value_t = false)]
        keep: bool,

        /// Package previously reproduced job pairs into artifact images.
        #[arg(short, long, default_value_t = false)]
        package_mode: bool,

        /// Patch dead dependency mirrors while generating build scripts.
        #[arg(short, long, default_value_t = false)]
        dependency_solver: bool,

        /// Skip the free-disk-space check between runs.
        #[arg(short, long, default_value_t = false)]
        skip_disk_check: bool,
    },
    /// Analyze a single build log and print the result mapping.
    Analyze {
        /// Path to the build log.
        #[arg(short, long)]
        log_path: PathBuf,

        /// The job ID the log belongs to.
        #[arg(short, long)]
        job_id: String,

        /// Build system override (maven, gradle, ant, play).
        #[arg(short, long)]
        build_system: Option<String>,

        /// Trigger commit SHA, used to look up build files.
        #[arg(short, long)]
        trigger_sha: Option<String>,

        /// Repository slug (owner/name), used for language fallback.
        #[arg(short, long)]
        repo: Option<String>,
    },
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        let credentials = Credentials::load(self.credentials.as_deref())?;

        match &self.command {
            Commands::Reproduce {
                input_file,
                task_name,
                threads,
                runs,
                keep,
                package_mode,
                dependency_solver,
                skip_disk_check,
            } => {
                info!("Reproducing pairs from {}", input_file.display());
                let mut config = Config::new(task_name, credentials);
                config.skip_check_disk = *skip_disk_check;

                let mut dispatcher = JobDispatcher::new(
                    input_file,
                    config,
                    *threads,
                    *runs,
                    *keep,
                    *package_mode,
                    *dependency_solver,
                )?;
                dispatcher.run().await?;
                Ok(())
            }
            Commands::Analyze {
                log_path,
                job_id,
                build_system,
                trigger_sha,
                repo,
            } => {
                let analyzer = Analyzer::new(&credentials.github_tokens);
                let result = analyzer
                    .analyze_single_log(
                        log_path,
                        job_id,
                        build_system.as_deref(),
                        trigger_sha.as_deref(),
                        repo.as_deref(),
                    )
                    .await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            }
        }
    }
}
