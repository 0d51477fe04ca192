mod analyzer;
mod assets;
mod config;
mod error;
mod genai;
mod illustrator;
mod manifest;
mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use log::info;
use pipeline::Pipeline;
use std::fs;
use std::path::PathBuf;

/// Generates cinematic illustrations for a story text file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the input text file (story).
    #[arg(long)]
    text_file: PathBuf,

    /// Directory to save results.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Optional initial style preferences.
    #[arg(long, default_value = "")]
    style_prompt: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please provide GEMINI_API_KEY or a valid config.yml.");
            return Err(e);
        }
    };

    let story_text = fs::read_to_string(&args.text_file)
        .with_context(|| format!("Failed to read {}", args.text_file.display()))?;
    info!(
        "Loaded story file: {} ({} chars)",
        args.text_file.display(),
        story_text.len()
    );

    let client = genai::create_client(&config)?;
    let pipeline = Pipeline::new(config, client, &args.output_dir);

    let report = pipeline.run(&story_text, &args.style_prompt).await?;
    report.print_summary();

    if !report.is_clean() {
        // Partial progress is persisted; a re-run picks up the failed items.
        std::process::exit(1);
    }
    Ok(())
}
