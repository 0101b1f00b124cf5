use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{command, value_parser, Arg};
use vision_trainer::stats::{channel_stats, collect_split_images};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = command!()
        .about("Per-channel mean and std of an image-folder split")
        .args([
            Arg::new("data_dir")
                .long("data_dir")
                .value_parser(value_parser!(PathBuf))
                .default_value("data"),
            Arg::new("split")
                .long("split")
                .default_value("train"),
            Arg::new("output")
                .long("output")
                .value_parser(value_parser!(PathBuf))
                .default_value("normalization_stats.json"),
        ])
        .get_matches();

    let data_dir = matches
        .get_one::<PathBuf>("data_dir")
        .context("--data_dir has a default")?;
    let split = matches
        .get_one::<String>("split")
        .context("--split has a default")?;
    let output = matches
        .get_one::<PathBuf>("output")
        .context("--output has a default")?;

    let split_dir = data_dir.join(split);
    log::info!("Loading images from {}...", split_dir.display());
    let paths = collect_split_images(&split_dir)?;

    let stats = channel_stats(&paths)?;

    // Save statistics to JSON file
    let json = serde_json::to_string_pretty(&stats)?;
    fs::write(output, json).with_context(|| format!("failed to write {}", output.display()))?;

    println!("Statistics saved to {}", output.display());
    println!("Mean: {:?}", stats.mean);
    println!("Std: {:?}", stats.std);
    Ok(())
}
