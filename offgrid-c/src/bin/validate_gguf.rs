//! GGUF Model Format Validator
//!
//! Checks that a model file will get past the bridge's load-time validation
//! and prints its metadata.

use ai_chat::util::gguf::{self, GgufValue};
use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

fn main() -> Result<()> {
    let matches = Command::new("validate_gguf")
        .version("1.0")
        .about("Validate GGUF model file format and print its metadata")
        .arg(
            Arg::new("file")
                .help("Path to the GGUF file to validate")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .help("Print every metadata key, not just general.*")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let Some(file) = matches.get_one::<String>("file") else {
        anyhow::bail!("missing file argument");
    };
    let file_path = PathBuf::from(file);
    let show_all = matches.get_flag("all");

    println!("🔍 GGUF Model Validator");
    println!("📁 File: {:?}", file_path);
    println!();

    let metadata = match gguf::inspect(&file_path) {
        Ok(metadata) => metadata,
        Err(e) => {
            println!("❌ {:#}", e);
            return Err(e);
        }
    };

    println!(
        "📊 File size: {} bytes ({:.2} MB)",
        metadata.file_size,
        metadata.file_size as f64 / (1024.0 * 1024.0)
    );
    println!("✅ GGUF version: {}", metadata.header.version);
    println!("🔢 Tensors: {}", metadata.header.tensor_count);
    println!("🔑 Metadata entries: {}", metadata.header.kv_count);
    println!();

    for (key, value) in &metadata.entries {
        if !show_all && !key.starts_with("general.") {
            continue;
        }
        match value {
            GgufValue::Str(s) if s.chars().count() > 120 => {
                let short: String = s.chars().take(120).collect();
                println!("  {} = {}…", key, short);
            }
            _ => println!("  {} = {}", key, value),
        }
    }

    println!();
    println!(
        "✅ {} looks like a valid GGUF model",
        metadata.name().unwrap_or("file")
    );
    Ok(())
}
