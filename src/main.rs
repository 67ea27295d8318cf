use clap::{Parser, Subcommand};
use seqdump::config::RegistryConfig;
use seqdump::{Registry, Severity};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seqdump", about = "Find game music sequences in binary dumps and export them as MIDI")]
struct Cli {
    /// JSON registry configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print the diagnostics log as JSON when done
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in formats and the extensions they claim
    Formats,
    /// Report the files and collections found in the inputs
    Scan {
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
    },
    /// Write every collection found in the inputs as a Standard MIDI File
    Export {
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RegistryConfig::from_json_file(path)?,
        None       => RegistryConfig::default(),
    };
    let mut reg = Registry::with_builtin(config)?;

    match cli.command {

        // ── Formats ──────────────────────────────────────────────────────────
        Commands::Formats => {
            println!("{:<10} {:<8} Extensions", "Format", "Active");
            for format in reg.formats().iter() {
                let active = reg.active_formats().contains(&format.name());
                println!("{:<10} {:<8} {}", format.name(), active, format.extensions().join(", "));
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { inputs } => {
            open_all(&mut reg, &inputs)?;
            for (id, source) in reg.sources() {
                println!("{id}  {}  {} B  crc32 {:08x}", source.name(), source.size(), source.checksum());
                for file in reg.files().filter(|f| f.source() == id) {
                    println!("  {:<8} {:<6} {:<16?} 0x{:08X} +0x{:X}  {}",
                        file.id(), file.format(), file.kind(), file.offset, file.length, file.name);
                }
            }
            for (id, coll) in reg.collections() {
                let files = coll.instrument_sets().len() + coll.sample_collections().len() + coll.misc().len();
                println!("{id}  '{}'  sequence + {files} file(s)", coll.name());
            }
        }

        // ── Export ───────────────────────────────────────────────────────────
        Commands::Export { inputs, output_dir } => {
            open_all(&mut reg, &inputs)?;
            std::fs::create_dir_all(&output_dir)?;
            let ids: Vec<_> = reg.collections().map(|(id, _)| id).collect();
            let mut used = HashSet::new();
            for id in ids {
                let smf = reg.export(id)?;
                let name = smf.name.clone().unwrap_or_else(|| id.to_string());
                let mut stem = sanitize(&name);
                if !used.insert(stem.clone()) {
                    stem = format!("{stem}_{}", sanitize(&id.to_string()));
                    used.insert(stem.clone());
                }
                let path = output_dir.join(format!("{stem}.mid"));
                match smf.to_bytes() {
                    Ok(bytes) => {
                        std::fs::write(&path, bytes)?;
                        println!("  wrote  {}", path.display());
                    }
                    Err(e) => eprintln!("  skipped {name}: {e}"),
                }
            }
        }
    }

    let errors = reg.log().at_least(Severity::Error).count();
    if errors > 0 {
        eprintln!("{errors} error(s) logged");
    }
    if cli.log_json {
        println!("{}", String::from_utf8_lossy(&reg.log().to_json()?));
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_all(reg: &mut Registry, inputs: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    for path in inputs {
        if reg.open_file(path)?.is_none() {
            println!("  nothing found in {}", path.display());
        }
    }
    Ok(())
}

/// Collection names come from source names and offsets; keep them usable as
/// file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
