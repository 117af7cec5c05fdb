use std::path::{
    Path,
    PathBuf,
};

use clap::{
    Parser,
    Subcommand,
};
use nor_kv::error::Error as StoreError;
use nor_kv::{
    Config,
    BLOCK_SIZE,
};
use nor_kv_cli::error::Error;
use nor_kv_cli::{
    display_bytes,
    format_statistics,
    hexdump,
    open_store,
    parse_value,
    FileFlash,
};

#[derive(Parser)]
#[command(name = "nor-kv-cli")]
#[command(about = "Inspect and edit nor-kv flash images", long_about = None)]
struct Cli {
    /// Flash image file
    #[arg(short, long, default_value = "kv.bin")]
    image: PathBuf,

    /// Resolve keys by scanning flash instead of using the mapping table
    #[arg(long)]
    no_mapping: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a blank image and format it
    Init {
        /// Image size in bytes (must be multiple of 4096)
        #[arg(short, long, value_parser = parse_size)]
        size: usize,
    },
    /// Store a value
    Set {
        key: String,
        value: String,

        /// The value is hex encoded
        #[arg(long)]
        hex: bool,
    },
    /// Print a value as hex dump
    Get { key: String },
    /// Delete a key
    Del { key: String },
    /// List all live items
    List,
    /// Print block usage
    Stats,
    /// Run a single garbage collection cycle
    Gc,
}

fn parse_size(s: &str) -> Result<usize, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<usize>().map_err(|e| e.to_string())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config {
        mapping_table: !cli.no_mapping,
        ..Config::default()
    };

    match cli.command {
        Commands::Init { size } => init(&cli.image, size, config),
        command => edit(&cli.image, command, config),
    }
}

fn init(image: &Path, size: usize, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut flash = FileFlash::blank(size)?;
    open_store(&mut flash, config)?;
    flash.save(image)?;

    println!("Initialized {} ({} bytes, {} blocks)", image.display(), size, size / BLOCK_SIZE);
    Ok(())
}

fn edit(image: &Path, command: Commands, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut flash = FileFlash::load(image)?;
    let mut kv = open_store(&mut flash, config)?;

    match command {
        Commands::Init { .. } => {}
        Commands::Set { key, value, hex } => {
            let value = parse_value(&value, hex)?;
            kv.set(&key, value)?;
        }
        Commands::Get { key } => {
            let value = match kv.get::<Vec<u8>>(&key) {
                Err(StoreError::ItemNotFound) => return Err(Error::KeyNotFound(key).into()),
                other => other?,
            };
            println!("{key} [{} bytes]", value.len());
            print!("{}", hexdump(&value));
        }
        Commands::Del { key } => match kv.delete(&key) {
            Err(StoreError::ItemNotFound) => return Err(Error::KeyNotFound(key).into()),
            other => other?,
        },
        Commands::List => {
            for entry in kv.list()? {
                println!(
                    "{:#06x}  {} = {}",
                    entry.offset,
                    display_bytes(&entry.key),
                    display_bytes(&entry.value)
                );
            }
        }
        Commands::Stats => {
            print!("{}", format_statistics(&kv.statistics()?));
        }
        Commands::Gc => {
            println!("{:?}", kv.collect_garbage()?);
        }
    }

    drop(kv);
    flash.save(image)?;
    Ok(())
}
