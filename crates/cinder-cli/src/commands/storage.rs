//! Storage descriptor commands

use anyhow::Result;
use cinder_asset::StorageDescriptor;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum StorageCommands {
    /// Print the key/value pairs of a storage descriptor
    Parse {
        /// Descriptor (e.g., "type=LocalAssetStorage;name=Data;src=assets")
        descriptor: String,
    },
}

pub fn run(cmd: StorageCommands) -> Result<()> {
    match cmd {
        StorageCommands::Parse { descriptor } => {
            let parsed = StorageDescriptor::parse(&descriptor)?;
            for (key, value) in parsed.iter() {
                println!("{} = {}", key, value);
            }
            if parsed.is_default() {
                println!("(default storage)");
            }
            Ok(())
        }
    }
}
