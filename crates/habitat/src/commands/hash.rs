//! Hash command implementation
//!
//! Prints the current hash of every phase for a habitat. Useful to see
//! which phases a config edit will invalidate before starting a build.

use crate::cli::HashArgs;
use habitat_core::config::ConfigLoader;
use habitat_core::errors::Result;
use habitat_core::{hasher, phases};
use std::path::Path;

pub async fn execute(root: &Path, strict: bool, args: HashArgs) -> Result<()> {
    let loader = ConfigLoader::new(root).strict(strict);
    let config_path = loader.habitat_config_path(&args.habitat);
    let hashes = hasher::calculate_all(&loader, &config_path, &phases::names())?;
    for (name, hash) in &hashes {
        println!("{:>8}  {}", name, hash);
    }
    Ok(())
}
