//! PNG encoding for phenotypes. The core only exposes raw RGB buffers; this
//! is the one place they meet a file format.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glyphbots_core::Organism;
use tracing::debug;

/// Writes `organism`'s phenotype as a PNG under `directory`, returning the
/// file path. The filename carries the organism id and generation so a
/// directory of snapshots stays self-describing.
pub fn save_phenotype_png(directory: &Path, organism: &Organism) -> Result<PathBuf> {
    fs::create_dir_all(directory)
        .with_context(|| format!("creating snapshot directory {}", directory.display()))?;

    let image = organism.phenotype();
    let buffer = image::RgbImage::from_raw(image.width(), image.height(), image.data().to_vec())
        .context("phenotype buffer does not match its dimensions")?;

    let path = directory.join(format!(
        "organism_{:06}_gen{:04}.png",
        organism.id(),
        organism.generation()
    ));
    buffer
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "phenotype snapshot written");
    Ok(path)
}
