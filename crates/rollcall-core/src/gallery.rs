//! Gallery of known identities, built once from a directory of reference photos.

use crate::pipeline::FaceEmbedder;
use crate::types::GalleryEntry;
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single reference image was left out of the gallery.
#[derive(Error, Debug)]
enum EntryError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("embedding: {0}")]
    Embed(String),
    #[error("embedding has {got} dimensions, gallery uses {expected}")]
    Dimension { expected: usize, got: usize },
}

/// Known identities and their reference embeddings, in load order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identity.as_str())
    }

    /// Embedding dimensionality shared by every entry, if any entry exists.
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }
}

/// Identity for a reference image path, if it has a recognised extension.
///
/// The identity is the file stem verbatim; case and whitespace are kept.
pub fn identity_for(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}

/// Build the gallery from every `<identity>.jpg` / `<identity>.png` in `dir`.
///
/// Files that fail to open, decode or embed are logged and skipped. The
/// first embedded entry fixes the dimensionality; later entries that
/// disagree are skipped too. Entries follow directory listing order and
/// duplicate identities are kept side by side.
pub fn load_gallery<E: FaceEmbedder>(dir: &Path, embedder: &mut E) -> Result<Gallery, GalleryError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| GalleryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let size = embedder.input_size();
    let mut entries: Vec<GalleryEntry> = Vec::new();
    let mut skipped = 0usize;

    for dir_entry in read_dir {
        let path = match dir_entry {
            Ok(e) => e.path(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read gallery directory entry");
                skipped += 1;
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Some(identity) = identity_for(&path) else {
            tracing::debug!(path = %path.display(), "ignoring non-image file");
            continue;
        };

        let expected_dim = entries.first().map(|e| e.embedding.dim());
        match embed_reference(&path, size, expected_dim, embedder) {
            Ok(embedding) => {
                tracing::debug!(%identity, dim = embedding.dim(), "gallery entry loaded");
                entries.push(GalleryEntry {
                    identity,
                    embedding,
                    source: path,
                });
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to process reference image");
                skipped += 1;
            }
        }
    }

    tracing::info!(dir = %dir.display(), loaded = entries.len(), skipped, "gallery ready");
    Ok(Gallery::new(entries))
}

fn embed_reference<E: FaceEmbedder>(
    path: &Path,
    size: u32,
    expected_dim: Option<usize>,
    embedder: &mut E,
) -> Result<crate::types::Embedding, EntryError> {
    let rgb = image::open(path)?.to_rgb8();
    let resized = image::imageops::resize(&rgb, size, size, FilterType::Triangle);
    let embedding = embedder
        .embed(&resized)
        .map_err(|e| EntryError::Embed(e.to_string()))?;

    match expected_dim {
        Some(expected) if expected != embedding.dim() => Err(EntryError::Dimension {
            expected,
            got: embedding.dim(),
        }),
        _ => Ok(embedding),
    }
}
