use std::path::Path;

use tokio::{
    fs::{self, File},
    io::{self, AsyncWriteExt},
};
use tracing::warn;

use crate::{
    download::PartSpec,
    errors::{CoopError, CoopResult},
};

/// Creates the parent directories of `destination`. Safe to race.
pub async fn prepare_parent(destination: &Path) -> CoopResult<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CoopError::storage(parent, e))?;
    }
    Ok(())
}

/// Concatenates the part files into `destination` in index order and removes
/// them afterwards. Returns the number of bytes written.
///
/// Every part must exist; a missing one fails the whole combine so the
/// caller can fall back to a single request instead of producing a file
/// with a hole in it.
pub async fn combine_parts(parts: &[PartSpec], destination: &Path) -> CoopResult<u64> {
    let mut ordered: Vec<&PartSpec> = parts.iter().collect();
    ordered.sort_by_key(|p| p.index);

    for part in &ordered {
        if fs::metadata(&part.temp_path).await.is_err() {
            return Err(CoopError::MissingPart(part.temp_path.clone()));
        }
    }

    prepare_parent(destination).await?;
    let mut output = File::create(destination)
        .await
        .map_err(|e| CoopError::storage(destination, e))?;

    let mut written = 0;
    for part in &ordered {
        let mut input = File::open(&part.temp_path)
            .await
            .map_err(|e| CoopError::storage(&part.temp_path, e))?;
        written += io::copy(&mut input, &mut output)
            .await
            .map_err(|e| CoopError::storage(destination, e))?;
    }
    output
        .flush()
        .await
        .map_err(|e| CoopError::storage(destination, e))?;

    discard_parts(parts).await;
    Ok(written)
}

/// Removes whatever part files exist. Failures are only logged.
pub async fn discard_parts(parts: &[PartSpec]) {
    for part in parts {
        match fs::remove_file(&part.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %part.temp_path.display(), error = %e, "could not remove part file"),
        }
    }
}

/// Removes a partially written destination after a terminal failure.
pub async fn discard_partial(destination: &Path) {
    match fs::remove_file(destination).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %destination.display(), error = %e, "could not remove partial download"),
    }
}
