use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Objects at or below this size are always fetched in one request.
pub const MULTIPART_THRESHOLD: u64 = 10 * 1024 * 1024;

/// A downloadable object as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Storage key, also the output path relative to the output directory.
    pub key: String,
    pub size: u64,
    pub download_url: String,
    pub last_modified: DateTime<Utc>,
}

impl ObjectDescriptor {
    /// Lower-cased extension of the key's file name including the dot,
    /// or an empty string when there is none.
    pub fn extension(&self) -> String {
        Path::new(&self.key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }

    /// Last path segment of the key, used as a display label.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').find(|s| !s.is_empty()).unwrap_or(&self.key)
    }

    /// Where the object lands under `output_dir`.
    pub fn destination(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.key.trim_start_matches('/'))
    }
}

/// How one object is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Whole,
    Multipart(u32),
}

/// Strategy decision for one object of the batch.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub descriptor: ObjectDescriptor,
    pub strategy: Strategy,
}

impl DownloadPlan {
    pub fn decide(descriptor: ObjectDescriptor, part_count: u32, ranges_supported: bool) -> Self {
        let strategy = choose_strategy(descriptor.size, part_count, ranges_supported);
        DownloadPlan {
            descriptor,
            strategy,
        }
    }
}

/// Representation of a byte range of an object and the temp file it is
/// written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub index: u32,
    pub start_byte: u64,
    /// Inclusive.
    pub end_byte: u64,
    pub temp_path: PathBuf,
}

impl PartSpec {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn range_header(&self) -> String {
        format!(
            "bytes={start}-{end}",
            start = self.start_byte,
            end = self.end_byte
        )
    }
}

/// Whether an object is a candidate for multipart before asking the server.
/// Every part must get at least one byte.
pub fn wants_multipart(size: u64, part_count: u32) -> bool {
    part_count > 1 && size > MULTIPART_THRESHOLD && size >= part_count as u64
}

pub fn choose_strategy(size: u64, part_count: u32, ranges_supported: bool) -> Strategy {
    if wants_multipart(size, part_count) && ranges_supported {
        Strategy::Multipart(part_count)
    } else {
        Strategy::Whole
    }
}

/// Temp file of part `index` for an object written to `destination`.
pub fn part_path(destination: &Path, index: u32) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

/// Splits `[0, size - 1]` into `part_count` contiguous ranges. The last
/// range absorbs the remainder. Objects smaller than `part_count` get one
/// byte per part.
pub fn plan_parts(size: u64, part_count: u32, destination: &Path) -> Vec<PartSpec> {
    if size == 0 {
        return Vec::new();
    }
    let part_count = part_count.max(1).min(size.min(u32::MAX as u64) as u32);
    let base = size / part_count as u64;

    (0..part_count)
        .map(|index| {
            let start_byte = index as u64 * base;
            let end_byte = if index + 1 == part_count {
                size - 1
            } else {
                start_byte + base - 1
            };
            PartSpec {
                index,
                start_byte,
                end_byte,
                temp_path: part_path(destination, index),
            }
        })
        .collect()
}
