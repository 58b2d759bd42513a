use std::path::PathBuf;

use crate::errors::{CoopError, CoopResult};

const SIZE_UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Formats a byte count with 1024-based units, e.g. `1.50 KB`.
pub fn human_readable_size(size: u64) -> String {
    if size == 0 {
        return String::from("0 B");
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, SIZE_UNITS[unit])
}

/// Splits `s3://bucket/prefix` into bucket and prefix. The prefix may be
/// empty.
pub fn parse_s3_url(s3_url: &str) -> CoopResult<(String, String)> {
    let path = s3_url.strip_prefix("s3://").unwrap_or(s3_url);
    let (bucket, prefix) = match path.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix),
        None => (path, ""),
    };
    if bucket.is_empty() {
        return Err(CoopError::InvalidUrl(s3_url.to_string()));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// Converts `https://source.coop/[repositories/]account/repo[/path]` into
/// `s3://account/repo[/path]`.
pub fn repo_url_to_s3_url(repo_url: &str) -> CoopResult<String> {
    let without_scheme = repo_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| CoopError::InvalidUrl(repo_url.to_string()))?;
    let path = without_scheme
        .split_once('/')
        .map(|(_, path)| path)
        .unwrap_or("");
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.strip_prefix("repositories/").unwrap_or(path);

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(CoopError::InvalidUrl(repo_url.to_string()));
    }
    Ok(format!("s3://{}", segments.join("/")))
}

/// Accepts either a repository page URL or an `s3://` URL.
pub fn resolve_s3_url(repository: &str) -> CoopResult<String> {
    if repository.starts_with("http") {
        repo_url_to_s3_url(repository)
    } else {
        Ok(repository.to_string())
    }
}

/// `./source-coop-<last prefix segment>`, or `./source-coop-download` when
/// the URL names a bare bucket.
pub fn default_output_dir(s3_url: &str) -> CoopResult<PathBuf> {
    let (_, prefix) = parse_s3_url(s3_url)?;
    let name = prefix
        .trim_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download");
    Ok(PathBuf::from(format!(".{}source-coop-{}", std::path::MAIN_SEPARATOR, name)))
}
