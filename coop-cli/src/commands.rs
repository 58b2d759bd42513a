use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Subcommand;
use coop_core::{
    download::ObjectDescriptor,
    downloader::{BatchResult, ConfirmGate, DownloadOptions, Downloader},
    errors::{CoopError, CoopResult},
    inventory::{BatchSummary, ObjectInventory, S3Inventory},
    utils::{default_output_dir, human_readable_size, resolve_s3_url},
};
use dialoguer::Confirm;
use indicatif::MultiProgress;
use prettytable::{format, Table};
use tracing::debug;

use crate::progress::BarSink;

/// Rows shown in the object listing.
pub const OBJECT_LIMIT: usize = 20;

#[derive(Subcommand)]
pub enum Commands {
    /// Show how many files a repository holds and how large they are
    Summarize {
        /// Repository page URL or s3:// URL
        repository: String,
        /// Only count files with this extension, e.g. .csv
        #[arg(long)]
        file_type: Option<String>,
    },
    /// Download every file of a repository
    Download {
        /// Repository page URL or s3:// URL
        repository: String,
        /// Only download files with this extension, e.g. .csv
        #[arg(long)]
        file_type: Option<String>,
        /// Defaults to ./source-coop-<repository name>
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Files downloaded at the same time
        #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        threads: u64,
        /// Parts per large file, 0 or 1 disables multipart downloads
        #[arg(short, long, default_value_t = 8)]
        multipart: u32,
        /// Don't ask for confirmation and don't list the files
        #[arg(short, long)]
        quiet: bool,
    },
}

/// Asks on the terminal before a batch starts and announces it once
/// accepted.
pub struct PromptConfirm {
    banner: String,
}

impl ConfirmGate for PromptConfirm {
    fn confirm(&self, summary: &BatchSummary, output_dir: &Path) -> bool {
        let accepted = Confirm::new()
            .with_prompt(download_prompt(summary, output_dir))
            .default(false)
            .interact()
            .unwrap_or(false);
        if accepted {
            println!("{}", self.banner);
        }
        accepted
    }
}

fn start_banner(total_files: usize, output_dir: &Path, threads: u64, multipart: u32) -> String {
    if multipart > 1 {
        format!(
            "Downloading {} files to {} using up to {} concurrent connections and {} parts for large files...",
            total_files,
            output_dir.display(),
            threads,
            multipart
        )
    } else {
        format!(
            "Downloading {} files to {} using up to {} concurrent connections...",
            total_files,
            output_dir.display(),
            threads
        )
    }
}

fn download_prompt(summary: &BatchSummary, output_dir: &Path) -> String {
    format!(
        "Download {} files ({}) to {}?",
        summary.total_files,
        summary.total_size_human(),
        output_dir.display()
    )
}

/// Lists the repository on a short-lived runtime. It is dropped before the
/// download starts so the downloader can run its own.
fn list_objects(
    endpoint: &str,
    s3_url: &str,
    file_type: Option<&str>,
) -> CoopResult<(Vec<ObjectDescriptor>, BatchSummary)> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CoopError::Scheduler(e.to_string()))?;
    rt.block_on(async {
        let inventory = S3Inventory::new(endpoint);
        inventory.list_objects_with_summary(s3_url, file_type).await
    })
}

pub fn handle_summarize(
    endpoint: &str,
    repository: String,
    file_type: Option<String>,
) -> CoopResult<()> {
    let s3_url = resolve_s3_url(&repository)?;
    println!("Using S3 URL: {}", s3_url);
    println!("Listing objects...");

    let (objects, summary) = list_objects(endpoint, &s3_url, file_type.as_deref())?;
    print_summary(&summary);
    print_objects(&objects, OBJECT_LIMIT);
    Ok(())
}

pub struct DownloadArgs {
    pub repository: String,
    pub file_type: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub threads: u64,
    pub multipart: u32,
    pub quiet: bool,
}

pub fn handle_download(endpoint: &str, args: DownloadArgs, bars: MultiProgress) -> CoopResult<()> {
    let s3_url = resolve_s3_url(&args.repository)?;
    println!("Using S3 URL: {}", s3_url);

    let output_dir = match args.output_dir {
        Some(dir) => dir,
        None => {
            let dir = default_output_dir(&s3_url)?;
            println!("Using default output directory: {}", dir.display());
            dir
        }
    };

    println!("Listing objects...");
    let (objects, summary) = list_objects(endpoint, &s3_url, args.file_type.as_deref())?;
    if !args.quiet {
        print_summary(&summary);
        print_objects(&objects, OBJECT_LIMIT);
    }
    if objects.is_empty() {
        println!("No files found to download");
        return Ok(());
    }

    let banner = start_banner(objects.len(), &output_dir, args.threads, args.multipart);
    let options = DownloadOptions {
        max_concurrent: args.threads as usize,
        part_count: args.multipart,
        interactive: !args.quiet,
        quiet: args.quiet,
    };
    let downloader = Downloader::new(&output_dir, options)?
        .with_progress(Arc::new(BarSink::new(bars.clone())))
        .with_confirm(Arc::new(PromptConfirm {
            banner: banner.clone(),
        }));
    // Without a prompt the batch starts right away.
    if args.quiet {
        println!("{}", banner);
    }

    debug!(objects = objects.len(), output_dir = %output_dir.display(), "starting batch");
    let result = downloader.download(objects)?;
    bars.clear().ok();

    for line in result_lines(&result) {
        println!("{}", line);
    }
    Ok(())
}

fn result_lines(result: &BatchResult) -> Vec<String> {
    if result.total_requested > 0 && result.successful_count + result.failed_count == 0 {
        return vec![String::from("Download cancelled")];
    }
    let mut lines = vec![format!(
        "Successfully downloaded {} of {} files",
        result.successful_count, result.total_requested
    )];
    if result.failed_count > 0 {
        lines.push(format!("Failed to download {} files", result.failed_count));
    }
    lines
}

fn summary_tables(summary: &BatchSummary) -> (Table, Option<Table>) {
    let mut main = Table::new();
    main.set_format(*format::consts::FORMAT_BOX_CHARS);
    main.set_titles(row!["Metric", "Value"]);
    main.add_row(row!["Total Files", summary.total_files]);
    main.add_row(row!["Total Size", summary.total_size_human()]);

    if summary.file_types.is_empty() {
        return (main, None);
    }

    let mut types = Table::new();
    types.set_format(*format::consts::FORMAT_BOX_CHARS);
    types.set_titles(row!["Extension", "Count", "Size", "Percentage"]);
    for (ext, stats) in summary.types_by_size() {
        let percentage = if summary.total_size > 0 {
            stats.size as f64 / summary.total_size as f64 * 100.0
        } else {
            0.0
        };
        types.add_row(row![
            ext,
            r->stats.count,
            r->human_readable_size(stats.size),
            r->format!("{:.2}%", percentage)
        ]);
    }
    (main, Some(types))
}

fn print_summary(summary: &BatchSummary) {
    let (main, types) = summary_tables(summary);
    println!("Repository Summary");
    main.printstd();
    if let Some(types) = types {
        println!("File Types");
        types.printstd();
    }
}

/// Newest objects first, at most `limit` rows.
fn objects_table(objects: &[ObjectDescriptor], limit: usize) -> Table {
    let mut sorted: Vec<&ObjectDescriptor> = objects.iter().collect();
    sorted.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table.set_titles(row!["Last Modified", "Size", "Key"]);
    for object in sorted.into_iter().take(limit) {
        table.add_row(row![
            object.last_modified.format("%Y-%m-%d %H:%M:%S"),
            r->human_readable_size(object.size),
            object.key
        ]);
    }
    table
}

fn print_objects(objects: &[ObjectDescriptor], limit: usize) {
    if objects.is_empty() {
        println!("No objects found");
        return;
    }
    println!(
        "Objects (showing {} of {})",
        limit.min(objects.len()),
        objects.len()
    );
    objects_table(objects, limit).printstd();
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use coop_core::inventory::summarize;

    use super::*;

    fn object(key: &str, size: u64, day: u32) -> ObjectDescriptor {
        ObjectDescriptor {
            key: key.to_string(),
            size,
            download_url: format!("https://data.source.coop/bucket/{}", key),
            last_modified: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_download_prompt() {
        let summary = summarize(&[object("a.csv", 1024, 1), object("b.csv", 512, 2)]);

        assert_eq!(
            download_prompt(&summary, Path::new("out")),
            "Download 2 files (1.50 KB) to out?"
        );
    }

    #[test]
    fn test_start_banner() {
        assert_eq!(
            start_banner(3, Path::new("out"), 10, 8),
            "Downloading 3 files to out using up to 10 concurrent connections and 8 parts for large files..."
        );
        assert_eq!(
            start_banner(3, Path::new("out"), 4, 1),
            "Downloading 3 files to out using up to 4 concurrent connections..."
        );
    }

    #[test]
    fn test_result_lines() {
        let done = BatchResult {
            successful_count: 2,
            failed_count: 1,
            total_requested: 3,
        };
        assert_eq!(
            result_lines(&done),
            vec!["Successfully downloaded 2 of 3 files", "Failed to download 1 files"]
        );

        let clean = BatchResult {
            successful_count: 3,
            failed_count: 0,
            total_requested: 3,
        };
        assert_eq!(result_lines(&clean), vec!["Successfully downloaded 3 of 3 files"]);

        let declined = BatchResult {
            total_requested: 3,
            ..BatchResult::default()
        };
        assert_eq!(result_lines(&declined), vec!["Download cancelled"]);
    }

    #[test]
    fn test_objects_table_newest_first() {
        let objects: Vec<_> = (1..=25)
            .map(|day| object(&format!("f{}.csv", day), 10, day))
            .collect();

        let table = objects_table(&objects, OBJECT_LIMIT);

        assert_eq!(table.len(), OBJECT_LIMIT);
        let first = table.get_row(0).unwrap().get_cell(2).unwrap().get_content();
        assert_eq!(first, "f25.csv");
    }

    #[test]
    fn test_summary_tables() {
        let summary = summarize(&[object("a.csv", 300, 1), object("b.json", 100, 1)]);

        let (main, types) = summary_tables(&summary);
        let types = types.unwrap();

        assert_eq!(main.len(), 2);
        assert_eq!(types.len(), 2);
        assert_eq!(types.get_row(0).unwrap().get_cell(0).unwrap().get_content(), ".csv");
        assert_eq!(types.get_row(0).unwrap().get_cell(3).unwrap().get_content(), "75.00%");
    }
}
