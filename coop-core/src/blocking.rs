//! Thread pool engine for hosts that cannot start an async runtime.
//!
//! Every object is fetched whole with a blocking client; there is no range
//! probing and no multipart.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rayon::ThreadPoolBuilder;
use reqwest::blocking::Client;
use tracing::{debug, error, warn};

use crate::{
    download::ObjectDescriptor,
    downloader::BatchResult,
    errors::{CoopError, CoopResult},
    event::{Event, ProgressSink},
    fetch::{WHOLE_CHUNK_SIZE, WHOLE_TIMEOUT},
};

/// Downloads `batch` with `workers` threads. Objects are started in batch
/// order.
pub fn download_blocking(
    batch: Vec<ObjectDescriptor>,
    output_dir: &Path,
    workers: usize,
    quiet: bool,
    progress: Arc<dyn ProgressSink>,
) -> CoopResult<BatchResult> {
    let total_requested = batch.len();
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("coop-download-{}", i))
        .build()
        .map_err(|e| CoopError::Scheduler(e.to_string()))?;

    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    // The blocking client owns a runtime of its own, so it is created and
    // dropped on a pool thread.
    pool.install(|| -> CoopResult<()> {
        let client = Client::builder().timeout(WHOLE_TIMEOUT).build()?;
        rayon::scope_fifo(|scope| {
            for (id, descriptor) in batch.iter().enumerate() {
                let client = &client;
                let progress = progress.as_ref();
                let successful = &successful;
                let failed = &failed;
                scope.spawn_fifo(move |_| {
                    if download_one(client, descriptor, output_dir, id, quiet, progress) {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        Ok(())
    })?;

    Ok(BatchResult {
        successful_count: successful.into_inner(),
        failed_count: failed.into_inner(),
        total_requested,
    })
}

fn download_one(
    client: &Client,
    descriptor: &ObjectDescriptor,
    output_dir: &Path,
    id: usize,
    quiet: bool,
    progress: &dyn ProgressSink,
) -> bool {
    let destination = descriptor.destination(output_dir);
    progress.on_event(Event::Started {
        id,
        name: descriptor.file_name().to_string(),
        total: descriptor.size,
    });

    match fetch_whole_blocking(client, &descriptor.download_url, &destination, progress, id) {
        Ok(written) => {
            debug!(key = %descriptor.key, written, "downloaded");
            progress.on_event(Event::Finished { id });
            true
        }
        Err(e) => {
            if !quiet {
                error!(key = %descriptor.key, error = %e, "download failed");
            }
            match fs::remove_file(&destination) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %destination.display(), error = %e, "could not remove partial download"),
            }
            progress.on_event(Event::Withdrawn { id });
            false
        }
    }
}

/// Blocking counterpart of [`crate::fetch::fetch_whole`].
pub fn fetch_whole_blocking(
    client: &Client,
    url: &str,
    destination: &Path,
    progress: &dyn ProgressSink,
    id: usize,
) -> CoopResult<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| CoopError::storage(parent, e))?;
    }

    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(CoopError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let mut file = File::create(destination).map_err(|e| CoopError::storage(destination, e))?;
    let mut buffer = vec![0u8; WHOLE_CHUNK_SIZE];
    let mut completed = 0;
    loop {
        let read = fill(&mut response, &mut buffer).map_err(|e| CoopError::Transfer {
            url: url.to_string(),
            source: e,
        })?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|e| CoopError::storage(destination, e))?;
        completed += read as u64;
        progress.on_event(Event::Position { id, completed });
    }
    file.flush().map_err(|e| CoopError::storage(destination, e))?;
    Ok(completed)
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use chrono::Utc;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl ProgressSink for Recorder {
        fn on_event(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn object(server: &MockServer, key: &str, size: u64) -> ObjectDescriptor {
        ObjectDescriptor {
            key: key.to_string(),
            size,
            download_url: format!("{}/bucket/{}", server.uri(), key),
            last_modified: Utc::now(),
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn test_fill_reads_across_short_reads() {
        let mut reader = io::Cursor::new(vec![7u8; 10]).chain(io::Cursor::new(vec![9u8; 10]));
        let mut buf = [0u8; 15];

        assert_eq!(fill(&mut reader, &mut buf).unwrap(), 15);
        assert_eq!(fill(&mut reader, &mut buf).unwrap(), 5);
        assert_eq!(fill(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_download_blocking_counts_each_object_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        let big = body(400_000);
        let small = body(2048);
        rt.block_on(async {
            Mock::given(method("GET"))
                .and(path("/bucket/data/big.bin"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(big.clone()))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/bucket/data/small.csv"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(small.clone()))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/bucket/data/gone.csv"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;
        });
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let batch = vec![
            object(&server, "data/big.bin", big.len() as u64),
            object(&server, "data/small.csv", small.len() as u64),
            object(&server, "data/gone.csv", 10),
        ];

        let result = download_blocking(batch, dir.path(), 10, true, recorder.clone()).unwrap();

        assert_eq!(
            result,
            BatchResult {
                successful_count: 2,
                failed_count: 1,
                total_requested: 3
            }
        );
        assert_eq!(fs::read(dir.path().join("data/big.bin")).unwrap(), big);
        assert_eq!(fs::read(dir.path().join("data/small.csv")).unwrap(), small);
        assert!(!dir.path().join("data/gone.csv").exists());

        let events = recorder.0.lock().unwrap();
        let finished: HashSet<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::Finished { id } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(finished, HashSet::from([0, 1]));
        assert!(events.contains(&Event::Withdrawn { id: 2 }));
        assert!(events.contains(&Event::Position {
            id: 0,
            completed: big.len() as u64
        }));
    }
}
