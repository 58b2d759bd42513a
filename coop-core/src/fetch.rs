//! Single HTTP transfers: the range probe, one part of a multipart
//! transfer, and a whole object in one request.

use std::{path::Path, time::Duration};

use futures_util::StreamExt;
use reqwest::{
    header::{self, HeaderMap},
    Client, StatusCode,
};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
};
use tracing::debug;

use crate::{
    download::PartSpec,
    errors::{CoopError, CoopResult},
    event::{Event, ProgressSink},
    storage::prepare_parent,
};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PART_TIMEOUT: Duration = Duration::from_secs(60);
pub const WHOLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Write size for part transfers (64 KiB).
pub const PART_CHUNK_SIZE: usize = 64 * 1024;
/// Write size for whole-object transfers (128 KiB).
pub const WHOLE_CHUNK_SIZE: usize = 128 * 1024;

/// Asks the server whether `url` honors byte-range requests.
///
/// Any failure counts as "no": the caller then takes the single-request
/// path, which works against every server.
pub async fn probe_range_support(client: &Client, url: &str) -> bool {
    match client.head(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => accepts_byte_ranges(response.headers()),
        Err(e) => {
            debug!(url, error = %e, "range probe failed");
            false
        }
    }
}

pub(crate) fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

/// Downloads one byte range into the part's temp file.
///
/// Only `206 Partial Content` is accepted. The temp file is left behind on
/// failure; removing it is the caller's job.
pub async fn fetch_part(
    client: &Client,
    url: &str,
    part: &PartSpec,
    progress: &dyn ProgressSink,
    id: usize,
) -> CoopResult<u64> {
    let response = client
        .get(url)
        .header(header::RANGE, part.range_header())
        .timeout(PART_TIMEOUT)
        .send()
        .await?;

    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(CoopError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let file = File::create(&part.temp_path)
        .await
        .map_err(|e| CoopError::storage(&part.temp_path, e))?;
    let mut writer = ChunkedWriter::new(file, &part.temp_path, PART_CHUNK_SIZE);
    let mut received = 0;

    let mut stream = response.bytes_stream();
    while let Some(bytes) = stream.next().await {
        let flushed = writer.write(&bytes?).await?;
        if flushed > 0 {
            received += flushed;
            progress.on_event(Event::Advanced { id, bytes: flushed });
        }
    }
    let flushed = writer.finish().await?;
    if flushed > 0 {
        received += flushed;
        progress.on_event(Event::Advanced { id, bytes: flushed });
    }

    if received != part.len() {
        return Err(CoopError::Truncated {
            path: part.temp_path.clone(),
            expected: part.len(),
            received,
        });
    }
    Ok(received)
}

/// Downloads the whole object to `destination`, reporting cumulative
/// progress. A partially written file is left in place on failure.
pub async fn fetch_whole(
    client: &Client,
    url: &str,
    destination: &Path,
    progress: &dyn ProgressSink,
    id: usize,
) -> CoopResult<u64> {
    prepare_parent(destination).await?;

    let response = client.get(url).timeout(WHOLE_TIMEOUT).send().await?;
    if !response.status().is_success() {
        return Err(CoopError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let file = File::create(destination)
        .await
        .map_err(|e| CoopError::storage(destination, e))?;
    let mut writer = ChunkedWriter::new(file, destination, WHOLE_CHUNK_SIZE);
    let mut completed = 0;

    let mut stream = response.bytes_stream();
    while let Some(bytes) = stream.next().await {
        let flushed = writer.write(&bytes?).await?;
        if flushed > 0 {
            completed += flushed;
            progress.on_event(Event::Position { id, completed });
        }
    }
    let flushed = writer.finish().await?;
    if flushed > 0 {
        completed += flushed;
        progress.on_event(Event::Position { id, completed });
    }

    Ok(completed)
}

/// Buffers network chunks and writes them out in fixed-size blocks.
struct ChunkedWriter<'a> {
    file: File,
    path: &'a Path,
    chunk_size: usize,
    pending: Vec<u8>,
}

impl<'a> ChunkedWriter<'a> {
    fn new(file: File, path: &'a Path, chunk_size: usize) -> Self {
        ChunkedWriter {
            file,
            path,
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
        }
    }

    /// Returns the number of bytes that reached the file during this call.
    async fn write(&mut self, mut data: &[u8]) -> CoopResult<u64> {
        let mut flushed = 0;
        while !data.is_empty() {
            let take = (self.chunk_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.chunk_size {
                flushed += self.flush_pending().await?;
            }
        }
        Ok(flushed)
    }

    async fn flush_pending(&mut self) -> CoopResult<u64> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.file
            .write_all(&self.pending)
            .await
            .map_err(|e| CoopError::storage(self.path, e))?;
        let written = self.pending.len() as u64;
        self.pending.clear();
        Ok(written)
    }

    async fn finish(mut self) -> CoopResult<u64> {
        let written = self.flush_pending().await?;
        self.file
            .flush()
            .await
            .map_err(|e| CoopError::storage(self.path, e))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use wiremock::{
        matchers::{header as header_is, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::download::plan_parts;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl ProgressSink for Recorder {
        fn on_event(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[tokio::test]
    async fn test_probe_reads_accept_ranges() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ranged"))
            .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "bytes"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/plain"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/none"))
            .respond_with(ResponseTemplate::new(200).insert_header("accept-ranges", "none"))
            .mount(&server)
            .await;
        let client = Client::new();

        assert!(probe_range_support(&client, &format!("{}/ranged", server.uri())).await);
        assert!(!probe_range_support(&client, &format!("{}/plain", server.uri())).await);
        assert!(!probe_range_support(&client, &format!("{}/none", server.uri())).await);
        assert!(!probe_range_support(&client, "http://127.0.0.1:1/unreachable").await);
    }

    #[tokio::test]
    async fn test_fetch_part_writes_range() {
        let server = MockServer::start().await;
        let data = body(200_000);
        let dir = tempfile::tempdir().unwrap();
        let parts = plan_parts(data.len() as u64, 2, &dir.path().join("obj"));
        let part = &parts[1];
        let slice = data[part.start_byte as usize..=part.end_byte as usize].to_vec();
        Mock::given(method("GET"))
            .and(header_is("Range", part.range_header().as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(slice.clone()))
            .mount(&server)
            .await;
        let recorder = Recorder::default();

        let received = fetch_part(&Client::new(), &server.uri(), part, &recorder, 4)
            .await
            .unwrap();

        assert_eq!(received, part.len());
        assert_eq!(std::fs::read(&part.temp_path).unwrap(), slice);
        let events = recorder.0.lock().unwrap();
        let advanced: u64 = events
            .iter()
            .map(|e| match e {
                Event::Advanced { id: 4, bytes } => {
                    assert!(*bytes <= PART_CHUNK_SIZE as u64);
                    *bytes
                }
                other => panic!("unexpected event {:?}", other),
            })
            .sum();
        assert_eq!(advanced, part.len());
    }

    #[tokio::test]
    async fn test_fetch_part_rejects_full_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(100)))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let parts = plan_parts(100, 2, &dir.path().join("obj"));

        let result = fetch_part(&Client::new(), &server.uri(), &parts[0], &Recorder::default(), 0).await;

        assert!(matches!(result, Err(CoopError::Status { status, .. }) if status == StatusCode::OK));
        assert!(!parts[0].temp_path.exists());
    }

    #[tokio::test]
    async fn test_fetch_part_detects_short_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body(10)))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let parts = plan_parts(100, 2, &dir.path().join("obj"));

        let result = fetch_part(&Client::new(), &server.uri(), &parts[0], &Recorder::default(), 0).await;

        assert!(matches!(result, Err(CoopError::Truncated { expected: 50, received: 10, .. })));
    }

    #[tokio::test]
    async fn test_fetch_whole_reports_cumulative_progress() {
        let server = MockServer::start().await;
        let data = body(300_000);
        Mock::given(method("GET"))
            .and(path("/bucket/dir/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("dir/file.bin");
        let recorder = Recorder::default();

        let completed = fetch_whole(
            &Client::new(),
            &format!("{}/bucket/dir/file.bin", server.uri()),
            &destination,
            &recorder,
            1,
        )
        .await
        .unwrap();

        assert_eq!(completed, data.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), data);
        let positions: Vec<u64> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                Event::Position { completed, .. } => *completed,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(positions.last().copied(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_fetch_whole_fails_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let result = fetch_whole(
            &Client::new(),
            &server.uri(),
            &dir.path().join("missing.bin"),
            &Recorder::default(),
            0,
        )
        .await;

        assert!(matches!(result, Err(CoopError::Status { status, .. }) if status == StatusCode::NOT_FOUND));
    }
}
