/// Progress notifications emitted while a batch is running.
///
/// `id` identifies one object of the batch (its position after sorting).
/// Events are observational only; nothing in the downloader waits on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The object was admitted and its transfer is starting.
    Started { id: usize, name: String, total: u64 },
    /// Incremental bytes written by one part of a multipart transfer.
    Advanced { id: usize, bytes: u64 },
    /// Cumulative bytes written by a whole-object transfer.
    Position { id: usize, completed: u64 },
    /// Multipart attempt abandoned, counting restarts from zero.
    Reset { id: usize },
    Finished { id: usize },
    /// Terminal failure, the row should disappear.
    Withdrawn { id: usize },
}

impl Event {
    pub fn id(&self) -> usize {
        match self {
            Event::Started { id, .. }
            | Event::Advanced { id, .. }
            | Event::Position { id, .. }
            | Event::Reset { id }
            | Event::Finished { id }
            | Event::Withdrawn { id } => *id,
        }
    }
}

/// Receiver of download [`Event`]s. Called from async tasks and from worker
/// threads, so implementations must be thread safe.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: Event) {}
}
