use std::{
    collections::HashMap,
    io::{self, Write},
    sync::Mutex,
};

use coop_core::event::{Event, ProgressSink};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::fmt::MakeWriter;

const BAR_TEMPLATE: &str =
    "{msg:30} [{bar:40.cyan/blue}] {percent:>3}% {bytes}/{total_bytes} {bytes_per_sec} ({eta})";

/// One progress bar per object in flight.
pub struct BarSink {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<usize, ProgressBar>>,
}

impl BarSink {
    pub fn new(multi: MultiProgress) -> Self {
        let style = match ProgressStyle::with_template(BAR_TEMPLATE) {
            Ok(style) => style.progress_chars("#>-"),
            Err(_) => ProgressStyle::default_bar(),
        };
        BarSink {
            multi,
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn take_bar(&self, id: usize) -> Option<ProgressBar> {
        match self.bars.lock() {
            Ok(mut bars) => bars.remove(&id),
            Err(_) => None,
        }
    }

    fn with_bar(&self, id: usize, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(&id) {
                f(bar);
            }
        }
    }
}

impl ProgressSink for BarSink {
    fn on_event(&self, event: Event) {
        match event {
            Event::Started { id, name, total } => {
                let bar = self.multi.add(ProgressBar::new(total));
                bar.set_style(self.style.clone());
                bar.set_message(name);
                if let Ok(mut bars) = self.bars.lock() {
                    bars.insert(id, bar);
                }
            }
            Event::Advanced { id, bytes } => self.with_bar(id, |bar| bar.inc(bytes)),
            Event::Position { id, completed } => {
                self.with_bar(id, |bar| bar.set_position(completed))
            }
            Event::Reset { id } => self.with_bar(id, |bar| bar.reset()),
            Event::Finished { id } => {
                if let Some(bar) = self.take_bar(id) {
                    bar.finish();
                }
            }
            Event::Withdrawn { id } => {
                if let Some(bar) = self.take_bar(id) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }
        }
    }
}

/// Log sink that hides the bars while a line is written.
#[derive(Clone)]
pub struct LogWriter {
    multi: MultiProgress,
}

impl LogWriter {
    pub fn new(multi: MultiProgress) -> Self {
        LogWriter { multi }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.multi.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.multi.suspend(|| io::stderr().flush())
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
