//! Progress reporting
//!
//! Observes the pipeline's [`Event`] broadcast and renders it with
//! `indicatif`, or as periodic log lines when stderr is not a terminal.
//! Nothing here feeds back into the pipeline.

use crate::config::ProgressMode;
use crate::types::{Event, JobId, Stage};
use crate::utils::format_size;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often plain mode logs a status line
const PLAIN_INTERVAL: Duration = Duration::from_secs(10);

/// Running totals derived from events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Jobs announced by all batches so far
    pub jobs_total: usize,
    /// Jobs whose body finished downloading
    pub downloaded: usize,
    /// Jobs that finished the whole pipeline
    pub done: usize,
    /// Jobs skipped as already transferred
    pub skipped: usize,
    /// Jobs that failed at any stage
    pub failed: usize,
    /// Downloads currently running
    pub in_flight: usize,
    /// Sum of known sizes
    pub bytes_total: u64,
    /// Bytes received so far
    pub bytes_done: u64,
}

impl ProgressSnapshot {
    /// Fold one event into the totals
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BatchStarted { jobs, total_bytes } => {
                self.jobs_total += jobs;
                self.bytes_total += total_bytes;
            }
            Event::DownloadStarted { .. } => self.in_flight += 1,
            Event::Downloading { delta_bytes, .. } => self.bytes_done += delta_bytes,
            Event::DownloadComplete { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.downloaded += 1;
            }
            Event::JobDone { .. } => self.done += 1,
            Event::JobSkipped { .. } => self.skipped += 1,
            Event::JobFailed { stage, .. } => {
                if *stage == Stage::Download {
                    self.in_flight = self.in_flight.saturating_sub(1);
                }
                self.failed += 1;
            }
            _ => {}
        }
    }

    /// One-line human summary
    pub fn line(&self) -> String {
        let mut line = format!(
            "{}/{} files, {} of {}",
            self.downloaded,
            self.jobs_total.saturating_sub(self.skipped),
            format_size(self.bytes_done),
            format_size(self.bytes_total),
        );
        if self.in_flight > 0 {
            line.push_str(&format!(", {} active", self.in_flight));
        }
        if self.skipped > 0 {
            line.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.failed > 0 {
            line.push_str(&format!(", {} failed", self.failed));
        }
        line
    }
}

/// Downgrade bar modes to plain output when stderr is not a terminal
pub fn resolve_mode(requested: ProgressMode, stderr_is_terminal: bool) -> ProgressMode {
    match requested {
        ProgressMode::MultiLine | ProgressMode::OneLine if !stderr_is_terminal => {
            ProgressMode::Plain
        }
        other => other,
    }
}

/// Owns the terminal area the bars draw into
#[derive(Clone)]
pub struct ProgressDisplay {
    mode: ProgressMode,
    multi: MultiProgress,
}

impl ProgressDisplay {
    /// Create a display for the given mode
    pub fn new(mode: ProgressMode) -> Self {
        let target = match mode {
            ProgressMode::MultiLine | ProgressMode::OneLine => ProgressDrawTarget::stderr(),
            ProgressMode::Plain | ProgressMode::Off => ProgressDrawTarget::hidden(),
        };
        Self {
            mode,
            multi: MultiProgress::with_draw_target(target),
        }
    }

    /// Active mode
    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    /// Writer for log output that does not tear the bars
    pub fn log_writer(&self) -> LogWriter {
        LogWriter {
            multi: self.multi.clone(),
        }
    }

    /// Start rendering events from `rx`
    pub fn spawn(&self, rx: broadcast::Receiver<Event>) -> ProgressHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(render(self.mode, self.multi.clone(), rx, stop.clone()));
        ProgressHandle { stop, task }
    }
}

/// Running reporter task
pub struct ProgressHandle {
    stop: CancellationToken,
    task: JoinHandle<ProgressSnapshot>,
}

impl ProgressHandle {
    /// Drain pending events, clear the bars and return the final totals
    pub async fn finish(self) -> ProgressSnapshot {
        self.stop.cancel();
        self.task.await.unwrap_or_default()
    }
}

/// `tracing` writer that suspends the bars while a line is printed
#[derive(Clone)]
pub struct LogWriter {
    multi: MultiProgress,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.multi.suspend(|| std::io::stderr().write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn total_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

fn file_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg:40!} [{bar:30.green/white}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Bars for the two terminal modes
struct Bars {
    total: ProgressBar,
    files: HashMap<JobId, ProgressBar>,
    per_file: bool,
    multi: MultiProgress,
}

impl Bars {
    fn new(multi: MultiProgress, per_file: bool) -> Self {
        let total = multi.add(ProgressBar::new(0));
        total.set_style(total_style());
        total.set_prefix("total");
        Self {
            total,
            files: HashMap::new(),
            per_file,
            multi,
        }
    }

    fn update(&mut self, event: &Event, snapshot: &ProgressSnapshot) {
        self.total.set_length(snapshot.bytes_total);
        self.total.set_position(snapshot.bytes_done);
        self.total.set_message(format!(
            "{}/{} files",
            snapshot.downloaded,
            snapshot.jobs_total.saturating_sub(snapshot.skipped)
        ));

        if !self.per_file {
            return;
        }
        match event {
            Event::DownloadStarted {
                id,
                name,
                total_bytes,
            } => {
                let bar = self.multi.add(ProgressBar::new(total_bytes.unwrap_or(0)));
                bar.set_style(file_style());
                bar.set_message(name.clone());
                self.files.insert(*id, bar);
            }
            Event::Downloading {
                id,
                downloaded_bytes,
                total_bytes,
                ..
            } => {
                if let Some(bar) = self.files.get(id) {
                    if let Some(total) = total_bytes {
                        bar.set_length(*total);
                    }
                    bar.set_position(*downloaded_bytes);
                }
            }
            Event::DownloadComplete { id } | Event::JobFailed { id, .. } => {
                if let Some(bar) = self.files.remove(id) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
            }
            _ => {}
        }
    }

    fn finish(self) {
        for bar in self.files.values() {
            bar.finish_and_clear();
        }
        self.total.finish_and_clear();
    }
}

fn observe(event: Event, snapshot: &mut ProgressSnapshot, bars: &mut Option<Bars>) {
    snapshot.apply(&event);
    if let Some(bars) = bars.as_mut() {
        bars.update(&event, snapshot);
    }
}

async fn render(
    mode: ProgressMode,
    multi: MultiProgress,
    mut rx: broadcast::Receiver<Event>,
    stop: CancellationToken,
) -> ProgressSnapshot {
    let mut snapshot = ProgressSnapshot::default();
    let mut bars = match mode {
        ProgressMode::MultiLine => Some(Bars::new(multi, true)),
        ProgressMode::OneLine => Some(Bars::new(multi, false)),
        ProgressMode::Plain | ProgressMode::Off => None,
    };
    let mut ticker = tokio::time::interval(PLAIN_INTERVAL);
    ticker.tick().await;
    let mut last_logged = snapshot;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => observe(event, &mut snapshot, &mut bars),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress reporter lagged behind events");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick(), if mode == ProgressMode::Plain => {
                if snapshot != last_logged {
                    tracing::info!("progress: {}", snapshot.line());
                    last_logged = snapshot;
                }
            }
            _ = stop.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    observe(event, &mut snapshot, &mut bars);
                }
                break;
            }
        }
    }

    if let Some(bars) = bars {
        bars.finish();
    }
    snapshot
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: u64, size: u64) -> Event {
        Event::DownloadStarted {
            id: JobId(id),
            name: format!("f{}.bin", id),
            total_bytes: Some(size),
        }
    }

    #[test]
    fn snapshot_tracks_a_batch() {
        let mut s = ProgressSnapshot::default();
        for event in [
            Event::BatchStarted {
                jobs: 3,
                total_bytes: 300,
            },
            Event::JobSkipped {
                id: JobId(3),
                name: "f3.bin".into(),
            },
            started(1, 100),
            started(2, 100),
            Event::Downloading {
                id: JobId(1),
                downloaded_bytes: 100,
                total_bytes: Some(100),
                delta_bytes: 100,
            },
            Event::DownloadComplete { id: JobId(1) },
            Event::JobFailed {
                id: JobId(2),
                stage: Stage::Download,
                error: "boom".into(),
            },
            Event::JobDone { id: JobId(1) },
        ] {
            s.apply(&event);
        }

        assert_eq!(
            s,
            ProgressSnapshot {
                jobs_total: 3,
                downloaded: 1,
                done: 1,
                skipped: 1,
                failed: 1,
                in_flight: 0,
                bytes_total: 300,
                bytes_done: 100,
            }
        );
        assert_eq!(
            s.line(),
            "1/2 files, 100.00 B of 300.00 B, 1 skipped, 1 failed"
        );
    }

    #[test]
    fn extraction_failures_do_not_touch_in_flight() {
        let mut s = ProgressSnapshot::default();
        s.apply(&started(1, 10));
        s.apply(&started(2, 10));
        s.apply(&Event::JobFailed {
            id: JobId(3),
            stage: Stage::Extract,
            error: "corrupt".into(),
        });
        assert_eq!(s.in_flight, 2);
        assert_eq!(s.failed, 1);
    }

    #[test]
    fn bar_modes_fall_back_to_plain_without_terminal() {
        assert_eq!(resolve_mode(ProgressMode::MultiLine, false), ProgressMode::Plain);
        assert_eq!(resolve_mode(ProgressMode::OneLine, false), ProgressMode::Plain);
        assert_eq!(resolve_mode(ProgressMode::Off, false), ProgressMode::Off);
        assert_eq!(resolve_mode(ProgressMode::OneLine, true), ProgressMode::OneLine);
    }

    #[tokio::test]
    async fn reporter_drains_events_on_finish() {
        let (tx, rx) = broadcast::channel(16);
        let display = ProgressDisplay::new(ProgressMode::Off);
        let handle = display.spawn(rx);

        tx.send(Event::BatchStarted {
            jobs: 2,
            total_bytes: 20,
        })
        .unwrap();
        tx.send(started(1, 10)).unwrap();
        tx.send(Event::DownloadComplete { id: JobId(1) }).unwrap();

        let snapshot = handle.finish().await;
        assert_eq!(snapshot.jobs_total, 2);
        assert_eq!(snapshot.downloaded, 1);
    }

    #[tokio::test]
    async fn hidden_bars_still_count() {
        let (tx, rx) = broadcast::channel(16);
        let display = ProgressDisplay {
            mode: ProgressMode::MultiLine,
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        };
        let handle = display.spawn(rx);
        tx.send(started(1, 10)).unwrap();
        drop(tx);

        let snapshot = handle.finish().await;
        assert_eq!(snapshot.in_flight, 1);
    }
}
