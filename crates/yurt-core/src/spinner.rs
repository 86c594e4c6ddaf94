//! Progress indicator shown while slow commands or waits are in flight.
//!
//! Purely cosmetic. Rendering failures are ignored and nothing here
//! influences the result of the work it accompanies. Nothing is drawn when
//! stderr is not a terminal, so redirected logs stay clean.

use std::future::Future;
use std::io::{IsTerminal, Write};
use std::time::Duration;
use tokio::sync::oneshot;

/// Frames rendered in order, then repeated.
pub const FRAMES: [&str; 6] = [".  ", ".. ", "...", " ..", "  .", "   "];

/// Time between two redraws.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Width blanked out when clearing the line.
const CLEAR_WIDTH: usize = 80;

/// Rotating-frame ticker redrawn in place on a line-oriented sink.
pub struct Spinner<W: Write> {
    out: W,
    frame: usize,
}

impl Spinner<std::io::Stderr> {
    /// Spinner drawing on standard error.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write> Spinner<W> {
    /// Create a spinner drawing on `out`.
    pub fn new(out: W) -> Self {
        Self { out, frame: 0 }
    }

    /// Redraw frames until `done` completes, then clear the line.
    ///
    /// The line is cleared before the first frame and again after `done`
    /// resolves, so nothing is left behind on the sink whichever way the
    /// accompanied work ended.
    pub async fn run_until<F: Future>(&mut self, done: F) -> F::Output {
        self.clear();
        tokio::pin!(done);
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);

        let output = loop {
            tokio::select! {
                biased;

                output = &mut done => break output,
                _ = ticker.tick() => self.render_next(),
            }
        };

        self.clear();
        output
    }

    /// Consume the spinner and return its sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn render_next(&mut self) {
        let frame = FRAMES[self.frame % FRAMES.len()];
        self.frame = self.frame.wrapping_add(1);
        let _ = write!(self.out, "\r{frame}\r");
        let _ = self.out.flush();
    }

    fn clear(&mut self) {
        let _ = write!(self.out, "\r{}\r", " ".repeat(CLEAR_WIDTH));
        let _ = self.out.flush();
    }
}

/// Whether the stderr indicator should be drawn.
fn indicator_enabled(requested: bool, stderr_is_terminal: bool) -> bool {
    requested && stderr_is_terminal
}

/// Await `work` while a stderr spinner runs on a separate task.
///
/// Returns only after the spinner task has cleared its line. Without a
/// terminal on stderr this is just `work.await`.
pub async fn show_while<F: Future>(work: F) -> F::Output {
    if !indicator_enabled(true, std::io::stderr().is_terminal()) {
        return work.await;
    }

    let (done_tx, done_rx) = oneshot::channel::<()>();

    let ticker = tokio::spawn(async move {
        let mut spinner = Spinner::stderr();
        spinner
            .run_until(async move {
                let _ = done_rx.await;
            })
            .await;
    });

    let output = work.await;

    let _ = done_tx.send(());
    if let Err(e) = ticker.await {
        tracing::debug!(error = %e, "Progress indicator task failed");
    }

    output
}

/// Sleep for `duration`, optionally rendering the spinner meanwhile.
pub async fn sleep_for(duration: Duration, show_indicator: bool) {
    if indicator_enabled(show_indicator, std::io::stderr().is_terminal()) {
        Spinner::stderr()
            .run_until(tokio::time::sleep(duration))
            .await;
    } else {
        tokio::time::sleep(duration).await;
    }
}
