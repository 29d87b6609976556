//! Output routing for supervised processes.
//!
//! Every child stream and every status message ends up as one line on a single
//! display stream. The `OutputRouter` owns that stream behind a mutex so lines
//! from concurrent replicas never interleave, and renders the label column
//! (padding, color, elapsed time).

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Label used for status lines that do not belong to a single process.
pub const SYSTEM_LABEL: &str = "procrack";

// Rotating label colors, indexed by template slot.
const PALETTE: [&str; 6] = ["36", "33", "32", "35", "34", "31"];
const SYSTEM_COLOR: &str = "1;37";

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Display settings for the router.
#[derive(Debug, Clone, Copy)]
pub struct OutputSettings {
    /// Width of the label column.
    pub padding: usize,
    /// Colorize labels (and keep child ANSI codes).
    pub color: bool,
    /// Prefix lines with the elapsed run time.
    pub timestamp: bool,
}

/// Serializes labeled lines from many tasks onto one writer.
pub struct OutputRouter {
    writer: Mutex<Box<dyn Write + Send>>,
    settings: OutputSettings,
    start: Instant,
}

impl OutputRouter {
    /// Creates a router writing to stdout.
    pub fn new(settings: OutputSettings) -> Self {
        Self::with_writer(settings, Box::new(std::io::stdout()))
    }

    pub fn with_writer(settings: OutputSettings, writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            settings,
            start: Instant::now(),
        }
    }

    /// Creates an outlet for one stream of one replica.
    pub fn sink(self: &Arc<Self>, label: &str, slot: usize, stream: StreamKind) -> Outlet {
        Outlet {
            router: Arc::clone(self),
            label: label.to_string(),
            slot,
            stream,
        }
    }

    /// Writes a status line attributed to procrack itself.
    pub fn system(&self, text: impl AsRef<str>) {
        let line = self.format_line(SYSTEM_LABEL, SYSTEM_COLOR, text.as_ref());
        self.write_line(&line);
    }

    /// Reports an unrecoverable configuration error and exits.
    pub fn fatal(&self, text: impl AsRef<str>) -> ! {
        let _ = self.writer.lock().map(|mut writer| writer.flush());
        fatal(text.as_ref(), self.settings.color)
    }

    fn process_line(&self, label: &str, slot: usize, stream: StreamKind, text: &str) {
        let text = sanitize_text(text, !self.settings.color);
        let color = match stream {
            StreamKind::Stdout => PALETTE[slot % PALETTE.len()],
            StreamKind::Stderr => "1;31",
        };
        let line = self.format_line(label, color, &text);
        self.write_line(&line);
    }

    fn format_line(&self, label: &str, color: &str, text: &str) -> String {
        let mut prefix = String::new();
        if self.settings.timestamp {
            prefix.push_str(&self.elapsed());
            prefix.push(' ');
        }
        let padded = format!("{:<width$} |", label, width = self.settings.padding);
        prefix.push_str(&apply_color(&padded, color, self.settings.color));
        format!("{} {}", prefix, text)
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }

    fn write_line(&self, line: &str) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }
}

/// One child stream attached to the router.
pub struct Outlet {
    router: Arc<OutputRouter>,
    label: String,
    slot: usize,
    stream: StreamKind,
}

impl Outlet {
    /// Forwards `reader` line by line until it closes.
    pub async fn pump<R>(self, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    self.router
                        .process_line(&self.label, self.slot, self.stream, &line)
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(label = %self.label, stream = ?self.stream, error = %err, "stream read failed");
                    break;
                }
            }
        }
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Prints an `ERROR:` line to stderr and exits with status 1.
pub fn fatal(text: &str, color: bool) -> ! {
    eprintln!("{}", format_fatal(text, color));
    std::process::exit(1);
}

pub fn format_fatal(text: &str, color: bool) -> String {
    apply_color(&format!("ERROR: {}", text), "1;31", color)
}

fn apply_color(text: &str, code: &str, enabled: bool) -> String {
    if enabled {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, text)
    } else {
        text.to_string()
    }
}

/// In-memory writer shared between a router and a test.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub fn test_router(buffer: &SharedBuffer) -> Arc<OutputRouter> {
    let settings = OutputSettings {
        padding: 10,
        color: false,
        timestamp: false,
    };
    Arc::new(OutputRouter::with_writer(settings, Box::new(buffer.clone())))
}
