use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use time::{OffsetDateTime, macros::format_description};
use tokio::{sync::mpsc, task::JoinHandle};

/// Append-only plain-text log of one run.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
}

impl LogSink {
    /// `<logs_dir>/<game>/<instance>/<YYYY-MM-DD_HH-MM-SS>.log`, never reusing an existing file.
    pub fn create(logs_dir: &Path, game: &str, instance: &str) -> anyhow::Result<Self> {
        let dir = logs_dir.join(path_segment(game)).join(path_segment(instance));
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year]-[month]-[day]_[hour]-[minute]-[second]"
            ))
            .context("format log timestamp")?;

        for attempt in 0..1000u32 {
            let name = if attempt == 0 {
                format!("{stamp}.log")
            } else {
                format!("{stamp}-{attempt}.log")
            };
            let path = dir.join(name);
            match std::fs::OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => return Ok(Self { path, file }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
            }
        }
        anyhow::bail!("too many log files for {stamp} in {}", dir.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }
}

fn path_segment(s: &str) -> String {
    let out: String = s
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "_".to_string() } else { out }
}

fn strip_newline(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// Reads `source` line by line on a dedicated thread until EOF.
///
/// Every line is appended to `sink` before it is handed to the receiver, in
/// production order. The channel closes at EOF. Lines that are not UTF-8 stay in
/// the sink but are not forwarded.
pub fn spawn_tail<R>(source: R, mut sink: LogSink) -> std::io::Result<mpsc::UnboundedReceiver<String>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let thread_name = format!(
        "tail-{}",
        sink.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    std::thread::Builder::new().name(thread_name).spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::with_capacity(256);
        let mut sink_failed = false;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, path = %sink.path.display(), "output read failed");
                    break;
                }
            }
            strip_newline(&mut buf);

            if let Err(e) = sink.write_line(&buf) {
                if !sink_failed {
                    tracing::warn!(error = %e, path = %sink.path.display(), "log sink write failed");
                }
                sink_failed = true;
            }

            match std::str::from_utf8(&buf) {
                // A closed receiver means nobody dispatches anymore; keep draining into the sink.
                Ok(line) => {
                    let _ = tx.send(line.to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %sink.path.display(), "skipping non-UTF-8 output line");
                }
            }
        }
        tracing::debug!(path = %sink.path.display(), "output stream closed");
    })?;

    Ok(rx)
}

/// [`spawn_tail`] with a callback invoked once per line, one at a time. The task
/// finishes when the stream reaches EOF.
pub fn tail_with<R, F>(source: R, sink: LogSink, mut on_line: F) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    let mut rx = spawn_tail(source, sink)?;
    Ok(tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            on_line(line);
        }
    }))
}
