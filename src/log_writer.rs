use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;

pub struct LogEntry {
    pub file_path: PathBuf,
    pub line: String,
}

pub type LogSender = mpsc::UnboundedSender<LogEntry>;

pub fn create_log_channel() -> (LogSender, mpsc::UnboundedReceiver<LogEntry>) {
    mpsc::unbounded_channel()
}

/// One request as recorded in the access log.
pub struct AccessRecord<'a> {
    pub client: &'a str,
    pub user: Option<&'a str>,
    pub time: DateTime<Local>,
    pub request_line: &'a str,
    pub status: u16,
    pub bytes: usize,
}

/// Common Log Format: `%h %l %u %t "%r" %>s %b`.
pub fn format_clf(rec: &AccessRecord<'_>) -> String {
    let bytes = if rec.bytes == 0 {
        "-".to_string()
    } else {
        rec.bytes.to_string()
    };
    format!(
        "{} - {} [{}] \"{}\" {} {}\n",
        rec.client,
        rec.user.filter(|u| !u.is_empty()).unwrap_or("-"),
        rec.time.format("%d/%b/%Y:%H:%M:%S %z"),
        rec.request_line,
        rec.status,
        bytes
    )
}

fn open_log(path: &PathBuf) -> Option<BufWriter<File>> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(BufWriter::with_capacity(8192, file)),
        Err(e) => {
            log::error!("Cannot open access log {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn run_log_writer(mut rx: mpsc::UnboundedReceiver<LogEntry>) {
    let mut writers: HashMap<PathBuf, BufWriter<File>> = HashMap::new();
    let mut count = 0u32;

    loop {
        let entry = tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(e) => e,
                    None => break, // channel closed
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                // Periodic flush
                for w in writers.values_mut() {
                    let _ = w.flush();
                }
                count = 0;
                continue;
            }
        };

        if !writers.contains_key(&entry.file_path) {
            match open_log(&entry.file_path) {
                Some(w) => {
                    writers.insert(entry.file_path.clone(), w);
                }
                None => continue,
            }
        }
        if let Some(writer) = writers.get_mut(&entry.file_path) {
            let _ = writer.write_all(entry.line.as_bytes());
            count += 1;
        }

        if count >= 64 {
            for w in writers.values_mut() {
                let _ = w.flush();
            }
            count = 0;
        }
    }

    // Final flush on shutdown
    for w in writers.values_mut() {
        let _ = w.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_clf() {
        let time = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let line = format_clf(&AccessRecord {
            client: "10.0.0.1",
            user: Some("alice"),
            time,
            request_line: "GET /index.html HTTP/1.1",
            status: 200,
            bytes: 1234,
        });
        assert!(line.starts_with("10.0.0.1 - alice [05/Mar/2024:14:07:09 "));
        assert!(line.ends_with("] \"GET /index.html HTTP/1.1\" 200 1234\n"));
    }

    #[test]
    fn test_format_clf_anonymous_empty_body() {
        let line = format_clf(&AccessRecord {
            client: "::1",
            user: None,
            time: Local::now(),
            request_line: "HEAD / HTTP/1.0",
            status: 304,
            bytes: 0,
        });
        assert!(line.starts_with("::1 - - ["));
        assert!(line.ends_with(" 304 -\n"));
    }

    #[tokio::test]
    async fn test_writer_appends_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let (tx, rx) = create_log_channel();
        let task = tokio::spawn(run_log_writer(rx));
        for i in 0..3 {
            tx.send(LogEntry {
                file_path: path.clone(),
                line: format!("line {}\n", i),
            })
            .unwrap();
        }
        tx.send(LogEntry {
            file_path: dir.path().join("missing/dir/access.log"),
            line: "dropped\n".to_string(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "line 0\nline 1\nline 2\n"
        );
    }
}
