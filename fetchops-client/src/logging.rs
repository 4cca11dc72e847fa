use std::{fs::OpenOptions, io, path::Path, sync::Mutex};

use tracing_subscriber::{EnvFilter, fmt::writer::BoxMakeWriter};

/// Installs the global subscriber, filtered by `RUST_LOG`.
///
/// Logs go to `log_file` when given and openable, otherwise to stderr.
pub fn init_logging(log_file: Option<&Path>) {
    let (writer, ansi) = log_writer(log_file);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(writer)
        .with_ansi(ansi)
        .init();
}

/// Picks the log sink. The flag is whether ANSI colors suit it.
fn log_writer(log_file: Option<&Path>) -> (BoxMakeWriter, bool) {
    let Some(log_path) = log_file else {
        return (BoxMakeWriter::new(io::stderr), true);
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        // Appends from concurrent spans serialize on the mutex.
        Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        Err(err) => {
            // No subscriber yet, so this one goes straight to stderr.
            eprintln!("failed to open log file {}: {err}", log_path.display());
            (BoxMakeWriter::new(io::stderr), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[test]
    fn log_lines_append_to_the_file() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("client.log");
        std::fs::write(&path, "earlier\n").expect("seed log file");

        let (writer, ansi) = log_writer(Some(&path));
        assert!(!ansi);
        writer
            .make_writer()
            .write_all(b"request submitted\n")
            .expect("write log line");

        let contents = std::fs::read_to_string(&path).expect("read log file");
        assert_eq!(contents, "earlier\nrequest submitted\n");
    }

    #[test]
    fn unopenable_log_file_falls_back_to_stderr() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("missing").join("client.log");

        let (_writer, ansi) = log_writer(Some(&path));
        assert!(ansi);
        assert!(!path.exists());
    }
}
