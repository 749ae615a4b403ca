//! Output sinks for setup, finish, and check streams.
//!
//! Two writers with different failure contracts:
//!
//! - [`SetupSink`]: tees start-pipeline output to the instance log file and
//!   an in-memory capture. The capture seeds the instance's rolling buffer
//!   and is flushed to the client after the JSON response.
//! - [`ResilientWriter`]: fans finish/check command output to the log file
//!   (best-effort) and the client connection, which is marked unhealthy on
//!   its first write error. The producer always sees success, so a client
//!   disconnect can never abort a running command.
//!
//! Both are cheap clones around a shared mutex, so concurrent command
//! threads interleave whole writes instead of corrupting each other.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

struct SetupInner {
    log: Option<File>,
    captured: Vec<u8>,
}

/// Tee for start-pipeline output: log file + captured bytes.
#[derive(Clone)]
pub struct SetupSink {
    inner: Arc<Mutex<SetupInner>>,
}

impl SetupSink {
    pub fn new(log: Option<File>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SetupInner {
                log,
                captured: Vec::new(),
            })),
        }
    }

    /// Snapshot of everything written so far.
    pub fn captured(&self) -> Vec<u8> {
        self.inner.lock().expect("setup sink poisoned").captured.clone()
    }
}

impl Write for SetupSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().expect("setup sink poisoned");
        if let Some(log) = inner.log.as_mut() {
            let _ = log.write_all(buf);
        }
        inner.captured.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("setup sink poisoned");
        if let Some(log) = inner.log.as_mut() {
            let _ = log.flush();
        }
        Ok(())
    }
}

struct ResilientInner {
    log: Option<File>,
    conn: Option<UnixStream>,
    conn_healthy: bool,
}

/// Fan-out writer that never reports failure to the producer.
#[derive(Clone)]
pub struct ResilientWriter {
    inner: Arc<Mutex<ResilientInner>>,
}

impl ResilientWriter {
    pub fn new(log: Option<File>, conn: Option<UnixStream>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResilientInner {
                log,
                conn_healthy: conn.is_some(),
                conn,
            })),
        }
    }

    /// Whether the client connection has survived all writes so far.
    pub fn conn_healthy(&self) -> bool {
        self.inner.lock().expect("resilient writer poisoned").conn_healthy
    }
}

impl Write for ResilientWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().expect("resilient writer poisoned");
        if let Some(log) = inner.log.as_mut() {
            let _ = log.write_all(buf);
        }
        if inner.conn_healthy {
            if let Some(conn) = inner.conn.as_mut() {
                if conn.write_all(buf).is_err() {
                    inner.conn_healthy = false;
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn setup_sink_tees_to_log_and_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.log");
        let log = File::create(&path).unwrap();

        let mut sink = SetupSink::new(Some(log));
        sink.write_all(b"Cloning repo ...\n").unwrap();
        let mut clone = sink.clone();
        clone.write_all(b"done\n").unwrap();
        sink.flush().unwrap();

        assert_eq!(sink.captured(), b"Cloning repo ...\ndone\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"Cloning repo ...\ndone\n");
    }

    #[test]
    fn setup_sink_works_without_log_file() {
        let mut sink = SetupSink::new(None);
        sink.write_all(b"hello").unwrap();
        assert_eq!(sink.captured(), b"hello");
    }

    #[test]
    fn resilient_writer_reaches_both_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.log");
        let log = File::create(&path).unwrap();
        let (client, server) = UnixStream::pair().unwrap();

        let mut w = ResilientWriter::new(Some(log), Some(server));
        w.write_all(b"check output\n").unwrap();
        assert!(w.conn_healthy());

        let mut client = client;
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"check output\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"check output\n");
    }

    #[test]
    fn resilient_writer_survives_dead_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.log");
        let log = File::create(&path).unwrap();
        let (client, server) = UnixStream::pair().unwrap();
        drop(client); // client went away mid-command

        let mut w = ResilientWriter::new(Some(log), Some(server));
        // Writes after the disconnect still succeed from the producer's
        // point of view; the log keeps receiving bytes.
        for _ in 0..4 {
            w.write_all(b"still running\n").unwrap();
        }
        assert!(!w.conn_healthy());
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"still running\nstill running\nstill running\nstill running\n"
        );
    }

    #[test]
    fn resilient_clones_share_health_state() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(client);

        let mut a = ResilientWriter::new(None, Some(server));
        let b = a.clone();
        a.write_all(b"x").unwrap();
        a.write_all(b"y").unwrap();
        assert!(!b.conn_healthy());
    }
}
