//! Unix domain socket server.
//!
//! Accepts connections on `<root>/groved.sock` and hands each one to the
//! supervisor's dispatcher. The accept loop is async so shutdown plumbing
//! stays simple; the dispatcher itself is blocking (PTY fan-out and attach
//! sessions need plain fds), so accepted sockets are converted to `std`
//! streams and served on blocking threads.

use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::error::{GroveError, Result};
use crate::supervisor::Supervisor;

/// Listen on `socket_path` until `shutdown` signals.
///
/// A stale socket file from a previous run is removed before binding, and
/// the socket file is removed again on the way out.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    socket_path: &Path,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(GroveError::Request(format!(
                "remove stale socket {}: {e}",
                socket_path.display()
            )))
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        GroveError::Request(format!("listen on {}: {e}", socket_path.display()))
    })?;

    info!(path = %socket_path.display(), "groved listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let sup = Arc::clone(&supervisor);
                        match stream.into_std() {
                            Ok(stream) => {
                                tokio::task::spawn_blocking(move || {
                                    if stream.set_nonblocking(false).is_err() {
                                        return;
                                    }
                                    sup.handle_conn(stream);
                                });
                            }
                            Err(e) => debug!(error = %e, "could not convert accepted stream"),
                        }
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
            _ = shutdown.wait_for(|&v| v) => {
                info!("shutting down listener");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_ping_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(dir.path()).unwrap();
        let socket_path = sup.socket_path();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn({
            let sup = Arc::clone(&sup);
            let socket_path = socket_path.clone();
            async move { serve(sup, &socket_path, shutdown_rx).await }
        });

        // Wait for the socket file to appear.
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = tokio::task::spawn_blocking({
            let socket_path = socket_path.clone();
            move || {
                let mut conn = UnixStream::connect(&socket_path).unwrap();
                conn.write_all(b"{\"type\":\"ping\"}\n").unwrap();
                let mut line = String::new();
                BufReader::new(conn).read_line(&mut line).unwrap();
                line
            }
        })
        .await
        .unwrap();
        assert_eq!(response.trim(), r#"{"ok":true}"#);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket_path.exists(), "socket file must be removed on shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(dir.path()).unwrap();
        let socket_path = sup.socket_path();
        std::fs::write(&socket_path, b"stale").unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn({
            let sup = Arc::clone(&sup);
            let socket_path = socket_path.clone();
            async move { serve(sup, &socket_path, shutdown_rx).await }
        });

        for _ in 0..100 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(UnixStream::connect(&socket_path).is_ok());

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
