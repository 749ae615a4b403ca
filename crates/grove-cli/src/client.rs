//! Daemon connection helpers.
//!
//! One request per connection: write a JSON line, read a JSON line back.
//! Some commands keep reading raw bytes afterwards (setup output, logs,
//! attach streams), so the response line is read byte-by-byte rather than
//! through a buffered reader that could swallow stream bytes.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context};

use grove_proto::{Request, Response};

/// The grove data root: `$GROVE_ROOT` or `~/.grove`.
pub fn root_dir() -> PathBuf {
    if let Some(root) = std::env::var_os("GROVE_ROOT") {
        return PathBuf::from(root);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".grove")
}

pub fn socket_path() -> PathBuf {
    root_dir().join("groved.sock")
}

/// Connect to the daemon socket with a friendly failure message.
pub fn connect() -> anyhow::Result<UnixStream> {
    let path = socket_path();
    UnixStream::connect(&path).with_context(|| {
        format!(
            "cannot connect to groved at {} (is the daemon running? try: groved)",
            path.display()
        )
    })
}

pub fn write_request(conn: &mut UnixStream, request: &Request) -> anyhow::Result<()> {
    let mut json = serde_json::to_string(request)?;
    json.push('\n');
    conn.write_all(json.as_bytes())?;
    Ok(())
}

/// Read the daemon's single-line JSON response.
pub fn read_response(conn: &mut UnixStream) -> anyhow::Result<Response> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match conn.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    if line.is_empty() {
        bail!("daemon closed the connection without responding");
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Send one request and return the response, failing on `ok=false`.
pub fn call(request: &Request) -> anyhow::Result<Response> {
    let mut conn = connect()?;
    write_request(&mut conn, request)?;
    let resp = read_response(&mut conn)?;
    if !resp.ok {
        bail!("{}", resp.error);
    }
    Ok(resp)
}

/// Copy the remainder of the connection (post-response stream) to stdout.
pub fn stream_to_stdout(conn: &mut UnixStream) {
    let mut stdout = std::io::stdout();
    let _ = std::io::copy(conn, &mut stdout);
    let _ = stdout.flush();
}

/// Compact uptime/age rendering: 42s, 3m, 2h15m, 1d4h.
pub fn format_age(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        return format!("{secs}s");
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{mins}m");
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{hours}h{:02}m", mins % 60);
    }
    format!("{}d{}h", hours / 24, hours % 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(60), "1m");
        assert_eq!(format_age(3_599), "59m");
        assert_eq!(format_age(3_600), "1h00m");
        assert_eq!(format_age(8_100), "2h15m");
        assert_eq!(format_age(101_000), "1d4h");
        assert_eq!(format_age(-5), "0s");
    }

    #[test]
    fn read_response_parses_line_and_leaves_stream_intact() {
        let (mut server, mut client) = UnixStream::pair().unwrap();
        server
            .write_all(b"{\"ok\":true,\"instance_id\":\"1\"}\nraw bytes follow")
            .unwrap();
        drop(server);

        let resp = read_response(&mut client).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.instance_id, "1");

        let mut rest = String::new();
        client.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "raw bytes follow");
    }
}
