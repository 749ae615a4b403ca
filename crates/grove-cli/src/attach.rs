//! Interactive attach: bridge the local terminal to an instance PTY.
//!
//! The terminal goes raw so every keystroke reaches the agent unmodified;
//! Ctrl-] is the one escape hatch, sending a clean detach frame. Output
//! from the daemon is raw PTY bytes and is copied straight to stdout.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use crossterm::terminal;

use grove_proto::{req, write_frame, Frame, Request};

use crate::client;

/// Detach keystroke: Ctrl-] (0x1D).
const DETACH_KEY: u8 = 0x1d;

/// How often the resize watcher compares the terminal size.
const RESIZE_POLL: Duration = Duration::from_millis(500);

/// Attach the current terminal to `instance_id` and block until the user
/// detaches or the agent exits.
pub fn run(instance_id: &str) -> anyhow::Result<()> {
    let mut conn = client::connect()?;
    client::write_request(&mut conn, &Request::for_instance(req::ATTACH, instance_id))?;
    let resp = client::read_response(&mut conn)?;
    if !resp.ok {
        bail!("{}", resp.error);
    }

    terminal::enable_raw_mode()?;
    let result = bridge(&mut conn, instance_id);
    terminal::disable_raw_mode()?;
    let _ = conn.shutdown(Shutdown::Both);

    println!("\n[grove] detached from {instance_id}");
    result
}

fn bridge(conn: &mut UnixStream, instance_id: &str) -> anyhow::Result<()> {
    print!("\r\n[grove] attached to {instance_id}  (detach: Ctrl-])\r\n");
    std::io::stdout().flush()?;

    // Tell the PTY how big this terminal is before any input flows.
    if let Ok((cols, rows)) = terminal::size() {
        let _ = write_frame(conn, &Frame::Resize(cols, rows));
    }

    let (done_tx, done_rx) = mpsc::channel::<()>();

    // Server -> stdout: raw PTY bytes until the daemon closes the stream.
    let output_done = done_tx.clone();
    let mut output_conn = conn.try_clone()?;
    thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let _ = std::io::copy(&mut output_conn, &mut stdout);
        let _ = stdout.flush();
        let _ = output_done.send(());
    });

    // stdin -> server: frame keystrokes, watching for the detach key.
    let input_done = done_tx.clone();
    let mut input_conn = conn.try_clone()?;
    thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if buf[..n].contains(&DETACH_KEY) {
                let _ = write_frame(&mut input_conn, &Frame::Detach);
                break;
            }
            if write_frame(&mut input_conn, &Frame::Data(buf[..n].to_vec())).is_err() {
                break;
            }
        }
        let _ = input_done.send(());
    });

    // Resize watcher: forward size changes as they happen.
    let mut resize_conn = conn.try_clone()?;
    thread::spawn(move || {
        let mut last = terminal::size().ok();
        loop {
            thread::sleep(RESIZE_POLL);
            let Ok(size) = terminal::size() else { continue };
            if last != Some(size) {
                last = Some(size);
                if write_frame(&mut resize_conn, &Frame::Resize(size.0, size.1)).is_err() {
                    break;
                }
            }
        }
    });

    // First of {output stream ended, user detached} wins.
    let _ = done_rx.recv();
    Ok(())
}
