//! Attach-stream framing.
//!
//! After the JSON handshake an attach connection becomes asymmetric:
//!
//!   Server → Client : raw PTY output bytes (no framing; the terminal
//!                     interprets escape sequences)
//!   Client → Server : length-prefixed frames:
//!
//! ```text
//! [1 byte type][4 bytes big-endian length][payload]
//!
//! 0x00  data    – stdin bytes to write into the PTY
//! 0x01  resize  – payload: 2-byte cols + 2-byte rows (big-endian u16)
//! 0x02  detach  – no payload; client wants to detach cleanly
//! ```

use std::io::{self, Read, Write};

/// Sanity cap on a single frame payload. Protects the daemon from a
/// malformed or malicious client allocating unbounded memory.
pub const MAX_FRAME_LEN: u32 = 1 << 20; // 1 MiB

/// A single client → server control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keystrokes to inject into the instance PTY.
    Data(Vec<u8>),
    /// Terminal resize: (cols, rows).
    Resize(u16, u16),
    /// Clean detach request.
    Detach,
}

const FRAME_DATA: u8 = 0x00;
const FRAME_RESIZE: u8 = 0x01;
const FRAME_DETACH: u8 = 0x02;

/// Write a single framed message.
pub fn write_frame(w: &mut impl Write, frame: &Frame) -> io::Result<()> {
    let (kind, payload): (u8, Vec<u8>) = match frame {
        Frame::Data(bytes) => (FRAME_DATA, bytes.clone()),
        Frame::Resize(cols, rows) => {
            let mut p = Vec::with_capacity(4);
            p.extend_from_slice(&cols.to_be_bytes());
            p.extend_from_slice(&rows.to_be_bytes());
            (FRAME_RESIZE, p)
        }
        Frame::Detach => (FRAME_DETACH, Vec::new()),
    };

    let mut hdr = [0u8; 5];
    hdr[0] = kind;
    hdr[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&hdr)?;
    if !payload.is_empty() {
        w.write_all(&payload)?;
    }
    Ok(())
}

/// Read a single framed message.
///
/// Returns `UnexpectedEof` when the peer closed the stream, `InvalidData`
/// for unknown frame types, oversized payloads, or a malformed resize.
pub fn read_frame(r: &mut impl Read) -> io::Result<Frame> {
    let mut hdr = [0u8; 5];
    r.read_exact(&mut hdr)?;
    let kind = hdr[0];
    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("attach frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        r.read_exact(&mut payload)?;
    }

    match kind {
        FRAME_DATA => Ok(Frame::Data(payload)),
        FRAME_RESIZE => {
            if payload.len() != 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("resize frame payload must be 4 bytes, got {}", payload.len()),
                ));
            }
            let cols = u16::from_be_bytes([payload[0], payload[1]]);
            let rows = u16::from_be_bytes([payload[2], payload[3]]);
            Ok(Frame::Resize(cols, rows))
        }
        FRAME_DETACH => Ok(Frame::Detach),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown attach frame type: {other:#04x}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        read_frame(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn data_roundtrip() {
        let frame = Frame::Data(b"printf hi\n".to_vec());
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn empty_data_roundtrip() {
        let frame = Frame::Data(Vec::new());
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn resize_roundtrip() {
        let frame = Frame::Resize(213, 58);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn detach_roundtrip() {
        assert_eq!(roundtrip(Frame::Detach), Frame::Detach);
    }

    #[test]
    fn detach_has_empty_payload_on_wire() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Detach).unwrap();
        assert_eq!(buf, vec![0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = vec![0x00];
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let buf = vec![0x7f, 0, 0, 0, 0];
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn malformed_resize_rejected() {
        let mut buf = vec![0x01];
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&[0, 80]);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_stream_is_eof() {
        let buf = vec![0x00, 0, 0, 0, 10, b'h', b'i'];
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frames_parse_back_to_back() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Resize(80, 24)).unwrap();
        write_frame(&mut buf, &Frame::Data(b"ls\n".to_vec())).unwrap();
        write_frame(&mut buf, &Frame::Detach).unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(read_frame(&mut cur).unwrap(), Frame::Resize(80, 24));
        assert_eq!(read_frame(&mut cur).unwrap(), Frame::Data(b"ls\n".to_vec()));
        assert_eq!(read_frame(&mut cur).unwrap(), Frame::Detach);
    }
}
