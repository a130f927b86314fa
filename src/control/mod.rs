use std::io::{BufRead, Write};

use crate::error::Result;

pub mod client;

pub use client::ControlClient;

/// Write one already CRLF-terminated line and flush.
pub fn write_line<W: Write + ?Sized>(w: &mut W, line: &str) -> Result<()> {
    w.write_all(line.as_bytes())?;
    w.flush()?;
    Ok(())
}

/// Read one line. `None` on a clean EOF.
pub fn read_crlf_line<R: BufRead + ?Sized>(r: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_lines_until_eof() {
        let mut r = Cursor::new(b"START OK port=1\r\nSTOP OK ok=true\n".to_vec());
        assert_eq!(read_crlf_line(&mut r).unwrap().as_deref(), Some("START OK port=1"));
        assert_eq!(read_crlf_line(&mut r).unwrap().as_deref(), Some("STOP OK ok=true"));
        assert_eq!(read_crlf_line(&mut r).unwrap(), None);
    }

    #[test]
    fn writes_line_verbatim() {
        let mut out = Vec::new();
        write_line(&mut out, "STOP\r\n").unwrap();
        assert_eq!(out, b"STOP\r\n");
    }
}
