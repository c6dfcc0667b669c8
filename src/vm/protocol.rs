//! Marker-framed command protocol over the serial console
//!
//! Each command is sent as `(<command>); echo "<marker>_$?"` with a marker
//! unique to that command. The reply is complete once the console shows the
//! marker, an underscore, the exit status digits and a line terminator.
//! Everything before the marker is the command's output.

use uuid::Uuid;

/// Fresh marker for one command
pub fn new_marker() -> String {
    format!("__AGV_{}", Uuid::now_v7().simple())
}

/// Wrap `command` so the shell prints the marker and exit status after it
pub fn wrap(command: &str, marker: &str) -> String {
    format!("({}); echo \"{}_$?\"", command, marker)
}

/// Quote a string for POSIX sh
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A fully framed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub output: String,
    pub exit_code: i32,
}

/// Incremental parser for one command's console output
#[derive(Debug)]
pub struct MarkerScanner {
    marker: Vec<u8>,
    buffer: Vec<u8>,
}

impl MarkerScanner {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            buffer: Vec::new(),
        }
    }

    /// Feed console bytes; returns the reply once the trailer is complete
    pub fn push(&mut self, bytes: &[u8]) -> Option<Framed> {
        self.buffer.extend_from_slice(bytes);
        self.scan()
    }

    /// Output received so far, for replies cut short by a timeout
    pub fn partial_output(&self) -> String {
        normalize(&self.buffer)
    }

    fn scan(&mut self) -> Option<Framed> {
        let mut from = 0;
        while let Some(offset) = find(&self.buffer[from..], &self.marker) {
            let start = from + offset;
            match self.trailer_at(start + self.marker.len()) {
                Trailer::Complete(exit_code) => {
                    return Some(Framed {
                        output: normalize(&self.buffer[..start]),
                        exit_code,
                    });
                }
                // Digits may still be arriving; a later marker cannot be the real one
                Trailer::Incomplete => return None,
                Trailer::Decoy => from = start + 1,
            }
        }
        None
    }

    /// Classify what follows a marker occurrence: `_<digits>\n` or `_<digits>\r\n`
    fn trailer_at(&self, pos: usize) -> Trailer {
        let rest = &self.buffer[pos..];
        match rest.first() {
            None => return Trailer::Incomplete,
            Some(b'_') => {}
            Some(_) => return Trailer::Decoy,
        }
        let digits = rest[1..].iter().take_while(|b| b.is_ascii_digit()).count();
        let after = &rest[1 + digits..];
        if digits == 0 {
            return if after.is_empty() {
                Trailer::Incomplete
            } else {
                Trailer::Decoy
            };
        }
        let terminated = match after {
            [] | [b'\r'] => return Trailer::Incomplete,
            [b'\n', ..] | [b'\r', b'\n', ..] => true,
            _ => false,
        };
        if !terminated {
            return Trailer::Decoy;
        }
        std::str::from_utf8(&rest[1..1 + digits])
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .map(Trailer::Complete)
            .unwrap_or(Trailer::Decoy)
    }
}

enum Trailer {
    Complete(i32),
    Incomplete,
    Decoy,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Lossy UTF-8 with `\r\n` folded to `\n`
fn normalize(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: &str = "__AGV_test";

    #[test]
    fn test_wrap() {
        assert_eq!(wrap("ls -la", M), "(ls -la); echo \"__AGV_test_$?\"");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/mnt/share0/it's"), r"'/mnt/share0/it'\''s'");
    }

    #[test]
    fn test_simple_reply() {
        let mut scanner = MarkerScanner::new(M);
        let framed = scanner.push(b"hello\r\nworld\r\n__AGV_test_0\r\n").unwrap();
        assert_eq!(framed.output, "hello\nworld\n");
        assert_eq!(framed.exit_code, 0);
    }

    #[test]
    fn test_split_digits_wait_for_terminator() {
        let mut scanner = MarkerScanner::new(M);
        assert!(scanner.push(b"out\n__AGV_te").is_none());
        assert!(scanner.push(b"st_1").is_none());
        assert!(scanner.push(b"2").is_none());
        assert!(scanner.push(b"7\r").is_none());
        let framed = scanner.push(b"\n").unwrap();
        assert_eq!(framed.exit_code, 127);
        assert_eq!(framed.output, "out\n");
    }

    #[test]
    fn test_decoys_do_not_terminate() {
        let mut scanner = MarkerScanner::new(M);
        // Echoed command line, marker-like text in output, and a different marker
        assert!(scanner
            .push(b"(cat f); echo \"__AGV_test_$?\"\n__AGV_test_abc\n__AGV_test_12 trailing\n__AGV_other_0\n")
            .is_none());
        let framed = scanner.push(b"__AGV_test_2\n").unwrap();
        assert_eq!(framed.exit_code, 2);
        assert!(framed.output.contains("__AGV_test_12 trailing"));
    }

    #[test]
    fn test_marker_without_newline_before_it() {
        let mut scanner = MarkerScanner::new(M);
        let framed = scanner.push(b"no newline__AGV_test_1\n").unwrap();
        assert_eq!(framed.output, "no newline");
        assert_eq!(framed.exit_code, 1);
    }

    #[test]
    fn test_partial_output() {
        let mut scanner = MarkerScanner::new(M);
        scanner.push(b"line one\r\nline");
        assert_eq!(scanner.partial_output(), "line one\nline");
    }

    #[test]
    fn test_markers_are_unique() {
        assert_ne!(new_marker(), new_marker());
    }
}
