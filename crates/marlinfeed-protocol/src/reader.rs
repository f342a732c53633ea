//! Streaming G-code line extraction.
//!
//! TCP sockets, TTYs and pipes are all byte streams without message
//! boundaries: a single read may contain a partial line, a complete line,
//! several lines, or comment noise. `GcodeParser` accumulates fed bytes,
//! applies whitespace compression and comment stripping as it scans, and
//! queues complete [`Line`]s for extraction.
//!
//! # Whitespace compression levels
//!
//! - 0: keep all whitespace.
//! - 1: collapse whitespace runs to a single space, strip leading and
//!   trailing spaces of each line, keep the final `\n`.
//! - 2: remove all whitespace except the terminating `\n`.
//! - 3 (default): remove all whitespace.
//!
//! Level 1 matters for real firmware: some stock Marlin builds require a
//! space between the opcode and its arguments.
//!
//! # Comments
//!
//! Everything from the comment character (default `;`) up to the next
//! `\n` is stripped. While inside a comment, up to 63 characters are
//! captured and scanned at the newline for a slicer `TIME:<seconds>`
//! estimate. Setting the comment character to `'\n'` preserves comments.
//!
//! # Example
//!
//! ```
//! use marlinfeed_protocol::GcodeParser;
//!
//! let mut parser = GcodeParser::new();
//! parser.whitespace_compression(1);
//! parser.feed(b"  G1   X2 Y3 ; rapid\n");
//! let line = parser.next().unwrap();
//! assert_eq!(line.data(), b"G1 X2 Y3\n");
//! ```

use std::collections::VecDeque;

use marlinfeed_core::constants::{COMMENT_BUFSIZE, LINE_BUFSIZE, MAX_PRINT_TIME_SECS};

use crate::line::Line;

/// Stateful G-code stream parser. Feed bytes in, take [`Line`]s out.
#[derive(Debug)]
pub struct GcodeParser {
    /// The line currently being assembled, already compressed.
    line: Vec<u8>,

    /// Complete lines ready for extraction.
    ready: VecDeque<Line>,

    /// Whitespace compression level 0..=3.
    ws_comp: u8,

    /// Everything after this byte up to the next `\n` is discarded.
    comment: u8,

    /// True while the scan position is inside a comment span.
    in_comment: bool,

    /// Captured comment bytes, scanned at newline for slicer metadata.
    combuf: Vec<u8>,

    /// Total number of bytes ever fed, stripped or not.
    bytes_read: u64,

    /// Print time extracted from slicer comments.
    print_time: Option<u32>,
}

impl GcodeParser {
    pub fn new() -> Self {
        GcodeParser {
            line: Vec::with_capacity(LINE_BUFSIZE),
            ready: VecDeque::new(),
            ws_comp: 3,
            comment: b';',
            in_comment: false,
            combuf: Vec::with_capacity(COMMENT_BUFSIZE),
            bytes_read: 0,
            print_time: None,
        }
    }

    /// Sets the whitespace compression level (see module docs).
    pub fn whitespace_compression(&mut self, level: u8) {
        self.ws_comp = level;
    }

    /// Sets the byte that starts a comment. `b'\n'` preserves comments.
    pub fn comment_char(&mut self, ch: u8) {
        self.comment = ch;
    }

    /// Number of bytes fed so far, regardless of whether they were
    /// stripped or extracted.
    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Estimated print time in seconds, parsed from a `TIME:` slicer
    /// comment; `None` until such a comment has been seen.
    pub fn estimated_print_time(&self) -> Option<u32> {
        self.print_time
    }

    /// Feeds bytes from the underlying stream through the scanner.
    /// Complete lines become available via [`next`](GcodeParser::next).
    pub fn feed(&mut self, bytes: &[u8]) {
        self.bytes_read += bytes.len() as u64;
        for &ch in bytes {
            self.scan_byte(ch);
        }
    }

    /// True if a complete line is ready for extraction.
    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Extracts the next complete line, if any.
    pub fn next(&mut self) -> Option<Line> {
        self.ready.pop_front()
    }

    /// Extracts up to `dest.len()` bytes of buffered data verbatim (in
    /// scan order: queued lines first, then the partial line), discarding
    /// line structure. Returns the number of bytes stored.
    pub fn raw(&mut self, dest: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dest.len() {
            if let Some(front) = self.ready.front_mut() {
                let take = (dest.len() - n).min(front.len());
                dest[n..n + take].copy_from_slice(&front.data()[..take]);
                n += take;
                if take == front.len() {
                    self.ready.pop_front();
                } else {
                    front.slice_from(take as isize);
                }
            } else {
                break;
            }
        }
        if n < dest.len() && !self.line.is_empty() {
            let take = (dest.len() - n).min(self.line.len());
            dest[n..n + take].copy_from_slice(&self.line[..take]);
            self.line.drain(..take);
            n += take;
        }
        if n > 0 {
            self.combuf.clear();
            self.in_comment = false;
        }
        n
    }

    /// Bytes of the partially assembled line (compressed view).
    pub fn partial_len(&self) -> usize {
        self.line.len()
    }

    /// Emits the partially assembled line as a ready [`Line`], without a
    /// terminating newline. Used when the underlying stream hits EOF so a
    /// final unterminated line is not lost.
    pub fn flush(&mut self) {
        if self.in_comment {
            self.parse_comment();
            self.in_comment = false;
        }
        if self.ws_comp == 1 && self.line.last() == Some(&b' ') {
            self.line.pop();
        }
        if !self.line.is_empty() {
            self.emit();
        }
    }

    /// Discards all buffered data. The next feed starts a fresh line.
    /// Returns the number of bytes discarded.
    pub fn discard(&mut self) -> usize {
        let n: usize = self.ready.iter().map(Line::len).sum::<usize>() + self.line.len();
        self.ready.clear();
        self.line.clear();
        self.combuf.clear();
        self.in_comment = false;
        n
    }

    fn scan_byte(&mut self, ch: u8) {
        if ch == b'\n' {
            if self.in_comment {
                self.parse_comment();
            }
            self.in_comment = false;
            if self.ws_comp == 1 && self.line.last() == Some(&b' ') {
                self.line.pop();
            }
            if self.ws_comp < 3 {
                self.line.push(ch);
            }
            if self.line.is_empty() {
                // level 3 and nothing but whitespace/comment on the line
                return;
            }
            self.emit();
            return;
        }

        if self.in_comment || ch == self.comment {
            if self.in_comment && self.combuf.len() < COMMENT_BUFSIZE - 1 {
                self.combuf.push(ch);
            } else {
                self.combuf.clear();
            }
            self.in_comment = true;
            return;
        }

        if self.ws_comp == 0 || !ch.is_ascii_whitespace() {
            self.line.push(ch);
        } else if self.ws_comp == 1 && !self.line.is_empty() && self.line.last() != Some(&b' ') {
            self.line.push(b' ');
        }

        // An overlong line is emitted as a split fragment. The fragment
        // boundary will usually produce one illegal G-code line.
        if self.line.len() == LINE_BUFSIZE {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let data = std::mem::replace(&mut self.line, Vec::with_capacity(LINE_BUFSIZE));
        self.ready.push_back(Line::new(data));
    }

    /// Tries to extract information from a captured slicer comment.
    fn parse_comment(&mut self) {
        if let Some(rest) = self.combuf.strip_prefix(b"TIME:") {
            let (secs, valid) = Line::new(rest.to_vec()).number_with_len();
            if valid > 0 && secs > 0 && secs < MAX_PRINT_TIME_SECS {
                tracing::debug!(seconds = secs, "slicer print time estimate");
                self.print_time = Some(secs as u32);
            }
        }
        self.combuf.clear();
    }
}

impl Default for GcodeParser {
    fn default() -> Self {
        Self::new()
    }
}
