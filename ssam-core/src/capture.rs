//! Capture extraction: pull read/write payload bytes out of an IRP monitor text log.
//!
//! Only `Data (Hexer)` blocks belonging to a `Major function = Read` or `= Write`
//! request are kept. Everything else is dropped without error.

use std::io::BufRead;

const FUNCTION_MARKER: &str = "Major function =";
const DATA_MARKER: &str = "Data (Hexer)";
const DATA_INDENT: &str = "  ";

/// Major function of the IRP a data block belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Function {
    None,
    Read,
    Write,
    Other(String),
}

impl Function {
    fn parse(name: &str) -> Self {
        match name {
            "Read" => Function::Read,
            "Write" => Function::Write,
            other => Function::Other(other.to_string()),
        }
    }

    fn carries_payload(&self) -> bool {
        matches!(self, Function::Read | Function::Write)
    }
}

/// Line-oriented extractor. Feed lines in order, then call `finish`.
#[derive(Debug)]
pub struct Extractor {
    function: Function,
    /// Function in effect when the current hex block was opened.
    block: Option<Function>,
    lines: Vec<String>,
    out: Vec<u8>,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            function: Function::None,
            block: None,
            lines: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Process one line of the capture log (without trailing newline).
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);

        if self.block.is_some() && line.starts_with(DATA_INDENT) {
            self.lines.push(line.trim().to_string());
            return;
        }
        self.flush();

        if let Some(rest) = line.strip_prefix(FUNCTION_MARKER) {
            self.function = Function::parse(rest.trim());
        } else if line.starts_with(DATA_MARKER) {
            self.block = Some(self.function.clone());
        }
    }

    /// Close any open block and return the collected bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.out
    }

    fn flush(&mut self) {
        let Some(function) = self.block.take() else {
            return;
        };
        let lines = std::mem::take(&mut self.lines);
        if !function.carries_payload() {
            log::trace!("dropping {} hex line(s) of {:?} block", lines.len(), function);
            return;
        }
        for line in &lines {
            parse_hex_line(line, &mut self.out);
        }
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the second tab-separated field of a hex dump line, appending valid bytes.
fn parse_hex_line(line: &str, out: &mut Vec<u8>) {
    let Some(field) = line.split('\t').nth(1) else {
        log::debug!("hex line without data field: {line:?}");
        return;
    };
    for token in field.split_whitespace() {
        match u8::from_str_radix(token, 16) {
            Ok(b) => out.push(b),
            Err(_) => log::debug!("skipping invalid hex token {token:?}"),
        }
    }
}

/// Extract payload bytes from capture text.
pub fn extract_bytes(text: &str) -> Vec<u8> {
    let mut ex = Extractor::new();
    for line in text.lines() {
        ex.push_line(line);
    }
    ex.finish()
}

/// Extract payload bytes from raw capture file contents; invalid UTF-8 is replaced.
pub fn extract_from_slice(raw: &[u8]) -> Vec<u8> {
    extract_bytes(&String::from_utf8_lossy(raw))
}

/// Extract payload bytes from a reader. Lines are decoded lossily.
pub fn extract_from_reader<R: BufRead>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut ex = Extractor::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        ex.push_line(&String::from_utf8_lossy(&buf));
    }
    Ok(ex.finish())
}
