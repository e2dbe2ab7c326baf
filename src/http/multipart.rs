//! Streaming `multipart/form-data` reader.
//!
//! The reader works directly on the parser's [`ReceiveWindow`]:
//!
//! ```text
//! --token\r\n                                   ◀─ Boundary
//! Content-Disposition: form-data; name="f"; ... ◀─ PartHeaders
//! \r\n                                          ◀─ end of part headers
//! ...part bytes...                              ◀─ PartBody (streamed)
//! \r\n--token\r\n  or  \r\n--token--            ◀─ back to Boundary / Done
//! ```
//!
//! File parts go to an [`UploadSink`] chunk by chunk; plain fields are
//! collected as strings. While no full delimiter is in the window, bytes are
//! flushed only up to the last CRLF that could still start one, so a
//! delimiter split across reads is never mistaken for part data.

use crate::buffer::{ReceiveWindow, find_bytes, rfind_bytes};

use super::parser::ParseError;
use super::request::Request;
use super::upload::{PartInfo, UploadSink};

const CRLF: &[u8] = b"\r\n";

/// Position inside the multipart body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartPhase {
    /// Looking for a `--token` line (preamble or between parts).
    Boundary,
    PartHeaders,
    PartBody,
    /// The closing `--token--` was seen; anything else is epilogue.
    Done,
}

enum BodyScan {
    /// A delimiter starts at this offset.
    Boundary(usize),
    /// This many leading bytes are part data.
    Data(usize),
}

/// Incremental reader for one multipart body.
#[derive(Debug)]
pub struct MultipartReader {
    dash_boundary: Vec<u8>,
    delimiter: Vec<u8>,
    phase: MultipartPhase,
    part: PartInfo,
    value: Vec<u8>,
    max_field_size: usize,
}

impl MultipartReader {
    /// Creates a reader for `boundary` (the bare token from `Content-Type`).
    pub fn new(boundary: &str, max_field_size: usize) -> Self {
        let dash_boundary = [b"--", boundary.as_bytes()].concat();
        let delimiter = [CRLF, &dash_boundary].concat();
        Self {
            dash_boundary,
            delimiter,
            phase: MultipartPhase::Boundary,
            part: PartInfo::default(),
            value: Vec::new(),
            max_field_size,
        }
    }

    pub fn phase(&self) -> MultipartPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == MultipartPhase::Done
    }

    /// Consumes as much of `window` as can be decided on.
    ///
    /// # Errors
    ///
    /// Upload storage failures and oversized plain fields.
    pub fn advance(
        &mut self,
        window: &mut ReceiveWindow,
        sink: &mut dyn UploadSink,
        request: &mut Request,
    ) -> Result<(), ParseError> {
        loop {
            match self.phase {
                MultipartPhase::Boundary => {
                    let Some(pos) = window.find(CRLF) else {
                        return Ok(());
                    };
                    let line = window.consume(pos, CRLF.len()).trim_ascii_end();
                    if line == self.dash_boundary.as_slice() {
                        self.part = PartInfo::default();
                        self.phase = MultipartPhase::PartHeaders;
                    } else if self.is_close_delimiter(line) {
                        self.phase = MultipartPhase::Done;
                    }
                }
                MultipartPhase::PartHeaders => {
                    let Some(pos) = window.find(CRLF) else {
                        return Ok(());
                    };
                    let line = window.consume_line(pos, CRLF.len());
                    if line.is_empty() {
                        self.start_part(sink)?;
                        self.phase = MultipartPhase::PartBody;
                    } else {
                        self.part_header(&line);
                    }
                }
                MultipartPhase::PartBody => match self.scan_body(window.pending()) {
                    BodyScan::Boundary(pos) => {
                        // keep "--token" for the Boundary phase, drop the CRLF
                        let chunk = window.consume(pos, CRLF.len());
                        self.write(chunk, sink)?;
                        self.finish_part(sink, request)?;
                        self.phase = MultipartPhase::Boundary;
                    }
                    BodyScan::Data(safe) => {
                        if safe > 0 {
                            let chunk = window.consume(safe, 0);
                            self.write(chunk, sink)?;
                        }
                        return Ok(());
                    }
                },
                MultipartPhase::Done => {
                    let epilogue = window.len();
                    window.consume(epilogue, 0);
                    return Ok(());
                }
            }
        }
    }

    /// Called once the whole body has arrived. Accepts a closing delimiter
    /// that lacks its trailing CRLF.
    ///
    /// # Errors
    ///
    /// [`ParseError::Multipart`] if the body ended before `--token--`.
    pub fn finish(&mut self, window: &mut ReceiveWindow) -> Result<(), ParseError> {
        if self.phase == MultipartPhase::Boundary
            && self.is_close_delimiter(window.pending().trim_ascii_end())
        {
            let rest = window.len();
            window.consume(rest, 0);
            self.phase = MultipartPhase::Done;
        }
        if self.is_done() {
            Ok(())
        } else {
            Err(ParseError::Multipart("body ended before the closing boundary"))
        }
    }

    /// Finds the end of the current part in `pending`. A delimiter only
    /// counts when followed by CRLF or `--`; until those two bytes are in,
    /// the data before it is all that can be released.
    fn scan_body(&self, pending: &[u8]) -> BodyScan {
        let mut from = 0;
        while let Some(rel) = find_bytes(&pending[from..], &self.delimiter) {
            let pos = from + rel;
            let after = &pending[pos + self.delimiter.len()..];
            if after.len() < 2 {
                return BodyScan::Data(pos);
            }
            if after.starts_with(CRLF) || after.starts_with(b"--") {
                return BodyScan::Boundary(pos);
            }
            from = pos + 1;
        }
        BodyScan::Data(flushable_len(pending, &self.delimiter))
    }

    fn is_close_delimiter(&self, line: &[u8]) -> bool {
        line.strip_prefix(self.dash_boundary.as_slice()) == Some(b"--")
    }

    fn part_header(&mut self, line: &str) {
        let Some((name, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("content-disposition") {
            for (key, param) in disposition_params(value) {
                if key.eq_ignore_ascii_case("name") {
                    self.part.field_name = param;
                } else if key.eq_ignore_ascii_case("filename") {
                    self.part.file_name = Some(param);
                }
            }
        } else if name.trim().eq_ignore_ascii_case("content-type") {
            self.part.content_type = Some(value.to_owned());
        }
    }

    fn start_part(&mut self, sink: &mut dyn UploadSink) -> Result<(), ParseError> {
        if self.part.is_file() {
            sink.begin(&self.part)?;
        } else {
            self.value.clear();
        }
        Ok(())
    }

    fn write(&mut self, chunk: &[u8], sink: &mut dyn UploadSink) -> Result<(), ParseError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.part.is_file() {
            sink.write(chunk)?;
        } else {
            if self.value.len() + chunk.len() > self.max_field_size {
                return Err(ParseError::BodyTooLarge {
                    max: self.max_field_size as u64,
                });
            }
            self.value.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn finish_part(
        &mut self,
        sink: &mut dyn UploadSink,
        request: &mut Request,
    ) -> Result<(), ParseError> {
        let part = std::mem::take(&mut self.part);
        if part.is_file() {
            request.uploads.push(sink.finish()?);
        } else {
            let value = String::from_utf8_lossy(&self.value).into_owned();
            request.form_params.push((part.field_name, value));
            self.value.clear();
        }
        Ok(())
    }
}

/// How many leading bytes of `pending` can be handed to the part without
/// risking cutting a delimiter that has only partly arrived.
fn flushable_len(pending: &[u8], delimiter: &[u8]) -> usize {
    match rfind_bytes(pending, CRLF) {
        Some(pos) if delimiter.starts_with(&pending[pos..]) => pos,
        _ if pending.ends_with(b"\r") => pending.len() - 1,
        _ => pending.len(),
    }
}

/// `form-data; name="a"; filename="b.txt"` → `[("name", "a"), ("filename", "b.txt")]`.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .skip(1)
        .filter_map(|param| {
            let (key, raw) = param.split_once('=')?;
            let raw = raw.trim();
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .unwrap_or(raw);
            Some((key.trim().to_owned(), unquoted.to_owned()))
        })
        .collect()
}

/// Extracts the boundary token of a `multipart/form-data` content type.
///
/// Returns `None` for other media types; `Some("")` means the boundary
/// parameter is missing.
pub fn boundary_of(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media = params.next()?.trim();
    if !media.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    let boundary = params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_owned())
        .unwrap_or_default();
    Some(boundary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::upload::{DiskSink, tests::scratch_dir};

    const BODY: &[u8] = b"preamble\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
hello world\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
line one\r\n--XyZ-not-a-boundary\r\nline two\r\n\
--XyZ--\r\n";

    fn run(chunks: &[&[u8]], sink: &mut DiskSink) -> (Request, MultipartReader) {
        let mut window = ReceiveWindow::with_capacity(512);
        let mut reader = MultipartReader::new("XyZ", 1024);
        let mut request = Request::default();
        for chunk in chunks {
            window.append(chunk).unwrap();
            reader.advance(&mut window, sink, &mut request).unwrap();
        }
        reader.finish(&mut window).unwrap();
        (request, reader)
    }

    #[test]
    fn reads_fields_and_files() {
        let dir = scratch_dir("mp-basic");
        let mut sink = DiskSink::new(&dir);
        let (request, reader) = run(&[BODY], &mut sink);
        assert!(reader.is_done());
        assert_eq!(request.form_param("title"), Some("hello world"));
        let [file] = request.uploads() else {
            panic!("expected one upload");
        };
        assert_eq!(file.field_name(), "doc");
        assert_eq!(file.content_type(), Some("text/plain"));
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            b"line one\r\n--XyZ-not-a-boundary\r\nline two"
        );
        drop(request);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn every_two_way_split_reassembles_exactly() {
        let expected: &[u8] = b"line one\r\n--XyZ-not-a-boundary\r\nline two";
        for split in 1..BODY.len() {
            let dir = scratch_dir("mp-split");
            let mut sink = DiskSink::new(&dir);
            let (request, _) = run(&[&BODY[..split], &BODY[split..]], &mut sink);
            assert_eq!(request.form_param("title"), Some("hello world"), "split {split}");
            let data = std::fs::read(request.uploads()[0].path()).unwrap();
            assert_eq!(data, expected, "split {split}");
            drop(request);
            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn byte_by_byte_feed() {
        let dir = scratch_dir("mp-bytes");
        let mut sink = DiskSink::new(&dir);
        let chunks: Vec<&[u8]> = BODY.chunks(1).collect();
        let (request, _) = run(&chunks, &mut sink);
        assert_eq!(request.uploads().len(), 1);
        assert_eq!(request.uploads()[0].size(), 40);
        drop(request);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_delimiter_without_crlf() {
        let dir = scratch_dir("mp-tail");
        let mut sink = DiskSink::new(&dir);
        let body = b"--b\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n1\r\n--b--";
        let mut window = ReceiveWindow::with_capacity(128);
        let mut reader = MultipartReader::new("b", 64);
        let mut request = Request::default();
        window.append(body).unwrap();
        reader.advance(&mut window, &mut sink, &mut request).unwrap();
        reader.finish(&mut window).unwrap();
        assert_eq!(request.form_param("x"), Some("1"));
        assert!(window.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncated_body_fails_to_finish() {
        let dir = scratch_dir("mp-trunc");
        let mut sink = DiskSink::new(&dir);
        let body = b"--b\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\npartial";
        let mut window = ReceiveWindow::with_capacity(128);
        let mut reader = MultipartReader::new("b", 64);
        let mut request = Request::default();
        window.append(body).unwrap();
        reader.advance(&mut window, &mut sink, &mut request).unwrap();
        assert!(matches!(
            reader.finish(&mut window),
            Err(ParseError::Multipart(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_plain_field_is_rejected() {
        let dir = scratch_dir("mp-big");
        let mut sink = DiskSink::new(&dir);
        let mut body = b"--b\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n".to_vec();
        body.extend(std::iter::repeat_n(b'a', 100));
        let mut window = ReceiveWindow::with_capacity(256);
        let mut reader = MultipartReader::new("b", 10);
        let mut request = Request::default();
        window.append(&body).unwrap();
        assert!(matches!(
            reader.advance(&mut window, &mut sink, &mut request),
            Err(ParseError::BodyTooLarge { max: 10 })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flushable_len_holds_partial_delimiter() {
        let delim = b"\r\n--tok";
        assert_eq!(flushable_len(b"data\r\n--t", delim), 4);
        assert_eq!(flushable_len(b"data\r", delim), 4);
        assert_eq!(flushable_len(b"data\r\nmore", delim), 10);
        assert_eq!(flushable_len(b"data", delim), 4);
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            boundary_of("multipart/form-data; boundary=----abc").as_deref(),
            Some("----abc")
        );
        assert_eq!(
            boundary_of("Multipart/Form-Data; charset=utf-8; boundary=\"q q\"").as_deref(),
            Some("q q")
        );
        assert_eq!(boundary_of("multipart/form-data").as_deref(), Some(""));
        assert_eq!(boundary_of("application/json"), None);
    }
}
