//! NZB manifest parsing
//!
//! An NZB is an XML document enumerating the articles (segments) that make
//! up one or more files. Only well-formed `<file>` elements with at least
//! one segment are kept; segments are ordered by their declared ordinal.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{Error, Result};
use crate::types::MessageId;

/// One encoded chunk of a file: (message-id, declared size, ordinal)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Article message-id
    pub message_id: MessageId,
    /// Declared encoded size in bytes (authoritative for allocation)
    pub bytes: u64,
    /// 1-based ordinal within the file
    pub number: u32,
}

/// One file in the manifest with its ordered segments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbFile {
    /// Raw subject line (usually carries a quoted filename)
    pub subject: String,
    /// Poster address
    pub poster: String,
    /// Newsgroups the articles were posted to
    pub groups: Vec<String>,
    /// Segments sorted by `number`
    pub segments: Vec<Segment>,
}

impl NzbFile {
    /// Filename hint parsed from the subject line
    ///
    /// Usenet subjects typically carry the filename in quotes, e.g.
    /// `Some.Movie [01/50] - "Some.Movie.part01.rar" yEnc (1/100)`.
    /// Returns `None` when no quoted, non-empty name is present.
    pub fn subject_filename(&self) -> Option<&str> {
        let start = self.subject.find('"')?;
        let rest = &self.subject[start + 1..];
        let end = rest.find('"')?;
        let name = &rest[..end];
        if name.is_empty() { None } else { Some(name) }
    }

    /// Sum of declared segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    /// First segment, if any
    pub fn first_segment(&self) -> Option<&Segment> {
        self.segments.first()
    }
}

/// A parsed NZB document: metadata plus the ordered list of files
#[derive(Clone, Debug, Default)]
pub struct NzbDocument {
    /// `<head><meta>` entries, keys lower-cased
    pub meta: HashMap<String, String>,
    /// Files with at least one segment, in document order
    pub files: Vec<NzbFile>,
}

impl NzbDocument {
    /// Parse an NZB document from raw bytes
    ///
    /// Files without segments are dropped; a document with no usable files
    /// is an error. Metadata keys are matched case-insensitively by
    /// lower-casing them at parse time.
    pub fn parse(content: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(content)
            .map_err(|e| Error::InvalidNzb(format!("not valid UTF-8: {e}")))?;

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut doc = NzbDocument::default();

        // Parser context while walking events
        let mut current_file: Option<NzbFile> = None;
        let mut current_segment: Option<(u64, u32)> = None;
        let mut meta_key: Option<String> = None;
        let mut in_group = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                    b"meta" => {
                        meta_key = attr(&e, b"name")?.map(|v| v.to_ascii_lowercase());
                    }
                    b"file" => {
                        current_file = Some(NzbFile {
                            subject: attr(&e, b"subject")?.unwrap_or_default(),
                            poster: attr(&e, b"poster")?.unwrap_or_default(),
                            groups: Vec::new(),
                            segments: Vec::new(),
                        });
                    }
                    b"group" => in_group = true,
                    b"segment" => {
                        let bytes = attr(&e, b"bytes")?
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0);
                        let number = attr(&e, b"number")?
                            .and_then(|v| v.parse::<u32>().ok())
                            .unwrap_or(0);
                        current_segment = Some((bytes, number));
                    }
                    _ => {}
                },
                Ok(Event::Text(t)) => {
                    let value = t
                        .unescape()
                        .map_err(|e| Error::InvalidNzb(format!("bad text node: {e}")))?
                        .into_owned();
                    if let Some(key) = meta_key.take() {
                        doc.meta.insert(key, value);
                    } else if in_group {
                        if let Some(file) = current_file.as_mut() {
                            file.groups.push(value);
                        }
                    } else if let Some((bytes, number)) = current_segment.take() {
                        if let Some(file) = current_file.as_mut() {
                            file.segments.push(Segment {
                                message_id: MessageId::new(value),
                                bytes,
                                number,
                            });
                        }
                    }
                }
                Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                    b"file" => {
                        if let Some(mut file) = current_file.take() {
                            if !file.segments.is_empty() {
                                file.segments.sort_by_key(|s| s.number);
                                doc.files.push(file);
                            }
                        }
                    }
                    b"group" => in_group = false,
                    b"meta" => meta_key = None,
                    b"segment" => current_segment = None,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::InvalidNzb(format!("XML error: {e}"))),
            }
        }

        if doc.files.is_empty() {
            return Err(Error::InvalidNzb("no files with segments".into()));
        }

        Ok(doc)
    }

    /// Archive password from `<meta name="password">`, if present
    pub fn password(&self) -> Option<&str> {
        self.meta.get("password").map(String::as_str)
    }

    /// Sum of declared sizes across all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(NzbFile::total_bytes).sum()
    }
}

/// Strip a namespace prefix from an element name
fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

/// Read a single attribute value by local name
fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|e| Error::InvalidNzb(format!("bad attribute: {e}")))?;
        if local_name(a.key.as_ref()) == key {
            let value = a
                .unescape_value()
                .map_err(|e| Error::InvalidNzb(format!("bad attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta name="Password">secret123</meta>
    <meta name="title">Some.Movie.2024</meta>
  </head>
  <file poster="poster@example.com" date="1700000000" subject="Some.Movie [1/2] - &quot;Some.Movie.part01.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.movies</group>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="700000" number="2">part2@example.com</segment>
      <segment bytes="750000" number="1">part1@example.com</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1700000001" subject="no segments here">
    <groups><group>alt.binaries.movies</group></groups>
    <segments></segments>
  </file>
</nzb>"#;

    #[test]
    fn parses_files_and_sorts_segments_by_ordinal() {
        let doc = NzbDocument::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(doc.files.len(), 1, "segment-less file must be dropped");

        let file = &doc.files[0];
        assert_eq!(file.poster, "poster@example.com");
        assert_eq!(file.groups, vec!["alt.binaries.movies", "alt.binaries.test"]);
        assert_eq!(file.segments.len(), 2);
        assert_eq!(file.segments[0].number, 1);
        assert_eq!(file.segments[0].message_id.as_str(), "part1@example.com");
        assert_eq!(file.segments[0].bytes, 750_000);
        assert_eq!(file.segments[1].number, 2);
    }

    #[test]
    fn meta_keys_are_case_insensitive() {
        let doc = NzbDocument::parse(SAMPLE.as_bytes()).unwrap();
        // <meta name="Password"> is reachable via the lower-cased key
        assert_eq!(doc.password(), Some("secret123"));
        assert_eq!(doc.meta.get("title").map(String::as_str), Some("Some.Movie.2024"));
    }

    #[test]
    fn subject_filename_extracts_quoted_name() {
        let doc = NzbDocument::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            doc.files[0].subject_filename(),
            Some("Some.Movie.part01.rar")
        );
    }

    #[test]
    fn subject_without_quotes_yields_none() {
        let file = NzbFile {
            subject: "no quoted name here".into(),
            poster: String::new(),
            groups: vec![],
            segments: vec![],
        };
        assert_eq!(file.subject_filename(), None);
    }

    #[test]
    fn total_bytes_sums_declared_sizes() {
        let doc = NzbDocument::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(doc.total_bytes(), 1_450_000);
    }

    #[test]
    fn document_without_usable_files_is_rejected() {
        let empty = r#"<?xml version="1.0"?><nzb><head></head></nzb>"#;
        let error = NzbDocument::parse(empty.as_bytes()).unwrap_err();
        assert!(matches!(error, Error::InvalidNzb(_)));
    }

    #[test]
    fn malformed_xml_is_rejected() {
        let broken = r#"<nzb><file subject="x"><segments><segment bytes="1" number="1">a@x"#;
        let result = NzbDocument::parse(broken.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn non_utf8_content_is_rejected() {
        let result = NzbDocument::parse(&[0xFF, 0xFE, 0x00]);
        assert!(matches!(result, Err(Error::InvalidNzb(_))));
    }

    #[test]
    fn namespaced_elements_are_handled() {
        let namespaced = r#"<?xml version="1.0"?>
<n:nzb xmlns:n="http://www.newzbin.com/DTD/2003/nzb">
  <n:file poster="p" subject="&quot;a.bin&quot;">
    <n:groups><n:group>alt.binaries.test</n:group></n:groups>
    <n:segments><n:segment bytes="10" number="1">seg@x</n:segment></n:segments>
  </n:file>
</n:nzb>"#;
        let doc = NzbDocument::parse(namespaced.as_bytes()).unwrap();
        assert_eq!(doc.files.len(), 1);
        assert_eq!(doc.files[0].segments[0].message_id.as_str(), "seg@x");
    }
}
