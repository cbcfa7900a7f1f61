//! Streaming parser for the decoder's tag-delimited output.
//!
//! Both output variants share one outer grammar: a root element holding a
//! sequence of per-packet child elements. [`ElementReader`] pulls one child
//! element at a time from an async byte stream, so memory stays bounded by the
//! largest single record no matter how long the capture is. The typed layers
//! in [`psml`] and [`pdml`] turn those elements into rows and detail trees.

mod pdml;
mod psml;

pub use pdml::DetailStream;
pub use psml::SummaryStream;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::config::{Malformed, ParsePolicy, TruncatedTail};
use crate::error::ParseError;

/// A fully closed element and everything inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            text: String::new(),
            children: Vec::new(),
        })
    }
}

/// A recoverable problem the parser skipped over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub position: usize,
    pub reason: String,
}

enum Step {
    Continue,
    Record(Element),
    Eof,
}

/// Pulls one record element at a time out of a byte stream.
pub struct ElementReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    record_tags: &'static [&'static str],
    policy: ParsePolicy,
    /// Open elements of the record being built; empty between records
    stack: Vec<Element>,
    consecutive_errors: usize,
    warnings: Vec<ParseWarning>,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> ElementReader<R> {
    /// `record_tags` names the elements returned as records; anything outside
    /// them (the root element, declarations) is skipped.
    pub fn new(input: R, record_tags: &'static [&'static str], policy: ParsePolicy) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);
        reader.check_end_names(false);
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            record_tags,
            policy,
            stack: Vec::new(),
            consecutive_errors: 0,
            warnings: Vec::new(),
            finished: false,
        }
    }

    /// Byte offset into the stream
    pub fn position(&self) -> usize {
        self.reader.buffer_position()
    }

    /// Drain the warnings collected so far
    pub fn take_warnings(&mut self) -> Vec<ParseWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Next complete record, or `None` at end of stream.
    pub async fn next_element(&mut self) -> Result<Option<Element>, ParseError> {
        while !self.finished {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            let step = match self.reader.read_event_into_async(&mut buf).await {
                Ok(event) => self.apply(event),
                Err(e) => Err(e),
            };
            self.buf = buf;

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Record(element)) => {
                    self.consecutive_errors = 0;
                    return Ok(Some(element));
                }
                Ok(Step::Eof) => return self.finish(),
                Err(quick_xml::Error::Io(e)) => {
                    self.finished = true;
                    return Err(ParseError::Io(std::io::Error::new(e.kind(), e.to_string())));
                }
                Err(quick_xml::Error::UnexpectedEof(what)) => {
                    debug!("Stream ended inside {}", what);
                    return self.finish();
                }
                Err(e) => {
                    // A decoder killed mid-tag leaves a fragment that fails to
                    // parse for reasons other than EOF; it is still a cut-off tail
                    if self.at_end_of_input().await? {
                        debug!("Stream ended inside a broken fragment: {}", e);
                        return self.finish();
                    }
                    self.report_malformed(e.to_string())?
                }
            }
        }
        Ok(None)
    }

    async fn at_end_of_input(&mut self) -> Result<bool, ParseError> {
        match self.reader.get_mut().fill_buf().await {
            Ok(rest) => Ok(rest.is_empty()),
            Err(e) => {
                self.finished = true;
                Err(ParseError::Io(e))
            }
        }
    }

    fn is_record_tag(&self, name: &[u8]) -> bool {
        self.record_tags.iter().any(|tag| tag.as_bytes() == name)
    }

    fn apply(&mut self, event: Event<'_>) -> Result<Step, quick_xml::Error> {
        match event {
            Event::Start(start) => {
                if self.stack.is_empty() {
                    if !self.is_record_tag(start.name().as_ref()) {
                        return Ok(Step::Continue);
                    }
                }
                self.stack.push(Element::from_start(&start)?);
            }
            Event::Empty(start) => {
                if self.stack.is_empty() {
                    if self.is_record_tag(start.name().as_ref()) {
                        return Ok(Step::Record(Element::from_start(&start)?));
                    }
                    return Ok(Step::Continue);
                }
                let element = Element::from_start(&start)?;
                if let Some(parent) = self.stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::Text(text) => {
                if let Some(open) = self.stack.last_mut() {
                    open.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(open) = self.stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(end) => {
                let Some(element) = self.stack.pop() else {
                    return Ok(Step::Continue);
                };
                if element.name.as_bytes() != end.name().as_ref() {
                    self.stack.clear();
                    return Err(quick_xml::Error::EndEventMismatch {
                        expected: element.name,
                        found: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                    });
                }
                match self.stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(Step::Record(element)),
                }
            }
            Event::Eof => return Ok(Step::Eof),
            _ => {}
        }
        Ok(Step::Continue)
    }

    fn finish(&mut self) -> Result<Option<Element>, ParseError> {
        self.finished = true;
        let Some(open) = self.stack.first() else {
            return Ok(None);
        };
        let element = open.name.clone();
        self.stack.clear();
        match self.policy.truncated_tail {
            TruncatedTail::Drop => {
                debug!("Dropping truncated <{}> record at end of stream", element);
                Ok(None)
            }
            TruncatedTail::Error => Err(ParseError::Truncated {
                element,
                position: self.position(),
            }),
        }
    }

    /// Apply the malformed-input policy to a bad fragment and resynchronise on
    /// the next record.
    pub(crate) fn report_malformed(&mut self, reason: String) -> Result<(), ParseError> {
        let position = self.position();
        self.stack.clear();
        self.consecutive_errors += 1;

        if self.consecutive_errors > self.policy.max_consecutive_errors {
            self.finished = true;
            return Err(ParseError::TooManyErrors {
                count: self.consecutive_errors,
                position,
            });
        }
        match self.policy.malformed {
            Malformed::Error => {
                self.finished = true;
                return Err(ParseError::Malformed { position, reason });
            }
            Malformed::Warn => {
                warn!("Skipping malformed record at byte {}: {}", position, reason);
                self.warnings.push(ParseWarning { position, reason });
            }
            Malformed::Ignore => debug!("Skipping malformed record at byte {}: {}", position, reason),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS: &[&str] = &["packet"];

    async fn collect(input: &[u8], policy: ParsePolicy) -> (Vec<Element>, Vec<ParseWarning>) {
        let mut reader = ElementReader::new(input, TAGS, policy);
        let mut out = Vec::new();
        while let Some(element) = reader.next_element().await.unwrap() {
            out.push(element);
        }
        (out, reader.take_warnings())
    }

    #[tokio::test]
    async fn test_records_in_order() {
        let input = br#"<?xml version="1.0"?>
<root version="0">
<packet id="1"><a x="1"/><b>text &amp; more</b></packet>
<packet id="2"/>
</root>"#;
        let (records, warnings) = collect(input, ParsePolicy::default()).await;
        assert!(warnings.is_empty());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attr("id"), Some("1"));
        assert_eq!(records[0].children.len(), 2);
        assert_eq!(records[0].children[0].attr("x"), Some("1"));
        assert_eq!(records[0].children[1].text, "text & more");
        assert_eq!(records[1].attr("id"), Some("2"));
    }

    #[tokio::test]
    async fn test_truncated_tail_is_dropped() {
        let input = b"<root><packet id=\"1\"><a/></packet><packet id=\"2\"><a x=\"";
        let (records, warnings) = collect(input, ParsePolicy::default()).await;
        assert_eq!(records.len(), 1);
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_tail_can_be_an_error() {
        let policy = ParsePolicy {
            truncated_tail: TruncatedTail::Error,
            ..ParsePolicy::default()
        };
        let input: &[u8] = b"<root><packet id=\"1\"></packet><packet><a/>";
        let mut reader = ElementReader::new(input, TAGS, policy);
        assert!(reader.next_element().await.unwrap().is_some());
        assert!(matches!(
            reader.next_element().await,
            Err(ParseError::Truncated { .. })
        ));
    }

    #[tokio::test]
    async fn test_cut_inside_attribute_follows_truncation_policy() {
        let input: &[u8] = b"<root><packet id=\"1\"/><packet id=\"2\"><a x=\"";

        // Malformed fragments are fatal under this policy, a cut-off tail is not
        let strict_malformed = ParsePolicy {
            malformed: Malformed::Error,
            ..ParsePolicy::default()
        };
        let mut reader = ElementReader::new(input, TAGS, strict_malformed);
        assert!(reader.next_element().await.unwrap().is_some());
        assert!(reader.next_element().await.unwrap().is_none());
        assert!(reader.take_warnings().is_empty());

        let strict_tail = ParsePolicy {
            truncated_tail: TruncatedTail::Error,
            ..ParsePolicy::default()
        };
        let mut reader = ElementReader::new(input, TAGS, strict_tail);
        assert!(reader.next_element().await.unwrap().is_some());
        match reader.next_element().await {
            Err(ParseError::Truncated { element, .. }) => assert_eq!(element, "packet"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_middle_record_is_warned_and_skipped() {
        let input = b"<root><packet id=\"1\"/><packet id=\"2\"><a></b></packet><packet id=\"3\"/></root>";
        let (records, warnings) = collect(input, ParsePolicy::default()).await;
        let ids: Vec<_> = records.iter().filter_map(|r| r.attr("id")).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_strict_policy() {
        let policy = ParsePolicy {
            malformed: Malformed::Error,
            ..ParsePolicy::default()
        };
        let input: &[u8] = b"<root><packet><a></b></packet></root>";
        let mut reader = ElementReader::new(input, TAGS, policy);
        assert!(matches!(
            reader.next_element().await,
            Err(ParseError::Malformed { .. })
        ));
        assert!(reader.next_element().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_elements_outside_records_are_skipped() {
        let input = b"<root><other><packet id=\"x\"/></other></root>";
        // Unrelated wrappers between records are transparent
        let (records, _) = collect(input, ParsePolicy::default()).await;
        assert_eq!(records.len(), 1);
    }
}
