// kafkagate/src/decode/xml_stream.rs
//
// XML record extractor with streaming XML→JSON transform.
//
// Same contract as the JSON extractor: chunks in, one record per top-level
// element out, straddles stitched through the carry buffer. A byte scanner
// finds top-level element boundaries (tags, quoted attribute values,
// comments, CDATA, processing instructions); each complete element is parsed
// with an event reader and emitted as JSON:
//
//   <a href="x">hi<b/></a>
//     → {"tag":"a","attributes":{"href":"x"},"text":"hi",
//        "children":[{"tag":"b","attributes":{}}]}
//
// All records emitted from one chunk share a single growing output buffer;
// the batch receives refcounted slices of it, resolved when the buffer is
// frozen at the end of the call.

use bytes::{BufMut, Bytes, BytesMut};
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

use crate::decode::ParseError;
use crate::kafka::batch::MessageBatch;

const CDATA_OPEN: &[u8] = b"CDATA[";

/// Byte-level scanner state, persistent across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Character data; top-level whitespace when depth == 0.
    Content,
    /// `<` consumed, construct kind not known yet.
    AfterLt,
    /// Inside `<tag ...>`.
    StartTag { quote: Option<u8>, slash: bool },
    /// Inside `</tag ...>`.
    EndTag,
    /// `<!` consumed.
    AfterBang,
    /// `<!-` consumed, second dash pending.
    CommentOpen,
    Comment,
    CommentDash,
    CommentDashDash,
    /// Matching the `CDATA[` opener, index into CDATA_OPEN.
    CdataOpen(u8),
    Cdata,
    CdataBracket,
    CdataBracketBracket,
    /// `<!DOCTYPE ...>` and other declarations.
    Decl { quote: Option<u8> },
    /// `<? ... ?>`.
    Pi,
    PiQuestion,
}

pub struct XmlStreamParser {
    scan:        Scan,
    depth:       u32,
    /// Bytes of the in-progress top-level construct from earlier chunks.
    carry:       Vec<u8>,
    carry_limit: Option<usize>,
    offset:      usize,
}

impl XmlStreamParser {
    pub fn new(carry_limit: Option<usize>) -> Self {
        Self {
            scan: Scan::Content,
            depth: 0,
            carry: Vec::new(),
            carry_limit,
            offset: 0,
        }
    }

    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    fn construct_active(&self) -> bool {
        self.depth > 0 || self.scan != Scan::Content
    }

    /// Feed one body chunk; completed records are appended to `batch`.
    pub fn process_chunk(
        &mut self,
        chunk: &Bytes,
        batch: &mut MessageBatch,
    ) -> Result<(), ParseError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let buf: &[u8] = chunk;
        // Where the current top-level construct started in this chunk, if it
        // started here; None while finishing a construct begun earlier.
        let mut start: Option<usize> = None;
        let mut out = BytesMut::new();
        let mut spans: Vec<(usize, usize)> = Vec::new();

        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            match self.scan {
                Scan::Content => {
                    if b == b'<' {
                        if self.depth == 0 {
                            start = Some(i);
                        }
                        self.scan = Scan::AfterLt;
                    } else if self.depth == 0 && !b.is_ascii_whitespace() {
                        return Err(self.diag_at(buf, i, "text outside top-level element"));
                    }
                }
                Scan::AfterLt => {
                    self.scan = match b {
                        b'/' => Scan::EndTag,
                        b'!' => Scan::AfterBang,
                        b'?' => Scan::Pi,
                        _ => Scan::StartTag {
                            quote: None,
                            slash: false,
                        },
                    };
                }
                Scan::StartTag { quote, slash } => match quote {
                    Some(q) => {
                        if b == q {
                            self.scan = Scan::StartTag {
                                quote: None,
                                slash: false,
                            };
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => {
                            self.scan = Scan::StartTag {
                                quote: Some(b),
                                slash: false,
                            };
                        }
                        b'/' => {
                            self.scan = Scan::StartTag {
                                quote: None,
                                slash: true,
                            };
                        }
                        b'>' => {
                            self.scan = Scan::Content;
                            if slash {
                                // Self-closing element.
                                if self.depth == 0 {
                                    self.emit(chunk, &mut start, i, &mut out, &mut spans)?;
                                }
                            } else {
                                self.depth += 1;
                            }
                        }
                        _ => {
                            self.scan = Scan::StartTag {
                                quote: None,
                                slash: false,
                            };
                        }
                    },
                },
                Scan::EndTag => {
                    if b == b'>' {
                        if self.depth == 0 {
                            return Err(self.diag_at(buf, i, "unexpected closing tag"));
                        }
                        self.depth -= 1;
                        self.scan = Scan::Content;
                        if self.depth == 0 {
                            self.emit(chunk, &mut start, i, &mut out, &mut spans)?;
                        }
                    }
                }
                Scan::AfterBang => {
                    self.scan = match b {
                        b'-' => Scan::CommentOpen,
                        b'[' => Scan::CdataOpen(0),
                        _ => Scan::Decl { quote: None },
                    };
                }
                Scan::CommentOpen => {
                    if b != b'-' {
                        return Err(self.diag_at(buf, i, "malformed comment"));
                    }
                    self.scan = Scan::Comment;
                }
                Scan::Comment => {
                    if b == b'-' {
                        self.scan = Scan::CommentDash;
                    }
                }
                Scan::CommentDash => {
                    self.scan = if b == b'-' {
                        Scan::CommentDashDash
                    } else {
                        Scan::Comment
                    };
                }
                Scan::CommentDashDash => match b {
                    b'>' => {
                        self.scan = Scan::Content;
                        if self.depth == 0 {
                            self.discard_ignorable(&mut start);
                        }
                    }
                    b'-' => {}
                    _ => self.scan = Scan::Comment,
                },
                Scan::CdataOpen(progress) => {
                    if b != CDATA_OPEN[progress as usize] {
                        return Err(self.diag_at(buf, i, "malformed CDATA section"));
                    }
                    self.scan = if progress as usize + 1 == CDATA_OPEN.len() {
                        Scan::Cdata
                    } else {
                        Scan::CdataOpen(progress + 1)
                    };
                }
                Scan::Cdata => {
                    if b == b']' {
                        self.scan = Scan::CdataBracket;
                    }
                }
                Scan::CdataBracket => {
                    self.scan = if b == b']' {
                        Scan::CdataBracketBracket
                    } else {
                        Scan::Cdata
                    };
                }
                Scan::CdataBracketBracket => match b {
                    b'>' => {
                        self.scan = Scan::Content;
                        if self.depth == 0 {
                            self.discard_ignorable(&mut start);
                        }
                    }
                    b']' => {}
                    _ => self.scan = Scan::Cdata,
                },
                Scan::Decl { quote } => match quote {
                    Some(q) => {
                        if b == q {
                            self.scan = Scan::Decl { quote: None };
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => self.scan = Scan::Decl { quote: Some(b) },
                        b'>' => {
                            self.scan = Scan::Content;
                            if self.depth == 0 {
                                self.discard_ignorable(&mut start);
                            }
                        }
                        _ => {}
                    },
                },
                Scan::Pi => {
                    if b == b'?' {
                        self.scan = Scan::PiQuestion;
                    }
                }
                Scan::PiQuestion => {
                    if b == b'>' {
                        self.scan = Scan::Content;
                        if self.depth == 0 {
                            self.discard_ignorable(&mut start);
                        }
                    } else if b != b'?' {
                        self.scan = Scan::Pi;
                    }
                }
            }
            i += 1;
        }

        // End of chunk inside a top-level construct: carry the open tail.
        if self.construct_active() {
            let from = start.unwrap_or(0);
            self.append_carry(&buf[from..])?;
        }

        self.offset += buf.len();

        if !spans.is_empty() {
            let frozen = out.freeze();
            for (span_start, span_len) in spans {
                batch.push(frozen.slice(span_start..span_start + span_len));
            }
        }
        Ok(())
    }

    /// A top-level element just closed at chunk offset `end`; transform its
    /// span to JSON and stage it in the shared output buffer.
    fn emit(
        &mut self,
        chunk: &Bytes,
        start: &mut Option<usize>,
        end: usize,
        out: &mut BytesMut,
        spans: &mut Vec<(usize, usize)>,
    ) -> Result<(), ParseError> {
        let span: Bytes = match start.take() {
            Some(from) if self.carry.is_empty() => chunk.slice(from..end + 1),
            _ => {
                // Straddle: the construct began in an earlier chunk.
                self.append_carry(&chunk[..end + 1])?;
                Bytes::from(std::mem::take(&mut self.carry))
            }
        };

        let value = element_to_json(&span, self.offset + end)?;
        let json = serde_json::to_vec(&value).map_err(|err| {
            ParseError::Invalid(format!("cannot serialize converted element: {err}"))
        })?;

        let at = out.len();
        out.put_slice(&json);
        spans.push((at, json.len()));
        Ok(())
    }

    /// A top-level comment, PI or declaration closed; it produces no record.
    fn discard_ignorable(&mut self, start: &mut Option<usize>) {
        self.carry.clear();
        *start = None;
    }

    fn append_carry(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        if let Some(limit) = self.carry_limit {
            if self.carry.len() + bytes.len() > limit {
                return Err(ParseError::Memory);
            }
        }
        self.carry.extend_from_slice(bytes);
        Ok(())
    }

    fn diag_at(&self, buf: &[u8], pos: usize, reason: &str) -> ParseError {
        let end = (pos + 16).min(buf.len());
        let context = String::from_utf8_lossy(&buf[pos..end]);
        ParseError::Invalid(format!(
            "{reason} at byte {}, near {context:?}",
            self.offset + pos
        ))
    }
}

// ── XML → JSON transform ──────────────────────────────────────────────────────

struct Node {
    tag:        String,
    attributes: Map<String, Value>,
    children:   Vec<Value>,
    text:       String,
}

fn node_from(start: &BytesStart<'_>, at: usize) -> Result<Node, ParseError> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Map::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| {
            ParseError::Invalid(format!("invalid XML attribute near byte {at}: {err}"))
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|err| {
            ParseError::Invalid(format!("invalid XML attribute value near byte {at}: {err}"))
        })?;
        attributes.insert(key, Value::String(value.into_owned()));
    }
    Ok(Node {
        tag,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn finish(node: Node) -> Value {
    let mut map = Map::new();
    map.insert("tag".to_string(), Value::String(node.tag));
    map.insert("attributes".to_string(), Value::Object(node.attributes));
    let text = node.text.trim();
    if !text.is_empty() {
        map.insert("text".to_string(), Value::String(text.to_string()));
    }
    if !node.children.is_empty() {
        map.insert("children".to_string(), Value::Array(node.children));
    }
    Value::Object(map)
}

/// Parse one complete element span into its JSON value.
fn element_to_json(span: &[u8], at: usize) -> Result<Value, ParseError> {
    let invalid =
        |err: quick_xml::Error| ParseError::Invalid(format!("invalid XML near byte {at}: {err}"));

    let mut reader = quick_xml::Reader::from_reader(span);
    let mut stack: Vec<Node> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(node_from(&start, at)?),
            Ok(Event::Empty(start)) => {
                let value = finish(node_from(&start, at)?);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(value),
                    None => return Ok(value),
                }
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().ok_or_else(|| {
                    ParseError::Invalid(format!("unexpected closing tag near byte {at}"))
                })?;
                let value = finish(node);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(value),
                    None => return Ok(value),
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape().map_err(invalid)?);
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)) => {}
            Ok(Event::Eof) => {
                return Err(ParseError::Invalid(format!(
                    "unexpected end of XML element near byte {at}"
                )))
            }
            Err(err) => return Err(invalid(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> XmlStreamParser {
        XmlStreamParser::new(None)
    }

    fn run_chunks(
        parser: &mut XmlStreamParser,
        chunks: &[&[u8]],
    ) -> Result<Vec<Value>, ParseError> {
        let mut records = Vec::new();
        for chunk in chunks {
            let mut batch = MessageBatch::new();
            parser.process_chunk(&Bytes::copy_from_slice(chunk), &mut batch)?;
            for record in batch.into_records() {
                records.push(serde_json::from_slice(&record).unwrap());
            }
        }
        Ok(records)
    }

    #[test]
    fn element_with_attributes_and_children() {
        let records = run_chunks(
            &mut parser(),
            &[br#"<event id="7" kind="net">up<source host="a"/></event>"#],
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0],
            serde_json::json!({
                "tag": "event",
                "attributes": {"id": "7", "kind": "net"},
                "text": "up",
                "children": [
                    {"tag": "source", "attributes": {"host": "a"}}
                ]
            })
        );
    }

    #[test]
    fn two_top_level_elements() {
        let records =
            run_chunks(&mut parser(), &[b"<a x=\"1\"/>\n<b>t</b>"]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["tag"], "a");
        assert_eq!(records[1]["tag"], "b");
        assert_eq!(records[1]["text"], "t");
    }

    #[test]
    fn straddling_element_over_chunks() {
        let body = br#"<event name="straddle"><child attr="v">text</child></event>"#;
        for split in 1..body.len() {
            let (a, b) = body.split_at(split);
            let records = run_chunks(&mut parser(), &[a, b]).unwrap();
            assert_eq!(records.len(), 1, "split at {split}");
            assert_eq!(records[0]["tag"], "event", "split at {split}");
        }
    }

    #[test]
    fn prolog_and_comments_are_skipped() {
        let records = run_chunks(
            &mut parser(),
            &[b"<?xml version=\"1.0\"?><!-- preamble --><a/><!-- trailing -->"],
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["tag"], "a");
    }

    #[test]
    fn angle_brackets_inside_attribute_values() {
        let records =
            run_chunks(&mut parser(), &[br#"<a note="a > b < c"><b/></a>"#]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["attributes"]["note"], "a > b < c");
    }

    #[test]
    fn cdata_becomes_text() {
        let records =
            run_chunks(&mut parser(), &[b"<a><![CDATA[5 < 6 >]]></a>"]).unwrap();
        assert_eq!(records[0]["text"], "5 < 6 >");
    }

    #[test]
    fn comment_inside_element_does_not_break_the_span() {
        let body = b"<a><!-- note --><b/></a>";
        for split in 1..body.len() {
            let (first, second) = body.split_at(split);
            let records = run_chunks(&mut parser(), &[first, second]).unwrap();
            assert_eq!(records.len(), 1, "split at {split}");
            assert_eq!(records[0]["children"][0]["tag"], "b", "split at {split}");
        }
    }

    #[test]
    fn nested_same_name_elements_balance() {
        let records =
            run_chunks(&mut parser(), &[b"<a><a><a/></a></a>"]).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn text_outside_elements_is_rejected() {
        let err = run_chunks(&mut parser(), &[b"junk<a/>"]).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn stray_closing_tag_is_rejected() {
        let err = run_chunks(&mut parser(), &[b"</a><a/>"]).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn empty_chunk_is_a_noop() {
        let mut p = parser();
        let mut batch = MessageBatch::new();
        p.process_chunk(&Bytes::from_static(b"<a>"), &mut batch)
            .unwrap();
        let carried = p.carry_len();
        p.process_chunk(&Bytes::new(), &mut batch).unwrap();
        assert_eq!(p.carry_len(), carried);
        p.process_chunk(&Bytes::from_static(b"</a>"), &mut batch)
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn records_from_one_chunk_share_the_output_buffer() {
        let mut batch = MessageBatch::new();
        parser()
            .process_chunk(&Bytes::from_static(b"<a/><b/>"), &mut batch)
            .unwrap();
        assert_eq!(batch.len(), 2);
        let first_range = batch.records()[0].as_ptr() as usize
            ..batch.records()[0].as_ptr() as usize + batch.records()[0].len();
        let second = batch.records()[1].as_ptr() as usize;
        // Contiguous slices of one frozen buffer.
        assert_eq!(second, first_range.end);
    }

    #[test]
    fn carry_limit_stops_runaway_elements() {
        let mut p = XmlStreamParser::new(Some(8));
        let mut batch = MessageBatch::new();
        let err = p
            .process_chunk(
                &Bytes::from_static(b"<element-name-way-too-long"),
                &mut batch,
            )
            .unwrap_err();
        assert_eq!(err, ParseError::Memory);
    }
}
