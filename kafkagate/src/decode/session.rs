// kafkagate/src/decode/session.rs
//
// Per-request streaming session.
//
// Owns the topic handle, the parser and the pending batch for one request.
// The topic comes from the URL: records POSTed to /v1/<topic> go to <topic>,
// and an authenticated consumer id scopes it to <consumer>_<topic>. Each body
// chunk is parsed, the records it closed are flushed to the sink as one
// batch, and the count the sink accepted feeds the terminal response.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::error;

use crate::decode::json_stream::{JsonStreamParser, ParseError};
use crate::decode::xml_stream::XmlStreamParser;
use crate::decode::ResponseBody;
use crate::error::DecoderError;
use crate::kafka::batch::MessageBatch;
use crate::kafka::topics::TopicHandle;
use crate::kafka::{KafkaSink, TopicRegistry};

const URL_TOPIC_PREFIX: &str = "/v1/";
/// Characters terminating the topic segment of the URL.
const URL_SPECIALS: &[u8] = b";/?:@=&";

/// Request attributes the listener hands to the decoder.
#[derive(Debug, Clone, Default)]
pub struct RequestVars {
    pub uri:          String,
    pub client_ip:    String,
    /// Authenticated consumer id, if any; prefixes the topic name.
    pub consumer_id:  Option<String>,
    pub content_type: Option<String>,
}

/// Extract the topic from `/v1/<topic>`; anything from the first special
/// character on is ignored, so `/v1/t;x`, `/v1/t?x` and `/v1/t/x` all route
/// to `t`.
fn extract_url_topic(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix(URL_TOPIC_PREFIX)?;
    let end = rest
        .bytes()
        .position(|b| URL_SPECIALS.contains(&b))
        .unwrap_or(rest.len());
    let topic = &rest[..end];
    (!topic.is_empty()).then_some(topic)
}

fn is_xml_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.split(';').next().unwrap_or(ct).trim();
            ct.to_ascii_lowercase().ends_with("xml")
        })
        .unwrap_or(false)
}

enum Parser {
    Json(JsonStreamParser),
    Xml(XmlStreamParser),
}

pub struct StreamSession {
    sink:            Arc<KafkaSink>,
    topic:           Arc<TopicHandle>,
    parser:          Parser,
    messages_queued: usize,
    diagnostic:      Option<String>,
    xml_response:    bool,
}

impl StreamSession {
    pub fn new(
        sink: Arc<KafkaSink>,
        topics: &TopicRegistry,
        vars: &RequestVars,
        memory_limit: Option<usize>,
        force_xml: bool,
    ) -> Result<Self, DecoderError> {
        let Some(topic_name) = extract_url_topic(&vars.uri) else {
            error!(
                "couldn't extract url topic from {} (client {})",
                vars.uri, vars.client_ip
            );
            return Err(DecoderError::ResourceNotFound);
        };

        let effective = match &vars.consumer_id {
            Some(consumer) => format!("{consumer}_{topic_name}"),
            None => topic_name.to_string(),
        };

        let topic = topics.get(&effective, Instant::now()).map_err(|err| {
            error!(
                "invalid topic {effective} received from client {}: {err}",
                vars.client_ip
            );
            DecoderError::UnknownTopic
        })?;

        let xml = force_xml || is_xml_content_type(vars.content_type.as_deref());
        let parser = if xml {
            Parser::Xml(XmlStreamParser::new(memory_limit))
        } else {
            Parser::Json(JsonStreamParser::new(memory_limit))
        };

        Ok(Self {
            sink,
            topic,
            parser,
            messages_queued: 0,
            diagnostic: None,
            xml_response: xml,
        })
    }

    /// Parse one body chunk and flush whatever it closed to the sink.
    pub fn on_chunk(&mut self, chunk: Bytes) -> Result<(), DecoderError> {
        let mut batch = MessageBatch::new();
        let parse_result = match &mut self.parser {
            Parser::Json(p) => p.process_chunk(&chunk, &mut batch),
            Parser::Xml(p) => p.process_chunk(&chunk, &mut batch),
        };

        let parsed = batch.len();
        let queued = if parsed > 0 {
            self.sink.produce_batch(&self.topic, batch)
        } else {
            0
        };
        self.messages_queued += queued;

        match parse_result {
            Err(ParseError::Memory) => {
                self.diagnostic = Some("memory limit exceeded".to_string());
                Err(DecoderError::MemoryError)
            }
            Err(ParseError::Invalid(diag)) => {
                self.diagnostic = Some(diag);
                Err(DecoderError::InvalidRequest)
            }
            Ok(()) if queued < parsed => Err(self.sink.partial_batch_error()),
            Ok(()) => Ok(()),
        }
    }

    /// Count the sink accepted for delivery, not the count parsed.
    pub fn messages_queued(&self) -> usize {
        self.messages_queued
    }

    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    /// Terminal response: queued-message count plus the parser diagnostic on
    /// error, in the format matching the record branch.
    pub fn render_response(&self) -> ResponseBody {
        if self.xml_response {
            let mut body = format!(
                "<result><messages_queued>{}</messages_queued>",
                self.messages_queued
            );
            if let Some(diag) = &self.diagnostic {
                body.push_str("<errors>");
                body.push_str(&xml_escape(diag));
                body.push_str("</errors>");
            }
            body.push_str("</result>");
            ResponseBody {
                content_type: "application/xml",
                body,
            }
        } else {
            let mut value = serde_json::json!({ "messages_queued": self.messages_queued });
            if let Some(diag) = &self.diagnostic {
                value["json_decoder_error"] = serde_json::Value::String(diag.clone());
            }
            ResponseBody {
                content_type: "application/json",
                body: value.to_string(),
            }
        }
    }
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
