// kafkagate/src/decode/mod.rs
//
// Decoder capability interface between listeners and per-request processing.
//
// Four variants:
//   Dumb                 — buffer the whole payload, one record to the
//                          configured default topic
//   Passthrough          — every callback's bytes become one record
//   StreamingJson        — incremental per-object extraction, URL-routed
//                          topic; switches to the XML transform on a
//                          content-type hint
//   StreamingJsonFromXml — same pipeline with the XML transform forced
//
// A listener holds a DecoderKind; each request (or datagram) gets a session
// created through it. Lifecycle per session: new → on_chunk* → end_of_body →
// response.

pub mod json_stream;
pub mod session;
pub mod xml_stream;

pub use json_stream::{JsonStreamParser, ParseError};
pub use session::{RequestVars, StreamSession};
pub use xml_stream::XmlStreamParser;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecoderError;
use crate::kafka::{KafkaSink, TopicRegistry};

const VALIDATOR_PREFIX: &str = "/v1/meraki/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Dumb,
    Passthrough,
    StreamingJson,
    StreamingJsonFromXml,
}

impl DecoderKind {
    pub fn name(&self) -> &'static str {
        match self {
            DecoderKind::Dumb => "dumb",
            DecoderKind::Passthrough => "passthrough",
            DecoderKind::StreamingJson => "streaming_json",
            DecoderKind::StreamingJsonFromXml => "streaming_json_xml",
        }
    }

    /// Streaming decoders route on the request URL and need an HTTP listener.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            DecoderKind::StreamingJson | DecoderKind::StreamingJsonFromXml
        )
    }

    /// Create the per-request session.
    pub fn new_session(
        &self,
        sink: Arc<KafkaSink>,
        topics: &TopicRegistry,
        default_topic: Option<&str>,
        vars: &RequestVars,
        memory_limit: Option<usize>,
    ) -> Result<Session, DecoderError> {
        match self {
            DecoderKind::Dumb => Ok(Session::Dumb(DumbSession::new(
                sink,
                default_topic,
                memory_limit,
            )?)),
            DecoderKind::Passthrough => Ok(Session::Passthrough(PassthroughSession::new(
                sink,
                default_topic,
            )?)),
            DecoderKind::StreamingJson => Ok(Session::Streaming(StreamSession::new(
                sink,
                topics,
                vars,
                memory_limit,
                /* force_xml */ false,
            )?)),
            DecoderKind::StreamingJsonFromXml => Ok(Session::Streaming(StreamSession::new(
                sink,
                topics,
                vars,
                memory_limit,
                /* force_xml */ true,
            )?)),
        }
    }
}

/// GET validator: echo the token after the validation prefix.
pub fn validate_url(uri: &str) -> Result<&str, DecoderError> {
    uri.strip_prefix(VALIDATOR_PREFIX)
        .ok_or(DecoderError::ResourceNotFound)
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Per-request state, one per HTTP request, TCP connection or UDP datagram.
pub enum Session {
    Dumb(DumbSession),
    Passthrough(PassthroughSession),
    Streaming(StreamSession),
}

impl Session {
    pub fn on_chunk(&mut self, chunk: Bytes) -> Result<(), DecoderError> {
        match self {
            Session::Dumb(s) => s.on_chunk(chunk),
            Session::Passthrough(s) => s.on_chunk(chunk),
            Session::Streaming(s) => s.on_chunk(chunk),
        }
    }

    /// The body is complete; buffering decoders produce here.
    pub fn end_of_body(&mut self) -> Result<(), DecoderError> {
        match self {
            Session::Dumb(s) => s.end_of_body(),
            Session::Passthrough(_) | Session::Streaming(_) => Ok(()),
        }
    }

    pub fn messages_queued(&self) -> usize {
        match self {
            Session::Dumb(s) => s.queued,
            Session::Passthrough(s) => s.queued,
            Session::Streaming(s) => s.messages_queued(),
        }
    }

    /// Terminal response body, if this session produces one.
    pub fn response_body(&self) -> Option<ResponseBody> {
        match self {
            Session::Dumb(_) | Session::Passthrough(_) => None,
            Session::Streaming(s) => Some(s.render_response()),
        }
    }
}

/// A rendered terminal response.
pub struct ResponseBody {
    pub content_type: &'static str,
    pub body:         String,
}

/// Whole-body buffering session: one record on the default topic.
pub struct DumbSession {
    sink:   Arc<KafkaSink>,
    topic:  String,
    buf:    BytesMut,
    limit:  Option<usize>,
    queued: usize,
}

impl DumbSession {
    fn new(
        sink: Arc<KafkaSink>,
        default_topic: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Self, DecoderError> {
        let topic = default_topic.ok_or(DecoderError::UnknownTopic)?;
        Ok(Self {
            sink,
            topic: topic.to_string(),
            buf: BytesMut::new(),
            limit,
            queued: 0,
        })
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), DecoderError> {
        if let Some(limit) = self.limit {
            if self.buf.len() + chunk.len() > limit {
                return Err(DecoderError::MemoryError);
            }
        }
        self.buf.put_slice(&chunk);
        Ok(())
    }

    fn end_of_body(&mut self) -> Result<(), DecoderError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.buf).freeze();
        self.sink.produce_record(&self.topic, payload)?;
        self.queued += 1;
        Ok(())
    }
}

/// Stateless line-protocol session: each callback's bytes are one record.
pub struct PassthroughSession {
    sink:   Arc<KafkaSink>,
    topic:  String,
    queued: usize,
}

impl PassthroughSession {
    fn new(sink: Arc<KafkaSink>, default_topic: Option<&str>) -> Result<Self, DecoderError> {
        let topic = default_topic.ok_or(DecoderError::UnknownTopic)?;
        Ok(Self {
            sink,
            topic: topic.to_string(),
            queued: 0,
        })
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Result<(), DecoderError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.sink.produce_record(&self.topic, chunk)?;
        self.queued += 1;
        Ok(())
    }
}
