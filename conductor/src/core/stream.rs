//! Signal stream parser for the agent's newline-delimited JSON output.
//!
//! Wire format, one record per line:
//!
//! ```text
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."},{"type":"tool_use","name":"Edit",...}],"usage":{...}}}
//! {"type":"result","result":"...","usage":{...}}
//! ```
//!
//! Malformed lines and unknown record types are skipped. Every text fragment is
//! scanned for sentinels; the first sentinel of each category (failure,
//! completion, bailout) is kept.

use std::io::{BufRead, Read};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::sentinel::{Signal, SignalKind, decisive_signal};

/// Line-level failures of the stream itself.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A single record exceeded the configured line cap.
    #[error("stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("read agent stream")]
    Read(#[source] std::io::Error),
}

/// Reads newline-delimited records into a growable buffer, bounded only by `max_line_bytes`.
pub struct LineReader<R> {
    reader: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<String>, StreamError> {
        self.buf.clear();
        let cap = self.max_line_bytes as u64 + 1;
        let read = (&mut self.reader)
            .take(cap)
            .read_until(b'\n', &mut self.buf)
            .map_err(StreamError::Read)?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        } else if self.buf.len() > self.max_line_bytes {
            return Err(StreamError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
    },
    #[serde(other)]
    Other,
}

/// Token counters reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

/// Everything the classifier needs from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub failure: Option<Signal>,
    pub completion: Option<Signal>,
    pub bailout: Option<Signal>,
    pub usage: TokenUsage,
    pub last_tool: Option<String>,
    /// Bounded tail of the text fragments.
    pub last_output: String,
    /// Assistant text, only when collection was requested.
    pub text: Option<String>,
    /// Text of `result` records, only when collection was requested. The agent
    /// repeats its final assistant message here.
    pub result_text: Option<String>,
    pub lines: usize,
    pub skipped_lines: usize,
}

impl StreamSummary {
    /// Collected text for decoding: the `result` text when the stream had one,
    /// otherwise the assistant text.
    pub fn collected_text(&self) -> Option<&str> {
        self.result_text.as_deref().or(self.text.as_deref())
    }
}

type CancelHook<'a> = Box<dyn FnMut(&Signal) + 'a>;

/// Incremental parser fed one line at a time.
pub struct StreamParser<'a> {
    on_terminal: Option<CancelHook<'a>>,
    cancelled: bool,
    tail_bytes: usize,
    summary: StreamSummary,
}

impl<'a> StreamParser<'a> {
    pub fn new(tail_bytes: usize) -> Self {
        Self {
            on_terminal: None,
            cancelled: false,
            tail_bytes,
            summary: StreamSummary::default(),
        }
    }

    /// Invoke `hook` once, on the first failure or bailout sentinel.
    pub fn with_cancel(mut self, hook: impl FnMut(&Signal) + 'a) -> Self {
        self.on_terminal = Some(Box::new(hook));
        self
    }

    /// Keep the full text (analysis runs decode observations from it).
    pub fn collect_text(mut self) -> Self {
        self.summary.text = Some(String::new());
        self
    }

    pub fn feed_line(&mut self, line: &str) {
        self.summary.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                trace!(err = %err, "skipping malformed stream line");
                self.summary.skipped_lines += 1;
                return;
            }
        };
        match event {
            StreamEvent::Assistant { message } => {
                if let Some(usage) = &message.usage {
                    self.summary.usage.add(usage);
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.feed_text(&text, false),
                        ContentBlock::ToolUse { name } => self.summary.last_tool = Some(name),
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result { result, usage } => {
                if let Some(usage) = usage
                    && usage.total() > self.summary.usage.total()
                {
                    self.summary.usage = usage;
                }
                if let Some(text) = result {
                    self.feed_text(&text, true);
                }
            }
            StreamEvent::Other => {}
        }
    }

    fn feed_text(&mut self, text: &str, from_result: bool) {
        push_tail(&mut self.summary.last_output, text, self.tail_bytes);
        if self.summary.text.is_some() {
            let collected = if from_result {
                self.summary.result_text.get_or_insert_with(String::new)
            } else {
                self.summary.text.get_or_insert_with(String::new)
            };
            if !collected.is_empty() {
                collected.push('\n');
            }
            collected.push_str(text);
        }

        let Some(signal) = decisive_signal(text) else {
            return;
        };
        let slot = match signal.kind {
            SignalKind::PlanComplete => &mut self.summary.completion,
            SignalKind::Bailout => &mut self.summary.bailout,
            _ => &mut self.summary.failure,
        };
        if slot.is_some() {
            return;
        }
        debug!(kind = %signal.kind, detail = %signal.detail, "sentinel detected");
        *slot = Some(signal.clone());

        if signal.kind.stops_execution()
            && !self.cancelled
            && let Some(hook) = self.on_terminal.as_mut()
        {
            self.cancelled = true;
            hook(&signal);
        }
    }

    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    pub fn finish(self) -> StreamSummary {
        self.summary
    }
}

/// Parse a complete stream held in memory.
pub fn parse_stream(input: &str, tail_bytes: usize) -> StreamSummary {
    let mut parser = StreamParser::new(tail_bytes);
    for line in input.lines() {
        parser.feed_line(line);
    }
    parser.finish()
}

/// Append `text` to `tail`, keeping at most `limit` bytes on a char boundary.
pub fn push_tail(tail: &mut String, text: &str, limit: usize) {
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(text);
    if tail.len() <= limit {
        return;
    }
    let mut cut = tail.len() - limit;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    tail.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TAIL: usize = 4096;

    #[test]
    fn result_record_yields_failure_with_detail() {
        let summary = parse_stream(
            r####"{"type":"result","result":"Tests failed ###PLAN_FAILED:test_infrastructure### see log"}"####,
            TAIL,
        );
        let failure = summary.failure.expect("failure");
        assert_eq!(failure.kind, SignalKind::PlanFailed);
        assert_eq!(failure.detail, "test_infrastructure");
    }

    #[test]
    fn assistant_text_yields_sentinel_with_colons() {
        let line = r####"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}},{"type":"text","text":"###BLOCKED:db: host: unreachable###"}]}}"####;
        let summary = parse_stream(line, TAIL);
        let failure = summary.failure.expect("failure");
        assert_eq!(failure.kind, SignalKind::Blocked);
        assert_eq!(failure.detail, "db: host: unreachable");
        assert_eq!(summary.last_tool.as_deref(), Some("Bash"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = [
            "not json",
            r####"{"type":"assistant","message":{"content":[{"type":"text","text":"working"####,
            r####"{"type":"system","subtype":"init"}"####,
            r####"{"type":"result","result":"###PLAN_COMPLETE###"}"####,
        ]
        .join("\n");
        let summary = parse_stream(&input, TAIL);
        assert_eq!(summary.skipped_lines, 2);
        assert_eq!(
            summary.completion.map(|signal| signal.kind),
            Some(SignalKind::PlanComplete)
        );
    }

    #[test]
    fn first_signal_per_category_wins() {
        let input = [
            r####"{"type":"assistant","message":{"content":[{"type":"text","text":"###TASK_FAILED:first###"}]}}"####,
            r####"{"type":"assistant","message":{"content":[{"type":"text","text":"###BUILD_FAILED:second###"}]}}"####,
        ]
        .join("\n");
        let summary = parse_stream(&input, TAIL);
        assert_eq!(summary.failure.expect("failure").detail, "first");
    }

    #[test]
    fn cancel_hook_fires_once_on_failure_or_bailout() {
        let mut fired = Vec::new();
        {
            let mut parser =
                StreamParser::new(TAIL).with_cancel(|signal: &Signal| fired.push(signal.kind));
            parser.feed_line(r####"{"type":"result","result":"###PLAN_COMPLETE###"}"####);
            parser.feed_line(r####"{"type":"result","result":"###BAILOUT:context###"}"####);
            parser.feed_line(r####"{"type":"result","result":"###TEST_FAILED:x###"}"####);
        }
        assert_eq!(fired, vec![SignalKind::Bailout]);
    }

    #[test]
    fn usage_accumulates_and_result_can_raise_it() {
        let input = [
            r####"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":100,"output_tokens":10}}}"####,
            r####"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":200,"output_tokens":20}}}"####,
            r####"{"type":"result","result":"done","usage":{"input_tokens":50,"output_tokens":5}}"####,
        ]
        .join("\n");
        let summary = parse_stream(&input, TAIL);
        assert_eq!(summary.usage.total(), 330);

        let raised = parse_stream(
            r####"{"type":"result","result":"done","usage":{"input_tokens":1000,"output_tokens":1}}"####,
            TAIL,
        );
        assert_eq!(raised.usage.total(), 1001);
    }

    #[test]
    fn tail_is_bounded_on_char_boundaries() {
        let mut tail = String::new();
        push_tail(&mut tail, "ééééé", 5);
        assert!(tail.len() <= 5);
        assert!(tail.ends_with('é'));
    }

    #[test]
    fn line_reader_handles_lines_longer_than_buffer() {
        let long = "x".repeat(200_000);
        let input = format!("{long}\nshort\n");
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()), 1 << 20);
        assert_eq!(reader.next_line().expect("line").expect("some").len(), 200_000);
        assert_eq!(reader.next_line().expect("line").as_deref(), Some("short"));
        assert!(reader.next_line().expect("eof").is_none());
    }

    #[test]
    fn line_reader_reports_oversized_line_distinctly() {
        let input = format!("{}\n", "y".repeat(64));
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()), 16);
        let err = reader.next_line().expect_err("too long");
        assert!(matches!(err, StreamError::LineTooLong { limit: 16 }));
    }
}
