//! Incremental parser for streamed explanations.
//!
//! The generation endpoint answers with `data: {"content": "..."}` events
//! separated by a blank line. The model is asked to write plain paragraphs,
//! then a `---` line, then a single-line JSON object with related topics and
//! questions. Both halves arrive chopped into arbitrary fragments and the
//! fragments themselves arrive chopped into arbitrary byte frames.
//!
//! Three layers deal with that, innermost first:
//!
//! * [`Utf8Decoder`] turns frames into text, holding back a character whose
//!   bytes straddle two frames.
//! * [`EventSplitter`] keeps the undelimited remainder between reads and hands
//!   out complete events in arrival order.
//! * [`StreamAssembler`] runs the text/JSON state machine over those events and
//!   feeds [`StreamChunk`]s to the sink.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::{RawTail, StreamChunk};

const EVENT_DELIMITER: &str = "\n\n";
const DATA_PREFIX: &str = "data:";
const SEPARATOR: &str = "---";

/// UTF-8 decoder that tolerates characters split across frames.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `carry + bytes` as possible. An incomplete sequence
    /// at the very end is kept for the next call; invalid bytes become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let input = std::mem::take(&mut self.carry);

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }
}

/// Splits decoded text into `\n\n`-delimited events.
#[derive(Debug, Default)]
pub struct EventSplitter {
    decoder: Utf8Decoder,
    pending: String,
}

impl EventSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one frame and moves every complete event to the back of `queue`.
    pub fn push(&mut self, frame: &[u8], queue: &mut VecDeque<String>) {
        let text = self.decoder.decode(frame);
        self.pending.push_str(&text);

        let mut consumed = 0;
        while let Some(pos) = self.pending[consumed..].find(EVENT_DELIMITER) {
            let end = consumed + pos;
            queue.push_back(self.pending[consumed..end].to_string());
            consumed = end + EVENT_DELIMITER.len();
        }
        self.pending.drain(..consumed);
    }

    /// Size of the unterminated remainder, which is dropped when the stream ends.
    pub fn leftover(&self) -> usize {
        self.pending.len() + self.decoder.pending_bytes()
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    content: Option<String>,
}

/// Extracts the `content` of one event.
///
/// `Ok(None)` means the event carries nothing for us (comment line, keep-alive,
/// empty data). `Err` is a decode failure the caller should skip.
pub fn event_content(event: &str) -> Result<Option<String>, serde_json::Error> {
    let Some(data) = event.trim_start().strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    let payload: EventPayload = serde_json::from_str(data)?;
    Ok(Some(payload.content.unwrap_or_default()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Text,
    Json,
}

/// How the structured tail of a stream turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailStatus {
    /// The JSON tail was parsed and emitted with the final chunk.
    Complete,
    /// The stream ended without a `---` separator.
    Missing,
    /// The stream ended while the JSON tail was still unparsable.
    Incomplete { buffered: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub events: usize,
    pub skipped: usize,
    pub leftover: usize,
    pub tail: TailStatus,
}

/// The text/JSON state machine of one streamed explanation.
///
/// All buffers live as long as one call; create a fresh assembler per stream.
#[derive(Debug)]
pub struct StreamAssembler {
    splitter: EventSplitter,
    queue: VecDeque<String>,
    phase: Phase,
    main_text: String,
    json_buffer: String,
    tail_done: bool,
    events: usize,
    skipped: usize,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            splitter: EventSplitter::new(),
            queue: VecDeque::new(),
            phase: Phase::Text,
            main_text: String::new(),
            json_buffer: String::new(),
            tail_done: false,
            events: 0,
            skipped: 0,
        }
    }

    /// Feeds one raw frame, calling `sink` for every chunk it produces, in order.
    pub fn feed<F>(&mut self, frame: &[u8], sink: &mut F)
    where
        F: FnMut(StreamChunk),
    {
        self.splitter.push(frame, &mut self.queue);
        while let Some(event) = self.queue.pop_front() {
            self.events += 1;
            match event_content(&event) {
                Ok(Some(content)) => self.on_content(&content, sink),
                Ok(None) => {}
                Err(err) => {
                    self.skipped += 1;
                    log::warn!("Skipping undecodable stream event {:?}: {}", event, err);
                }
            }
        }
    }

    /// Ends the stream. Whatever is still unterminated is discarded.
    pub fn finish(self) -> StreamSummary {
        let tail = if self.phase == Phase::Json {
            TailStatus::Incomplete {
                buffered: self.json_buffer.len(),
            }
        } else if self.tail_done {
            TailStatus::Complete
        } else {
            TailStatus::Missing
        };

        let leftover = self.splitter.leftover();
        if leftover > 0 {
            log::debug!("Discarding {} bytes of unterminated stream data", leftover);
        }
        if let TailStatus::Incomplete { buffered } = tail {
            log::warn!("Stream ended before the related-content JSON closed ({} bytes buffered)", buffered);
        }

        StreamSummary {
            events: self.events,
            skipped: self.skipped,
            leftover,
            tail,
        }
    }

    fn on_content<F>(&mut self, content: &str, sink: &mut F)
    where
        F: FnMut(StreamChunk),
    {
        match self.phase {
            Phase::Text => match content.split_once(SEPARATOR) {
                Some((before, after)) => {
                    self.main_text.push_str(before.trim());
                    self.json_buffer = after.trim().to_string();
                    self.phase = Phase::Json;
                    self.try_close_tail(sink);
                }
                None => {
                    self.main_text.push_str(content.trim());
                    self.main_text.push(' ');
                    sink(StreamChunk {
                        text: self.main_text.trim().to_string(),
                        ..Default::default()
                    });
                }
            },
            Phase::Json => {
                self.json_buffer.push_str(content.trim());
                self.try_close_tail(sink);
            }
        }
    }

    fn try_close_tail<F>(&mut self, sink: &mut F)
    where
        F: FnMut(StreamChunk),
    {
        if !self.json_buffer.ends_with('}') {
            return;
        }
        match serde_json::from_str::<RawTail>(&self.json_buffer) {
            Ok(tail) => {
                let (topics, questions) = tail.into_related();
                sink(StreamChunk {
                    text: self.main_text.trim().to_string(),
                    topics,
                    questions,
                });
                self.json_buffer.clear();
                self.phase = Phase::Text;
                self.tail_done = true;
            }
            // A `}` inside a string value, or a nested object closing early.
            Err(err) => log::debug!("Related-content JSON not complete yet: {}", err),
        }
    }
}

/// Drives a [`StreamAssembler`] over an async stream of frames.
///
/// Each frame is awaited in turn; `sink` runs synchronously for every chunk.
/// A frame error stops assembly and is returned as is; chunks already handed
/// to the sink stay delivered.
pub async fn assemble<S, B, E, F>(frames: S, mut sink: F) -> Result<StreamSummary, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    F: FnMut(StreamChunk),
{
    let mut assembler = StreamAssembler::new();
    futures::pin_mut!(frames);
    while let Some(frame) = frames.next().await {
        assembler.feed(frame?.as_ref(), &mut sink);
    }
    Ok(assembler.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::{QuestionKind, TopicKind};

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "content": content })
        )
    }

    fn run(frames: &[Vec<u8>]) -> (Vec<StreamChunk>, StreamSummary) {
        let mut chunks = Vec::new();
        let mut assembler = StreamAssembler::new();
        for frame in frames {
            assembler.feed(frame, &mut |c| chunks.push(c));
        }
        (chunks, assembler.finish())
    }

    fn frames_of(events: &[&str]) -> Vec<Vec<u8>> {
        events.iter().map(|e| event(e).into_bytes()).collect()
    }

    #[test]
    fn hello_world_stream() {
        let (chunks, summary) = run(&frames_of(&[
            "Hello ",
            "world. ",
            "---",
            r#"{"topics":[],"#,
            r#""questions":[]}"#,
        ]));

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "Hello world.", "Hello world."]);
        assert_eq!(chunks.last().unwrap(), &StreamChunk {
            text: "Hello world.".into(),
            topics: vec![],
            questions: vec![],
        });
        assert_eq!(summary.tail, TailStatus::Complete);
        assert_eq!(summary.events, 5);
    }

    #[test]
    fn tail_that_never_closes_leaves_the_last_text_update() {
        let (chunks, summary) = run(&frames_of(&["Hello ", "world. ", "---", r#"{"topics":[],"#]));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.last().unwrap().text, "Hello world.");
        assert!(chunks.iter().all(|c| c.topics.is_empty() && c.questions.is_empty()));
        assert_eq!(summary.tail, TailStatus::Incomplete { buffered: 13 });
    }

    #[test]
    fn related_items_are_parsed_from_fragments() {
        let (chunks, _) = run(&frames_of(&[
            "Photosynthesis turns light",
            "into sugar. ---",
            r#"{"topics":[{"topic":"Chlorophyll","type":"prerequisite","#,
            r#""reason":"Absorbs light"}],"questions":[{"question":"What if pla"#,
            r#"nts glowed?","type":"curiosity","context":"Bioluminescence"}]}"#,
        ]));

        let last = chunks.last().unwrap();
        assert_eq!(last.text, "Photosynthesis turns light into sugar.");
        assert_eq!(last.topics.len(), 1);
        assert_eq!(last.topics[0].topic, "Chlorophyll");
        assert_eq!(last.topics[0].kind, TopicKind::Prerequisite);
        assert_eq!(last.questions[0].question, "What if plants glowed?");
        assert_eq!(last.questions[0].kind, QuestionKind::Curiosity);
    }

    #[test]
    fn item_with_null_field_does_not_sink_the_tail() {
        let (chunks, summary) = run(&frames_of(&[
            "Text. ",
            "---",
            r#"{"topics":[{"topic":"A","type":"deeper","reason":null},{"topic":"B","type":null,"reason":"ok"},"#,
            r#"{"topic":"C","type":"parallel","reason":"ok"}],"questions":[]}"#,
        ]));

        assert_eq!(summary.tail, TailStatus::Complete);
        let last = chunks.last().unwrap();
        assert_eq!(last.text, "Text.");
        let names: Vec<&str> = last.topics.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(last.topics[0].reason, "");
    }

    #[test]
    fn separator_and_whole_tail_in_one_event() {
        let (chunks, summary) = run(&frames_of(&[
            "Short answer.",
            r#"--- {"topics":[],"questions":[]}"#,
        ]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "Short answer.");
        assert_eq!(summary.tail, TailStatus::Complete);
    }

    #[test]
    fn brace_inside_a_string_does_not_end_the_tail() {
        let (chunks, summary) = run(&frames_of(&[
            "Sets. ",
            "---",
            r#"{"topics":[{"topic":"{x}"#,
            r#"","type":"deeper","reason":"r"}],"questions":[]}"#,
        ]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].topics[0].topic, "{x}");
        assert_eq!(summary.tail, TailStatus::Complete);
    }

    #[test]
    fn multibyte_characters_split_across_frames() {
        let whole = event("Ünïcödé ß 日本語 🚀").into_bytes();
        let unsplit = run(&[whole.clone()]).0;

        for cut in 1..whole.len() {
            let (a, b) = whole.split_at(cut);
            let (chunks, _) = run(&[a.to_vec(), b.to_vec()]);
            assert_eq!(chunks, unsplit, "split at byte {}", cut);
        }
        assert_eq!(unsplit[0].text, "Ünïcödé ß 日本語 🚀");
    }

    #[test]
    fn byte_at_a_time() {
        let bytes: Vec<u8> = frames_of(&["Ça va? ", "Très bien."]).concat();
        let frames: Vec<Vec<u8>> = bytes.iter().map(|b| vec![*b]).collect();
        let (chunks, _) = run(&frames);
        assert_eq!(chunks.last().unwrap().text, "Ça va? Très bien.");
    }

    #[test]
    fn each_event_is_consumed_once() {
        let frame = event("again").into_bytes();
        let (chunks, summary) = run(&[frame.clone(), frame]);
        assert_eq!(summary.events, 2);
        assert_eq!(chunks[0].text, "again");
        assert_eq!(chunks[1].text, "again again");
    }

    #[test]
    fn bad_events_are_skipped_not_fatal() {
        let mut frames = frames_of(&["one"]);
        frames.push(b"data: {not json}\n\n".to_vec());
        frames.push(b": keep-alive\n\n".to_vec());
        frames.push(b"data: \n\n".to_vec());
        frames.extend(frames_of(&["two"]));

        let (chunks, summary) = run(&frames);
        assert_eq!(chunks.last().unwrap().text, "one two");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.events, 5);
        assert_eq!(summary.tail, TailStatus::Missing);
    }

    #[test]
    fn unterminated_trailing_event_is_dropped() {
        let mut frames = frames_of(&["kept"]);
        frames.push(br#"data: {"content":"lost"}"#.to_vec());
        let (chunks, summary) = run(&frames);
        assert_eq!(chunks.len(), 1);
        assert!(summary.leftover > 0);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE6, 0x97]), "");
        assert_eq!(decoder.pending_bytes(), 2);
        assert_eq!(decoder.decode(&[0xA5]), "日");
    }

    #[tokio::test]
    async fn assemble_over_an_async_stream() {
        let frames: Vec<Result<Vec<u8>, std::io::Error>> =
            frames_of(&["Hi ", "---", r#"{"topics":[],"questions":[]}"#])
                .into_iter()
                .map(Ok)
                .collect();

        let mut chunks = Vec::new();
        let summary = assemble(futures::stream::iter(frames), |c| chunks.push(c))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(summary.tail, TailStatus::Complete);
    }

    #[tokio::test]
    async fn frame_error_stops_but_keeps_delivered_text() {
        let frames = vec![
            Ok(event("Partial").into_bytes()),
            Err("connection reset"),
            Ok(event("never").into_bytes()),
        ];

        let mut chunks = Vec::new();
        let result = assemble(futures::stream::iter(frames), |c| chunks.push(c)).await;
        assert_eq!(result.unwrap_err(), "connection reset");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Partial");
    }
}
