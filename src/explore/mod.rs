pub mod stream;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// How a related topic connects to the one being explained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Prerequisite,
    Extension,
    Application,
    Parallel,
    Deeper,
}

impl TopicKind {
    pub const ALL: [TopicKind; 5] = [
        TopicKind::Prerequisite,
        TopicKind::Extension,
        TopicKind::Application,
        TopicKind::Parallel,
        TopicKind::Deeper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Prerequisite => "prerequisite",
            TopicKind::Extension => "extension",
            TopicKind::Application => "application",
            TopicKind::Parallel => "parallel",
            TopicKind::Deeper => "deeper",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Curiosity,
    Mechanism,
    Causality,
    Innovation,
    Insight,
}

impl QuestionKind {
    pub const ALL: [QuestionKind; 5] = [
        QuestionKind::Curiosity,
        QuestionKind::Mechanism,
        QuestionKind::Causality,
        QuestionKind::Innovation,
        QuestionKind::Insight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Curiosity => "curiosity",
            QuestionKind::Mechanism => "mechanism",
            QuestionKind::Causality => "causality",
            QuestionKind::Innovation => "innovation",
            QuestionKind::Insight => "insight",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL.into_iter().find(|k| k.as_str().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: TopicKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub context: String,
}

/// One update for the chat while an explanation streams in.
///
/// `text` is everything received so far, not a delta. Only the last chunk of a
/// successful stream carries topics and questions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub topics: Vec<TopicRef>,
    pub questions: Vec<QuestionRef>,
}

/// Answer of the non-streamed explore request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploreResponse {
    pub content: String,
    pub related_topics: Vec<TopicRef>,
    pub related_questions: Vec<QuestionRef>,
}

impl From<ExploreResponse> for StreamChunk {
    fn from(response: ExploreResponse) -> Self {
        Self {
            text: response.content,
            topics: response.related_topics,
            questions: response.related_questions,
        }
    }
}

/// Related items as they come off the wire, before labels are checked.
///
/// Any JSON value decodes into one; a missing, null or non-string field reads
/// as blank and the item is dropped later.
#[derive(Debug, Default)]
pub(crate) struct RawTopic {
    topic: String,
    kind: String,
    reason: String,
}

impl From<Value> for RawTopic {
    fn from(item: Value) -> Self {
        Self {
            topic: string_field(&item, "topic"),
            kind: string_field(&item, "type"),
            reason: string_field(&item, "reason"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RawQuestion {
    question: String,
    kind: String,
    context: String,
}

impl From<Value> for RawQuestion {
    fn from(item: Value) -> Self {
        Self {
            question: string_field(&item, "question"),
            kind: string_field(&item, "type"),
            context: string_field(&item, "context"),
        }
    }
}

fn string_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decodes an array of related items one by one. Anything that is not an
/// array reads as empty.
pub(crate) fn related_list<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<Value>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().map(T::from).collect(),
        _ => Vec::new(),
    })
}

/// The `{"topics": [...], "questions": [...]}` payload after the `---`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawTail {
    #[serde(default, deserialize_with = "related_list")]
    topics: Vec<RawTopic>,
    #[serde(default, deserialize_with = "related_list")]
    questions: Vec<RawQuestion>,
}

pub(crate) const EXPECTED_RELATED: usize = 5;

impl RawTail {
    pub(crate) fn into_related(self) -> (Vec<TopicRef>, Vec<QuestionRef>) {
        (validate_topics(self.topics), validate_questions(self.questions))
    }
}

pub(crate) fn validate_topics(raw: Vec<RawTopic>) -> Vec<TopicRef> {
    let topics: Vec<TopicRef> = raw
        .into_iter()
        .filter_map(|t| {
            let kind = TopicKind::parse(&t.kind);
            if kind.is_none() || t.topic.trim().is_empty() {
                log::warn!("Dropping related topic {:?} with type {:?}", t.topic, t.kind);
            }
            Some(TopicRef {
                topic: non_blank(t.topic)?,
                kind: kind?,
                reason: t.reason.trim().to_string(),
            })
        })
        .collect();
    if topics.len() != EXPECTED_RELATED {
        log::warn!("Expected {} related topics, got {}", EXPECTED_RELATED, topics.len());
    }
    topics
}

pub(crate) fn validate_questions(raw: Vec<RawQuestion>) -> Vec<QuestionRef> {
    let questions: Vec<QuestionRef> = raw
        .into_iter()
        .filter_map(|q| {
            let kind = QuestionKind::parse(&q.kind);
            if kind.is_none() || q.question.trim().is_empty() {
                log::warn!("Dropping related question {:?} with type {:?}", q.question, q.kind);
            }
            Some(QuestionRef {
                question: non_blank(q.question)?,
                kind: kind?,
                context: q.context.trim().to_string(),
            })
        })
        .collect();
    if questions.len() != EXPECTED_RELATED {
        log::warn!("Expected {} related questions, got {}", EXPECTED_RELATED, questions.len());
    }
    questions
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_drops_unknown_labels_and_blank_names() {
        let tail: RawTail = serde_json::from_str(
            r#"{"topics":[
                {"topic":"Atoms","type":"prerequisite","reason":"Building blocks"},
                {"topic":"Vibes","type":"mood","reason":"?"},
                {"topic":"  ","type":"deeper","reason":"empty"}
            ],
            "questions":[{"question":"What if light stopped?","type":"Curiosity","context":"Thought experiment"}]}"#,
        )
        .unwrap();

        let (topics, questions) = tail.into_related();
        assert_eq!(
            topics,
            vec![TopicRef {
                topic: "Atoms".into(),
                kind: TopicKind::Prerequisite,
                reason: "Building blocks".into(),
            }]
        );
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].kind, QuestionKind::Curiosity);
    }

    #[test]
    fn odd_items_are_dropped_without_losing_their_siblings() {
        let tail: RawTail = serde_json::from_str(
            r#"{"topics":[
                {"topic":"Lava","type":null,"reason":"x"},
                "just a string",
                {"topic":"Magma","type":"deeper","reason":null},
                {"topic":42,"type":"parallel"}
            ],
            "questions":null}"#,
        )
        .unwrap();

        let (topics, questions) = tail.into_related();
        assert_eq!(
            topics,
            vec![TopicRef {
                topic: "Magma".into(),
                kind: TopicKind::Deeper,
                reason: "".into(),
            }]
        );
        assert!(questions.is_empty());
    }

    #[test]
    fn missing_arrays_decode_as_empty() {
        let tail: RawTail = serde_json::from_str("{}").unwrap();
        let (topics, questions) = tail.into_related();
        assert!(topics.is_empty());
        assert!(questions.is_empty());
    }

    #[test]
    fn kinds_serialize_as_their_labels() {
        let json = serde_json::to_string(&QuestionRef {
            question: "Why?".into(),
            kind: QuestionKind::Causality,
            context: "".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"question":"Why?","type":"causality","context":""}"#);
    }
}
