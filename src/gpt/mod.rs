pub mod prompts;
pub mod rate_limit;
pub mod transport;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{GptError, Result};
use crate::explore::stream::{self, StreamSummary};
use crate::explore::{
    related_list, validate_questions, validate_topics, ExploreResponse, RawQuestion, RawTopic, StreamChunk,
};
use crate::quiz::{self, ExamType, QuestionFrame, QuizQuestion, RawQuizQuestion};

use prompts::{build_prompts, QuestionAspect, RequestKind, TEST_SET_SIZE};
use transport::Transport;

const MIN_VALID_TEST_QUESTIONS: usize = 5;
const TEST_SET_AGE_GROUP: &str = "16-18";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// What we know about the learner. Every prompt is tuned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub age: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExploreBody {
    domain: Option<String>,
    content: Option<RawParagraphs>,
    #[serde(default, deserialize_with = "related_list")]
    related_topics: Vec<RawTopic>,
    #[serde(default, deserialize_with = "related_list")]
    related_questions: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
struct RawParagraphs {
    #[serde(default)]
    paragraph1: String,
    #[serde(default)]
    paragraph2: String,
    #[serde(default)]
    paragraph3: String,
}

#[derive(Debug, Deserialize)]
struct RawTestSet {
    questions: Option<Vec<RawQuizQuestion>>,
}

/// Turns topics into explanations and quiz questions.
///
/// Holds nothing between calls except the HTTP client, so one instance is
/// shared by every chat.
#[derive(Debug, Clone)]
pub struct GptService {
    transport: Transport,
}

impl GptService {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Streams an explanation of `query`, handing every update to `on_chunk`
    /// as soon as it is parsed.
    pub async fn stream_explore_content<F>(
        &self,
        query: &str,
        ctx: &UserContext,
        on_chunk: F,
    ) -> Result<StreamSummary>
    where
        F: FnMut(StreamChunk),
    {
        let messages = build_prompts(RequestKind::ExploreStream, query, ctx)?.into_messages();
        log::info!("Streaming explanation for {:?} (age {})", query, ctx.age);

        let frames = self.transport.generate_stream(&messages).await?;
        let summary = stream::assemble(frames, on_chunk).await?;

        log::debug!(
            "Stream for {:?} done: {} events, {} skipped, tail {:?}",
            query,
            summary.events,
            summary.skipped,
            summary.tail
        );
        Ok(summary)
    }

    pub async fn get_explore_content(&self, query: &str, ctx: &UserContext) -> Result<ExploreResponse> {
        let messages = build_prompts(RequestKind::Explore, query, ctx)?.into_messages();
        let content = self.transport.generate_text(&messages).await?;

        let body: RawExploreBody = serde_json::from_str(extract_json(&content))?;
        let (Some(_domain), Some(paragraphs)) = (body.domain, body.content) else {
            return Err(GptError::MalformedUpstreamPayload(
                "explore response lacks domain or content".into(),
            ));
        };

        let content = [paragraphs.paragraph1, paragraphs.paragraph2, paragraphs.paragraph3]
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if content.is_empty() {
            return Err(GptError::MalformedUpstreamPayload("explore response has empty paragraphs".into()));
        }

        Ok(ExploreResponse {
            content,
            related_topics: validate_topics(body.related_topics),
            related_questions: validate_questions(body.related_questions),
        })
    }

    pub async fn get_playground_question(
        &self,
        topic: &str,
        level: u8,
        ctx: &UserContext,
    ) -> Result<QuizQuestion> {
        let aspect = *QuestionAspect::ALL
            .choose(&mut rand::thread_rng())
            .unwrap_or(&QuestionAspect::CoreConcepts);
        log::info!("Playground question on {:?}, level {}, aspect {}", topic, level, aspect.label());

        let messages = build_prompts(RequestKind::Playground { level, aspect }, topic, ctx)?.into_messages();
        let content = self.transport.generate_text(&messages).await?;

        let raw: RawQuizQuestion = serde_json::from_str(extract_json(&content))?;
        let question = raw.into_question(QuestionFrame {
            difficulty: level,
            topic: topic.trim().to_string(),
            fallback_subtopic: topic.trim().to_string(),
            age_group: ctx.age.to_string(),
        })?;

        if !quiz::validate_quiz_question(&question) {
            log::warn!("Discarding invalid playground question: {:?}", question.text);
            return Err(GptError::ValidationFailed(question.text));
        }
        Ok(quiz::shuffle_options(question, &mut rand::thread_rng()))
    }

    pub async fn get_test_questions(&self, topic: &str, exam: ExamType) -> Result<Vec<QuizQuestion>> {
        // Exam sets target a fixed audience, the age in the context is unused
        let ctx = UserContext { age: 17 };
        let messages = build_prompts(RequestKind::TestSet { exam }, topic, &ctx)?.into_messages();
        let content = self.transport.generate_text(&messages).await?;

        let parsed: RawTestSet = serde_json::from_str(extract_json(&content))?;
        let raw_questions = parsed
            .questions
            .ok_or_else(|| GptError::MalformedUpstreamPayload("test set has no questions array".into()))?;

        let topic = topic.trim();
        let total = raw_questions.len();
        let mut rng = rand::thread_rng();
        let valid: Vec<QuizQuestion> = raw_questions
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| {
                let frame = QuestionFrame {
                    difficulty: (index / 5 + 1) as u8,
                    topic: topic.to_string(),
                    fallback_subtopic: format!("{} Concept {}", topic, index + 1),
                    age_group: TEST_SET_AGE_GROUP.to_string(),
                };
                raw.into_question(frame)
                    .ok()
                    .filter(quiz::validate_quiz_question)
            })
            .take(TEST_SET_SIZE)
            .map(|q| quiz::shuffle_options(q, &mut rng))
            .collect();

        log::info!("{} of {} {} questions on {:?} passed validation", valid.len(), total, exam, topic);
        if valid.len() < MIN_VALID_TEST_QUESTIONS {
            return Err(GptError::ValidationFailed(format!(
                "only {} valid questions generated",
                valid.len()
            )));
        }
        Ok(valid)
    }

    /// Explains `query` through memes and social media trends. Free-form text.
    pub async fn explore_query(&self, query: &str) -> Result<String> {
        let ctx = UserContext { age: 18 };
        let messages = build_prompts(RequestKind::Trend, query, &ctx)?.into_messages();
        let content = self.transport.generate_text(&messages).await?;
        Ok(content.trim().to_string())
    }
}

/// Models like to wrap JSON answers in markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::stream::TailStatus;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KID: UserContext = UserContext { age: 12 };

    async fn service_answering(body: serde_json::Value) -> (MockServer, GptService) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let transport = Transport::new(server.uri(), Duration::from_secs(5)).unwrap();
        (server, GptService::new(transport))
    }

    fn question_json(text: &str, options: [&str; 4], correct: i64) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "options": options,
            "correctAnswer": correct,
            "explanation": {"correct": "Because it is so.", "key_point": "Remember this one."},
            "subtopic": "Basics"
        })
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn streamed_explanation_end_to_end() {
        let server = MockServer::start().await;
        let body = [
            r#"data: {"content":"Gravity pulls "}"#,
            r#"data: {"content":"things together. "}"#,
            r#"data: {"content":"---"}"#,
            r#"data: {"content":"{\"topics\":[{\"topic\":\"Mass\",\"type\":\"prerequisite\",\"reason\":\"r\"}],"}"#,
            r#"data: {"content":"\"questions\":[]}"}"#,
        ]
        .map(|e| format!("{e}\n\n"))
        .concat();
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;
        let service = GptService::new(Transport::new(server.uri(), Duration::from_secs(5)).unwrap());

        let mut chunks = Vec::new();
        let summary = service
            .stream_explore_content("Gravity", &KID, |c| chunks.push(c))
            .await
            .unwrap();

        assert_eq!(summary.tail, TailStatus::Complete);
        let last = chunks.last().unwrap();
        assert_eq!(last.text, "Gravity pulls things together.");
        assert_eq!(last.topics[0].topic, "Mass");
        assert!(last.questions.is_empty());
    }

    #[tokio::test]
    async fn empty_query_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let service = GptService::new(Transport::new(server.uri(), Duration::from_secs(5)).unwrap());

        let err = service.stream_explore_content(" ", &KID, |_| {}).await.unwrap_err();
        assert!(matches!(err, GptError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn explore_content_joins_paragraphs() {
        let answer = serde_json::json!({
            "domain": "SCIENCE",
            "content": {"paragraph1": "One.", "paragraph2": "Two.", "paragraph3": "Three."},
            "relatedTopics": [{"topic": "Cells", "type": "prerequisite", "reason": "Basics"}],
        });
        let fenced = format!("```json\n{answer}\n```");
        let (_server, service) = service_answering(serde_json::json!({ "content": fenced })).await;

        let response = service.get_explore_content("Biology", &KID).await.unwrap();
        assert_eq!(response.content, "One.\n\nTwo.\n\nThree.");
        assert_eq!(response.related_topics.len(), 1);
        assert!(response.related_questions.is_empty());
    }

    #[tokio::test]
    async fn explore_content_without_domain_is_malformed() {
        let answer = serde_json::json!({"content": {"paragraph1": "One."}}).to_string();
        let (_server, service) = service_answering(serde_json::json!({ "content": answer })).await;

        let err = service.get_explore_content("Biology", &KID).await.unwrap_err();
        assert!(matches!(err, GptError::MalformedUpstreamPayload(_)));
    }

    #[tokio::test]
    async fn playground_question_is_validated_and_shuffled() {
        let answer = question_json(
            "Which gas do plants absorb?",
            ["Carbon dioxide", "Oxygen", "Nitrogen", "Helium"],
            0,
        )
        .to_string();
        let (_server, service) = service_answering(serde_json::json!({ "content": answer })).await;

        let question = service.get_playground_question("Plants", 3, &KID).await.unwrap();
        assert_eq!(question.correct_option(), Some("Carbon dioxide"));
        assert_eq!(question.difficulty, 3);
        assert_eq!(question.age_group, "12");
        assert_eq!(question.subtopic, "Basics");
    }

    #[tokio::test]
    async fn playground_question_with_duplicates_is_rejected() {
        let answer = question_json("Which gas do plants absorb?", ["Oxygen", "Oxygen", "Nitrogen", "Helium"], 0)
            .to_string();
        let (_server, service) = service_answering(serde_json::json!({ "content": answer })).await;

        let err = service.get_playground_question("Plants", 3, &KID).await.unwrap_err();
        assert!(matches!(err, GptError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_set_keeps_valid_questions_only() {
        let mut questions: Vec<serde_json::Value> = (0..6)
            .map(|i| {
                question_json(
                    &format!("Question number {i} about optics?"),
                    ["Lens", "Mirror", "Prism", "Fiber"],
                    (i % 4) as i64,
                )
            })
            .collect();
        questions.push(question_json("Too few options here?", ["A", "A", "B", "C"], 0));
        let answer = serde_json::json!({ "questions": questions }).to_string();
        let (_server, service) = service_answering(serde_json::json!({ "content": answer })).await;

        let set = service.get_test_questions("Optics", ExamType::Jee).await.unwrap();
        assert_eq!(set.len(), 6);
        assert_eq!(set[0].difficulty, 1);
        assert_eq!(set[5].difficulty, 2);
        assert!(set.iter().all(quiz::validate_quiz_question));
        assert!(set.iter().all(|q| q.age_group == TEST_SET_AGE_GROUP));
    }

    #[tokio::test]
    async fn test_set_with_too_few_valid_questions_fails() {
        let questions = vec![question_json("Only one good question?", ["A", "B", "C", "D"], 1)];
        let answer = serde_json::json!({ "questions": questions }).to_string();
        let (_server, service) = service_answering(serde_json::json!({ "content": answer })).await;

        let err = service.get_test_questions("Optics", ExamType::Neet).await.unwrap_err();
        assert!(matches!(err, GptError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn trend_explainer_returns_raw_text() {
        let (_server, service) = service_answering(serde_json::json!({ "content": "  POV: you learn Rust  " })).await;
        let text = service.explore_query("Rust").await.unwrap();
        assert_eq!(text, "POV: you learn Rust");
    }
}
