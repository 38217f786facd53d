use crate::error::{GptError, Result};
use crate::explore::{QuestionKind, TopicKind, EXPECTED_RELATED};
use crate::quiz::ExamType;

use super::{Message, UserContext};

/// What a playground question should focus on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionAspect {
    CoreConcepts,
    Applications,
    ProblemSolving,
    Analysis,
    CurrentTrends,
}

impl QuestionAspect {
    pub const ALL: [QuestionAspect; 5] = [
        QuestionAspect::CoreConcepts,
        QuestionAspect::Applications,
        QuestionAspect::ProblemSolving,
        QuestionAspect::Analysis,
        QuestionAspect::CurrentTrends,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            QuestionAspect::CoreConcepts => "core concepts",
            QuestionAspect::Applications => "applications",
            QuestionAspect::ProblemSolving => "problem solving",
            QuestionAspect::Analysis => "analysis",
            QuestionAspect::CurrentTrends => "current trends",
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            QuestionAspect::CoreConcepts => "fundamental principles and theories",
            QuestionAspect::Applications => "real-world use cases and implementations",
            QuestionAspect::ProblemSolving => "a short scenario that needs a solution",
            QuestionAspect::Analysis => "comparing different approaches or technologies",
            QuestionAspect::CurrentTrends => "recent developments and where the field is heading",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Three paragraphs plus related items, all inside one JSON document.
    Explore,
    /// Plain paragraphs, `---`, then a one-line JSON tail.
    ExploreStream,
    Playground { level: u8, aspect: QuestionAspect },
    TestSet { exam: ExamType },
    /// Social-media-trend explainer.
    Trend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

impl PromptPair {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

pub const TEST_SET_SIZE: usize = 15;

pub fn build_prompts(kind: RequestKind, topic: &str, ctx: &UserContext) -> Result<PromptPair> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(GptError::InvalidArgument("topic must not be empty".into()));
    }

    let pair = match kind {
        RequestKind::Explore => explore(topic, ctx),
        RequestKind::ExploreStream => explore_stream(topic, ctx),
        RequestKind::Playground { level, aspect } => {
            if !(1..=10).contains(&level) {
                return Err(GptError::InvalidArgument(format!(
                    "difficulty level {level} is outside 1..=10"
                )));
            }
            playground(topic, level, aspect, ctx)
        }
        RequestKind::TestSet { exam } => test_set(topic, exam),
        RequestKind::Trend => trend(topic),
    };
    Ok(pair)
}

fn labels<T: std::fmt::Display>(kinds: &[T]) -> String {
    kinds
        .iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn explore(topic: &str, ctx: &UserContext) -> PromptPair {
    let system = format!(
        r#"You are a Gen-Z tutor who explains complex topics concisely and simply.
First identify the domain of the topic: SCIENCE, MATHEMATICS, TECHNOLOGY, MEDICAL, HISTORY,
BUSINESS, LAW, PSYCHOLOGY, CURRENT_AFFAIRS or GENERAL.

Return your answer in this EXACT JSON format and nothing else:
{{
  "domain": "identified domain",
  "content": {{
    "paragraph1": "core concept and definition, 20-30 words",
    "paragraph2": "main ideas and examples, 20-30 words",
    "paragraph3": "practical uses and relevance, 20-40 words"
  }},
  "relatedTopics": [{{"topic": "name", "type": "prerequisite", "reason": "why it matters"}}],
  "relatedQuestions": [{{"question": "What if...?", "type": "curiosity", "context": "short hook"}}]
}}

RULES:
- Each paragraph around 20-30 words, no repetition between paragraphs
- EXACTLY {n} related topics, one of each type: {topic_types}
- EXACTLY {n} related questions, one of each type: {question_types}
- Questions start with curiosity triggers like "What if", "How exactly", "Why does", "Can we"
- Keep examples specific and brief"#,
        n = EXPECTED_RELATED,
        topic_types = labels(&TopicKind::ALL),
        question_types = labels(&QuestionKind::ALL),
    );
    let user = format!(
        r#"Explain "{topic}" in three paragraphs of 20-30 words:
1. Basic definition without using words like imagine
2. More details
3. Where it is used, without saying "real world application"
Make it engaging for someone aged {age}."#,
        age = ctx.age,
    );
    PromptPair { system, user }
}

fn explore_stream(topic: &str, ctx: &UserContext) -> PromptPair {
    let age = ctx.age;
    let system = format!(
        r#"You are a Gen-Z tutor who explains complex topics concisely for a {age} year old.
First write the explanation as plain text, then the related content as STRICT single-line JSON.

Structure your response exactly like this:

<paragraph 1>

<paragraph 2>

<paragraph 3>

---
{{"topics":[{{"topic":"Topic","type":"prerequisite","reason":"Why"}}],"questions":[{{"question":"Q?","type":"curiosity","context":"Context"}}]}}

RULES:
- Match the complexity of the explanation to a {age} year old
- Total explanation 60-80 words, each paragraph around 20-25 words
- The third paragraph states applications and facts directly
- Use "---" as the separator and nowhere else
- The JSON must be on a single line with no line breaks and no extra characters
- EXACTLY {n} related topics and EXACTLY {n} questions
- Topic names are 1-2 words; questions are 8-12 words and curiosity-driven
- Topic types: {topic_types}
- Question types: {question_types}
- Never split words or insert spaces inside words"#,
        n = EXPECTED_RELATED,
        topic_types = labels(&TopicKind::ALL),
        question_types = labels(&QuestionKind::ALL),
    );
    let user = format!(
        r#"Explain "{topic}" in three very concise paragraphs for a {age} year old in Gen Z style:
1. Basic definition (15-20 words)
2. Key details (15-20 words)
3. Direct applications and facts (15-20 words)

Then provide EXACTLY:
- {n} related topics that help understand {topic} better
- {n} mind-blowing questions (8-12 words each) that spark curiosity

Follow the format and length limits strictly."#,
        n = EXPECTED_RELATED,
    );
    PromptPair { system, user }
}

fn playground(topic: &str, level: u8, aspect: QuestionAspect, ctx: &UserContext) -> PromptPair {
    let system = format!(
        r#"Generate a UNIQUE multiple-choice question about {topic}.
Focus on {aspect}: {guidance}.

Return only this JSON:
{{
  "text": "question text",
  "options": ["option A", "option B", "option C", "option D"],
  "correctAnswer": RANDOM_INDEX_0_TO_3,
  "explanation": {{
    "correct": "why the correct answer is right, max 15 words",
    "key_point": "one concept to remember, max 10 words"
  }},
  "subtopic": "specific subtopic"
}}

RULES:
- Exactly 4 distinct, equally plausible options; wrong options reflect common misconceptions
- Place the correct answer at a random index
- Vary the question pattern (what/why/how/compare) and use current examples
- Difficulty {level}/10, language suitable for a {age} year old
- Explanations are short and plain, 25 words at most in total"#,
        aspect = aspect.label(),
        guidance = aspect.guidance(),
        age = ctx.age,
    );
    let user = format!(
        "Create a completely unique {level}/10 difficulty question about {topic}.\n\
         Focus on {aspect}.\n\
         Make it engaging for a {age} year old student.",
        aspect = aspect.label(),
        age = ctx.age,
    );
    PromptPair { system, user }
}

fn test_set(topic: &str, exam: ExamType) -> PromptPair {
    let system = format!(
        r#"Create a {exam} exam test set about {topic}.
Generate exactly {size} questions as JSON in this structure and nothing else:
{{
  "questions": [
    {{
      "text": "Clear question text",
      "options": ["A", "B", "C", "D"],
      "correctAnswer": 0,
      "explanation": {{"correct": "step-by-step reason", "key_point": "concept tested"}},
      "subtopic": "specific concept"
    }}
  ]
}}
Every question has exactly 4 distinct options."#,
        size = TEST_SET_SIZE,
    );
    let user = format!(
        "Create {size} {exam} questions about {topic} (5 easy, 5 medium, 5 hard), easiest first.",
        size = TEST_SET_SIZE,
    );
    PromptPair { system, user }
}

fn trend(topic: &str) -> PromptPair {
    let system = "You are a social media trend expert who explains topics by connecting them \
                  to current viral trends, memes, and pop culture moments."
        .to_string();
    let user = format!(
        r#"Explain "{topic}" using current social media trends, memes, and pop culture references.

Structure it like:
- The Hook: a TikTok-style intro ("POV: you're learning {topic}")
- The Breakdown: Instagram-carousel-style bullet points
- The Tea: facts as a short thread
- Quick Takes: YouTube-shorts-style one-liners
- The Trend Connection: end on a viral reference

Keep it relatable ("that one friend who...", "core memory", "living rent free") and accurate."#
    );
    PromptPair { system, user }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::Role;

    const TEEN: UserContext = UserContext { age: 15 };

    #[test]
    fn empty_topic_is_rejected() {
        for kind in [RequestKind::Explore, RequestKind::ExploreStream, RequestKind::Trend] {
            assert!(matches!(
                build_prompts(kind, "   ", &TEEN),
                Err(GptError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn stream_prompt_spells_out_the_wire_format() {
        let pair = build_prompts(RequestKind::ExploreStream, "Black holes", &TEEN).unwrap();
        assert!(pair.system.contains("---"));
        assert!(pair.system.contains("single-line JSON"));
        assert!(pair.system.contains("15 year old"));
        assert!(pair.system.contains("prerequisite, extension, application, parallel, deeper"));
        assert!(pair.system.contains("curiosity, mechanism, causality, innovation, insight"));
        assert!(pair.user.contains("\"Black holes\""));
        assert!(pair.user.contains("EXACTLY:\n- 5 related topics"));
    }

    #[test]
    fn playground_level_is_bounded() {
        let kind = RequestKind::Playground {
            level: 11,
            aspect: QuestionAspect::Analysis,
        };
        assert!(build_prompts(kind, "Rust", &TEEN).is_err());

        let kind = RequestKind::Playground {
            level: 4,
            aspect: QuestionAspect::Analysis,
        };
        let pair = build_prompts(kind, "Rust", &TEEN).unwrap();
        assert!(pair.system.contains("Focus on analysis"));
        assert!(pair.user.contains("4/10"));
    }

    #[test]
    fn messages_are_system_then_user() {
        let pair = build_prompts(RequestKind::TestSet { exam: ExamType::Neet }, "Optics", &TEEN).unwrap();
        assert!(pair.system.contains("NEET"));
        let messages = pair.into_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
    }
}
