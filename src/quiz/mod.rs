use std::collections::HashSet;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{GptError, Result};

pub const OPTION_COUNT: usize = 4;
const OPTION_LETTERS: [char; OPTION_COUNT] = ['A', 'B', 'C', 'D'];
const MIN_QUESTION_LEN: usize = 10;
const MIN_EXPLANATION_LEN: usize = 5;

/// A run through several questions, e.g. an exam test set.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Quiz {
    pub questions: Vec<QuizQuestion>,
    pub current_question: usize,
    pub score: u32,
}

impl Quiz {
    pub fn new(questions: Vec<QuizQuestion>) -> Self {
        Self {
            questions,
            current_question: 0,
            score: 0,
        }
    }

    pub fn current(&self) -> Option<&QuizQuestion> {
        self.questions.get(self.current_question)
    }

    /// Checks `answer` against the current question and moves on.
    /// Returns `None` once every question has been answered.
    pub fn answer(&mut self, answer: &str) -> Option<bool> {
        let question = self.current()?;
        let correct = question.is_correct(answer);
        if correct {
            self.score += 1;
        }
        self.current_question += 1;
        Some(correct)
    }

    pub fn is_finished(&self) -> bool {
        self.current_question >= self.questions.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Explanation {
    pub correct: String,
    pub key_point: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub text: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
    pub explanation: Explanation,
    pub difficulty: u8,
    pub topic: String,
    pub subtopic: String,
    pub question_type: String,
    pub age_group: String,
}

impl QuizQuestion {
    pub fn correct_option(&self) -> Option<&str> {
        self.options.get(self.correct_answer).map(String::as_str)
    }

    pub fn is_correct(&self, answer: &str) -> bool {
        self.answer_index(answer) == Some(self.correct_answer)
    }

    /// Options prefixed with their letter, e.g. `B) Venus`.
    pub fn labelled_options(&self) -> Vec<String> {
        self.options
            .iter()
            .zip(OPTION_LETTERS)
            .map(|(option, letter)| format!("{letter}) {option}"))
            .collect()
    }

    /// Maps a reply to an option index. Accepts the labelled option, the bare
    /// option text or just its letter.
    pub fn answer_index(&self, reply: &str) -> Option<usize> {
        let reply = reply.trim();
        if let Some(i) = self.labelled_options().iter().position(|l| l == reply) {
            return Some(i);
        }
        if let Some(i) = self.options.iter().position(|o| o.trim() == reply) {
            return Some(i);
        }
        let mut chars = reply.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => OPTION_LETTERS
                .iter()
                .position(|l| l.eq_ignore_ascii_case(&letter))
                .filter(|i| *i < self.options.len()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExamType {
    #[serde(rename = "JEE")]
    Jee,
    #[serde(rename = "NEET")]
    Neet,
}

impl ExamType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JEE" => Some(ExamType::Jee),
            "NEET" => Some(ExamType::Neet),
            _ => None,
        }
    }
}

impl fmt::Display for ExamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExamType::Jee => f.write_str("JEE"),
            ExamType::Neet => f.write_str("NEET"),
        }
    }
}

/// Structural checks a generated question must pass before anyone sees it.
pub fn validate_quiz_question(question: &QuizQuestion) -> bool {
    let text = question.text.trim();
    if text.is_empty() || text.chars().count() < MIN_QUESTION_LEN {
        return false;
    }

    if question.options.len() != OPTION_COUNT {
        return false;
    }
    if question.options.iter().any(|o| o.trim().is_empty()) {
        return false;
    }
    let distinct: HashSet<&str> = question.options.iter().map(|o| o.trim()).collect();
    if distinct.len() != OPTION_COUNT {
        return false;
    }

    if question.correct_answer >= OPTION_COUNT {
        return false;
    }

    let Explanation { correct, key_point } = &question.explanation;
    correct.trim().chars().count() >= MIN_EXPLANATION_LEN
        && key_point.trim().chars().count() >= MIN_EXPLANATION_LEN
}

/// Reorders the options uniformly at random and moves `correct_answer` along
/// with the option it pointed at.
pub fn shuffle_options<R: Rng + ?Sized>(question: QuizQuestion, rng: &mut R) -> QuizQuestion {
    let QuizQuestion {
        options,
        correct_answer,
        ..
    } = &question;

    // Tag each option so the correct one can be found again after shuffling
    let mut tagged: Vec<(String, bool)> = options
        .iter()
        .enumerate()
        .map(|(i, o)| (o.clone(), i == *correct_answer))
        .collect();
    // `shuffle` is a Fisher-Yates pass
    tagged.shuffle(rng);

    let new_correct = tagged
        .iter()
        .position(|(_, is_correct)| *is_correct)
        .unwrap_or(*correct_answer);

    QuizQuestion {
        options: tagged.into_iter().map(|(o, _)| o).collect(),
        correct_answer: new_correct,
        ..question
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct RawExplanation {
    #[serde(default)]
    correct: String,
    #[serde(default)]
    key_point: String,
}

/// A question as the model wrote it. Nothing here is trusted yet.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawQuizQuestion {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<i64>,
    #[serde(default)]
    pub explanation: Option<RawExplanation>,
    #[serde(default)]
    pub subtopic: Option<String>,
}

/// What the request already knows about a question, as opposed to what the
/// model chose.
#[derive(Debug, Clone)]
pub(crate) struct QuestionFrame {
    pub difficulty: u8,
    pub topic: String,
    pub fallback_subtopic: String,
    pub age_group: String,
}

impl RawQuizQuestion {
    pub(crate) fn into_question(self, frame: QuestionFrame) -> Result<QuizQuestion> {
        let correct_answer = self
            .correct_answer
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| GptError::ValidationFailed("missing or negative correctAnswer".into()))?;
        let explanation = self
            .explanation
            .ok_or_else(|| GptError::ValidationFailed("missing explanation".into()))?;

        Ok(QuizQuestion {
            text: self.text.trim().to_string(),
            options: self.options.into_iter().map(|o| o.trim().to_string()).collect(),
            correct_answer,
            explanation: Explanation {
                correct: explanation.correct.trim().to_string(),
                key_point: explanation.key_point.trim().to_string(),
            },
            difficulty: frame.difficulty,
            topic: frame.topic,
            subtopic: self
                .subtopic
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(frame.fallback_subtopic),
            question_type: "conceptual".to_string(),
            age_group: frame.age_group,
        })
    }
}
