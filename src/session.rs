use std::fmt;

use chrono::{DateTime, Utc};

use crate::explore::{QuestionRef, StreamChunk, TopicRef};
use crate::gpt::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub topics: Option<Vec<TopicRef>>,
    pub questions: Option<Vec<QuestionRef>>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            topics: None,
            questions: None,
        }
    }

    fn assistant(chunk: &StreamChunk) -> Self {
        Self {
            role: Role::Assistant,
            text: chunk.text.clone(),
            topics: Some(chunk.topics.clone()).filter(|t| !t.is_empty()),
            questions: Some(chunk.questions.clone()).filter(|q| !q.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub turns: Vec<ChatTurn>,
    pub initial_query: String,
}

impl ChatSession {
    /// The assistant's latest answer, if one has started.
    pub fn answer(&self) -> Option<&ChatTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }
}

/// In-memory history of one chat, newest session first.
///
/// Only the active session accepts streamed updates; a stream that was
/// started for an older session keeps talking into the void.
#[derive(Debug, Default)]
pub struct History {
    sessions: Vec<ChatSession>,
    active: Option<SessionId>,
    next_id: u64,
}

impl History {
    /// Opens a session for `query` with the question and an empty answer, and
    /// makes it the active one.
    pub fn start_session(&mut self, query: &str) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(
            0,
            ChatSession {
                id,
                created_at: Utc::now(),
                turns: vec![ChatTurn::user(query), ChatTurn::assistant(&StreamChunk::default())],
                initial_query: query.to_string(),
            },
        );
        self.active = Some(id);
        id
    }

    /// Replaces the streaming answer of session `id` with `chunk`.
    ///
    /// Returns `false` and changes nothing when `id` is no longer active.
    pub fn apply_chunk(&mut self, id: SessionId, chunk: &StreamChunk) -> bool {
        if self.active != Some(id) {
            log::debug!("Dropping update for inactive session {}", id);
            return false;
        }
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        match session.turns.last_mut() {
            Some(turn) if turn.role == Role::Assistant => *turn = ChatTurn::assistant(chunk),
            _ => session.turns.push(ChatTurn::assistant(chunk)),
        }
        true
    }

    pub fn open(&mut self, id: SessionId) -> Option<&ChatSession> {
        let session = self.sessions.iter().find(|s| s.id == id)?;
        self.active = Some(id);
        Some(session)
    }

    /// Looks a session up by the number shown in the history listing.
    pub fn find(&self, number: u64) -> Option<SessionId> {
        self.sessions.iter().map(|s| s.id).find(|id| id.get() == number)
    }

    pub fn active(&self) -> Option<&ChatSession> {
        let id = self.active?;
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.active == Some(id)
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.active = None;
    }
}
