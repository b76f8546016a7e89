//! Reminder and chat text, voiced by the plant's personality
//!
//! Every generation tries the LLM first and falls back to canned text on
//! any failure, so callers always get a message back.

use crate::care::{self, CareTask};
use crate::db::{Database, DbError, PlantDetails};
use crate::llm::{ChatMessage, Completer, CompletionRequest};
use crate::personality::{self, PersonalityKind};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Conversation turns sent along with a chat message
pub const CHAT_HISTORY_TURNS: i64 = 6;

/// Soft limit asked of the model so replies fit one SMS segment
pub const SMS_CHAR_LIMIT: usize = 160;

/// Conversation role of reminders the user actually received
pub const REMINDER_ROLE: &str = "reminder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Llm,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedMessage {
    pub text: String,
    pub source: MessageSource,
}

#[derive(Debug)]
pub enum ChatError {
    NotFound(String),
    Validation(String),
    Db(DbError),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::NotFound(what) => write!(f, "{} not found", what),
            ChatError::Validation(msg) => write!(f, "{}", msg),
            ChatError::Db(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<DbError> for ChatError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => ChatError::NotFound(what),
            DbError::Validation(msg) => ChatError::Validation(msg),
            other => ChatError::Db(other),
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    db: Database,
    completer: Arc<dyn Completer>,
    max_tokens: u32,
    temperature: f32,
}

impl ChatService {
    pub fn new(db: Database, completer: Arc<dyn Completer>, max_tokens: u32, temperature: f32) -> Self {
        Self { db, completer, max_tokens, temperature }
    }

    /// Write a care reminder for `task` in the plant's voice. Nothing is
    /// stored; call [`ChatService::record_reminder`] once it was delivered.
    pub fn generate_care_reminder(&self, plant_id: i32, task: CareTask) -> Result<GeneratedMessage, ChatError> {
        let details = self.db.plant_details(plant_id)?;
        let kind = PersonalityKind::from_name(&details.personality.name);
        let (overdue, frequency) = self.schedule_status(&details, task)?;
        let frequency = match frequency {
            Some(days) => format!("every {} days", days),
            None => "as needed".to_string(),
        };

        let recent = self.db.recent_messages(plant_id, 2)?;
        let last_event = self.db.last_care_event(plant_id, task)?;

        let mut user_prompt = format!(
            "Generate a care reminder message for {task}.\n\n\
             Plant details:\n\
             - Name: {name}\n\
             - Type: {plant_type} ({species})\n\
             - Care frequency: {freq}\n\
             - Days overdue: {overdue}\n",
            task = task,
            name = details.plant.nickname,
            plant_type = details.catalog.name,
            species = details.catalog.species,
            freq = frequency,
            overdue = overdue,
        );
        if !recent.is_empty() {
            let lines: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
            user_prompt.push_str(&format!("\nRecent conversation: {}\n", lines.join(" | ")));
        }
        if let Some(event) = &last_event {
            user_prompt.push_str(&format!("Last {}: {}\n", task, event.completed_at));
        }
        user_prompt.push_str(&format!(
            "\nGuidelines:\n\
             - Stay perfectly in character as the {personality} personality\n\
             - Keep the message under {limit} characters (SMS friendly)\n\
             - Be specific about {task}\n\
             - Use the plant's name naturally\n\
             - If this is a repeat reminder, acknowledge it",
            personality = kind.name(),
            limit = SMS_CHAR_LIMIT,
            task = task,
        ));

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(system_prompt(&details, task.as_str())),
                ChatMessage::user(user_prompt),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        Ok(self.complete_or(&request, plant_id, || {
            personality::fallback_reminder(kind, &details.plant.nickname, task, overdue)
        }))
    }

    /// Add a delivered reminder to the plant's conversation
    pub fn record_reminder(&self, plant_id: i32, text: &str) -> Result<(), DbError> {
        self.db.append_message(plant_id, REMINDER_ROLE, text)
    }

    /// Reply to a user's message in the plant's voice; both turns are stored
    pub fn respond(&self, plant_id: i32, user_message: &str) -> Result<GeneratedMessage, ChatError> {
        let user_message = user_message.trim();
        if user_message.is_empty() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }

        let details = self.db.plant_details(plant_id)?;
        let kind = PersonalityKind::from_name(&details.personality.name);
        let history = self.db.recent_messages(plant_id, CHAT_HISTORY_TURNS)?;

        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\nKeep replies under {} characters (SMS friendly). You are a plant with personality, not a human assistant.",
            system_prompt(&details, "conversation"),
            SMS_CHAR_LIMIT
        ))];
        for turn in history {
            messages.push(match turn.role.as_str() {
                "user" => ChatMessage::user(turn.content),
                _ => ChatMessage::assistant(turn.content),
            });
        }
        messages.push(ChatMessage::user(user_message));

        let request = CompletionRequest {
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let reply = self.complete_or(&request, plant_id, || {
            personality::fallback_reply(kind, &details.plant.nickname, &details.catalog.name, user_message)
        });

        self.db.append_message(plant_id, "user", user_message)?;
        self.db.append_message(plant_id, "plant", &reply.text)?;
        Ok(reply)
    }

    fn complete_or<F: FnOnce() -> String>(&self, request: &CompletionRequest, plant_id: i32, fallback: F) -> GeneratedMessage {
        match self.completer.complete(request) {
            Ok(text) => GeneratedMessage { text, source: MessageSource::Llm },
            Err(e) => {
                warn!(plant_id, error = %e, "using fallback message");
                GeneratedMessage { text: fallback(), source: MessageSource::Fallback }
            }
        }
    }

    /// Days overdue and interval of the plant's schedule for `task`
    fn schedule_status(&self, details: &PlantDetails, task: CareTask) -> Result<(i64, Option<i32>), ChatError> {
        let now = Utc::now();
        let schedule = self
            .db
            .list_schedules_for_plant(details.plant.id)?
            .into_iter()
            .find(|s| s.task() == Some(task));

        let frequency = schedule.as_ref().map(|s| s.frequency_days);
        let overdue = match schedule.and_then(|s| care::parse_timestamp(&s.next_due)) {
            Some(due) => care::days_overdue(due, now),
            None => 0,
        };
        debug!(plant_id = details.plant.id, task = %task, overdue, "computed overdue days");
        Ok((overdue.max(0), frequency))
    }
}

/// System prompt: the personality template plus its voice traits
fn system_prompt(details: &PlantDetails, task_type: &str) -> String {
    let profile = PersonalityKind::from_name(&details.personality.name).profile();
    let care_needs = details.catalog.requirements().summary();

    let rendered = personality::render_template(
        &details.personality.prompt_template,
        &[
            ("plant_name", details.plant.nickname.as_str()),
            ("plant_type", details.catalog.name.as_str()),
            ("care_needs", care_needs.as_str()),
            ("task_type", task_type),
        ],
    );

    format!(
        "{}\n\nPERSONALITY TRAITS: {}\nTONE: {}\nSPEAKING STYLE: {}",
        rendered,
        profile.traits.join(", "),
        profile.tone,
        profile.speaking_style
    )
}
