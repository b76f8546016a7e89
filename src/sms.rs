//! Two-way SMS: phone numbers, reply parsing, senders, inbound handling
//!
//! Inbound texts are reduced to one of a small, fixed set of intents
//! ([`SmsIntent`]). Matching a text to one of the user's plants is
//! best-effort: nickname, then catalog name, then a fuzzy word match.

use crate::care::{self, CareTask};
use crate::chat::{ChatError, ChatService, MessageSource};
use crate::config::{Config, SmsConfig, SmsProvider};
use crate::db::{Database, DbError, PlantDetails, SmsRecord};
use crate::onboarding;
use base64::Engine;
use chrono::{Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";

// ============================================================================
// Phone Numbers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneError {
    Empty,
    TooShort(String),
    TooLong(String),
}

impl std::fmt::Display for PhoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhoneError::Empty => write!(f, "Phone number is required"),
            PhoneError::TooShort(raw) => write!(f, "Phone number '{}' is too short", raw),
            PhoneError::TooLong(raw) => write!(f, "Phone number '{}' is too long", raw),
        }
    }
}

impl std::error::Error for PhoneError {}

fn digits_of(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Canonicalize a phone number.
///
/// 10 digits get `default_cc`; 11 digits starting with 1 get a `+`; an
/// explicit leading `+` is kept. Shorter local numbers are left as digits.
pub fn normalize_phone(raw: &str, default_cc: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }
    let digits = digits_of(trimmed);
    if digits.len() < 7 {
        return Err(PhoneError::TooShort(trimmed.to_string()));
    }
    if digits.len() > 15 {
        return Err(PhoneError::TooLong(trimmed.to_string()));
    }

    if trimmed.starts_with('+') {
        return Ok(format!("+{}", digits));
    }
    let canonical = match digits.len() {
        10 => {
            let cc = digits_of(default_cc);
            if cc.is_empty() {
                digits
            } else {
                format!("+{}{}", cc, digits)
            }
        }
        11 if digits.starts_with('1') => format!("+{}", digits),
        n if n > 11 => format!("+{}", digits),
        _ => digits,
    };
    Ok(canonical)
}

/// Every stored form the same number might have been saved under, given
/// the country code local numbers are normalized with
pub fn phone_variants(raw: &str, default_cc: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let digits = digits_of(trimmed);
    let cc = digits_of(default_cc);
    let mut variants = vec![trimmed.to_string()];

    if let Ok(canonical) = normalize_phone(trimmed, default_cc) {
        variants.push(canonical);
    }
    variants.push(digits.clone());
    if !digits.is_empty() {
        variants.push(format!("+{}", digits));
    }
    if !cc.is_empty() {
        if digits.len() == 10 {
            variants.push(format!("+{}{}", cc, digits));
            variants.push(format!("{}{}", cc, digits));
        }
        if digits.len() == cc.len() + 10 && digits.starts_with(&cc) {
            variants.push(digits[cc.len()..].to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    variants
        .into_iter()
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

// ============================================================================
// Reply Parsing
// ============================================================================

lazy_static! {
    static ref REMIND_LATER: Regex =
        Regex::new(r"\b(remind me later|later|snooze|tomorrow|not now)\b").unwrap();
    static ref CONFIRM: Regex =
        Regex::new(r"\b(done|did it|yes|yep|yup|finished|completed|ok done)\b").unwrap();
    /// Past tense only: care that already happened
    static ref COMPLETED_PATTERNS: Vec<(CareTask, Regex)> = vec![
        (CareTask::Watering, Regex::new(r"\b(watered|gave (it|her|him|them) a drink)\b").unwrap()),
        (CareTask::Fertilizing, Regex::new(r"\b(fertilized|fertilised|fed)\b").unwrap()),
        (CareTask::Misting, Regex::new(r"\b(misted|sprayed)\b").unwrap()),
        (CareTask::Repotting, Regex::new(r"\brepotted\b").unwrap()),
        (CareTask::Pruning, Regex::new(r"\b(pruned|trimmed)\b").unwrap()),
    ];
    static ref TASK_PATTERNS: Vec<(CareTask, Regex)> = vec![
        (CareTask::Watering, Regex::new(r"\b(watered|water|watering|gave (it|her|him|them) a drink)\b").unwrap()),
        (
            CareTask::Fertilizing,
            Regex::new(r"\b(fertilized|fertilised|fertilize|fertilise|fertilizing|fed|feed|fertilizer)\b").unwrap(),
        ),
        (CareTask::Misting, Regex::new(r"\b(misted|mist|misting|sprayed|spray)\b").unwrap()),
        (CareTask::Repotting, Regex::new(r"\b(repotted|repot|repotting)\b").unwrap()),
        (CareTask::Pruning, Regex::new(r"\b(pruned|prune|pruning|trimmed|trim|cut)\b").unwrap()),
    ];
}

/// The task whose pattern matches earliest in `text`
fn first_task(patterns: &[(CareTask, Regex)], text: &str) -> Option<CareTask> {
    patterns
        .iter()
        .filter_map(|(task, re)| re.find(text).map(|m| (m.start(), *task)))
        .min_by_key(|(start, _)| *start)
        .map(|(_, task)| task)
}

/// What an inbound text asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmsIntent {
    /// Care was performed; `task` is None for a bare confirmation
    CareDone { task: Option<CareTask> },
    RemindLater,
    Stop,
    Help,
    Chat,
}

impl SmsIntent {
    pub const ALL_KINDS: [&'static str; 5] = ["care_done", "remind_later", "stop", "help", "chat"];

    pub fn kind(&self) -> &'static str {
        match self {
            SmsIntent::CareDone { .. } => "care_done",
            SmsIntent::RemindLater => "remind_later",
            SmsIntent::Stop => "stop",
            SmsIntent::Help => "help",
            SmsIntent::Chat => "chat",
        }
    }
}

fn bare_command(lower: &str) -> String {
    lower
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .trim()
        .to_string()
}

/// Classify an inbound text. Total: any input yields one of [`SmsIntent::ALL_KINDS`].
pub fn parse_reply(text: &str) -> SmsIntent {
    let lower = text.to_lowercase();
    let command = bare_command(&lower);

    if matches!(command.as_str(), "stop" | "stopall" | "unsubscribe" | "cancel" | "end" | "quit")
        || lower.contains("unsubscribe")
    {
        return SmsIntent::Stop;
    }
    if matches!(command.as_str(), "help" | "commands" | "info" | "?") {
        return SmsIntent::Help;
    }
    let question = lower.contains('?');
    // Reported care wins over plans: "watered Spike, will mist tomorrow"
    if !question {
        if let Some(task) = first_task(&COMPLETED_PATTERNS, &lower) {
            return SmsIntent::CareDone { task: Some(task) };
        }
    }
    if REMIND_LATER.is_match(&lower) {
        return SmsIntent::RemindLater;
    }
    // Questions about care ("should I water you?") are conversation
    if question {
        return SmsIntent::Chat;
    }
    if let Some(task) = first_task(&TASK_PATTERNS, &lower) {
        return SmsIntent::CareDone { task: Some(task) };
    }
    if CONFIRM.is_match(&lower) {
        return SmsIntent::CareDone { task: None };
    }
    SmsIntent::Chat
}

// ============================================================================
// Plant Matching
// ============================================================================

const IGNORED_WORDS: &[&str] = &[
    "the", "and", "you", "your", "for", "just", "did", "was", "has", "have", "with", "all", "now", "her", "him",
    "them", "its", "this", "that", "today",
];

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Best fuzzy distance between any message word and any nickname word
fn fuzzy_score(message_words: &[String], nickname: &str) -> Option<usize> {
    let mut best: Option<usize> = None;
    for msg_word in message_words {
        if msg_word.chars().count() < 3 || IGNORED_WORDS.contains(&msg_word.as_str()) {
            continue;
        }
        if TASK_PATTERNS.iter().any(|(_, re)| re.is_match(msg_word)) {
            continue;
        }
        for nick_word in words(nickname) {
            let shorter = msg_word.chars().count().min(nick_word.chars().count());
            if shorter < 3 {
                continue;
            }
            let score = if msg_word.contains(nick_word.as_str()) || nick_word.contains(msg_word.as_str()) {
                0
            } else {
                let d = levenshtein(msg_word, &nick_word);
                // two edits on a four-letter word is a different word
                if d <= 2 && d * 2 < shorter {
                    d
                } else {
                    continue;
                }
            };
            best = Some(best.map_or(score, |b: usize| b.min(score)));
        }
    }
    best
}

/// Find the plant a message refers to. Nickname substring beats catalog
/// name substring beats fuzzy word match; ties go to the earliest plant.
pub fn match_plant<'a>(text: &str, plants: &'a [PlantDetails]) -> Option<&'a PlantDetails> {
    let lower = text.to_lowercase();
    let message_words = words(text);
    let mut best: Option<((u8, i64), &PlantDetails)> = None;

    for plant in plants {
        let nickname = plant.plant.nickname.to_lowercase();
        let common = plant.catalog.name.to_lowercase();

        let score = if !nickname.is_empty() && lower.contains(&nickname) {
            Some((0u8, -(nickname.len() as i64)))
        } else if !common.is_empty() && lower.contains(&common) {
            Some((1, -(common.len() as i64)))
        } else {
            fuzzy_score(&message_words, &nickname).map(|d| (2, d as i64))
        };

        if let Some(score) = score {
            if best.as_ref().map_or(true, |(b, _)| score < *b) {
                best = Some((score, plant));
            }
        }
    }
    best.map(|(_, plant)| plant)
}

// ============================================================================
// Outbound Senders
// ============================================================================

#[derive(Debug)]
pub enum SmsError {
    NotConfigured(String),
    Transport(String),
    Rejected { status: u16, message: String },
    Db(DbError),
    Chat(ChatError),
}

impl std::fmt::Display for SmsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmsError::NotConfigured(msg) => write!(f, "SMS provider not configured: {}", msg),
            SmsError::Transport(msg) => write!(f, "SMS send failed: {}", msg),
            SmsError::Rejected { status, message } => {
                write!(f, "SMS rejected by provider (HTTP {}): {}", status, message)
            }
            SmsError::Db(e) => write!(f, "{}", e),
            SmsError::Chat(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SmsError {}

impl From<DbError> for SmsError {
    fn from(e: DbError) -> Self {
        SmsError::Db(e)
    }
}

impl From<ChatError> for SmsError {
    fn from(e: ChatError) -> Self {
        SmsError::Chat(e)
    }
}

impl From<ureq::Error> for SmsError {
    fn from(e: ureq::Error) -> Self {
        SmsError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SmsReceipt {
    pub provider: String,
    pub message_id: String,
    pub status: String,
    /// The sender already wrote this message to the SMS log
    pub recorded: bool,
}

pub trait SmsSender: Send + Sync {
    fn send(&self, to: &str, body: &str) -> Result<SmsReceipt, SmsError>;
    fn provider(&self) -> &'static str;
}

/// Demo provider: nothing leaves the machine, the message is only logged
pub struct LogSender {
    db: Database,
}

impl LogSender {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SmsSender for LogSender {
    fn send(&self, to: &str, body: &str) -> Result<SmsReceipt, SmsError> {
        let message_id = format!("log-{}", uuid::Uuid::new_v4());
        self.db.record_sms(&SmsRecord {
            direction: "outbound",
            phone: to,
            body,
            status: "logged",
            provider: Some("log"),
            provider_message_id: Some(message_id.as_str()),
            error: None,
        })?;
        info!(phone = %to, chars = body.chars().count(), "SMS logged (demo provider)");
        Ok(SmsReceipt {
            provider: "log".to_string(),
            message_id,
            status: "logged".to_string(),
            recorded: true,
        })
    }

    fn provider(&self) -> &'static str {
        "log"
    }
}

#[derive(Deserialize)]
struct TwilioResponse {
    sid: Option<String>,
    status: Option<String>,
    message: Option<String>,
}

/// Message id recorded when the provider accepted a message without a readable id
pub const UNKNOWN_SID: &str = "unknown";

/// Twilio Messages API. No retries here; the reminder queue retries.
pub struct TwilioSender {
    agent: ureq::Agent,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

impl TwilioSender {
    pub fn from_config(config: &SmsConfig) -> Result<Self, SmsError> {
        let field = |value: &Option<String>, name: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| SmsError::NotConfigured(format!("missing {}", name)))
        };
        Ok(Self {
            agent: ureq::Agent::new_with_config(
                ureq::config::Config::builder()
                    .http_status_as_error(false)
                    .timeout_global(Some(std::time::Duration::from_secs(15)))
                    .build(),
            ),
            account_sid: field(&config.account_sid, "account_sid")?,
            auth_token: field(&config.auth_token, "auth_token")?,
            from_number: field(&config.from_number, "from_number")?,
            base_url: TWILIO_API.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.account_sid, self.auth_token);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(credentials))
    }
}

impl SmsSender for TwilioSender {
    fn send(&self, to: &str, body: &str) -> Result<SmsReceipt, SmsError> {
        let url = format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid);
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.basic_auth())
            .send_form([("To", to), ("From", self.from_number.as_str()), ("Body", body)])?;

        let status = response.status().as_u16();
        let text = response.body_mut().read_to_string().unwrap_or_default();
        let parsed: Option<TwilioResponse> = serde_json::from_str(&text).ok();

        if !(200..300).contains(&status) {
            let message = parsed.and_then(|p| p.message).unwrap_or(text);
            return Err(SmsError::Rejected { status, message });
        }

        // Accepted means sent: an unreadable body must not trigger a resend
        let (sid, sms_status) = match parsed {
            Some(p) => (p.sid, p.status),
            None => {
                warn!(phone = %to, status, "Twilio accepted the message but the response was unreadable");
                (None, None)
            }
        };
        let message_id = sid.unwrap_or_else(|| UNKNOWN_SID.to_string());
        debug!(phone = %to, sid = %message_id, "SMS accepted by Twilio");
        Ok(SmsReceipt {
            provider: "twilio".to_string(),
            message_id,
            status: sms_status.unwrap_or_else(|| "queued".to_string()),
            recorded: false,
        })
    }

    fn provider(&self) -> &'static str {
        "twilio"
    }
}

/// Pick the sender for this configuration; Twilio without credentials
/// degrades to the log provider
pub fn sender_from_config(config: &Config, db: &Database) -> Box<dyn SmsSender> {
    if config.sms.provider == SmsProvider::Twilio {
        match TwilioSender::from_config(&config.sms) {
            Ok(sender) => return Box::new(sender),
            Err(e) => warn!(error = %e, "falling back to log SMS provider"),
        }
    }
    Box::new(LogSender::new(db.clone()))
}

/// Log a successfully sent outbound message unless the sender already did
pub fn record_outbound(db: &Database, to: &str, body: &str, receipt: &SmsReceipt) -> Result<(), DbError> {
    if receipt.recorded {
        return Ok(());
    }
    db.record_sms(&SmsRecord {
        direction: "outbound",
        phone: to,
        body,
        status: &receipt.status,
        provider: Some(receipt.provider.as_str()),
        provider_message_id: Some(receipt.message_id.as_str()),
        error: None,
    })?;
    Ok(())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// TwiML document; an empty reply yields an empty `<Response>`
pub fn twiml_response(reply: Option<&str>) -> String {
    match reply.map(str::trim).filter(|r| !r.is_empty()) {
        Some(text) => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
            xml_escape(text)
        ),
        None => "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string(),
    }
}

// ============================================================================
// Inbound Processing
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InboundOutcome {
    UserNotFound,
    PhoneVerified { user_id: i32 },
    NoPlants { user_id: i32 },
    CareLogged { user_id: i32, plant_id: i32, nickname: String, task: CareTask },
    PlantNotIdentified { user_id: i32, candidates: Vec<String> },
    Snoozed { user_id: i32, plant_id: i32, nickname: String, task: CareTask, until: String },
    Help { user_id: i32 },
    Stopped { user_id: i32 },
    Replied { user_id: i32, plant_id: i32, nickname: String, source: MessageSource },
}

/// Result of handling one inbound text
#[derive(Debug, Clone, Serialize)]
pub struct InboundReport {
    pub phone: String,
    pub intent: SmsIntent,
    pub outcome: InboundOutcome,
    pub reply: String,
}

pub const HELP_TEXT: &str = "PlantTexts commands: reply WATERED, FED, MISTED, REPOTTED or PRUNED \
(add the plant's name if you have more than one), LATER to snooze a reminder, STOP to unsubscribe. \
Anything else chats with your plant.";

pub struct InboundProcessor {
    db: Database,
    chat: ChatService,
    snooze_hours: i64,
    default_cc: String,
}

impl InboundProcessor {
    pub fn new(db: Database, chat: ChatService, config: &SmsConfig) -> Self {
        Self {
            db,
            chat,
            snooze_hours: config.snooze_hours.max(1),
            default_cc: config.default_country_code.clone(),
        }
    }

    pub fn process(&self, from: &str, body: &str) -> Result<InboundReport, SmsError> {
        self.db.record_sms(&SmsRecord {
            direction: "inbound",
            phone: from,
            body,
            status: "received",
            provider: None,
            provider_message_id: None,
            error: None,
        })?;

        let intent = parse_reply(body);
        let (outcome, reply) = self.handle(from, body, intent)?;
        info!(phone = %from, intent = intent.kind(), "inbound SMS processed");

        self.db.record_sms(&SmsRecord {
            direction: "outbound",
            phone: from,
            body: &reply,
            status: "replied",
            provider: Some("twiml"),
            provider_message_id: None,
            error: None,
        })?;

        Ok(InboundReport {
            phone: from.to_string(),
            intent,
            outcome,
            reply,
        })
    }

    fn handle(&self, from: &str, body: &str, intent: SmsIntent) -> Result<(InboundOutcome, String), SmsError> {
        let user = match self.db.find_user_by_phone(from, &self.default_cc)? {
            Some(user) => user,
            None => {
                return Ok((
                    InboundOutcome::UserNotFound,
                    "Sorry, this number isn't registered with PlantTexts.".to_string(),
                ))
            }
        };

        if intent == SmsIntent::Stop {
            self.db.set_user_active(user.id, false)?;
            info!(user_id = user.id, "user opted out by SMS");
            return Ok((
                InboundOutcome::Stopped { user_id: user.id },
                "You're unsubscribed and won't get more reminders. Your plants will miss you.".to_string(),
            ));
        }

        // Any reply to the welcome text confirms the number
        if !user.phone_verified {
            self.db.mark_phone_verified(user.id)?;
            return Ok((InboundOutcome::PhoneVerified { user_id: user.id }, onboarding::verified_reply()));
        }

        if intent == SmsIntent::Help {
            return Ok((InboundOutcome::Help { user_id: user.id }, HELP_TEXT.to_string()));
        }

        let plants = self.db.list_plant_details(user.id)?;
        if plants.is_empty() {
            return Ok((
                InboundOutcome::NoPlants { user_id: user.id },
                "You don't have any plants yet. Add one in the app to start getting texts from it!".to_string(),
            ));
        }

        let mut plant = match_plant(body, &plants);
        if plant.is_none() && plants.len() == 1 {
            plant = plants.first();
        }
        if plant.is_none() && matches!(intent, SmsIntent::RemindLater | SmsIntent::CareDone { task: None }) {
            plant = self.most_recently_reminded(&plants)?;
        }
        let plant = match plant {
            Some(plant) => plant,
            None => {
                let candidates: Vec<String> = plants.iter().map(|p| p.plant.nickname.clone()).collect();
                let reply = format!("Which plant? Reply with one of: {}", candidates.join(", "));
                return Ok((InboundOutcome::PlantNotIdentified { user_id: user.id, candidates }, reply));
            }
        };
        let plant_id = plant.plant.id;
        let nickname = plant.plant.nickname.clone();

        match intent {
            SmsIntent::CareDone { task } => {
                let task = match task {
                    Some(task) => task,
                    None => self
                        .db
                        .last_reminded_schedule(plant_id)?
                        .and_then(|s| s.task())
                        .unwrap_or(CareTask::Watering),
                };
                self.db
                    .log_care_event(plant_id, task, "sms", Some("Recorded via SMS reply"), None)?;
                let reply = self.chat.respond(plant_id, body)?.text;
                Ok((
                    InboundOutcome::CareLogged { user_id: user.id, plant_id, nickname, task },
                    reply,
                ))
            }
            SmsIntent::RemindLater => {
                let schedule = match self.db.last_reminded_schedule(plant_id)? {
                    Some(schedule) => Some(schedule),
                    None => self.db.list_schedules_for_plant(plant_id)?.into_iter().next(),
                };
                let schedule = match schedule {
                    Some(schedule) => schedule,
                    None => {
                        let reply = self.chat.respond(plant_id, body)?;
                        return Ok((
                            InboundOutcome::Replied { user_id: user.id, plant_id, nickname, source: reply.source },
                            reply.text,
                        ));
                    }
                };
                let task = schedule.task().unwrap_or(CareTask::Watering);
                let until = Utc::now() + Duration::hours(self.snooze_hours);
                self.db.snooze_schedule(schedule.id, until)?;
                let reply = format!(
                    "No problem, I'll remind you about {} again in {} hours. - {}",
                    task, self.snooze_hours, nickname
                );
                Ok((
                    InboundOutcome::Snoozed {
                        user_id: user.id,
                        plant_id,
                        nickname,
                        task,
                        until: care::format_timestamp(until),
                    },
                    reply,
                ))
            }
            _ => {
                let reply = self.chat.respond(plant_id, body)?;
                Ok((
                    InboundOutcome::Replied { user_id: user.id, plant_id, nickname, source: reply.source },
                    reply.text,
                ))
            }
        }
    }

    fn most_recently_reminded<'a>(&self, plants: &'a [PlantDetails]) -> Result<Option<&'a PlantDetails>, SmsError> {
        let mut best: Option<(String, &PlantDetails)> = None;
        for plant in plants {
            if let Some(at) = self
                .db
                .last_reminded_schedule(plant.plant.id)?
                .and_then(|s| s.last_reminded_at)
            {
                if best.as_ref().map_or(true, |(b, _)| at > *b) {
                    best = Some((at, plant));
                }
            }
        }
        Ok(best.map(|(_, plant)| plant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{catalog_id, seeded_db};
    use crate::db::UserSignup;
    use crate::llm::DisabledCompleter;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(555) 123-4567", "+1").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("15551234567", "+1").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("+44 20 7946 0958", "+1").unwrap(), "+442079460958");
        assert_eq!(normalize_phone("5551234567", "+44").unwrap(), "+445551234567");
        assert_eq!(normalize_phone("123", "+1"), Err(PhoneError::TooShort("123".to_string())));
        assert_eq!(normalize_phone("  ", "+1"), Err(PhoneError::Empty));
    }

    #[test]
    fn test_phone_variants() {
        let variants = phone_variants("+15551234567", "+1");
        assert!(variants.contains(&"+15551234567".to_string()));
        assert!(variants.contains(&"15551234567".to_string()));
        assert!(variants.contains(&"5551234567".to_string()));

        let variants = phone_variants("555-123-4567", "+1");
        assert!(variants.contains(&"+15551234567".to_string()));
        assert!(variants.contains(&"5551234567".to_string()));
    }

    #[test]
    fn test_phone_variants_follow_country_code() {
        // what normalize_phone stores for a UK default
        let stored = normalize_phone("7946095812", "+44").unwrap();
        assert_eq!(stored, "+447946095812");

        let variants = phone_variants("7946095812", "+44");
        assert!(variants.contains(&stored));
        assert!(!variants.contains(&"+17946095812".to_string()));

        let variants = phone_variants("+447946095812", "+44");
        assert!(variants.contains(&"7946095812".to_string()));
    }

    #[test]
    fn test_find_user_with_non_us_country_code() {
        let (_dir, db) = seeded_db();
        let phone = normalize_phone("7946095812", "+44").unwrap();
        let user = db.create_user(&UserSignup::with_phone(&phone)).unwrap();

        let found = db.find_user_by_phone("7946095812", "+44").unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
        assert!(db.find_user_by_phone("7946095812", "+1").unwrap().is_none());
    }

    #[test]
    fn test_parse_reply_care_keywords() {
        assert_eq!(parse_reply("Watered Spike!"), SmsIntent::CareDone { task: Some(CareTask::Watering) });
        assert_eq!(parse_reply("fed the fern"), SmsIntent::CareDone { task: Some(CareTask::Fertilizing) });
        assert_eq!(parse_reply("misted"), SmsIntent::CareDone { task: Some(CareTask::Misting) });
        assert_eq!(parse_reply("just repotted her"), SmsIntent::CareDone { task: Some(CareTask::Repotting) });
        assert_eq!(parse_reply("trimmed the dead leaves"), SmsIntent::CareDone { task: Some(CareTask::Pruning) });
        assert_eq!(parse_reply("done"), SmsIntent::CareDone { task: None });
        assert_eq!(parse_reply("Did it"), SmsIntent::CareDone { task: None });
    }

    #[test]
    fn test_parse_reply_commands() {
        assert_eq!(parse_reply("STOP"), SmsIntent::Stop);
        assert_eq!(parse_reply("please unsubscribe me"), SmsIntent::Stop);
        assert_eq!(parse_reply("help"), SmsIntent::Help);
        assert_eq!(parse_reply("remind me later"), SmsIntent::RemindLater);
        assert_eq!(parse_reply("I'll water you tomorrow"), SmsIntent::RemindLater);
        assert_eq!(parse_reply("should I water you?"), SmsIntent::Chat);
        assert_eq!(parse_reply("how are you feeling"), SmsIntent::Chat);
        // "stop" inside a sentence is not an opt-out
        assert_eq!(parse_reply("don't stop growing"), SmsIntent::Chat);
    }

    #[test]
    fn test_every_task_has_reply_patterns() {
        for task in CareTask::ALL {
            assert!(TASK_PATTERNS.iter().any(|(t, _)| *t == task), "{:?}", task);
            assert!(COMPLETED_PATTERNS.iter().any(|(t, _)| *t == task), "{:?}", task);
        }
        assert!(REMIND_LATER.is_match("not now"));
        assert!(CONFIRM.is_match("yep"));
    }

    #[test]
    fn test_parse_reply_reported_care_beats_future_plans() {
        assert_eq!(
            parse_reply("Watered Spike, will mist her tomorrow"),
            SmsIntent::CareDone { task: Some(CareTask::Watering) }
        );
        assert_eq!(
            parse_reply("misted the fern, I'll water later"),
            SmsIntent::CareDone { task: Some(CareTask::Misting) }
        );
        // the earliest reported task wins
        assert_eq!(
            parse_reply("fed and watered everyone"),
            SmsIntent::CareDone { task: Some(CareTask::Fertilizing) }
        );
        // plans alone still snooze
        assert_eq!(parse_reply("will water tomorrow"), SmsIntent::RemindLater);
        assert_eq!(parse_reply("was Spike watered?"), SmsIntent::Chat);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("fern", "fren"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_twiml_escapes() {
        assert_eq!(
            twiml_response(None),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>"
        );
        let doc = twiml_response(Some("Water <now> & often"));
        assert!(doc.contains("<Message>Water &lt;now&gt; &amp; often</Message>"));
    }

    fn processor(db: &Database) -> InboundProcessor {
        let chat = ChatService::new(db.clone(), Arc::new(DisabledCompleter), 100, 0.8);
        InboundProcessor::new(db.clone(), chat, &SmsConfig::default())
    }

    fn unverified_user_with_plants(db: &Database, plants: &[(&str, &str)]) -> i32 {
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        for (species, nickname) in plants {
            db.add_user_plant(user.id, catalog_id(db, species), nickname).unwrap();
        }
        user.id
    }

    fn user_with_plants(db: &Database, plants: &[(&str, &str)]) -> i32 {
        let user_id = unverified_user_with_plants(db, plants);
        db.mark_phone_verified(user_id).unwrap();
        user_id
    }

    #[test]
    fn test_match_plant_priorities() {
        let (_dir, db) = seeded_db();
        let user_id = user_with_plants(
            &db,
            &[("Aloe vera", "Spike"), ("Nephrolepis exaltata", "Fernanda"), ("Monstera deliciosa", "Big Monty")],
        );
        let plants = db.list_plant_details(user_id).unwrap();

        let nick = |text: &str| match_plant(text, &plants).map(|p| p.plant.nickname.clone());
        assert_eq!(nick("watered spike"), Some("Spike".to_string()));
        assert_eq!(nick("watered the boston fern"), Some("Fernanda".to_string()));
        assert_eq!(nick("fed monty"), Some("Big Monty".to_string()));
        assert_eq!(nick("watered fernandaa"), Some("Fernanda".to_string()));
        assert_eq!(nick("watered it"), None);
    }

    #[test]
    fn test_inbound_unknown_number() {
        let (_dir, db) = seeded_db();
        let report = processor(&db).process("+19998887777", "watered").unwrap();
        assert!(matches!(report.outcome, InboundOutcome::UserNotFound));
        // inbound and reply both logged
        assert_eq!(db.recent_sms(10).unwrap().len(), 2);
    }

    #[test]
    fn test_inbound_single_plant_is_implicit() {
        let (_dir, db) = seeded_db();
        user_with_plants(&db, &[("Aloe vera", "Spike")]);

        let report = processor(&db).process("5551234567", "watered").unwrap();
        match report.outcome {
            InboundOutcome::CareLogged { nickname, task, .. } => {
                assert_eq!(nickname, "Spike");
                assert_eq!(task, CareTask::Watering);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!report.reply.is_empty());
    }

    #[test]
    fn test_inbound_ambiguous_plant() {
        let (_dir, db) = seeded_db();
        user_with_plants(&db, &[("Aloe vera", "Spike"), ("Nephrolepis exaltata", "Fernanda")]);

        let report = processor(&db).process("+15551234567", "watered").unwrap();
        match report.outcome {
            InboundOutcome::PlantNotIdentified { candidates, .. } => {
                assert_eq!(candidates, vec!["Spike".to_string(), "Fernanda".to_string()]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_inbound_done_uses_last_reminded_task() {
        let (_dir, db) = seeded_db();
        let user_id = user_with_plants(&db, &[("Aloe vera", "Spike"), ("Nephrolepis exaltata", "Fernanda")]);
        let fern = db.list_user_plants(user_id).unwrap()[1].id;
        let misting = db
            .list_schedules_for_plant(fern)
            .unwrap()
            .into_iter()
            .find(|s| s.task_type == "misting")
            .unwrap();
        db.mark_reminded(misting.id, Utc::now()).unwrap();

        let report = processor(&db).process("+15551234567", "done!").unwrap();
        match report.outcome {
            InboundOutcome::CareLogged { plant_id, task, .. } => {
                assert_eq!(plant_id, fern);
                assert_eq!(task, CareTask::Misting);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_inbound_snooze_and_stop() {
        let (_dir, db) = seeded_db();
        let user_id = user_with_plants(&db, &[("Aloe vera", "Spike")]);
        let proc = processor(&db);

        let report = proc.process("+15551234567", "later").unwrap();
        assert!(matches!(report.outcome, InboundOutcome::Snoozed { .. }));

        let report = proc.process("+15551234567", "STOP").unwrap();
        assert!(matches!(report.outcome, InboundOutcome::Stopped { .. }));
        assert!(!db.get_user(user_id).unwrap().is_active);
    }

    #[test]
    fn test_first_inbound_verifies_phone() {
        let (_dir, db) = seeded_db();
        let user_id = unverified_user_with_plants(&db, &[("Aloe vera", "Spike")]);
        let proc = processor(&db);

        let report = proc.process("+15551234567", "watered Spike").unwrap();
        match report.outcome {
            InboundOutcome::PhoneVerified { user_id: verified } => assert_eq!(verified, user_id),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.reply.contains(onboarding::CONTACT_CARD));
        assert!(db.get_user(user_id).unwrap().phone_verified);
        // the verifying message is not read as care
        let plant_id = db.list_user_plants(user_id).unwrap()[0].id;
        assert!(db.recent_care(plant_id, 10).unwrap().is_empty());

        let report = proc.process("+15551234567", "watered Spike").unwrap();
        assert!(matches!(report.outcome, InboundOutcome::CareLogged { .. }));
    }

    #[test]
    fn test_stop_from_unverified_phone() {
        let (_dir, db) = seeded_db();
        let user_id = unverified_user_with_plants(&db, &[("Aloe vera", "Spike")]);

        let report = processor(&db).process("+15551234567", "STOP").unwrap();
        assert!(matches!(report.outcome, InboundOutcome::Stopped { .. }));
        let user = db.get_user(user_id).unwrap();
        assert!(!user.is_active);
        assert!(!user.phone_verified);
    }

    #[test]
    fn test_inbound_chat_reply() {
        let (_dir, db) = seeded_db();
        user_with_plants(&db, &[("Aloe vera", "Spike")]);
        let report = processor(&db).process("+15551234567", "hello spike").unwrap();
        match report.outcome {
            InboundOutcome::Replied { source, .. } => assert_eq!(source, MessageSource::Fallback),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.reply.contains("Spike"));
    }

    #[test]
    fn test_log_sender_records_message() {
        let (_dir, db) = seeded_db();
        let receipt = LogSender::new(db.clone()).send("+15551234567", "hi").unwrap();
        assert!(receipt.recorded);
        assert!(receipt.message_id.starts_with("log-"));
        let rows = db.recent_sms(5).unwrap();
        assert_eq!(rows[0].status, "logged");
    }

    #[test]
    fn test_twilio_requires_credentials() {
        let config = SmsConfig::default();
        assert!(matches!(TwilioSender::from_config(&config), Err(SmsError::NotConfigured(_))));
    }

    #[test]
    fn test_twilio_transport_error() {
        let config = SmsConfig {
            provider: SmsProvider::Twilio,
            account_sid: Some("AC123".to_string()),
            auth_token: Some("secret".to_string()),
            from_number: Some("+15550001111".to_string()),
            ..SmsConfig::default()
        };
        let sender = TwilioSender::from_config(&config).unwrap().with_base_url("http://127.0.0.1:9");
        assert_eq!(sender.basic_auth(), "Basic QUMxMjM6c2VjcmV0");
        assert!(matches!(sender.send("+15551234567", "hi"), Err(SmsError::Transport(_))));
    }

    /// Serves the canned (status, body) responses in order, then stops
    fn canned_twilio(responses: Vec<(u16, &'static str)>) -> (String, std::thread::JoinHandle<()>) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = std::thread::spawn(move || {
            for (status, body) in responses {
                let request = server.recv().unwrap();
                request
                    .respond(tiny_http::Response::from_string(body).with_status_code(status))
                    .unwrap();
            }
        });
        (format!("http://127.0.0.1:{}", port), handle)
    }

    #[test]
    fn test_twilio_any_success_status_counts_as_sent() {
        let (base_url, server) = canned_twilio(vec![
            (201, r#"{"sid": "SM42", "status": "queued"}"#),
            (201, "<html>gateway hiccup</html>"),
            (400, r#"{"message": "The 'To' number is not a valid phone number."}"#),
        ]);
        let config = SmsConfig {
            provider: SmsProvider::Twilio,
            account_sid: Some("AC123".to_string()),
            auth_token: Some("secret".to_string()),
            from_number: Some("+15550001111".to_string()),
            ..SmsConfig::default()
        };
        let sender = TwilioSender::from_config(&config).unwrap().with_base_url(&base_url);

        let receipt = sender.send("+15551234567", "hi").unwrap();
        assert_eq!(receipt.message_id, "SM42");

        let receipt = sender.send("+15551234567", "hi").unwrap();
        assert_eq!(receipt.message_id, UNKNOWN_SID);
        assert_eq!(receipt.status, "queued");

        match sender.send("nope", "hi") {
            Err(SmsError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("not a valid phone number"));
            }
            other => panic!("expected rejection, got {:?}", other.map(|r| r.message_id)),
        }
        server.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_parse_reply_is_total(text in ".{0,200}") {
            let intent = parse_reply(&text);
            prop_assert!(SmsIntent::ALL_KINDS.contains(&intent.kind()));
        }

        #[test]
        fn prop_normalized_phone_is_stable(digits in "[2-9][0-9]{9}") {
            let canonical = normalize_phone(&digits, "+1").unwrap();
            prop_assert_eq!(normalize_phone(&canonical, "+1").unwrap(), canonical.clone());
            prop_assert!(phone_variants(&digits, "+1").contains(&canonical));
        }
    }
}
