//! HTTP API for planttexts
//!
//! `planttexts serve` → JSON API under `/api/v1` plus the SMS webhook.
//! Routing is a pure function of [`HttpRequest`] so it can be tested
//! without a socket.

use crate::care::{self, CareTask};
use crate::catalog::CareRequirements;
use crate::chat::{ChatError, ChatService};
use crate::config::Config;
use crate::db::{Database, DbError, UserSignup};
use crate::llm::Completer;
use crate::personality::{self, PersonalityKind};
use crate::onboarding;
use crate::sms::{self, InboundProcessor, PhoneError, SmsError, SmsSender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }
}

const JSON: &str = "application/json";
const XML: &str = "application/xml";
const ADMIN_HEADER: &str = "x-admin-api-key";
const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

/// Shared handles for every request thread
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub chat: ChatService,
    pub inbound: InboundProcessor,
    pub sender: Arc<dyn SmsSender>,
}

impl AppState {
    pub fn new(db: Database, config: Config, completer: Arc<dyn Completer>) -> Self {
        let chat = ChatService::new(
            db.clone(),
            completer,
            config.llm.max_tokens,
            config.llm.temperature,
        );
        let inbound = InboundProcessor::new(db.clone(), chat.clone(), &config.sms);
        let sender: Arc<dyn SmsSender> = Arc::from(sms::sender_from_config(&config, &db));
        Self { db, config, chat, inbound, sender }
    }
}

/// Transport-independent view of a request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Self {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (url, HashMap::new()),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn json<T: Serialize>(status: u16, data: T) -> Self {
        let body = serde_json::to_string(&ApiResponse::success(data))
            .unwrap_or_else(|e| format!("{{\"ok\":false,\"data\":null,\"error\":\"{}\"}}", e));
        Self { status, content_type: JSON, body }
    }

    fn xml(body: String) -> Self {
        Self { status: 200, content_type: XML, body }
    }

    fn empty(status: u16) -> Self {
        Self { status, content_type: JSON, body: String::new() }
    }
}

/// Handler error carrying its HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(404, format!("{} not found", what.into()))
    }

    fn into_response(self) -> HttpResponse {
        let body = serde_json::to_string(&ApiResponse::<()> {
            ok: false,
            data: None,
            error: Some(self.message.clone()),
        })
        .unwrap_or_default();
        HttpResponse { status: self.status, content_type: JSON, body }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => ApiError::not_found(what),
            DbError::Validation(msg) => ApiError::bad_request(msg),
            DbError::Conflict(msg) => ApiError::new(409, msg),
            other => {
                error!(error = %other, "database error");
                ApiError::new(500, "Internal database error")
            }
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::NotFound(what) => ApiError::not_found(what),
            ChatError::Validation(msg) => ApiError::bad_request(msg),
            ChatError::Db(e) => e.into(),
        }
    }
}

impl From<SmsError> for ApiError {
    fn from(e: SmsError) -> Self {
        match e {
            SmsError::Db(e) => e.into(),
            SmsError::Chat(e) => e.into(),
            other => ApiError::new(502, other.to_string()),
        }
    }
}

impl From<PhoneError> for ApiError {
    fn from(e: PhoneError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Deserialize)]
struct AddPlantRequest {
    user_id: i32,
    plant_catalog_id: i32,
    nickname: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Deserialize)]
struct CareCompleteRequest {
    user_plant_id: i32,
    task_type: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
struct TwilioInbound {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body", default)]
    body: String,
}

#[derive(Deserialize)]
struct TestSmsRequest {
    from_phone: String,
    message: String,
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {}", e)))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

/// Percent-decode one path segment; a literal `+` stays a plus
fn decode_segment(segment: &str) -> String {
    serde_urlencoded::from_str::<Vec<(String, String)>>(&format!("v={}", segment.replace('+', "%2B")))
        .ok()
        .and_then(|pairs| pairs.into_iter().next())
        .map(|(_, v)| v)
        .unwrap_or_else(|| segment.to_string())
}

fn parse_id(segment: &str, what: &str) -> Result<i32, ApiError> {
    segment
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid {} id '{}'", what, segment)))
}

fn limit_param(req: &HttpRequest, default: usize) -> usize {
    req.query
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(1, MAX_PAGE)
}

/// Compare digests so the check does not short-circuit on a prefix
fn keys_match(given: &str, expected: &str) -> bool {
    Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}

// ============================================================================
// Routing
// ============================================================================

/// Route one request. Never panics; errors become JSON envelopes.
pub fn route(state: &AppState, req: &HttpRequest) -> HttpResponse {
    if req.method == Method::Options {
        return HttpResponse::empty(204);
    }

    let path = req.path.trim_end_matches('/');
    let result = match (&req.method, path) {
        (&Method::Get, "") | (&Method::Get, "/health") => Ok(service_info(state, path)),
        (&Method::Post, "/api/sms/webhook") => Ok(sms_webhook(state, req)),
        (&Method::Post, "/api/sms/test") => sms_test(state, req),
        _ => match path.strip_prefix(state.config.server.api_prefix.trim_end_matches('/')) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
                api_route(state, req, &segments)
            }
            _ => Err(ApiError::new(404, "Not found")),
        },
    };
    result.unwrap_or_else(ApiError::into_response)
}

fn api_route(state: &AppState, req: &HttpRequest, segments: &[&str]) -> ApiResult {
    let db = &state.db;
    match (&req.method, segments) {
        (&Method::Get, []) => Ok(service_info(state, "")),
        (&Method::Get, ["health"]) => Ok(service_info(state, "/health")),

        // Catalog
        (&Method::Get, ["catalog"]) => {
            let search = req.query.get("q").map(String::as_str).filter(|q| !q.trim().is_empty());
            let entries = db.list_catalog(search, limit_param(req, DEFAULT_PAGE) as i64)?;
            Ok(HttpResponse::json(200, entries))
        }
        (&Method::Get, ["catalog", id]) => {
            Ok(HttpResponse::json(200, db.get_catalog_entry(parse_id(id, "catalog")?)?))
        }
        (&Method::Get, ["catalog", id, "personality"]) => suggested_personality(state, parse_id(id, "catalog")?),
        (&Method::Get, ["personalities"]) => Ok(HttpResponse::json(200, db.list_personalities()?)),

        // Users
        (&Method::Post, ["users"]) => {
            let signup = normalized_signup(state, &req.body)?;
            Ok(HttpResponse::json(201, db.create_user(&signup)?))
        }
        (&Method::Post, ["users", "find-or-create"]) => {
            let signup = normalized_signup(state, &req.body)?;
            let (user, created) = db.find_or_create_user(&signup)?;
            Ok(HttpResponse::json(
                if created { 201 } else { 200 },
                serde_json::json!({ "user": user, "created": created }),
            ))
        }
        (&Method::Get, ["users", "find", phone]) => {
            let phone = decode_segment(phone);
            match db.find_user_by_phone(&phone, &state.config.sms.default_country_code)? {
                Some(user) => Ok(HttpResponse::json(200, user)),
                None => Err(ApiError::not_found(format!("User with phone {}", phone))),
            }
        }
        (&Method::Get, ["users", id]) => Ok(HttpResponse::json(200, db.get_user(parse_id(id, "user")?)?)),
        (&Method::Delete, ["users", id]) => {
            let id = parse_id(id, "user")?;
            db.deactivate_user(id)?;
            Ok(HttpResponse::json(200, serde_json::json!({ "user_id": id, "deleted": true })))
        }
        (&Method::Get, ["users", id, "plants"]) => {
            let user = db.get_user(parse_id(id, "user")?)?;
            Ok(HttpResponse::json(200, db.list_plant_details(user.id)?))
        }
        (&Method::Get, ["users", id, "schedule"]) => {
            let user = db.get_user(parse_id(id, "user")?)?;
            Ok(HttpResponse::json(200, db.list_schedules_for_user(user.id)?))
        }
        (&Method::Get, ["users", id, "dashboard"]) => dashboard(state, parse_id(id, "user")?),

        // Plants
        (&Method::Post, ["plants"]) => {
            let body: AddPlantRequest = parse_json(&req.body)?;
            let (plant, created) = db.add_user_plant(body.user_id, body.plant_catalog_id, &body.nickname)?;
            let details = db.plant_details(plant.id)?;
            let welcome_sent = created
                && match onboarding::send_welcome(db, state.sender.as_ref(), body.user_id) {
                    Ok(outcome) => outcome.is_sent(),
                    Err(e) => {
                        warn!(user_id = body.user_id, error = %e, "welcome text failed");
                        false
                    }
                };
            Ok(HttpResponse::json(
                if created { 201 } else { 200 },
                serde_json::json!({ "plant": details, "created": created, "welcome_sent": welcome_sent }),
            ))
        }
        (&Method::Delete, ["plants", id]) => {
            let id = parse_id(id, "plant")?;
            db.remove_user_plant(id)?;
            Ok(HttpResponse::json(200, serde_json::json!({ "plant_id": id, "removed": true })))
        }
        (&Method::Get, ["plants", id, "history"]) => {
            let plant = db.get_user_plant(parse_id(id, "plant")?)?;
            let events = db.recent_care(plant.id, limit_param(req, 20) as i64)?;
            Ok(HttpResponse::json(200, serde_json::json!({ "plant": plant, "events": events })))
        }
        (&Method::Post, ["plants", id, "chat"]) => {
            let plant_id = parse_id(id, "plant")?;
            let body: ChatRequest = parse_json(&req.body)?;
            let reply = state.chat.respond(plant_id, &body.message)?;
            Ok(HttpResponse::json(
                200,
                serde_json::json!({ "plant_id": plant_id, "reply": reply.text, "source": reply.source }),
            ))
        }
        (&Method::Post, ["plants", id, "remind", task]) => {
            let plant_id = parse_id(id, "plant")?;
            let task = CareTask::parse(task)
                .ok_or_else(|| ApiError::bad_request(format!("Unknown care task '{}'", task)))?;
            let message = state.chat.generate_care_reminder(plant_id, task)?;
            Ok(HttpResponse::json(
                200,
                serde_json::json!({
                    "plant_id": plant_id,
                    "task": task,
                    "message": message.text,
                    "source": message.source,
                }),
            ))
        }

        // Care
        (&Method::Post, ["care", "complete"]) => complete_care(state, req),

        // Admin
        (&Method::Get, ["admin", "sms-log"]) => {
            check_admin(state, req)?;
            Ok(HttpResponse::json(200, db.recent_sms(limit_param(req, DEFAULT_PAGE) as i64)?))
        }

        _ => Err(ApiError::new(404, "Not found")),
    }
}

fn service_info(state: &AppState, path: &str) -> HttpResponse {
    if path.ends_with("health") {
        return HttpResponse::json(200, serde_json::json!({ "status": "healthy" }));
    }
    HttpResponse::json(
        200,
        serde_json::json!({
            "service": "planttexts",
            "version": env!("CARGO_PKG_VERSION"),
            "api_prefix": state.config.server.api_prefix,
            "llm_enabled": state.config.llm_enabled(),
            "sms_provider": state.config.sms.provider,
        }),
    )
}

fn normalized_signup(state: &AppState, body: &str) -> Result<UserSignup, ApiError> {
    let mut signup: UserSignup = parse_json(body)?;
    signup.phone = sms::normalize_phone(&signup.phone, &state.config.sms.default_country_code)?;
    Ok(signup)
}

fn suggested_personality(state: &AppState, catalog_id: i32) -> ApiResult {
    let entry = state.db.get_catalog_entry(catalog_id)?;
    let requirements: CareRequirements = entry.requirements();
    let kind = personality::personality_for_category(&entry.category, &requirements.climate);
    let profile = kind.profile();
    Ok(HttpResponse::json(
        200,
        serde_json::json!({
            "catalog_id": entry.id,
            "plant": entry.name,
            "personality": kind,
            "name": profile.name,
            "description": profile.description,
            "traits": profile.traits,
            "explanation": personality::explanation(kind, &entry.category),
        }),
    ))
}

fn dashboard(state: &AppState, user_id: i32) -> ApiResult {
    let user = state.db.get_user(user_id)?;
    let plants = state.db.list_plant_details(user.id)?;
    let upcoming: Vec<_> = state
        .db
        .list_schedules_for_user(user.id)?
        .into_iter()
        .take(10)
        .collect();
    let personalities: Vec<PersonalityKind> = plants
        .iter()
        .map(|p| PersonalityKind::from_name(&p.personality.name))
        .collect();
    Ok(HttpResponse::json(
        200,
        serde_json::json!({
            "user": user,
            "plant_count": plants.len(),
            "plants": plants,
            "personalities": personalities,
            "upcoming": upcoming,
        }),
    ))
}

fn complete_care(state: &AppState, req: &HttpRequest) -> ApiResult {
    let body: CareCompleteRequest = parse_json(&req.body)?;
    let task = CareTask::parse(&body.task_type)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown care task '{}'", body.task_type)))?;
    let completed_at = match body.completed_at.as_deref() {
        Some(raw) => Some(
            care::parse_timestamp(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid timestamp '{}'", raw)))?,
        ),
        None => None,
    };
    let event = state.db.log_care_event(
        body.user_plant_id,
        task,
        body.method.as_deref().unwrap_or("api"),
        body.notes.as_deref(),
        completed_at,
    )?;
    Ok(HttpResponse::json(201, event))
}

fn check_admin(state: &AppState, req: &HttpRequest) -> Result<(), ApiError> {
    let expected = state
        .config
        .admin
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ApiError::new(503, "Admin API key not configured"))?;
    match req.header(ADMIN_HEADER) {
        Some(given) if keys_match(given, expected) => Ok(()),
        _ => {
            warn!(path = %req.path, "rejected admin request");
            Err(ApiError::new(403, "Invalid admin API key"))
        }
    }
}

/// Twilio webhook: always answers TwiML so Twilio never retries
fn sms_webhook(state: &AppState, req: &HttpRequest) -> HttpResponse {
    let inbound: TwilioInbound = match serde_urlencoded::from_str(&req.body) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "malformed SMS webhook body");
            return HttpResponse::xml(sms::twiml_response(None));
        }
    };
    match state.inbound.process(&inbound.from, &inbound.body) {
        Ok(report) => HttpResponse::xml(sms::twiml_response(Some(report.reply.as_str()))),
        Err(e) => {
            error!(phone = %inbound.from, error = %e, "inbound SMS failed");
            HttpResponse::xml(sms::twiml_response(None))
        }
    }
}

fn sms_test(state: &AppState, req: &HttpRequest) -> ApiResult {
    let body: TestSmsRequest = parse_json(&req.body)?;
    let report = state.inbound.process(&body.from_phone, &body.message)?;
    Ok(HttpResponse::json(200, report))
}

// ============================================================================
// Server
// ============================================================================

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

/// CORS origin to echo back, if the request's origin is allowed
fn allowed_origin(config: &Config, origin: Option<&str>) -> Option<String> {
    let origins = &config.server.cors_origins;
    if origins.iter().any(|o| o == "*") {
        return Some("*".to_string());
    }
    origin.filter(|o| origins.iter().any(|allowed| allowed == o)).map(str::to_string)
}

fn to_http_request(request: &mut Request) -> HttpRequest {
    let mut req = HttpRequest::new(request.method().clone(), request.url());
    for h in request.headers() {
        req.headers
            .insert(h.field.as_str().as_str().to_lowercase(), h.value.as_str().to_string());
    }
    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        warn!(error = %e, "failed to read request body");
    }
    req.body = body;
    req
}

fn handle_request(state: &AppState, mut request: Request) -> std::io::Result<()> {
    let started = std::time::Instant::now();
    let req = to_http_request(&mut request);
    let resp = route(state, &req);

    info!(
        method = %req.method,
        path = %req.path,
        status = resp.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    let mut response = Response::from_string(resp.body).with_status_code(resp.status);
    let mut headers = vec![header("Content-Type", resp.content_type)];
    if let Some(origin) = allowed_origin(&state.config, req.header("origin")) {
        headers.push(header("Access-Control-Allow-Origin", &origin));
        headers.push(header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"));
        headers.push(header("Access-Control-Allow-Headers", "Content-Type, X-Admin-API-Key"));
    }
    for h in headers.into_iter().flatten() {
        response = response.with_header(h);
    }
    request.respond(response)
}

/// Serve until the listener fails. `server.workers` threads share one
/// listener and pull requests off it independently.
pub fn start_server(state: Arc<AppState>) -> std::io::Result<()> {
    let addr = state.config.bind_addr();
    let server = Server::http(&addr).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let server = Arc::new(server);
    let workers = state.config.server.workers.max(1);

    info!(addr = %addr, workers, prefix = %state.config.server.api_prefix, "planttexts API listening");

    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let server = Arc::clone(&server);
            let state = Arc::clone(&state);
            std::thread::spawn(move || loop {
                match server.recv() {
                    Ok(request) => {
                        if let Err(e) = handle_request(&state, request) {
                            warn!(worker = n, error = %e, "failed to write response");
                        }
                    }
                    Err(e) => {
                        error!(worker = n, error = %e, "listener failed");
                        break;
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            error!("request thread panicked");
        }
    }
    debug!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{catalog_id, seeded_db};
    use crate::llm::DisabledCompleter;
    use serde_json::Value;
    use tempfile::TempDir;

    fn state() -> (TempDir, AppState) {
        let (dir, db) = seeded_db();
        let mut config = Config::default();
        config.admin.api_key = Some("a".repeat(32));
        (dir, AppState::new(db, config, Arc::new(DisabledCompleter)))
    }

    fn call(state: &AppState, method: Method, url: &str, body: &str) -> (u16, Value) {
        let resp = route(state, &HttpRequest::new(method, url).with_body(body));
        let json = serde_json::from_str(&resp.body).unwrap_or(Value::Null);
        (resp.status, json)
    }

    fn signup(state: &AppState, phone: &str) -> i64 {
        let body = format!(r#"{{"phone":"{}"}}"#, phone);
        let (status, json) = call(state, Method::Post, "/api/v1/users", &body);
        assert_eq!(status, 201, "{}", json);
        json["data"]["id"].as_i64().unwrap()
    }

    #[test]
    fn test_health_and_info() {
        let (_dir, state) = state();
        let (status, json) = call(&state, Method::Get, "/health", "");
        assert_eq!(status, 200);
        assert_eq!(json["data"]["status"], "healthy");

        let (_, json) = call(&state, Method::Get, "/api/v1", "");
        assert_eq!(json["data"]["service"], "planttexts");
        assert_eq!(json["data"]["llm_enabled"], false);
    }

    #[test]
    fn test_catalog_routes() {
        let (_dir, state) = state();
        let (status, json) = call(&state, Method::Get, "/api/v1/catalog?q=fern&limit=5", "");
        assert_eq!(status, 200);
        let entries = json["data"].as_array().unwrap();
        assert!(!entries.is_empty() && entries.len() <= 5);

        let id = catalog_id(&state.db, "Aloe vera");
        let (_, json) = call(&state, Method::Get, &format!("/api/v1/catalog/{}/personality", id), "");
        assert_eq!(json["data"]["personality"], "sarcastic_survivor");

        let (status, _) = call(&state, Method::Get, "/api/v1/catalog/99999", "");
        assert_eq!(status, 404);
        let (status, _) = call(&state, Method::Get, "/api/v1/catalog/abc", "");
        assert_eq!(status, 400);

        let (_, json) = call(&state, Method::Get, "/api/v1/personalities", "");
        assert_eq!(json["data"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_user_signup_errors() {
        let (_dir, state) = state();
        signup(&state, "(555) 123-4567");

        let (status, json) = call(&state, Method::Post, "/api/v1/users", r#"{"phone":"5551234567"}"#);
        assert_eq!(status, 409);
        assert_eq!(json["ok"], false);

        let (status, _) = call(&state, Method::Post, "/api/v1/users", r#"{"phone":"123"}"#);
        assert_eq!(status, 400);
        let (status, _) = call(&state, Method::Post, "/api/v1/users", "not json");
        assert_eq!(status, 400);

        let (status, json) = call(&state, Method::Get, "/api/v1/users/find/+15551234567", "");
        assert_eq!(status, 200);
        assert_eq!(json["data"]["phone"], "+15551234567");

        let (status, json) = call(
            &state,
            Method::Post,
            "/api/v1/users/find-or-create",
            r#"{"phone":"15551234567"}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(json["data"]["created"], false);
    }

    #[test]
    fn test_plant_lifecycle() {
        let (_dir, state) = state();
        let user_id = signup(&state, "+15551234567");
        let fern = catalog_id(&state.db, "Nephrolepis exaltata");
        let body = format!(r#"{{"user_id":{},"plant_catalog_id":{},"nickname":"Fernanda"}}"#, user_id, fern);

        let (status, json) = call(&state, Method::Post, "/api/v1/plants", &body);
        assert_eq!(status, 201);
        assert_eq!(json["data"]["welcome_sent"], true);
        let plant_id = json["data"]["plant"]["id"].as_i64().unwrap();

        let (status, json) = call(&state, Method::Post, "/api/v1/plants", &body);
        assert_eq!(status, 200);
        assert_eq!(json["data"]["created"], false);
        assert_eq!(json["data"]["welcome_sent"], false);
        assert_eq!(state.db.recent_sms(10).unwrap().len(), 1);

        let (_, json) = call(&state, Method::Get, &format!("/api/v1/users/{}/dashboard", user_id), "");
        assert_eq!(json["data"]["plant_count"], 1);
        assert!(!json["data"]["upcoming"].as_array().unwrap().is_empty());

        let care = format!(r#"{{"user_plant_id":{},"task_type":"watering","notes":"deep soak"}}"#, plant_id);
        let (status, _) = call(&state, Method::Post, "/api/v1/care/complete", &care);
        assert_eq!(status, 201);
        let bad = format!(r#"{{"user_plant_id":{},"task_type":"dancing"}}"#, plant_id);
        let (status, _) = call(&state, Method::Post, "/api/v1/care/complete", &bad);
        assert_eq!(status, 400);

        let (_, json) = call(&state, Method::Get, &format!("/api/v1/plants/{}/history", plant_id), "");
        assert_eq!(json["data"]["events"].as_array().unwrap().len(), 1);

        let (status, json) = call(
            &state,
            Method::Post,
            &format!("/api/v1/plants/{}/chat", plant_id),
            r#"{"message":"hello"}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(json["data"]["source"], "fallback");

        let (status, json) = call(&state, Method::Post, &format!("/api/v1/plants/{}/remind/misting", plant_id), "");
        assert_eq!(status, 200);
        assert!(json["data"]["message"].as_str().unwrap().contains("Fernanda"));

        let (status, _) = call(&state, Method::Delete, &format!("/api/v1/plants/{}", plant_id), "");
        assert_eq!(status, 200);
        let (_, json) = call(&state, Method::Get, &format!("/api/v1/users/{}/plants", user_id), "");
        assert!(json["data"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_admin_key_checks() {
        let (_dir, mut state) = state();
        let url = "/api/v1/admin/sms-log";

        let resp = route(&state, &HttpRequest::new(Method::Get, url));
        assert_eq!(resp.status, 403);
        let resp = route(&state, &HttpRequest::new(Method::Get, url).with_header("X-Admin-API-Key", &"a".repeat(32)));
        assert_eq!(resp.status, 200);

        state.config.admin.api_key = None;
        let resp = route(&state, &HttpRequest::new(Method::Get, url).with_header("X-Admin-API-Key", "x"));
        assert_eq!(resp.status, 503);
    }

    #[test]
    fn test_sms_webhook_returns_twiml() {
        let (_dir, state) = state();
        let user_id = signup(&state, "+15551234567");
        state
            .db
            .add_user_plant(user_id as i32, catalog_id(&state.db, "Aloe vera"), "Spike")
            .unwrap();

        let resp = route(
            &state,
            &HttpRequest::new(Method::Post, "/api/sms/webhook").with_body("From=%2B15551234567&Body=YES"),
        );
        assert!(resp.body.contains("Phone verified!"));
        assert!(state.db.get_user(user_id as i32).unwrap().phone_verified);

        let resp = route(
            &state,
            &HttpRequest::new(Method::Post, "/api/sms/webhook").with_body("From=%2B15551234567&Body=watered+spike"),
        );
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type, XML);
        assert!(resp.body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>"));
        assert!(resp.body.contains("<Message>"));

        let history = state.db.list_user_plants(user_id as i32).unwrap();
        assert_eq!(state.db.recent_care(history[0].id, 5).unwrap().len(), 1);

        let resp = route(&state, &HttpRequest::new(Method::Post, "/api/sms/webhook").with_body("garbage"));
        assert_eq!(resp.body, "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>");
    }

    #[test]
    fn test_sms_test_endpoint() {
        let (_dir, state) = state();
        let (status, json) = call(
            &state,
            Method::Post,
            "/api/sms/test",
            r#"{"from_phone":"+19998887777","message":"help"}"#,
        );
        assert_eq!(status, 200);
        assert_eq!(json["data"]["outcome"]["status"], "user_not_found");
    }

    #[test]
    fn test_options_and_cors() {
        let (_dir, state) = state();
        let resp = route(&state, &HttpRequest::new(Method::Options, "/api/v1/users"));
        assert_eq!(resp.status, 204);

        assert_eq!(
            allowed_origin(&state.config, Some("http://localhost:3000")),
            Some("http://localhost:3000".to_string())
        );
        assert_eq!(allowed_origin(&state.config, Some("http://evil.example")), None);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let (_dir, state) = state();
        let (status, json) = call(&state, Method::Get, "/api/v1/nope", "");
        assert_eq!(status, 404);
        assert_eq!(json["ok"], false);
        let (status, _) = call(&state, Method::Get, "/elsewhere", "");
        assert_eq!(status, 404);
    }
}
