// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use lambda_http::run as lambda_run;
use quizbot_common::{
    ChatId, Contact, DEFAULT_COMPLETION_MODEL, DEFAULT_COMPLETION_TEMPERATURE, GameKind,
    KeyboardButton, QUIZ_STATS_CATEGORY, QuizTopic, ReplyKeyboard, TELEGRAM_SEND_MAX_CHARS,
    Update, chunk_text, expand_env_vars, extract, extract_quiz,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const GAMES_MENU_LABEL: &str = "Игры 🎲";
const FALLBACK_NOTICE: &str =
    "⚠️ Напиши /start, чтобы начать сначала или выбери команду из меню.";

#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    stats: StatsStore,
    feedback: FeedbackStore,
    sender: Arc<dyn MessageSender>,
    completions: Arc<dyn CompletionGateway>,
    owner_id: Option<String>,
    prompts: Arc<GamePrompts>,
}

/// Per-chat interaction state. One variant per pending expectation, so a
/// chat can never simultaneously await a quiz letter and a game word.
#[derive(Debug, Clone, Default, PartialEq)]
enum SessionState {
    #[default]
    Idle,
    MenuGames,
    AwaitingQuizAnswer {
        expected_answer: String,
    },
    AwaitingGameAnswer {
        kind: GameKind,
        expected_answer: Option<String>,
        raw_question: Option<String>,
    },
    AwaitingFeedback,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Session {
    first_name: Option<String>,
    state: SessionState,
}

#[derive(Clone, Default)]
struct SessionStore {
    inner: Arc<Mutex<HashMap<ChatId, Session>>>,
}

impl SessionStore {
    async fn get(&self, chat_id: &str) -> Session {
        self.inner
            .lock()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn set(&self, chat_id: &str, session: Session) {
        self.inner.lock().await.insert(chat_id.to_string(), session);
    }

    async fn clear(&self, chat_id: &str) {
        self.inner.lock().await.remove(chat_id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StatsEntry {
    played: u64,
    wins: u64,
}

#[derive(Clone, Default)]
struct StatsStore {
    inner: Arc<Mutex<HashMap<ChatId, HashMap<String, StatsEntry>>>>,
}

impl StatsStore {
    async fn record(&self, chat_id: &str, game_name: &str, won: bool) {
        let mut stats = self.inner.lock().await;
        let entry = stats
            .entry(chat_id.to_string())
            .or_default()
            .entry(game_name.to_string())
            .or_default();
        entry.played += 1;
        if won {
            entry.wins += 1;
        }
    }

    async fn snapshot(&self, chat_id: &str) -> HashMap<String, StatsEntry> {
        self.inner
            .lock()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// "The next free-text message from this chat is feedback". Consumed by the
/// very next inbound message regardless of its content.
#[derive(Clone, Default)]
struct FeedbackStore {
    inner: Arc<Mutex<HashSet<ChatId>>>,
}

impl FeedbackStore {
    async fn set(&self, chat_id: &str) {
        self.inner.lock().await.insert(chat_id.to_string());
    }

    async fn consume(&self, chat_id: &str) -> bool {
        self.inner.lock().await.remove(chat_id)
    }
}

#[async_trait]
trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<ReplyKeyboard>,
        parse_mode: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn answer_callback(&self, callback_query_id: &str) -> anyhow::Result<()>;
}

struct TelegramSender {
    client: reqwest::Client,
    api_base_url: String,
    bot_token: String,
    timeout_ms: u64,
}

impl TelegramSender {
    fn from_env(client: reqwest::Client) -> anyhow::Result<Self> {
        let bot_token =
            std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;
        let api_base_url = std::env::var("TELEGRAM_API_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://api.telegram.org".to_string());
        Ok(Self {
            client,
            api_base_url,
            bot_token,
            timeout_ms: parse_env_u64("TELEGRAM_SEND_TIMEOUT_MS", 10000),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base_url, self.bot_token, method)
    }

    async fn post_method(&self, method: &str, payload: &impl Serialize) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.method_url(method))
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(payload)
            .send()
            .await
            .with_context(|| format!("failed to call {method}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "".to_string());
            anyhow::bail!("{} returned {}: {}", method, status, body);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<&'a ReplyKeyboard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<ReplyKeyboard>,
        parse_mode: Option<&str>,
    ) -> anyhow::Result<()> {
        let payload = SendMessagePayload {
            chat_id,
            text,
            reply_markup: reply_markup.as_ref(),
            parse_mode,
        };
        self.post_method("sendMessage", &payload).await
    }

    async fn answer_callback(&self, callback_query_id: &str) -> anyhow::Result<()> {
        self.post_method(
            "answerCallbackQuery",
            &serde_json::json!({ "callback_query_id": callback_query_id }),
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GenerationError {
    MissingApiKey,
    Upstream { detail: String },
}

impl GenerationError {
    fn upstream(detail: impl Into<String>) -> Self {
        Self::Upstream {
            detail: detail.into(),
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "missing_api_key",
            Self::Upstream { .. } => "upstream",
        }
    }
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey => f.write_str("completion api key is not configured"),
            Self::Upstream { detail } => write!(f, "completion upstream failed: {detail}"),
        }
    }
}

impl std::error::Error for GenerationError {}

#[async_trait]
trait CompletionGateway: Send + Sync {
    /// One attempt, no retry; returns the first completion's text verbatim.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

struct OpenRouterGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    timeout_ms: u64,
}

impl OpenRouterGateway {
    fn from_env(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: std::env::var("OPENROUTER_BASE_URL")
                .ok()
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            api_key: normalize_optional_string(std::env::var("OPENROUTER_API_KEY").ok()),
            model: std::env::var("QUIZBOT_MODEL")
                .ok()
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
            temperature: DEFAULT_COMPLETION_TEMPERATURE,
            timeout_ms: parse_env_u64("QUIZBOT_COMPLETION_TIMEOUT_MS", 30000),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [CompletionRequestMessage<'a>; 1],
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct CompletionRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionGateway for OpenRouterGateway {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::MissingApiKey);
        };

        let request = CompletionRequest {
            model: &self.model,
            messages: [CompletionRequestMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&request)
            .send()
            .await
            .map_err(|error| GenerationError::upstream(format!("request failed: {error}")))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            GenerationError::upstream(format!("failed to read response body: {error}"))
        })?;
        if !status.is_success() {
            return Err(GenerationError::upstream(format!("status {status}: {body}")));
        }

        let parsed = serde_json::from_str::<CompletionResponse>(&body).map_err(|error| {
            GenerationError::upstream(format!("invalid completion payload: {error}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| GenerationError::upstream("completion payload missing message content"))
    }
}

#[derive(Debug, Clone)]
struct GamePrompts {
    word_guess: String,
    find_the_lie: String,
    continue_story: String,
    charade: String,
    quiz_template: String,
}

impl GamePrompts {
    fn defaults() -> Self {
        Self {
            word_guess: "Загадай одно существительное (например: тигр, самолёт, лампа и т.д.). \
Опиши его так, чтобы пользователь попытался угадать, что это. Не называй само слово в описании.\n\
Формат:\nОписание: ...\nЗагаданное слово: ..."
                .to_string(),
            find_the_lie: "Придумай три коротких утверждения на любые темы. \
Два из них должны быть правдой, одно - ложью. В конце укажи, какое из них ложь (например: \"Ложь: №2\").\n\
Формат:\n1. ...\n2. ...\n3. ...\nЛожь: №..."
                .to_string(),
            continue_story: "Придумай короткое начало истории и три возможных продолжения. \
Варианты продолжения пронумеруй.\nФормат:\nНачало: ...\n1. ...\n2. ...\n3. ..."
                .to_string(),
            charade: "Придумай одну шараду (загадку), которая состоит из трех частей, \
каждая часть даёт подсказку, чтобы угадать слово. В конце напиши ответ.\n\
Формат:\n1) ...\n2) ...\n3) ...\nОтвет: ..."
                .to_string(),
            quiz_template: "Создай 1 вопрос с 4 вариантами ответа (A, B, C, D) по теме \"{topic}\". \
В конце укажи правильный ответ одной буквой.\n\
Формат:\nВопрос: ...\nA) ...\nB) ...\nC) ...\nD) ...\nПравильный ответ: ..."
                .to_string(),
        }
    }

    fn for_game(&self, kind: GameKind) -> &str {
        match kind {
            GameKind::WordGuess => &self.word_guess,
            GameKind::FindTheLie => &self.find_the_lie,
            GameKind::ContinueStory => &self.continue_story,
            GameKind::Charade => &self.charade,
        }
    }

    fn quiz_prompt(&self, topic: QuizTopic) -> String {
        self.quiz_template.replace("{topic}", topic.menu_label())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GamePromptsFile {
    #[serde(default)]
    word_guess: Option<String>,
    #[serde(default)]
    find_the_lie: Option<String>,
    #[serde(default)]
    continue_story: Option<String>,
    #[serde(default)]
    charade: Option<String>,
    #[serde(default)]
    quiz_template: Option<String>,
}

fn load_game_prompts() -> GamePrompts {
    let mut prompts = GamePrompts::defaults();
    let Some(path) = normalize_optional_string(std::env::var("QUIZBOT_PROMPTS_CONFIG_PATH").ok())
    else {
        return prompts;
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read prompts config path");
            return prompts;
        }
    };

    let expanded = expand_env_vars(&raw);
    let parsed = match serde_yaml::from_str::<GamePromptsFile>(&expanded) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse prompts config yaml");
            return prompts;
        }
    };

    if let Some(value) = normalize_optional_string(parsed.word_guess) {
        prompts.word_guess = value;
    }
    if let Some(value) = normalize_optional_string(parsed.find_the_lie) {
        prompts.find_the_lie = value;
    }
    if let Some(value) = normalize_optional_string(parsed.continue_story) {
        prompts.continue_story = value;
    }
    if let Some(value) = normalize_optional_string(parsed.charade) {
        prompts.charade = value;
    }
    if let Some(value) = normalize_optional_string(parsed.quiz_template) {
        prompts.quiz_template = value;
    }

    info!(path = %path, "loaded prompts config");
    prompts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let client = reqwest::Client::new();
    let state = AppState {
        sessions: SessionStore::default(),
        stats: StatsStore::default(),
        feedback: FeedbackStore::default(),
        sender: Arc::new(TelegramSender::from_env(client.clone())?),
        completions: Arc::new(OpenRouterGateway::from_env(client)),
        owner_id: normalize_optional_string(std::env::var("MY_TELEGRAM_ID").ok()),
        prompts: Arc::new(load_game_prompts()),
    };
    if state.owner_id.is_none() {
        warn!("MY_TELEGRAM_ID is not set; operator relay and /reply are disabled");
    }

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running bot-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("BOT_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "bot-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/telegram", post(telegram_webhook_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn parse_env_u64(var_name: &str, default: u64) -> u64 {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn truncate_log_field(value: Option<&str>, max_chars: usize) -> String {
    let Some(text) = value.map(str::trim).filter(|entry| !entry.is_empty()) else {
        return String::new();
    };

    let mut out = String::new();
    for (idx, ch) in text.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...[truncated]");
            return out;
        }
        out.push(ch);
    }
    out
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "bot-service"}))
}

/// Single webhook entry point. Malformed JSON is the only 400; every other
/// outcome, including dialogue failures, acknowledges with a 200 so the
/// transport never retries or backs off on our internal errors.
async fn telegram_webhook_handler(
    State(state): State<AppState>,
    body: String,
) -> (StatusCode, &'static str) {
    let raw = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(error = %error, "webhook body is not valid json");
            return (StatusCode::BAD_REQUEST, "Bad JSON");
        }
    };

    let update = match serde_json::from_value::<Update>(raw.clone()) {
        Ok(update) => update,
        Err(error) => {
            warn!(error = %error, "webhook json does not look like an update envelope");
            return (StatusCode::OK, "ok");
        }
    };

    if let Err(error) = process_update(&state, &update, &raw).await {
        warn!(
            update_id = update.update_id.unwrap_or_default(),
            error = %format!("{error:#}"),
            "update processing failed"
        );
    }

    (StatusCode::OK, "ok")
}

async fn process_update(
    state: &AppState,
    update: &Update,
    raw: &serde_json::Value,
) -> anyhow::Result<()> {
    info!(
        update_id = update.update_id.unwrap_or_default(),
        "update received"
    );

    let sender_id = update.sender_id();
    let is_owner = match (&sender_id, &state.owner_id) {
        (Some(sender), Some(owner)) => sender == owner,
        _ => false,
    };
    let text = update.text().unwrap_or("");

    if is_owner && is_reply_command(text) {
        if let Some(owner_id) = state.owner_id.as_deref() {
            return handle_owner_reply(state, owner_id, text).await;
        }
    }

    if !is_owner {
        if let Some(owner_id) = state.owner_id.as_deref() {
            relay_update_to_owner(state, owner_id, update.update_id, raw).await;
        }
    }

    if let Some(callback) = update.callback_query.as_ref() {
        if let Err(error) = state.sender.answer_callback(&callback.id).await {
            warn!(
                callback_query_id = %callback.id,
                error = %format!("{error:#}"),
                "callback acknowledgement failed"
            );
        }
    }

    let Some(chat_id) = update.chat_id() else {
        return Ok(());
    };

    if let Some(contact) = update.contact() {
        return handle_contact(state, &chat_id, contact).await;
    }

    process_dialogue(state, &chat_id, text, update.sender_first_name()).await
}

fn is_reply_command(text: &str) -> bool {
    text == "/reply" || text.starts_with("/reply ")
}

async fn handle_owner_reply(state: &AppState, owner_id: &str, text: &str) -> anyhow::Result<()> {
    let mut parts = text.splitn(3, ' ');
    let _command = parts.next();
    let target = parts.next().map(str::trim).filter(|part| !part.is_empty());
    let reply_text = parts.next().map(str::trim).filter(|part| !part.is_empty());

    let (Some(target), Some(reply_text)) = (target, reply_text) else {
        deliver(state, owner_id, "⚠ Формат: /reply <chat_id> <текст>", None).await;
        return Ok(());
    };

    deliver(state, target, reply_text, None).await;
    deliver(
        state,
        owner_id,
        &format!("✅ Сообщение отправлено пользователю {target}"),
        None,
    )
    .await;
    info!(target = %target, "owner reply delivered");
    Ok(())
}

/// Forward the full inbound event to the operator. The payload is chunked by
/// character count so no chunk exceeds the transport's message cap and the
/// concatenation of the chunks is the payload, verbatim.
async fn relay_update_to_owner(
    state: &AppState,
    owner_id: &str,
    update_id: Option<i64>,
    raw: &serde_json::Value,
) {
    let body = serde_json::to_string_pretty(raw).unwrap_or_else(|_| raw.to_string());
    let update_id_display = update_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "—".to_string());
    let header = format!(
        "📡 Новое событие (update_id: {update_id_display}, получено: {})\nСодержимое апдейта (JSON):\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    );
    let payload = header + &body;

    for chunk in chunk_text(&payload, TELEGRAM_SEND_MAX_CHARS) {
        deliver_with_mode(
            state,
            owner_id,
            &format!("```json\n{chunk}\n```"),
            None,
            Some("Markdown"),
        )
        .await;
    }
}

async fn handle_contact(state: &AppState, chat_id: &str, contact: &Contact) -> anyhow::Result<()> {
    deliver(
        state,
        chat_id,
        &format!("✅ Спасибо! Я получил твой номер: +{}", contact.phone_number),
        None,
    )
    .await;

    if let Some(owner_id) = state.owner_id.as_deref() {
        let summary = format!(
            "📞 Новый контакт:\nИмя: {}\nТелефон: +{}\nID: {}",
            contact.first_name.as_deref().unwrap_or("—"),
            contact.phone_number,
            contact
                .user_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "—".to_string()),
        );
        deliver(state, owner_id, &summary, None).await;
    }
    Ok(())
}

async fn process_dialogue(
    state: &AppState,
    chat_id: &str,
    text: &str,
    first_name: Option<&str>,
) -> anyhow::Result<()> {
    let text = text.trim();

    if text == "/start" {
        // Reset also discards a pending feedback expectation.
        let _ = state.feedback.consume(chat_id).await;
        state
            .sessions
            .set(
                chat_id,
                Session {
                    first_name: first_name.map(str::to_string),
                    state: SessionState::Idle,
                },
            )
            .await;
        let greeting = format!(
            "👋 Привет, {}! Выбери тему для теста или игру:",
            first_name.unwrap_or("друг")
        );
        deliver(state, chat_id, &greeting, Some(main_keyboard())).await;
        return Ok(());
    }

    if state.feedback.consume(chat_id).await {
        return handle_feedback_text(state, chat_id, text).await;
    }

    if text == "/feedback" {
        state.feedback.set(chat_id).await;
        let mut session = state.sessions.get(chat_id).await;
        session.state = SessionState::AwaitingFeedback;
        state.sessions.set(chat_id, session).await;
        deliver(state, chat_id, "✍️ Напиши свой отзыв одним сообщением:", None).await;
        return Ok(());
    }

    if text == "/stats" {
        let snapshot = state.stats.snapshot(chat_id).await;
        deliver(state, chat_id, &render_stats(&snapshot), None).await;
        return Ok(());
    }

    let session = state.sessions.get(chat_id).await;
    match session.state.clone() {
        SessionState::AwaitingQuizAnswer { expected_answer } => {
            check_quiz_answer(state, chat_id, text, &expected_answer).await;
            Ok(())
        }
        SessionState::AwaitingGameAnswer {
            kind,
            expected_answer,
            raw_question,
        } => {
            check_game_answer(
                state,
                chat_id,
                text,
                kind,
                expected_answer.as_deref(),
                raw_question.as_deref(),
            )
            .await;
            Ok(())
        }
        SessionState::AwaitingFeedback => handle_feedback_text(state, chat_id, text).await,
        SessionState::Idle | SessionState::MenuGames => {
            handle_menu_input(state, chat_id, text, session).await
        }
    }
}

async fn handle_feedback_text(state: &AppState, chat_id: &str, text: &str) -> anyhow::Result<()> {
    let mut session = state.sessions.get(chat_id).await;
    let author = session
        .first_name
        .clone()
        .unwrap_or_else(|| "аноним".to_string());
    session.state = SessionState::Idle;
    state.sessions.set(chat_id, session).await;

    if let Some(owner_id) = state.owner_id.as_deref() {
        deliver(
            state,
            owner_id,
            &format!("💬 Отзыв от {author} (chat {chat_id}):\n\n{text}"),
            None,
        )
        .await;
    } else {
        warn!(chat_id = %chat_id, "feedback received but no operator is configured");
    }
    deliver(state, chat_id, "✅ Спасибо за отзыв!", None).await;
    Ok(())
}

async fn handle_menu_input(
    state: &AppState,
    chat_id: &str,
    text: &str,
    mut session: Session,
) -> anyhow::Result<()> {
    if text == GAMES_MENU_LABEL {
        session.state = SessionState::MenuGames;
        state.sessions.set(chat_id, session).await;
        deliver(state, chat_id, "Выбери игру:", Some(games_keyboard())).await;
        return Ok(());
    }

    if let Some(kind) = GameKind::from_menu_label(text) {
        return start_game(state, chat_id, session, kind).await;
    }

    // Topic quizzes are started from the main menu only.
    if session.state == SessionState::Idle {
        if let Some(topic) = QuizTopic::from_menu_label(text) {
            return start_quiz(state, chat_id, session, topic).await;
        }
    }

    deliver(state, chat_id, FALLBACK_NOTICE, None).await;
    Ok(())
}

async fn start_game(
    state: &AppState,
    chat_id: &str,
    session: Session,
    kind: GameKind,
) -> anyhow::Result<()> {
    let generated = match state.completions.generate(state.prompts.for_game(kind)).await {
        Ok(generated) => generated,
        Err(error) => {
            warn!(
                chat_id = %chat_id,
                game = kind.menu_label(),
                error_kind = error.kind_str(),
                error = %error,
                "game generation failed"
            );
            deliver(state, chat_id, generation_retry_notice(kind), None).await;
            return Ok(());
        }
    };

    let extraction = match extract(kind, &generated) {
        Ok(extraction) => extraction,
        Err(error) => {
            warn!(
                chat_id = %chat_id,
                game = kind.menu_label(),
                reason = error.as_str(),
                "generated text is missing the answer marker"
            );
            deliver(state, chat_id, generation_retry_notice(kind), None).await;
            return Ok(());
        }
    };

    let raw_question = (kind == GameKind::ContinueStory).then(|| generated.clone());
    state
        .sessions
        .set(
            chat_id,
            Session {
                first_name: session.first_name,
                state: SessionState::AwaitingGameAnswer {
                    kind,
                    expected_answer: extraction.expected_answer.clone(),
                    raw_question,
                },
            },
        )
        .await;

    deliver(
        state,
        chat_id,
        &game_question_message(kind, &extraction.display_text),
        None,
    )
    .await;
    Ok(())
}

async fn start_quiz(
    state: &AppState,
    chat_id: &str,
    session: Session,
    topic: QuizTopic,
) -> anyhow::Result<()> {
    const QUIZ_RETRY_NOTICE: &str = "⚠️ Не удалось сгенерировать вопрос. Попробуй ещё.";

    let prompt = state.prompts.quiz_prompt(topic);
    let generated = match state.completions.generate(&prompt).await {
        Ok(generated) => generated,
        Err(error) => {
            warn!(
                chat_id = %chat_id,
                topic = topic.menu_label(),
                error_kind = error.kind_str(),
                error = %error,
                "quiz generation failed"
            );
            deliver(state, chat_id, QUIZ_RETRY_NOTICE, None).await;
            return Ok(());
        }
    };

    let extraction = match extract_quiz(&generated) {
        Ok(extraction) => extraction,
        Err(error) => {
            warn!(
                chat_id = %chat_id,
                topic = topic.menu_label(),
                reason = error.as_str(),
                "generated quiz is missing the answer marker"
            );
            deliver(state, chat_id, QUIZ_RETRY_NOTICE, None).await;
            return Ok(());
        }
    };

    let Some(expected_answer) = extraction.expected_answer.clone() else {
        deliver(state, chat_id, QUIZ_RETRY_NOTICE, None).await;
        return Ok(());
    };

    state
        .sessions
        .set(
            chat_id,
            Session {
                first_name: session.first_name,
                state: SessionState::AwaitingQuizAnswer { expected_answer },
            },
        )
        .await;

    deliver(
        state,
        chat_id,
        &format!(
            "📚 Вопрос по теме {}:\n\n{}",
            topic.menu_label(),
            extraction.display_text
        ),
        None,
    )
    .await;
    Ok(())
}

async fn check_quiz_answer(state: &AppState, chat_id: &str, text: &str, expected_answer: &str) {
    let won = text.trim().to_uppercase() == expected_answer;
    state.stats.record(chat_id, QUIZ_STATS_CATEGORY, won).await;
    state.sessions.clear(chat_id).await;
    info!(chat_id = %chat_id, won, "quiz answer checked");

    let message = if won {
        "🎉 Правильно!".to_string()
    } else {
        format!("❌ Неправильно. Правильный ответ: {expected_answer}.")
    };
    deliver(state, chat_id, &message, Some(replay_keyboard())).await;
}

async fn check_game_answer(
    state: &AppState,
    chat_id: &str,
    text: &str,
    kind: GameKind,
    expected_answer: Option<&str>,
    raw_question: Option<&str>,
) {
    let won = match kind {
        GameKind::ContinueStory => matches!(text.trim(), "1" | "2" | "3"),
        GameKind::FindTheLie => expected_answer == Some(text.trim()),
        GameKind::WordGuess | GameKind::Charade => expected_answer
            .map(|answer| answer == text.trim().to_uppercase())
            .unwrap_or(false),
    };
    state.stats.record(chat_id, kind.menu_label(), won).await;
    state.sessions.clear(chat_id).await;
    info!(
        chat_id = %chat_id,
        game = kind.menu_label(),
        won,
        stored_generation = %truncate_log_field(raw_question, 400),
        "game answer checked"
    );

    let message = if won {
        game_win_message(kind).to_string()
    } else {
        game_lose_message(kind, expected_answer)
    };
    deliver(state, chat_id, &message, Some(replay_keyboard())).await;
}

fn render_stats(snapshot: &HashMap<String, StatsEntry>) -> String {
    if snapshot.is_empty() {
        return "Ты ещё не сыграл ни одной игры.".to_string();
    }

    let mut games: Vec<_> = snapshot.iter().collect();
    games.sort_by(|(left, _), (right, _)| left.cmp(right));

    let mut out = String::from("📊 Твоя статистика:");
    for (game, entry) in games {
        out.push_str(&format!(
            "\n🎮 {game}: сыграно {}, побед {}",
            entry.played, entry.wins
        ));
    }
    out
}

fn game_question_message(kind: GameKind, display_text: &str) -> String {
    match kind {
        GameKind::WordGuess => format!("🧠 Угадай слово:\n\n{display_text}"),
        GameKind::FindTheLie => {
            format!("🕵️ Найди ложь:\n\n{display_text}\n\nОтвет введи цифрой (1, 2 или 3).")
        }
        GameKind::ContinueStory => format!(
            "📖 Продолжи историю:\n\n{display_text}\n\nВыбери номер продолжения (1, 2 или 3)."
        ),
        GameKind::Charade => format!("🧩 Шарада:\n\n{display_text}\n\nНапиши свой ответ."),
    }
}

fn game_win_message(kind: GameKind) -> &'static str {
    match kind {
        GameKind::WordGuess => "🎉 Правильно! Хочешь сыграть ещё?",
        GameKind::FindTheLie => "🎉 Верно! Ты нашёл ложь!",
        GameKind::ContinueStory => "🎉 Классное продолжение!",
        GameKind::Charade => "🎉 Молодец! Правильно угадал!",
    }
}

fn game_lose_message(kind: GameKind, expected_answer: Option<&str>) -> String {
    match (kind, expected_answer) {
        (GameKind::WordGuess, Some(answer)) => {
            format!("❌ Неправильно. Было загадано: {answer}\nПопробуешь ещё?")
        }
        (GameKind::FindTheLie, Some(number)) => {
            format!("❌ Нет, ложь была под номером {number}. Попробуешь ещё?")
        }
        (GameKind::Charade, Some(answer)) => {
            format!("❌ Неправильно. Правильный ответ: {answer}. Попробуешь ещё?")
        }
        _ => "❌ Не похоже на вариант из списка.".to_string(),
    }
}

fn generation_retry_notice(kind: GameKind) -> &'static str {
    match kind {
        GameKind::WordGuess => "⚠️ Не удалось сгенерировать описание. Попробуй ещё.",
        GameKind::FindTheLie => "⚠️ Не удалось сгенерировать утверждения. Попробуй ещё.",
        GameKind::ContinueStory => "⚠️ Не удалось сгенерировать историю. Попробуй ещё.",
        GameKind::Charade => "⚠️ Не удалось сгенерировать шараду. Попробуй ещё.",
    }
}

fn main_keyboard() -> ReplyKeyboard {
    ReplyKeyboard::from_rows(vec![
        vec![
            KeyboardButton::new(QuizTopic::History.menu_label()),
            KeyboardButton::new(QuizTopic::Math.menu_label()),
        ],
        vec![
            KeyboardButton::new(QuizTopic::English.menu_label()),
            KeyboardButton::new(GAMES_MENU_LABEL),
        ],
        vec![
            KeyboardButton::new("/feedback"),
            KeyboardButton::contact_request("📤 Поделиться контактом"),
        ],
    ])
}

fn games_keyboard() -> ReplyKeyboard {
    ReplyKeyboard::from_rows(vec![
        vec![
            KeyboardButton::new(GameKind::WordGuess.menu_label()),
            KeyboardButton::new(GameKind::FindTheLie.menu_label()),
        ],
        vec![
            KeyboardButton::new(GameKind::ContinueStory.menu_label()),
            KeyboardButton::new(GameKind::Charade.menu_label()),
        ],
        vec![
            KeyboardButton::new("/start"),
            KeyboardButton::new("/stats"),
        ],
    ])
}

fn replay_keyboard() -> ReplyKeyboard {
    ReplyKeyboard::from_rows(vec![
        vec![KeyboardButton::new(GAMES_MENU_LABEL)],
        vec![KeyboardButton::new("/start")],
    ])
}

async fn deliver(state: &AppState, chat_id: &str, text: &str, reply_markup: Option<ReplyKeyboard>) {
    deliver_with_mode(state, chat_id, text, reply_markup, None).await;
}

/// Outbound sends are non-critical: a failure is logged with the chat it was
/// addressed to and never surfaced to the user or the inbound request.
async fn deliver_with_mode(
    state: &AppState,
    chat_id: &str,
    text: &str,
    reply_markup: Option<ReplyKeyboard>,
    parse_mode: Option<&str>,
) {
    if let Err(error) = state
        .sender
        .send_message(chat_id, text, reply_markup, parse_mode)
        .await
    {
        warn!(
            chat_id = %chat_id,
            error = %format!("{error:#}"),
            "outbound message delivery failed"
        );
    }
}
