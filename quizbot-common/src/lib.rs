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

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The transport caps one message at ~4096 characters; chunks stay below
/// that so the code-fence wrapper added by the relay still fits.
pub const TELEGRAM_SEND_MAX_CHARS: usize = 3900;

pub const DEFAULT_COMPLETION_MODEL: &str = "openai/gpt-3.5-turbo";
pub const DEFAULT_COMPLETION_TEMPERATURE: f32 = 0.7;

/// Stats category for quiz outcomes regardless of topic.
pub const QUIZ_STATS_CATEGORY: &str = "Викторина";

pub type ChatId = String;

/// All mini-games in menu order.
pub const ALL_GAME_KINDS: [GameKind; 4] = [
    GameKind::WordGuess,
    GameKind::FindTheLie,
    GameKind::ContinueStory,
    GameKind::Charade,
];

pub const ALL_QUIZ_TOPICS: [QuizTopic; 3] =
    [QuizTopic::History, QuizTopic::Math, QuizTopic::English];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    WordGuess,
    FindTheLie,
    ContinueStory,
    Charade,
}

impl GameKind {
    /// The keyboard label; also the key the stats store uses for the game.
    pub fn menu_label(self) -> &'static str {
        match self {
            Self::WordGuess => "Угадай слово",
            Self::FindTheLie => "Найди ложь",
            Self::ContinueStory => "Продолжи историю",
            Self::Charade => "Шарада",
        }
    }

    pub fn from_menu_label(text: &str) -> Option<Self> {
        let text = text.trim();
        ALL_GAME_KINDS
            .iter()
            .copied()
            .find(|kind| kind.menu_label() == text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuizTopic {
    History,
    Math,
    English,
}

impl QuizTopic {
    pub fn menu_label(self) -> &'static str {
        match self {
            Self::History => "История",
            Self::Math => "Математика",
            Self::English => "Английский",
        }
    }

    pub fn from_menu_label(text: &str) -> Option<Self> {
        let text = text.trim();
        ALL_QUIZ_TOPICS
            .iter()
            .copied()
            .find(|topic| topic.menu_label() == text)
    }
}

/// Inbound webhook envelope. Every event shape is optional; exactly one is
/// populated per update, so the accessors below coalesce in the transport's
/// documented order (message, edited message, callback press, inline query).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub edited_message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub inline_query: Option<InlineQuery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub chat: Option<ChatRef>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRef {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub phone_number: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub query: Option<String>,
}

impl Update {
    pub fn sender(&self) -> Option<&User> {
        self.message
            .as_ref()
            .and_then(|message| message.from.as_ref())
            .or_else(|| {
                self.edited_message
                    .as_ref()
                    .and_then(|message| message.from.as_ref())
            })
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|callback| callback.from.as_ref())
            })
            .or_else(|| {
                self.inline_query
                    .as_ref()
                    .and_then(|inline| inline.from.as_ref())
            })
    }

    pub fn sender_id(&self) -> Option<String> {
        self.sender().map(|user| user.id.to_string())
    }

    pub fn sender_first_name(&self) -> Option<&str> {
        self.sender().and_then(|user| user.first_name.as_deref())
    }

    /// Chat the reply should go to. Inline queries carry no chat, which is
    /// why this is separate from `sender_id`.
    pub fn chat_id(&self) -> Option<String> {
        self.message
            .as_ref()
            .and_then(|message| message.chat.as_ref())
            .or_else(|| {
                self.edited_message
                    .as_ref()
                    .and_then(|message| message.chat.as_ref())
            })
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|callback| callback.message.as_ref())
                    .and_then(|message| message.chat.as_ref())
            })
            .map(|chat| chat.id.to_string())
    }

    /// Free text of the update: message text, edited text, button callback
    /// data, or the inline query string.
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|message| message.text.as_deref())
            .or_else(|| {
                self.edited_message
                    .as_ref()
                    .and_then(|message| message.text.as_deref())
            })
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|callback| callback.data.as_deref())
            })
            .or_else(|| {
                self.inline_query
                    .as_ref()
                    .and_then(|inline| inline.query.as_deref())
            })
    }

    pub fn contact(&self) -> Option<&Contact> {
        self.message
            .as_ref()
            .and_then(|message| message.contact.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyKeyboard {
    pub keyboard: Vec<Vec<KeyboardButton>>,
    pub resize_keyboard: bool,
}

impl ReplyKeyboard {
    pub fn from_rows(rows: Vec<Vec<KeyboardButton>>) -> Self {
        Self {
            keyboard: rows,
            resize_keyboard: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_contact: Option<bool>,
}

impl KeyboardButton {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            request_contact: None,
        }
    }

    pub fn contact_request(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            request_contact: Some(true),
        }
    }
}

/// Result of parsing one generation: the text shown to the user and the
/// normalized token their answer is checked against (`None` for games with
/// no single correct answer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub display_text: String,
    pub expected_answer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionError {
    MissingAnswerMarker,
}

impl ExtractionError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingAnswerMarker => "missing_answer_marker",
        }
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ExtractionError {}

#[derive(Debug, Clone, Copy)]
enum AnswerPattern {
    /// Rest of the marker line, trimmed and uppercased.
    RestOfLine,
    /// A digit 1-3, optionally prefixed with a number sign.
    LieNumber,
    /// A single letter A-D, uppercased.
    AnswerLetter,
    /// The marker only confirms the generation shape; no answer token.
    MarkerOnly,
}

struct MarkerSpec {
    labels: &'static [&'static str],
    pattern: AnswerPattern,
    strip_marker_line: bool,
    lead_in: Option<&'static str>,
}

// The generation model does not guarantee literal phrasing, so each row
// lists the label variants seen in practice. Adding a game means adding a
// row here plus a `GameKind` variant.
static WORD_GUESS_MARKER: MarkerSpec = MarkerSpec {
    labels: &["загаданное слово", "слово", "ответ"],
    pattern: AnswerPattern::RestOfLine,
    strip_marker_line: true,
    lead_in: Some("описание"),
};

static FIND_THE_LIE_MARKER: MarkerSpec = MarkerSpec {
    labels: &["ложь", "неправда"],
    pattern: AnswerPattern::LieNumber,
    strip_marker_line: true,
    lead_in: None,
};

static CONTINUE_STORY_MARKER: MarkerSpec = MarkerSpec {
    labels: &["начало", "история"],
    pattern: AnswerPattern::MarkerOnly,
    strip_marker_line: false,
    lead_in: None,
};

static CHARADE_MARKER: MarkerSpec = MarkerSpec {
    labels: &["ответ", "отгадка"],
    pattern: AnswerPattern::RestOfLine,
    strip_marker_line: true,
    lead_in: None,
};

static QUIZ_MARKER: MarkerSpec = MarkerSpec {
    labels: &["правильный ответ", "верный ответ", "ответ"],
    pattern: AnswerPattern::AnswerLetter,
    strip_marker_line: true,
    lead_in: Some("вопрос"),
};

fn marker_spec(kind: GameKind) -> &'static MarkerSpec {
    match kind {
        GameKind::WordGuess => &WORD_GUESS_MARKER,
        GameKind::FindTheLie => &FIND_THE_LIE_MARKER,
        GameKind::ContinueStory => &CONTINUE_STORY_MARKER,
        GameKind::Charade => &CHARADE_MARKER,
    }
}

fn marker_regex(spec: &MarkerSpec) -> Regex {
    let labels = spec.labels.join("|");
    let value = match spec.pattern {
        AnswerPattern::RestOfLine => r"(\S.*)",
        AnswerPattern::LieNumber => r"№?\s*([1-3])\b",
        AnswerPattern::AnswerLetter => r"([a-dA-D])\b",
        AnswerPattern::MarkerOnly => "",
    };
    Regex::new(&format!(r"(?i)\b(?:{labels})\s*[:\-]\s*{value}")).unwrap()
}

/// Parse a mini-game generation into display text and the expected answer.
///
/// Pure function of its input: the first line matching the game's marker
/// wins, the marker line is stripped from the display text (the
/// continue-story probe keeps the full text since the numbered
/// continuations are part of what the user must see).
pub fn extract(kind: GameKind, raw: &str) -> Result<Extraction, ExtractionError> {
    run_extraction(marker_spec(kind), raw)
}

/// Parse a topic-quiz generation; the answer is a single letter A-D.
pub fn extract_quiz(raw: &str) -> Result<Extraction, ExtractionError> {
    run_extraction(&QUIZ_MARKER, raw)
}

fn run_extraction(spec: &MarkerSpec, raw: &str) -> Result<Extraction, ExtractionError> {
    let re = marker_regex(spec);

    let mut marker_idx = None;
    let mut captured = None;
    for (idx, line) in raw.lines().enumerate() {
        if let Some(caps) = re.captures(line) {
            marker_idx = Some(idx);
            captured = caps.get(1).map(|m| m.as_str().trim().to_string());
            break;
        }
    }
    let Some(marker_idx) = marker_idx else {
        return Err(ExtractionError::MissingAnswerMarker);
    };

    let expected_answer = match spec.pattern {
        AnswerPattern::MarkerOnly => None,
        AnswerPattern::LieNumber => Some(captured.ok_or(ExtractionError::MissingAnswerMarker)?),
        AnswerPattern::RestOfLine | AnswerPattern::AnswerLetter => Some(
            captured
                .ok_or(ExtractionError::MissingAnswerMarker)?
                .to_uppercase(),
        ),
    };

    let display_text = if spec.strip_marker_line {
        let kept = raw
            .lines()
            .enumerate()
            .filter(|(idx, _)| *idx != marker_idx)
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n");
        strip_lead_in(&kept, spec.lead_in)
    } else {
        raw.trim().to_string()
    };

    Ok(Extraction {
        display_text,
        expected_answer,
    })
}

fn strip_lead_in(text: &str, lead_in: Option<&str>) -> String {
    let trimmed = text.trim();
    let Some(label) = lead_in else {
        return trimmed.to_string();
    };
    let re = Regex::new(&format!(r"(?i)^(?:{label})\s*[:\-]\s*")).unwrap();
    re.replace(trimmed, "").trim().to_string()
}

/// Split `input` into chunks of at most `max_chars` characters. Splitting
/// counts characters, never bytes, so multi-byte text stays intact;
/// concatenating the chunks reconstructs the input exactly.
pub fn chunk_text(input: &str, max_chars: usize) -> Vec<String> {
    if input.is_empty() || max_chars == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in input.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    chunks.push(current);
    chunks
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment
/// variables. Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_guess_extraction_finds_hidden_word() {
        let raw = "Описание: Большая полосатая кошка, живёт в Азии.\nЗагаданное слово: тигр";
        let extraction = extract(GameKind::WordGuess, raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("ТИГР"));
        assert_eq!(
            extraction.display_text,
            "Большая полосатая кошка, живёт в Азии."
        );
    }

    #[test]
    fn word_guess_extraction_accepts_label_variants_and_dash_separator() {
        let raw = "Этот предмет летает.\nСлово - самолёт";
        let extraction = extract(GameKind::WordGuess, raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("САМОЛЁТ"));
        assert_eq!(extraction.display_text, "Этот предмет летает.");
    }

    #[test]
    fn word_guess_extraction_ignores_label_inside_longer_word() {
        // "ответить" must not count as an answer marker.
        let raw = "Попробуй ответить на вопрос без подсказок.";
        assert_eq!(
            extract(GameKind::WordGuess, raw),
            Err(ExtractionError::MissingAnswerMarker)
        );
    }

    #[test]
    fn find_the_lie_extraction_reads_number_with_and_without_sign() {
        let raw = "1. Киты - рыбы.\n2. Мёд не портится.\n3. У осьминога три сердца.\nЛожь: №1";
        let extraction = extract(GameKind::FindTheLie, raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("1"));
        assert!(!extraction.display_text.contains("Ложь"));

        let bare = "1. a\n2. b\n3. c\nНеправда: 3";
        let extraction = extract(GameKind::FindTheLie, bare).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("3"));
    }

    #[test]
    fn find_the_lie_extraction_rejects_out_of_range_number() {
        let raw = "1. a\n2. b\n3. c\nЛожь: №4";
        assert_eq!(
            extract(GameKind::FindTheLie, raw),
            Err(ExtractionError::MissingAnswerMarker)
        );
    }

    #[test]
    fn continue_story_extraction_keeps_full_text_and_has_no_answer() {
        let raw = "Начало: Поезд остановился в пустыне.\n1. Все вышли.\n2. Свет погас.\n3. Кто-то постучал.";
        let extraction = extract(GameKind::ContinueStory, raw).unwrap();
        assert_eq!(extraction.expected_answer, None);
        assert_eq!(extraction.display_text, raw);
    }

    #[test]
    fn charade_extraction_uppercases_answer() {
        let raw = "1) Первая часть - нота.\n2) Вторая часть - мера.\n3) Целое - город.\nОтгадка: доминика";
        let extraction = extract(GameKind::Charade, raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("ДОМИНИКА"));
        assert!(!extraction.display_text.contains("Отгадка"));
    }

    #[test]
    fn quiz_extraction_normalizes_letter_and_strips_marker_line() {
        let raw = "Вопрос: Когда началась Вторая мировая война?\nA) 1914\nB) 1939\nC) 1941\nD) 1945\nПравильный ответ: b";
        let extraction = extract_quiz(raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("B"));
        assert!(extraction.display_text.starts_with("Когда началась"));
        assert!(!extraction.display_text.contains("Правильный ответ"));
    }

    #[test]
    fn quiz_extraction_accepts_bare_answer_label() {
        let raw = "2+2?\nA) 3\nB) 4\nОтвет: B";
        let extraction = extract_quiz(raw).unwrap();
        assert_eq!(extraction.expected_answer.as_deref(), Some("B"));
    }

    #[test]
    fn extraction_fails_without_marker() {
        assert_eq!(
            extract(GameKind::WordGuess, "Просто описание без маркера."),
            Err(ExtractionError::MissingAnswerMarker)
        );
        assert_eq!(
            extract_quiz("Вопрос без ответа.\nA) x\nB) y"),
            Err(ExtractionError::MissingAnswerMarker)
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        let raw = "Описание: круглый и красный.\nЗагаданное слово: помидор";
        let first = extract(GameKind::WordGuess, raw).unwrap();
        let second = extract(GameKind::WordGuess, raw).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_text_reconstructs_input_within_bounds() {
        let input = "я".repeat(25) + &"x".repeat(17);
        let chunks = chunk_text(&input, 10);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks.concat(), input);
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn chunk_text_passes_short_input_through() {
        assert_eq!(chunk_text("привет", 100), vec!["привет".to_string()]);
        assert!(chunk_text("", 100).is_empty());
    }

    #[test]
    fn update_accessors_coalesce_event_shapes() {
        let message_update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 10,
            "message": {
                "from": {"id": 7, "first_name": "Аня"},
                "chat": {"id": 42},
                "text": "/start"
            }
        }))
        .unwrap();
        assert_eq!(message_update.sender_id().as_deref(), Some("7"));
        assert_eq!(message_update.sender_first_name(), Some("Аня"));
        assert_eq!(message_update.chat_id().as_deref(), Some("42"));
        assert_eq!(message_update.text(), Some("/start"));

        let callback_update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 11,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 8, "first_name": "Боря"},
                "message": {"chat": {"id": 43}},
                "data": "Шарада"
            }
        }))
        .unwrap();
        assert_eq!(callback_update.sender_id().as_deref(), Some("8"));
        assert_eq!(callback_update.chat_id().as_deref(), Some("43"));
        assert_eq!(callback_update.text(), Some("Шарада"));

        let inline_update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 12,
            "inline_query": {"id": "q-1", "from": {"id": 9}, "query": "история"}
        }))
        .unwrap();
        assert_eq!(inline_update.sender_id().as_deref(), Some("9"));
        assert_eq!(inline_update.chat_id(), None);
        assert_eq!(inline_update.text(), Some("история"));
    }

    #[test]
    fn keyboard_serialization_skips_unset_contact_flag() {
        let keyboard = ReplyKeyboard::from_rows(vec![vec![
            KeyboardButton::new("Игры 🎲"),
            KeyboardButton::contact_request("📤 Поделиться контактом"),
        ]]);
        let value = serde_json::to_value(&keyboard).unwrap();
        assert_eq!(value["resize_keyboard"], true);
        assert_eq!(value["keyboard"][0][0], serde_json::json!({"text": "Игры 🎲"}));
        assert_eq!(value["keyboard"][0][1]["request_contact"], true);
    }

    #[test]
    fn menu_labels_round_trip() {
        for kind in ALL_GAME_KINDS {
            assert_eq!(GameKind::from_menu_label(kind.menu_label()), Some(kind));
        }
        for topic in ALL_QUIZ_TOPICS {
            assert_eq!(QuizTopic::from_menu_label(topic.menu_label()), Some(topic));
        }
        assert_eq!(GameKind::from_menu_label("что-то ещё"), None);
    }

    #[test]
    fn expand_env_vars_replaces_known_and_drops_unknown() {
        unsafe { std::env::set_var("QUIZBOT_TEST_VAR", "value-1") };
        let expanded = expand_env_vars("a=${QUIZBOT_TEST_VAR} b=${QUIZBOT_TEST_MISSING}");
        assert_eq!(expanded, "a=value-1 b=");
    }
}
