//! Replies to plain text that is not a command

use anyhow::Result;
use dot_config::{Config, ConversationConfig};
use dot_ipc::InboundMessage;
use dot_providers::{ChatMessage, ChatProvider, OpenAiChat};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const GREETINGS: [&str; 4] = [
    "Hey! 👋 What's up?",
    "Hi there! How can I help?",
    "Hello! 😊 What do you need?",
    "Hey hey! What brings you here?",
];

const GREETING_WORDS: [&str; 8] = [
    "hi", "hello", "hey", "sup", "yo", "morning", "evening", "afternoon",
];

const HELP_PHRASES: [&str; 5] = ["help", "menu", "commands", "what can you do", "features"];

pub const HELP_REPLY: &str = "🤖 *What I can do:*

• Chat naturally about anything
• Download videos (TikTok, YouTube, IG, Twitter)
• Help with group management
• Answer questions

Just send me a message or link!";

pub const MEDIA_REPLY: &str =
    "🎬 I see a media link! Download feature coming soon. For now, let's chat about something else?";

pub const ERROR_REPLY: &str = "Hmm, something went wrong 😅 Try again?";

const MEDIA_PATTERN: &str = r"(?i)\b(?:(?:vm\.)?tiktok\.com|youtube\.com|youtu\.be|instagram\.com|twitter\.com|x\.com|facebook\.com)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Ignore,
    Greeting,
    Help,
    MediaLink,
    Chat,
}

pub struct Conversation {
    provider: Option<Arc<dyn ChatProvider>>,
    system_prompt: String,
    min_length: usize,
    reply_cooldown: Duration,
    history_size: usize,
    media_pattern: Regex,
    last_reply: Mutex<HashMap<String, Instant>>,
    history: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
}

fn pick_greeting() -> String {
    GREETINGS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(GREETINGS[0])
        .to_string()
}

fn default_system_prompt(bot_name: &str) -> String {
    format!(
        "You are {}, a smart and friendly assistant chatting on messaging platforms. \
Keep responses concise and natural, like a real person would, with an emoji or two at most.",
        bot_name
    )
}

impl Conversation {
    pub fn new(
        provider: Option<Arc<dyn ChatProvider>>,
        settings: &ConversationConfig,
        bot_name: &str,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            system_prompt: settings
                .system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| default_system_prompt(bot_name)),
            min_length: settings.min_length,
            reply_cooldown: Duration::from_secs(settings.reply_cooldown_secs),
            history_size: settings.history_size,
            media_pattern: Regex::new(MEDIA_PATTERN)?,
            last_reply: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        })
    }

    /// `None` when the fallback is disabled
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if !config.conversation.enabled {
            return Ok(None);
        }
        let provider = config.conversation_provider().map(|p| {
            Arc::new(OpenAiChat::new(
                &p.name,
                &p.api_key,
                p.base_url.as_deref(),
                p.model.as_deref(),
            )) as Arc<dyn ChatProvider>
        });
        Self::new(provider, &config.conversation, &config.bot.name).map(Some)
    }

    pub fn classify(&self, text: &str) -> Intent {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.min_length.max(1) {
            return Intent::Ignore;
        }

        let lower = trimmed.to_lowercase();
        if GREETING_WORDS.iter().any(|g| {
            lower == *g || lower.starts_with(&format!("{} ", g)) || lower.starts_with(&format!("{},", g))
        }) {
            return Intent::Greeting;
        }
        if HELP_PHRASES.iter().any(|h| lower.contains(h)) {
            return Intent::Help;
        }
        if self.media_pattern.is_match(trimmed) {
            return Intent::MediaLink;
        }
        Intent::Chat
    }

    pub async fn respond(&self, message: &InboundMessage) -> Option<String> {
        self.respond_at(message, Instant::now()).await
    }

    pub async fn respond_at(&self, message: &InboundMessage, now: Instant) -> Option<String> {
        let intent = self.classify(&message.body);
        if intent == Intent::Ignore {
            return None;
        }

        {
            let mut last = self.last_reply.lock();
            if let Some(at) = last.get(&message.chat_id) {
                if now.saturating_duration_since(*at) < self.reply_cooldown {
                    debug!(chat = %message.chat_id, "conversation reply suppressed by cooldown");
                    return None;
                }
            }
            last.insert(message.chat_id.clone(), now);
        }

        let reply = match intent {
            Intent::Greeting => pick_greeting(),
            Intent::Help => HELP_REPLY.to_string(),
            Intent::MediaLink => MEDIA_REPLY.to_string(),
            Intent::Chat => self.ask_provider(message).await,
            Intent::Ignore => return None,
        };
        Some(reply)
    }

    async fn ask_provider(&self, message: &InboundMessage) -> String {
        let Some(provider) = &self.provider else {
            warn!("Conversation fallback has no provider configured");
            return ERROR_REPLY.to_string();
        };

        let text = message.body.trim().to_string();
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        if let Some(past) = self.history.lock().get(&message.chat_id) {
            messages.extend(past.iter().cloned());
        }
        messages.push(ChatMessage::user(text.clone()));

        match provider.complete(&messages).await {
            Ok(reply) => {
                self.remember(&message.chat_id, text, reply.clone());
                reply
            }
            Err(e) => {
                warn!(provider = %provider.name(), "Conversation provider failed: {}", e);
                ERROR_REPLY.to_string()
            }
        }
    }

    fn remember(&self, chat_id: &str, user: String, assistant: String) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        let entries = history.entry(chat_id.to_string()).or_default();
        entries.push_back(ChatMessage::user(user));
        entries.push_back(ChatMessage::assistant(assistant));
        while entries.len() > self.history_size {
            entries.pop_front();
        }
    }

    pub fn history_len(&self, chat_id: &str) -> usize {
        self.history.lock().get(chat_id).map_or(0, VecDeque::len)
    }
}
