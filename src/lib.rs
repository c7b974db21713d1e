use anyhow::Result;
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, ReplyParameters},
    utils::{command::BotCommands, html},
};
use thiserror::Error;
use tokio::sync::Mutex;

pub const CONFIG_FILE: &str = "config.json";
pub const DATA_FILE: &str = "data.json";
pub const MESSAGES_FILE: &str = "messages/en.json";

/// Token shipped in the default config; the bot refuses to start with it.
pub const DEFAULT_BOT_TOKEN: &str = "PUT-YOUR-BOT-TOKEN-HERE";
pub const DEFAULT_CHANNEL_LINK: &str = "https://t.me/telegram";
pub const DEFAULT_OWNER_USERNAME: &str = "@telegram";
/// Literal value old config files use for "no group configured yet".
pub const ALLOWED_GROUP_PLACEHOLDER: &str = "GROUP ID DALO";

/// Minimum time between two `/like` commands from the same user.
pub const COOLDOWN: Duration = Duration::from_secs(3);

/// Which group chats may use the bot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedGroup {
    Any,
    Only(i64),
    /// configured but unparsable: nobody is let in
    Invalid(String),
}

impl AllowedGroup {
    /// Interpret the raw `allowed_group_id` value from the config file.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        use serde_json::Value;
        match value {
            None | Some(Value::Null) => AllowedGroup::Any,
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ALLOWED_GROUP_PLACEHOLDER) {
                    AllowedGroup::Any
                } else {
                    match trimmed.parse::<i64>() {
                        Ok(id) => AllowedGroup::Only(id),
                        Err(_) => AllowedGroup::Invalid(s.clone()),
                    }
                }
            }
            Some(Value::Number(n)) => match n.as_i64() {
                Some(id) => AllowedGroup::Only(id),
                None => AllowedGroup::Invalid(n.to_string()),
            },
            Some(other) => AllowedGroup::Invalid(other.to_string()),
        }
    }

    pub fn permits(&self, chat_id: i64) -> bool {
        match self {
            AllowedGroup::Any => true,
            AllowedGroup::Only(id) => *id == chat_id,
            AllowedGroup::Invalid(_) => false,
        }
    }
}

/// Runtime configuration (config file, `BOT_TOKEN` override and reply texts)
#[derive(Clone, Debug)]
pub struct Config {
    pub bot_token: String,
    pub channel_link: String,
    pub owner_username: String,
    pub allowed_group: AllowedGroup,
    pub messages: Messages,
}

pub type SharedConfig = Arc<Config>;

impl Default for Config {
    fn default() -> Self {
        Config {
            bot_token: DEFAULT_BOT_TOKEN.to_string(),
            channel_link: DEFAULT_CHANNEL_LINK.to_string(),
            owner_username: DEFAULT_OWNER_USERNAME.to_string(),
            allowed_group: AllowedGroup::Any,
            messages: default_messages(),
        }
    }
}

impl Config {
    /// `t.me` link for the configured owner, with or without a leading `@`.
    pub fn owner_link(&self) -> String {
        format!("https://t.me/{}", self.owner_username.trim_start_matches('@'))
    }
}

/// Recognized keys of the config file. Every key is optional.
#[derive(Debug, Default)]
struct ConfigFile {
    bot_token: Option<String>,
    channel_link: Option<String>,
    owner_username: Option<String>,
    allowed_group_id: Option<serde_json::Value>,
}

impl ConfigFile {
    /// Take every key on its own, so a mistyped value only loses that key.
    fn from_map(path: &Path, mut map: serde_json::Map<String, serde_json::Value>) -> Self {
        use serde_json::Value;
        let allowed_group_id = map.remove("allowed_group_id");
        let mut text_key = |key: &str| match map.remove(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                tracing::warn!(
                    "{}: {} should be a string, got {}. Using the default.",
                    path.display(),
                    key,
                    other
                );
                None
            }
        };
        ConfigFile {
            bot_token: text_key("bot_token"),
            channel_link: text_key("channel_link"),
            owner_username: text_key("owner_username"),
            allowed_group_id,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Load the config file at `path`, filling gaps from the compiled-in
/// defaults. A missing or unparsable file yields the defaults and a mistyped
/// key falls back on its own. `env_token` (normally `BOT_TOKEN`) wins over
/// whatever token was loaded.
pub fn load_config(path: &Path, env_token: Option<String>) -> Config {
    let file = match fs::read_to_string(path) {
        Ok(s) => match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(serde_json::Value::Object(map)) => ConfigFile::from_map(path, map),
            Ok(_) => {
                tracing::warn!("{} is not a JSON object. Using default configuration.", path.display());
                ConfigFile::default()
            }
            Err(e) => {
                tracing::warn!("failed to parse {}: {}. Using default configuration.", path.display(), e);
                ConfigFile::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("{} not found, using default configuration", path.display());
            ConfigFile::default()
        }
        Err(e) => {
            tracing::warn!("failed to read {}: {}. Using default configuration.", path.display(), e);
            ConfigFile::default()
        }
    };

    let defaults = Config::default();
    let allowed_group = AllowedGroup::from_value(file.allowed_group_id.as_ref());
    if let AllowedGroup::Invalid(raw) = &allowed_group {
        tracing::warn!("allowed_group_id {:?} is not a chat id; every group will be refused", raw);
    }

    Config {
        bot_token: non_empty(env_token)
            .or_else(|| non_empty(file.bot_token))
            .unwrap_or(defaults.bot_token),
        channel_link: non_empty(file.channel_link).unwrap_or(defaults.channel_link),
        owner_username: non_empty(file.owner_username).unwrap_or(defaults.owner_username),
        allowed_group,
        messages: defaults.messages,
    }
}

/// Reply templates, HTML formatted. Loaded from a JSON file with a
/// compiled-in English fallback.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Messages {
    pub group_only: String,
    pub group_not_allowed: String,
    pub start: String,
    pub channel_button: String,
    pub owner_button: String,
    pub register_usage: String,
    pub registered: String,
    pub profile: String,
    pub not_set: String,
    pub like_usage: String,
    pub cooldown: String,
    pub self_like: String,
    pub already_liked: String,
    pub like_added: String,
    pub user_not_found: String,
}

/// Load a Messages struct from a given JSON file path, falling back to defaults
pub fn load_messages_file(path: &str) -> Messages {
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!("failed to parse {}: {}. Falling back to defaults.", path, e);
            default_messages()
        }),
        Err(e) => {
            tracing::warn!("failed to read {}: {}. Falling back to defaults.", path, e);
            default_messages()
        }
    }
}

pub fn default_messages() -> Messages {
    Messages {
        group_only: "This bot only works in group chats.".to_string(),
        group_not_allowed: "The bot is not allowed in this group.".to_string(),
        start: "👑 <b>FF LIKE BOT</b> 👑\n━━━━━━━━━━━━━━━━━━\n\n🙋 User: {user}\n🆔 User ID: <code>{user_id}</code>\n\n👋 Free Fire like bot is active in this group (simulated likes only).\n\n🔹 /register &lt;FF_UID&gt; &lt;FF_NAME&gt; [level]\n🔹 /profile [@username]\n🔹 /like @username".to_string(),
        channel_button: "Channel".to_string(),
        owner_button: "Owner".to_string(),
        register_usage: "Usage: /register &lt;FF_UID&gt; &lt;FF_NAME&gt; [level]".to_string(),
        registered: "✅ Registered {name} (UID {uid}) Level: {level}".to_string(),
        profile: "👤 <b>{user}</b>\n• Game name: <b>{name}</b>\n• Game UID: <code>{uid}</code>\n• Likes: <b>{likes}</b>\n• Level: <b>{level}</b>".to_string(),
        not_set: "(not set)".to_string(),
        like_usage: "Usage: /like @username".to_string(),
        cooldown: "Slow down, your cooldown is still running.".to_string(),
        self_like: "You can't like yourself.".to_string(),
        already_liked: "You have already liked this user.".to_string(),
        like_added: "❤️ Like added for @{target}".to_string(),
        user_not_found: "User not found or not registered.".to_string(),
    }
}

/// Simple template formatter: replace `{key}` with `value` for each pair in `pairs`.
pub fn format_with(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut s = template.to_string();
    for (k, v) in pairs {
        s = s.replace(&format!("{{{}}}", k), v);
    }
    s
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write data file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize data file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("refusing to overwrite unreadable data file {path}")]
    Unreadable { path: PathBuf },
}

/// Identity of the Telegram user issuing a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub id: u64,
    pub username: Option<String>,
    pub first_name: String,
}

/// One user's game profile and like bookkeeping inside a group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub tg_id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub ff_uid: String,
    #[serde(default)]
    pub ff_name: String,
    #[serde(default)]
    pub likes_received: u64,
    #[serde(default, deserialize_with = "deserialize_ids")]
    pub liked_by: BTreeSet<u64>,
    #[serde(default)]
    pub level: Option<u64>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn from_caller(caller: &Caller) -> Self {
        UserRecord {
            tg_id: caller.id,
            username: caller.username.clone().unwrap_or_default(),
            first_name: caller.first_name.clone(),
            ff_uid: String::new(),
            ff_name: String::new(),
            likes_received: 0,
            liked_by: BTreeSet::new(),
            level: None,
            registered_at: Utc::now(),
        }
    }

    /// Case-insensitive match of `needle` (leading `@` ignored) against the
    /// stored username or game name.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.trim_start_matches('@').to_lowercase();
        if needle.is_empty() {
            return false;
        }
        self.username.to_lowercase() == needle || self.ff_name.to_lowercase() == needle
    }

    /// Username if set, otherwise first name.
    pub fn display_name(&self) -> &str {
        if self.username.is_empty() {
            &self.first_name
        } else {
            &self.username
        }
    }

    /// Name used when confirming a like: username, otherwise game name.
    pub fn like_label(&self) -> &str {
        if self.username.is_empty() {
            &self.ff_name
        } else {
            &self.username
        }
    }
}

// liker ids used to be written as JSON strings
fn deserialize_ids<'de, D>(deserializer: D) -> Result<BTreeSet<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    Vec::<RawId>::deserialize(deserializer)?
        .into_iter()
        .map(|id| match id {
            RawId::Number(n) => Ok(n),
            RawId::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        })
        .collect()
}

/// Per-chat state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub chat_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default)]
    pub users: BTreeMap<u64, UserRecord>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl GroupRecord {
    pub fn new(chat_id: i64, title: &str) -> Self {
        GroupRecord {
            chat_id,
            title: title.to_string(),
            owner_id: None,
            users: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// The whole data file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub groups: BTreeMap<i64, GroupRecord>,
}

/// Result of a `/like` attempt against the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LikeOutcome {
    NotFound,
    SelfLike,
    AlreadyLiked,
    Granted { target: String, likes: u64 },
}

/// JSON-file backed store. The full document is kept in memory and written
/// back in full after every mutation.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    doc: StoreDocument,
    /// set when a broken data file could not be moved aside
    write_blocked: bool,
}

/// `<path><suffix>` next to the original file
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl Store {
    /// Load the data file. A missing file starts an empty store; a broken one
    /// is moved aside to `<path>.corrupt-<timestamp>` and replaced by an
    /// empty store. If it cannot be moved aside, every save is refused so the
    /// original is never overwritten.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut write_blocked = false;
        let doc = match fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str::<StoreDocument>(&s) {
                Ok(doc) => {
                    tracing::info!("loaded {} groups from {}", doc.groups.len(), path.display());
                    doc
                }
                Err(e) => {
                    tracing::warn!("failed to parse {}: {}", path.display(), e);
                    write_blocked = !Self::quarantine(&path);
                    StoreDocument::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("{} not found, starting with an empty store", path.display());
                StoreDocument::default()
            }
            Err(e) => {
                tracing::warn!("failed to read {}: {}", path.display(), e);
                write_blocked = !Self::quarantine(&path);
                StoreDocument::default()
            }
        };
        Store {
            path,
            doc,
            write_blocked,
        }
    }

    fn quarantine(path: &Path) -> bool {
        let backup = sibling_path(path, &format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
        match fs::rename(path, &backup) {
            Ok(()) => {
                tracing::warn!("moved unreadable data file to {}", backup.display());
                true
            }
            Err(e) => {
                tracing::error!(
                    "could not move {} aside: {}. Changes will not be saved.",
                    path.display(),
                    e
                );
                false
            }
        }
    }

    pub fn document(&self) -> &StoreDocument {
        &self.doc
    }

    /// Write the whole document as pretty JSON. The data goes to a temp
    /// file first and is renamed over the target.
    pub fn save(&self) -> Result<(), StoreError> {
        if self.write_blocked {
            return Err(StoreError::Unreadable {
                path: self.path.clone(),
            });
        }
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let s = serde_json::to_string_pretty(&self.doc)?;
        let tmp = sibling_path(&self.path, ".tmp");
        fs::write(&tmp, s).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    pub fn group(&self, chat_id: i64) -> Option<&GroupRecord> {
        self.doc.groups.get(&chat_id)
    }

    pub fn user(&self, chat_id: i64, user_id: u64) -> Option<&UserRecord> {
        self.group(chat_id)?.users.get(&user_id)
    }

    /// Return the group record, creating and saving it first if needed.
    pub fn ensure_group(&mut self, chat_id: i64, title: &str) -> Result<&mut GroupRecord, StoreError> {
        if !self.doc.groups.contains_key(&chat_id) {
            self.doc.groups.insert(chat_id, GroupRecord::new(chat_id, title));
            tracing::info!("new group {} ({:?})", chat_id, title);
            self.save()?;
        }
        Ok(self
            .doc
            .groups
            .entry(chat_id)
            .or_insert_with(|| GroupRecord::new(chat_id, title)))
    }

    /// Return the caller's record in this group, creating and saving it (and
    /// the group) first if needed.
    pub fn ensure_user(
        &mut self,
        chat_id: i64,
        title: &str,
        caller: &Caller,
    ) -> Result<&mut UserRecord, StoreError> {
        let group = self.ensure_group(chat_id, title)?;
        if !group.users.contains_key(&caller.id) {
            group.users.insert(caller.id, UserRecord::from_caller(caller));
            tracing::info!("new user {} in group {}", caller.id, chat_id);
            self.save()?;
        }
        let group = self
            .doc
            .groups
            .entry(chat_id)
            .or_insert_with(|| GroupRecord::new(chat_id, title));
        Ok(group
            .users
            .entry(caller.id)
            .or_insert_with(|| UserRecord::from_caller(caller)))
    }

    /// Linear scan of the group's users by username or game name.
    pub fn find_user(&self, chat_id: i64, needle: &str) -> Option<&UserRecord> {
        self.group(chat_id)?.users.values().find(|u| u.matches(needle))
    }

    /// Give `giver_id`'s like to the user matching `needle`. Only a granted
    /// like touches the store.
    pub fn grant_like(
        &mut self,
        chat_id: i64,
        needle: &str,
        giver_id: u64,
    ) -> Result<LikeOutcome, StoreError> {
        let Some(group) = self.doc.groups.get_mut(&chat_id) else {
            return Ok(LikeOutcome::NotFound);
        };
        let Some(target) = group.users.values_mut().find(|u| u.matches(needle)) else {
            return Ok(LikeOutcome::NotFound);
        };
        if target.tg_id == giver_id {
            return Ok(LikeOutcome::SelfLike);
        }
        if !target.liked_by.insert(giver_id) {
            return Ok(LikeOutcome::AlreadyLiked);
        }
        target.likes_received += 1;
        tracing::info!(
            "like: chat={} giver={} target={} likes={}",
            chat_id,
            giver_id,
            target.tg_id,
            target.likes_received
        );
        let outcome = LikeOutcome::Granted {
            target: target.like_label().to_string(),
            likes: target.likes_received,
        };
        self.save()?;
        Ok(outcome)
    }
}

/// Per-user rate limit: last accepted action time for every user seen so far.
#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    last: HashMap<u64, Instant>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        CooldownTracker {
            window,
            last: HashMap::new(),
        }
    }

    pub fn check(&mut self, user_id: u64) -> bool {
        self.check_at(user_id, Instant::now())
    }

    /// True (and `now` recorded) if the user is out of cooldown at `now`.
    pub fn check_at(&mut self, user_id: u64, now: Instant) -> bool {
        if let Some(&last) = self.last.get(&user_id) {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last.insert(user_id, now);
        true
    }
}

/// Shared application state. Both parts sit behind one lock so a command's
/// check-mutate-save sequence is never interleaved with another command.
pub struct AppState {
    pub store: Store,
    pub cooldown: CooldownTracker,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self::with_cooldown(store, COOLDOWN)
    }

    pub fn with_cooldown(store: Store, window: Duration) -> Self {
        AppState {
            store,
            cooldown: CooldownTracker::new(window),
        }
    }
}

pub type SharedState = Arc<Mutex<AppState>>;

/// The chat a command was sent in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatContext {
    pub id: i64,
    pub is_group: bool,
    pub title: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDenied {
    NotGroup,
    GroupNotAllowed,
}

impl AccessDenied {
    pub fn reply<'a>(&self, messages: &'a Messages) -> &'a str {
        match self {
            AccessDenied::NotGroup => &messages.group_only,
            AccessDenied::GroupNotAllowed => &messages.group_not_allowed,
        }
    }
}

/// Commands run only in a group chat that the configuration allows.
pub fn check_access(allowed: &AllowedGroup, chat: &ChatContext) -> Result<(), AccessDenied> {
    if !chat.is_group {
        return Err(AccessDenied::NotGroup);
    }
    if !allowed.permits(chat.id) {
        return Err(AccessDenied::GroupNotAllowed);
    }
    Ok(())
}

#[derive(BotCommands, Clone, Copy, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "show the banner and your user id.")]
    Start,
    #[command(description = "register your game profile: <uid> <name> [level].")]
    Register,
    #[command(description = "show a profile: [@username].")]
    Profile,
    #[command(description = "like a registered user: @username.")]
    Like,
}

/// Split a message into a command and whitespace separated arguments.
/// `/cmd@OtherBot` is ignored when our own username is known.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<(Command, Vec<String>)> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?.strip_prefix('/')?;
    let name = match head.split_once('@') {
        Some((name, mention)) => {
            if let Some(me) = bot_username {
                if !mention.eq_ignore_ascii_case(me) {
                    return None;
                }
            }
            name
        }
        None => head,
    };
    let command = match name.to_lowercase().as_str() {
        "start" => Command::Start,
        "register" => Command::Register,
        "profile" => Command::Profile,
        "like" => Command::Like,
        _ => return None,
    };
    Some((command, parts.map(str::to_string).collect()))
}

/// Everything a handler needs from an incoming message
#[derive(Clone, Debug)]
pub struct Invocation {
    pub chat: ChatContext,
    pub caller: Caller,
    pub args: Vec<String>,
}

/// URL button attached below a reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

/// HTML formatted reply with optional link buttons
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub buttons: Vec<LinkButton>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            buttons: Vec::new(),
        }
    }
}

/// Run one command after the access check and produce the reply.
pub async fn run_command(
    state: &SharedState,
    config: &Config,
    invocation: &Invocation,
    command: Command,
) -> Result<Reply, StoreError> {
    if let Err(denied) = check_access(&config.allowed_group, &invocation.chat) {
        tracing::debug!(
            "refusing {:?} in chat {}: {:?}",
            command,
            invocation.chat.id,
            denied
        );
        return Ok(Reply::text(denied.reply(&config.messages)));
    }
    match command {
        Command::Start => Ok(start_reply(config, &invocation.caller)),
        Command::Register => register(state, config, invocation).await,
        Command::Profile => profile(state, config, invocation).await,
        Command::Like => like(state, config, invocation).await,
    }
}

fn start_reply(config: &Config, caller: &Caller) -> Reply {
    let user = match &caller.username {
        Some(username) => format!("@{}", username),
        None => caller.first_name.clone(),
    };
    let text = format_with(
        &config.messages.start,
        &[
            ("user", &html::escape(&user)),
            ("user_id", &caller.id.to_string()),
        ],
    );
    Reply {
        text,
        buttons: vec![
            LinkButton {
                label: config.messages.channel_button.clone(),
                url: config.channel_link.clone(),
            },
            LinkButton {
                label: config.messages.owner_button.clone(),
                url: config.owner_link(),
            },
        ],
    }
}

/// The level is only taken when it is written as plain digits; anything else
/// leaves it unset. Digits too large for a level are an error.
fn parse_level(arg: Option<&String>) -> Result<Option<u64>, std::num::ParseIntError> {
    match arg {
        Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => s.parse().map(Some),
        _ => Ok(None),
    }
}

async fn register(
    state: &SharedState,
    config: &Config,
    invocation: &Invocation,
) -> Result<Reply, StoreError> {
    let messages = &config.messages;
    let [ff_uid, ff_name, rest @ ..] = invocation.args.as_slice() else {
        return Ok(Reply::text(messages.register_usage.clone()));
    };
    let Ok(level) = parse_level(rest.first()) else {
        return Ok(Reply::text(messages.register_usage.clone()));
    };
    let caller = &invocation.caller;

    let mut lock = state.lock().await;
    let record = lock
        .store
        .ensure_user(invocation.chat.id, &invocation.chat.title, caller)?;
    record.ff_uid = ff_uid.clone();
    record.ff_name = ff_name.clone();
    record.level = level;
    record.username = caller.username.clone().unwrap_or_default();
    record.first_name = caller.first_name.clone();
    lock.store.save()?;
    drop(lock);

    tracing::info!(
        "register: chat={} user={} uid={} name={} level={:?}",
        invocation.chat.id,
        caller.id,
        ff_uid,
        ff_name,
        level
    );
    let level = level.map(|l| l.to_string());
    Ok(Reply::text(format_with(
        &messages.registered,
        &[
            ("name", &html::escape(ff_name)),
            ("uid", &html::escape(ff_uid)),
            ("level", level.as_deref().unwrap_or(&messages.not_set)),
        ],
    )))
}

async fn profile(
    state: &SharedState,
    config: &Config,
    invocation: &Invocation,
) -> Result<Reply, StoreError> {
    let messages = &config.messages;
    let chat = &invocation.chat;

    let mut lock = state.lock().await;
    let found = invocation
        .args
        .first()
        .and_then(|needle| lock.store.find_user(chat.id, needle))
        .cloned();
    let record = match found {
        Some(record) => record,
        None => lock
            .store
            .ensure_user(chat.id, &chat.title, &invocation.caller)?
            .clone(),
    };
    drop(lock);

    let or_not_set = |value: &str| {
        if value.is_empty() {
            messages.not_set.clone()
        } else {
            html::escape(value)
        }
    };
    let level = record.level.map(|l| l.to_string()).unwrap_or_default();
    Ok(Reply::text(format_with(
        &messages.profile,
        &[
            ("user", &or_not_set(record.display_name())),
            ("name", &or_not_set(&record.ff_name)),
            ("uid", &or_not_set(&record.ff_uid)),
            ("likes", &record.likes_received.to_string()),
            ("level", &or_not_set(&level)),
        ],
    )))
}

async fn like(
    state: &SharedState,
    config: &Config,
    invocation: &Invocation,
) -> Result<Reply, StoreError> {
    let messages = &config.messages;
    let Some(needle) = invocation.args.first() else {
        return Ok(Reply::text(messages.like_usage.clone()));
    };
    let giver = invocation.caller.id;

    let mut lock = state.lock().await;
    if !lock.cooldown.check(giver) {
        return Ok(Reply::text(messages.cooldown.clone()));
    }
    let outcome = lock.store.grant_like(invocation.chat.id, needle, giver)?;
    drop(lock);

    let reply = match outcome {
        LikeOutcome::NotFound => messages.user_not_found.clone(),
        LikeOutcome::SelfLike => messages.self_like.clone(),
        LikeOutcome::AlreadyLiked => messages.already_liked.clone(),
        LikeOutcome::Granted { target, .. } => {
            format_with(&messages.like_added, &[("target", &html::escape(&target))])
        }
    };
    Ok(Reply::text(reply))
}

/// Build the handler input from a Telegram message. Messages without a
/// sender (channel posts) yield `None`.
pub fn invocation_from_message(msg: &Message, args: Vec<String>) -> Option<Invocation> {
    let user = msg.from.as_ref()?;
    Some(Invocation {
        chat: ChatContext {
            id: msg.chat.id.0,
            is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
            title: msg.chat.title().unwrap_or_default().to_string(),
        },
        caller: Caller {
            id: user.id.0,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
        },
        args,
    })
}

fn link_button(button: &LinkButton) -> Option<InlineKeyboardButton> {
    match button.url.parse() {
        Ok(url) => Some(InlineKeyboardButton::url(button.label.clone(), url)),
        Err(e) => {
            tracing::warn!("dropping {} button, bad link {:?}: {}", button.label, button.url, e);
            None
        }
    }
}

async fn send_reply(bot: &Bot, msg: &Message, reply: Reply) -> Result<()> {
    let row: Vec<InlineKeyboardButton> = reply.buttons.iter().filter_map(link_button).collect();
    let mut request = bot
        .send_message(msg.chat.id, reply.text)
        .parse_mode(ParseMode::Html)
        .reply_parameters(ReplyParameters::new(msg.id));
    if !row.is_empty() {
        request = request.reply_markup(InlineKeyboardMarkup::new(vec![row]));
    }
    request.await?;
    Ok(())
}

/// Handle an incoming message: parse the command, run it and send the reply.
async fn handle_message(
    bot: &Bot,
    msg: &Message,
    state: SharedState,
    config: SharedConfig,
    bot_username: Option<&str>,
) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some((command, args)) = parse_command(text, bot_username) else {
        return Ok(());
    };
    let Some(invocation) = invocation_from_message(msg, args) else {
        tracing::debug!("ignoring {:?} without a sender in chat {}", command, msg.chat.id.0);
        return Ok(());
    };
    let reply = run_command(&state, &config, &invocation, command).await?;
    send_reply(bot, msg, reply).await
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

/// Run the bot: load config, messages and store, then start polling.
pub async fn run_bot() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv().ok();

    let config_path = env_or("LIKE_BOT_CONFIG", CONFIG_FILE);
    let data_path = env_or("LIKE_BOT_DATA", DATA_FILE);
    let messages_path = env_or("LIKE_BOT_MESSAGES", MESSAGES_FILE);

    let mut cfg = load_config(Path::new(&config_path), env::var("BOT_TOKEN").ok());
    cfg.messages = load_messages_file(&messages_path);
    if cfg.bot_token.trim().is_empty() || cfg.bot_token == DEFAULT_BOT_TOKEN {
        anyhow::bail!(
            "No bot token configured: set BOT_TOKEN or bot_token in {}.",
            config_path
        );
    }
    let shared_config = Arc::new(cfg);

    let state: SharedState = Arc::new(Mutex::new(AppState::new(Store::open(&data_path))));

    let bot = Bot::new(shared_config.bot_token.clone());
    let me = bot.get_me().await?;
    let bot_username = me.user.username.clone();
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        tracing::warn!("failed to register the command list: {}", e);
    }
    tracing::info!(
        "starting as @{} (allowed group: {:?}, data: {})",
        bot_username.as_deref().unwrap_or("?"),
        shared_config.allowed_group,
        data_path
    );

    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let state = state.clone();
        let shared_config = shared_config.clone();
        let bot_username = bot_username.clone();
        async move {
            if let Err(err) =
                handle_message(&bot, &msg, state, shared_config, bot_username.as_deref()).await
            {
                tracing::error!("handler error: {:?}", err);
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
