use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::thread::sleep;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::{BatchConfig, DEFAULT_USER_AGENT};
use crate::namespace::NS_MAIN;
use crate::store::PageRef;

const BOT_GROUP: &str = "bot";
const EDITOR_HISTORY_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

/// Read side of the wiki. Titles are full titles including the namespace prefix.
pub trait WikiReadApi {
    fn page_id(&mut self, title: &str) -> Result<Option<i64>>;
    fn get_text(&mut self, title: &str) -> Result<Option<String>>;
    fn members_of(&mut self, category: &str) -> Result<Vec<PageRef>>;
    fn transclusions_of(&mut self, template: &str) -> Result<Vec<PageRef>>;
    fn backlinks_of(&mut self, title: &str, namespaces: &[i32]) -> Result<Vec<PageRef>>;
    fn file_usage(&mut self, file: &str) -> Result<Vec<PageRef>>;
    /// Most recent editor of `title` that is neither the pipeline's own account nor a bot.
    fn last_non_automated_editor(&mut self, title: &str) -> Result<Option<String>>;
    fn edit_count(&mut self, user: &str) -> Result<u64>;
    fn groups_of(&mut self, user: &str) -> Result<BTreeSet<String>>;
    fn request_count(&self) -> usize;

    fn page_exists(&mut self, title: &str) -> Result<bool> {
        Ok(self.page_id(title)?.is_some())
    }
}

pub trait WikiWriteApi: WikiReadApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub bot_user: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_env() -> Self {
        Self::from_env_with_defaults("", DEFAULT_USER_AGENT, None)
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        let api_default = config.wiki.api_url.as_deref().unwrap_or("");
        Self::from_env_with_defaults(api_default, &config.user_agent(), config.bot_user())
    }

    fn from_env_with_defaults(
        api_url_default: &str,
        user_agent_default: &str,
        bot_user: Option<String>,
    ) -> Self {
        Self {
            api_url: env_value("WIKI_API_URL", api_url_default),
            user_agent: env_value("WIKI_USER_AGENT", user_agent_default),
            bot_user: bot_user.or_else(|| env::var("WIKI_BOT_USER").ok()),
            timeout_ms: env_parsed("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_parsed("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_parsed("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_parsed("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_parsed("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_parsed("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    group_cache: BTreeMap<String, BTreeSet<String>>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured (set [wiki].api_url or WIKI_API_URL)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            group_cache: BTreeMap::new(),
        })
    }

    /// Log in with WIKI_BOT_USER / WIKI_BOT_PASS when both are set.
    pub fn login_from_env(&mut self) -> Result<bool> {
        let username = env::var("WIKI_BOT_USER").ok().filter(|v| !v.trim().is_empty());
        let password = env::var("WIKI_BOT_PASS").ok().filter(|v| !v.is_empty());
        match (username, password) {
            (Some(username), Some(password)) => {
                self.login(username.trim(), &password)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// One API round trip. Reads go out as GET, login and edits as POST with the write budget.
    fn call(&mut self, method: Method, params: &[(&str, String)]) -> Result<Value> {
        let write = method == Method::Post;
        let budget = if write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let pairs = encode_params(params);

        let mut attempt = 0;
        loop {
            self.throttle(write);
            let request = match method {
                Method::Get => self.client.get(url.clone()).query(&pairs),
                Method::Post => self.client.post(url.clone()).form(&pairs),
            };
            let failure = match request.send() {
                Ok(response) if response.status().is_success() => {
                    let payload: Value = response
                        .json()
                        .context("MediaWiki API returned invalid JSON")?;
                    return check_api_error(payload);
                }
                Ok(response) => {
                    let status = response.status();
                    if attempt >= budget || !is_retryable_status(status) {
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    format!("HTTP {status}")
                }
                Err(error) => {
                    if attempt >= budget || !is_retryable_error(&error) {
                        return Err(error).context("failed to reach the MediaWiki API");
                    }
                    error.to_string()
                }
            };
            debug!(attempt, %failure, "retrying MediaWiki request");
            self.backoff(attempt, write);
            attempt += 1;
        }
    }

    /// Run a `list=` query to exhaustion, echoing the whole `continue` object back each round.
    fn query_list(&mut self, list: &str, params: &[(&str, String)]) -> Result<Vec<PageRef>> {
        let mut out = Vec::new();
        let mut continuation: Vec<(String, String)> = Vec::new();

        loop {
            let mut round: Vec<(&str, String)> = vec![
                ("action", "query".to_string()),
                ("list", list.to_string()),
            ];
            round.extend(params.iter().cloned());
            for (key, value) in &continuation {
                round.push((key.as_str(), value.clone()));
            }

            let response = self.call(Method::Get, &round)?;
            let (items, next) = decode_list(&response, list)?;
            for item in items {
                out.push(PageRef::new(item.ns, bare_title(item.ns, &item.title)));
            }
            if next.is_empty() {
                break;
            }
            continuation = next;
        }

        Ok(out)
    }

    fn query_user(&mut self, user: &str) -> Result<Option<UserEntry>> {
        let response = self.call(Method::Get, &[
            ("action", "query".to_string()),
            ("list", "users".to_string()),
            ("ususers", user.to_string()),
            ("usprop", "editcount|groups".to_string()),
        ])?;
        let envelope: Query<UserList> = decode(response, "users")?;
        Ok(envelope.query.users.into_iter().find(|user| !user.missing))
    }

    fn throttle(&mut self, write: bool) {
        let gap = Duration::from_millis(if write {
            self.config.rate_limit_write_ms
        } else {
            self.config.rate_limit_read_ms
        });
        if let Some(wait) = self
            .last_request_at
            .and_then(|last| gap.checked_sub(last.elapsed()))
        {
            sleep(wait);
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    /// Exponential backoff from `retry_delay_ms`; writes wait twice as long.
    fn backoff(&self, attempt: usize, write: bool) {
        let factor = 1u64 << attempt.min(16);
        let delay = self
            .config
            .retry_delay_ms
            .saturating_mul(factor)
            .saturating_mul(if write { 2 } else { 1 });
        sleep(Duration::from_millis(delay));
    }

    fn fetch_token(&mut self, kind: &str) -> Result<String> {
        let response = self.call(Method::Get, &[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", kind.to_string()),
        ])?;
        let envelope: Query<TokenList> = decode(response, "token")?;
        let tokens = envelope.query.tokens;
        let token = match kind {
            "login" => tokens.logintoken,
            _ => tokens.csrftoken,
        };
        token.ok_or_else(|| anyhow!("MediaWiki did not return a {kind} token"))
    }

    fn csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let token = self.fetch_token("csrf")?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// `titles=` query for a single page; `revision_props` adds `prop=revisions`.
    fn query_pages(&mut self, title: &str, revision_props: Option<&[(&str, String)]>) -> Result<Vec<PageEntry>> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("titles", title.to_string()),
        ];
        match revision_props {
            Some(extra) => {
                params.push(("prop", "revisions".to_string()));
                params.extend(extra.iter().cloned());
            }
            None => params.push(("prop", "info".to_string())),
        }
        let response = self.call(Method::Get, &params)?;
        let envelope: Query<PageList> = decode(response, "page")?;
        Ok(envelope.query.pages)
    }

    fn existing_page(&mut self, title: &str, revision_props: Option<&[(&str, String)]>) -> Result<Option<PageEntry>> {
        Ok(self
            .query_pages(title, revision_props)?
            .into_iter()
            .find(|page| !page.missing && page.pageid.is_some()))
    }
}

impl WikiReadApi for MediaWikiClient {
    fn page_id(&mut self, title: &str) -> Result<Option<i64>> {
        Ok(self.existing_page(title, None)?.and_then(|page| page.pageid))
    }

    fn get_text(&mut self, title: &str) -> Result<Option<String>> {
        let content = [
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ];
        Ok(self
            .existing_page(title, Some(&content))?
            .and_then(|page| page.revisions.into_iter().next())
            .and_then(|revision| revision.slots.main)
            .map(|slot| slot.content))
    }

    fn members_of(&mut self, category: &str) -> Result<Vec<PageRef>> {
        self.query_list(
            "categorymembers",
            &[
                ("cmtitle", category.to_string()),
                ("cmlimit", "500".to_string()),
            ],
        )
    }

    fn transclusions_of(&mut self, template: &str) -> Result<Vec<PageRef>> {
        self.query_list(
            "embeddedin",
            &[
                ("eititle", template.to_string()),
                ("eilimit", "500".to_string()),
            ],
        )
    }

    fn backlinks_of(&mut self, title: &str, namespaces: &[i32]) -> Result<Vec<PageRef>> {
        self.query_list(
            "backlinks",
            &[
                ("bltitle", title.to_string()),
                ("blnamespace", join_namespaces(namespaces)),
                ("bllimit", "500".to_string()),
            ],
        )
    }

    fn file_usage(&mut self, file: &str) -> Result<Vec<PageRef>> {
        self.query_list(
            "imageusage",
            &[
                ("iutitle", file.to_string()),
                ("iulimit", "500".to_string()),
            ],
        )
    }

    fn last_non_automated_editor(&mut self, title: &str) -> Result<Option<String>> {
        let history = [
            ("rvprop", "user".to_string()),
            ("rvlimit", EDITOR_HISTORY_DEPTH.to_string()),
        ];
        let users: Vec<String> = self
            .query_pages(title, Some(&history))?
            .into_iter()
            .flat_map(|page| page.revisions)
            .filter_map(|revision| revision.user)
            .collect();

        for user in users {
            if self
                .config
                .bot_user
                .as_deref()
                .is_some_and(|bot| bot.eq_ignore_ascii_case(&user))
            {
                continue;
            }
            if self.groups_of(&user)?.contains(BOT_GROUP) {
                debug!(user = %user, "skipping automated editor");
                continue;
            }
            return Ok(Some(user));
        }
        Ok(None)
    }

    fn edit_count(&mut self, user: &str) -> Result<u64> {
        Ok(self.query_user(user)?.map_or(0, |item| item.editcount))
    }

    fn groups_of(&mut self, user: &str) -> Result<BTreeSet<String>> {
        if let Some(groups) = self.group_cache.get(user) {
            return Ok(groups.clone());
        }
        let groups: BTreeSet<String> = self
            .query_user(user)?
            .map(|item| item.groups.into_iter().collect())
            .unwrap_or_default();
        self.group_cache.insert(user.to_string(), groups.clone());
        Ok(groups)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let login_token = self.fetch_token("login")?;
        let response = self.call(
            Method::Post,
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
        )?;
        let outcome: LoginReply = decode(response, "login")?;
        if outcome.login.result != "Success" {
            let reason = outcome.login.reason.unwrap_or(outcome.login.result);
            bail!("MediaWiki login as {username} failed: {reason}");
        }
        self.csrf_token = None;
        self.config.bot_user.get_or_insert_with(|| username.to_string());
        Ok(())
    }

    fn save(&mut self, title: &str, text: &str, summary: &str) -> Result<()> {
        let token = self.csrf_token()?;
        let response = self.call(
            Method::Post,
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", text.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("token", token),
            ],
        )?;
        let reply: EditReply = decode(response, "edit")?;
        match reply.edit.map(|edit| edit.result) {
            Some(result) if result == "Success" => Ok(()),
            Some(result) => bail!("MediaWiki refused the edit to {title}: {result}"),
            None => bail!("MediaWiki edit reply for {title} had no edit section"),
        }
    }
}

/// Strip the namespace prefix from an API title.
fn bare_title(namespace: i32, full: &str) -> String {
    if namespace == NS_MAIN {
        return full.to_string();
    }
    match full.split_once(':') {
        Some((_, rest)) => rest.to_string(),
        None => full.to_string(),
    }
}

/// Items of one `list=` module plus the `continue` parameters for the next round.
fn decode_list(response: &Value, list: &str) -> Result<(Vec<ListItem>, Vec<(String, String)>)> {
    let items = match response.get("query").and_then(|query| query.get(list)) {
        Some(value) => serde_json::from_value(value.clone())
            .with_context(|| format!("failed to decode {list} API response"))?,
        None => Vec::new(),
    };
    let continuation = response
        .get("continue")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| match value {
                    Value::String(text) => Some((key.clone(), text.clone())),
                    Value::Number(number) => Some((key.clone(), number.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok((items, continuation))
}

fn join_namespaces(namespaces: &[i32]) -> String {
    namespaces
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

fn encode_params(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn check_api_error(payload: Value) -> Result<Value> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parsed env override; unset or unparsable values fall back to `default`.
fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn decode<T: DeserializeOwned>(payload: Value, what: &str) -> Result<T> {
    serde_json::from_value(payload).with_context(|| format!("unexpected shape of MediaWiki {what} reply"))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Clone)]
struct ListItem {
    ns: i32,
    title: String,
}

/// `{"query": {...}}` envelope shared by every `action=query` reply.
#[derive(Debug, Deserialize)]
struct Query<T> {
    query: T,
}

#[derive(Debug, Deserialize)]
struct PageList {
    #[serde(default)]
    pages: Vec<PageEntry>,
}

#[derive(Debug, Deserialize)]
struct PageEntry {
    pageid: Option<i64>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    revisions: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    user: Option<String>,
    #[serde(default)]
    slots: Slots,
}

#[derive(Debug, Default, Deserialize)]
struct Slots {
    main: Option<MainSlot>,
}

#[derive(Debug, Deserialize)]
struct MainSlot {
    content: String,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    editcount: u64,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenList {
    tokens: Tokens,
}

#[derive(Debug, Deserialize)]
struct Tokens {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    login: LoginOutcome,
}

#[derive(Debug, Deserialize)]
struct LoginOutcome {
    result: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditReply {
    edit: Option<EditOutcome>,
}

#[derive(Debug, Deserialize)]
struct EditOutcome {
    result: String,
}
