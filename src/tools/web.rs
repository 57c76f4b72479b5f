//! Web reader: plain text from a single page
//!
//! Pages are fetched only when robots.txt allows it and the server says the
//! body is HTML or plain text. Bodies are capped before parsing, and the
//! extracted text is capped again before it reaches the model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{NativeTool, ToolDescriptor, ToolKind};
use crate::Result;
use crate::error::ToolFailure;

const USER_AGENT: &str = "ARC-WebReader/1.0";

/// Product token matched against robots.txt groups
const ROBOTS_AGENT: &str = "arc-webreader";

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Max body bytes read from the network
const MAX_PAGE_BYTES: usize = 500 * 1024;

/// Max characters of extracted text returned
const MAX_TEXT_CHARS: usize = 10_000;

/// Elements whose text is never page content
const SKIPPED_ELEMENTS: [&str; 8] = ["script", "style", "meta", "noscript", "header", "footer", "nav", "template"];

#[derive(Deserialize)]
struct ReadArgs {
    url: String,
}

struct ReadWebpage {
    client: Client,
}

#[async_trait]
impl NativeTool for ReadWebpage {
    async fn call(&self, arguments: Value) -> std::result::Result<String, ToolFailure> {
        let args: ReadArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolFailure::Failed(format!("invalid arguments: {e}")))?;
        let url = parse_http_url(&args.url)?;

        if !self.robots_allow(&url).await {
            return Err(ToolFailure::Failed("access denied by robots.txt".to_string()));
        }

        let (body, truncated) = self.fetch(&url).await?;
        if truncated {
            tracing::warn!(url = %url, limit = MAX_PAGE_BYTES, "page truncated");
        }

        let text = extract_text(&String::from_utf8_lossy(&body));
        tracing::debug!(url = %url, chars = text.len(), "read webpage");
        Ok(text)
    }
}

impl ReadWebpage {
    /// Missing or unreadable robots.txt allows everything; 401/403 deny everything
    async fn robots_allow(&self, url: &url::Url) -> bool {
        let Ok(robots_url) = url.join("/robots.txt") else {
            return true;
        };

        let response = match self.client.get(robots_url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "robots.txt unavailable, allowing");
                return true;
            }
        };

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => false,
            status if status.is_success() => match response.text().await {
                Ok(body) => Robots::parse(&body).allows(ROBOTS_AGENT, url.path()),
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// Body bytes, capped, and whether the cap was hit
    async fn fetch(&self, url: &url::Url) -> std::result::Result<(Vec<u8>, bool), ToolFailure> {
        let mut response = self.client.get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                ToolFailure::Failed(format!("request timed out ({}s)", FETCH_TIMEOUT.as_secs()))
            } else {
                ToolFailure::Failed(format!("failed to fetch page: {e}"))
            }
        })?;

        if !response.status().is_success() {
            return Err(ToolFailure::Failed(format!("HTTP error: {}", response.status())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !is_readable_content_type(&content_type) {
            return Err(ToolFailure::Failed(format!("unsupported content type: {content_type:?}")));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ToolFailure::Failed(format!("failed to read page: {e}")))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > MAX_PAGE_BYTES {
                body.truncate(MAX_PAGE_BYTES);
                return Ok((body, true));
            }
        }
        Ok((body, false))
    }
}

fn parse_http_url(raw: &str) -> std::result::Result<url::Url, ToolFailure> {
    let url = url::Url::parse(raw.trim()).map_err(|e| ToolFailure::Failed(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ToolFailure::Failed(format!("refusing to read {other}: URLs"))),
    }
}

fn is_readable_content_type(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("text/plain")
}

/// Visible text of an HTML document, one block per line
#[must_use]
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    collect_text(document.root_element(), &mut raw);

    let mut text = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if let Some((cut, _)) = text.char_indices().nth(MAX_TEXT_CHARS) {
        text.truncate(cut);
    }
    text
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return;
    }

    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child) = ElementRef::wrap(child) {
            collect_text(child, out);
            out.push('\n');
        }
    }
}

/// Allow and disallow rules that apply to one crawler
#[derive(Debug, Default)]
struct RuleGroup {
    agents: Vec<String>,
    rules: Vec<(bool, String)>,
}

/// Parsed robots.txt
#[derive(Debug, Default)]
pub struct Robots {
    groups: Vec<RuleGroup>,
}

impl Robots {
    /// Parse robots.txt, ignoring lines it does not understand
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut in_agents = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match field.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if !in_agents {
                        groups.push(RuleGroup::default());
                        in_agents = true;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                }
                field @ ("allow" | "disallow") => {
                    in_agents = false;
                    // An empty Disallow allows everything
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.rules.push((field == "allow", value.to_string()));
                    }
                }
                _ => {}
            }
        }

        Self { groups }
    }

    /// Whether `agent` may fetch `path`
    ///
    /// The group naming the agent wins over `*`; within a group the longest
    /// matching rule decides, and Allow wins ties.
    #[must_use]
    pub fn allows(&self, agent: &str, path: &str) -> bool {
        let agent = agent.to_ascii_lowercase();
        let group = self
            .groups
            .iter()
            .find(|g| g.agents.iter().any(|a| !a.is_empty() && a != "*" && agent.contains(a.as_str())))
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

        let Some(group) = group else {
            return true;
        };

        group
            .rules
            .iter()
            .filter(|(_, prefix)| path.starts_with(prefix.as_str()))
            .max_by_key(|(allow, prefix)| (prefix.len(), *allow))
            .is_none_or(|(allow, _)| *allow)
    }
}

/// Descriptor for `read_webpage`
///
/// # Errors
///
/// Returns error if the HTTP client cannot be built
pub fn web_tools() -> Result<Vec<ToolDescriptor>> {
    let client = Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    Ok(vec![ToolDescriptor::native(
        "read_webpage",
        "Fetch a web page and return its readable text. Only HTML and plain text pages are read.",
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Absolute http(s) URL" }
            },
            "required": ["url"],
            "additionalProperties": false
        }),
        ToolKind::Read,
        Arc::new(ReadWebpage { client }),
    )])
}
