//! System tools: clock, sandboxed filesystem reads, URL and app launchers

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;

use super::{NativeTool, ToolDescriptor, ToolKind};
use crate::config::ToolsConfig;
use crate::error::ToolFailure;

/// Max entries returned by `list_directory`
const MAX_DIR_ENTRIES: usize = 200;

/// Current local date and time
struct CurrentTime;

#[async_trait]
impl NativeTool for CurrentTime {
    async fn call(&self, _arguments: Value) -> Result<String, ToolFailure> {
        let now = chrono::Local::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "human": now.format("%A, %B %-d, %Y, %-I:%M %p").to_string(),
        })
        .to_string())
    }
}

/// Paths the filesystem tools may touch
#[derive(Debug, Clone)]
struct Sandbox {
    roots: Vec<PathBuf>,
}

impl Sandbox {
    /// Canonicalize `raw` and require it to sit below a root
    ///
    /// Relative paths resolve against the first root; `~` expands to home.
    async fn resolve(&self, raw: &str) -> Result<PathBuf, ToolFailure> {
        let expanded = match raw.strip_prefix("~") {
            Some(rest) => directories::BaseDirs::new()
                .map(|d| d.home_dir().join(rest.trim_start_matches('/')))
                .ok_or_else(|| ToolFailure::Failed("home directory unknown".to_string()))?,
            None => PathBuf::from(raw),
        };

        let candidate = if expanded.is_relative() {
            let base = self
                .roots
                .first()
                .ok_or_else(|| ToolFailure::Failed("no readable roots configured".to_string()))?;
            base.join(expanded)
        } else {
            expanded
        };

        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|e| ToolFailure::Failed(format!("{}: {e}", candidate.display())))?;

        let mut roots = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            if let Ok(root) = tokio::fs::canonicalize(root).await {
                roots.push(root);
            }
        }

        if is_within(&resolved, &roots) {
            Ok(resolved)
        } else {
            Err(ToolFailure::Failed(format!(
                "{} is outside the allowed directories",
                resolved.display()
            )))
        }
    }
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

struct ListDirectory {
    sandbox: Sandbox,
}

#[async_trait]
impl NativeTool for ListDirectory {
    async fn call(&self, arguments: Value) -> Result<String, ToolFailure> {
        let args: PathArgs = parse(arguments)?;
        let dir = self.sandbox.resolve(&args.path).await?;

        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ToolFailure::Failed(format!("{}: {e}", dir.display())))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolFailure::Failed(e.to_string()))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        let truncated = entries.len() > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);

        Ok(json!({
            "path": dir.display().to_string(),
            "entries": entries,
            "truncated": truncated,
        })
        .to_string())
    }
}

struct ReadFile {
    sandbox: Sandbox,
    max_bytes: usize,
}

#[async_trait]
impl NativeTool for ReadFile {
    async fn call(&self, arguments: Value) -> Result<String, ToolFailure> {
        let args: PathArgs = parse(arguments)?;
        let path = self.sandbox.resolve(&args.path).await?;

        let limit = self.max_bytes.saturating_add(1);
        let mut bytes = read_prefix(&path, limit)
            .await
            .map_err(|e| ToolFailure::Failed(format!("{}: {e}", path.display())))?;

        let truncated = bytes.len() > self.max_bytes;
        bytes.truncate(self.max_bytes);
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            let _ = write!(text, "\n[truncated at {} bytes]", self.max_bytes);
        }
        Ok(text)
    }
}

/// Read at most `limit` bytes from the start of a file
async fn read_prefix(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut bytes = Vec::new();
    file.take(u64::try_from(limit).unwrap_or(u64::MAX))
        .read_to_end(&mut bytes)
        .await?;
    Ok(bytes)
}

#[derive(Deserialize)]
struct UrlArgs {
    url: String,
}

struct OpenUrl;

/// Program and arguments that hand `url` to the desktop on `os`
///
/// The URL is always passed as one argument and never through a shell.
fn url_opener(os: &str, url: &url::Url) -> (&'static str, Vec<String>) {
    match os {
        "macos" => ("open", vec![url.to_string()]),
        "windows" => (
            "rundll32",
            vec!["url.dll,FileProtocolHandler".to_string(), url.to_string()],
        ),
        _ => ("xdg-open", vec![url.to_string()]),
    }
}

#[async_trait]
impl NativeTool for OpenUrl {
    async fn call(&self, arguments: Value) -> Result<String, ToolFailure> {
        let args: UrlArgs = parse(arguments)?;
        let url = validate_url(&args.url)?;

        let (program, args) = url_opener(std::env::consts::OS, &url);
        let program = which::which(program)
            .map_err(|_| ToolFailure::Failed(format!("no URL opener found ({program})")))?;

        spawn_detached(&program, &args)
            .map_err(|e| ToolFailure::Failed(format!("failed to launch opener: {e}")))?;

        tracing::info!(url = %url, "opened url");
        Ok(format!("Opened {url}"))
    }
}

#[derive(Deserialize)]
struct AppArgs {
    name: String,
}

/// Launch a desktop application by name
struct OpenApp;

/// Application names are plain words; no paths, flags, or shell syntax
fn validate_app_name(raw: &str) -> Result<&str, ToolFailure> {
    let name = raw.trim();
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(['-', '.'])
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '+'));

    if valid {
        Ok(name)
    } else {
        Err(ToolFailure::Failed(format!("invalid application name: {raw:?}")))
    }
}

/// Program and arguments that start application `name` on `os`
///
/// macOS looks the name up with `open -a`; elsewhere the name must be an
/// executable on `PATH`.
fn app_launcher(os: &str, name: &str) -> Result<(PathBuf, Vec<String>), ToolFailure> {
    if os == "macos" {
        let open = which::which("open").map_err(|_| ToolFailure::Failed("`open` not found".to_string()))?;
        return Ok((open, vec!["-a".to_string(), name.to_string()]));
    }

    let program = which::which(name)
        .map_err(|_| ToolFailure::Failed(format!("application {name:?} not found")))?;
    Ok((program, Vec::new()))
}

#[async_trait]
impl NativeTool for OpenApp {
    async fn call(&self, arguments: Value) -> Result<String, ToolFailure> {
        let args: AppArgs = parse(arguments)?;
        let name = validate_app_name(&args.name)?;
        let (program, args) = app_launcher(std::env::consts::OS, name)?;

        spawn_detached(&program, &args)
            .map_err(|e| ToolFailure::Failed(format!("failed to launch {name}: {e}")))?;

        tracing::info!(app = name, "opened application");
        Ok(format!("Opened {name}"))
    }
}

/// Start a process without waiting for it or sharing our stdio
fn spawn_detached(program: &Path, args: &[String]) -> std::io::Result<()> {
    tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(drop)
}

/// Only absolute http(s) URLs are opened
fn validate_url(raw: &str) -> Result<url::Url, ToolFailure> {
    let url = url::Url::parse(raw.trim()).map_err(|e| ToolFailure::Failed(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ToolFailure::Failed(format!("refusing to open {other}: URLs"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(arguments).map_err(|e| ToolFailure::Failed(format!("invalid arguments: {e}")))
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": description }
        },
        "required": ["path"],
        "additionalProperties": false
    })
}

/// Descriptors for `current_time`, `list_directory`, `read_file`, `open_url`, `open_app`
#[must_use]
pub fn system_tools(config: &ToolsConfig) -> Vec<ToolDescriptor> {
    let sandbox = Sandbox {
        roots: config.allowed_roots.clone(),
    };

    vec![
        ToolDescriptor::native(
            "current_time",
            "Get the current local date and time.",
            json!({ "type": "object", "properties": {}, "additionalProperties": false }),
            ToolKind::Read,
            Arc::new(CurrentTime),
        ),
        ToolDescriptor::native(
            "list_directory",
            "List the entries of a directory. Directories end with '/'.",
            path_schema("Directory path; relative paths start at the first allowed root"),
            ToolKind::Read,
            Arc::new(ListDirectory {
                sandbox: sandbox.clone(),
            }),
        ),
        ToolDescriptor::native(
            "read_file",
            "Read a text file.",
            path_schema("File path; relative paths start at the first allowed root"),
            ToolKind::Read,
            Arc::new(ReadFile {
                sandbox,
                max_bytes: config.max_read_bytes,
            }),
        ),
        ToolDescriptor::native(
            "open_url",
            "Open an http or https URL in the default browser.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL" }
                },
                "required": ["url"],
                "additionalProperties": false
            }),
            ToolKind::Mutate,
            Arc::new(OpenUrl),
        ),
        ToolDescriptor::native(
            "open_app",
            "Open a desktop application by name, e.g. 'Firefox' or 'gnome-calculator'.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Application name" }
                },
                "required": ["name"],
                "additionalProperties": false
            }),
            ToolKind::Mutate,
            Arc::new(OpenApp),
        ),
    ]
}

/// Whether `path` is inside one of `roots` (both taken as given)
#[must_use]
pub fn is_within(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}
