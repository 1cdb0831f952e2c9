use std::{future::Future, pin::Pin, process::Stdio, sync::Arc, time::Duration};

use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;

use crate::{
    config::{Config, FetchMode},
    version::user_agent,
};

pub const DEFAULT_RENDER_BUDGET: Duration = Duration::from_secs(5);

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send>>;

/// Retrieves the current text of the watched region.
///
/// Whatever a fetch allocates must be released when the returned future
/// completes or is dropped.
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self) -> FetchFuture;
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
pub enum FetchError {
    Http { message: String },
    Status { url: String, status: u16 },
    Browser { message: String },
    InvalidSelector { selector: String, message: String },
    SelectorNotFound { selector: String },
    Timeout { after: Duration },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { message } => write!(f, "http request failed: {message}"),
            Self::Status { url, status } => write!(f, "GET {url} returned status {status}"),
            Self::Browser { message } => write!(f, "browser failed: {message}"),
            Self::InvalidSelector { selector, message } => {
                write!(f, "invalid selector {selector:?}: {message}")
            }
            Self::SelectorNotFound { selector } => {
                write!(f, "no element matches selector {selector:?}")
            }
            Self::Timeout { after } => write!(f, "fetch timed out after {after:?}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http {
            message: value.to_string(),
        }
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector).map_err(|e| FetchError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

// Elements whose text never reaches the rendered page.
const HIDDEN_ELEMENTS: &[&str] = &["head", "noscript", "script", "style", "template", "title"];

// Elements that start and end their own line when rendered.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "caption", "dd", "details", "dialog", "div",
    "dl", "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4",
    "h5", "h6", "header", "hgroup", "hr", "legend", "li", "main", "nav", "ol", "option", "p",
    "pre", "section", "summary", "table", "tbody", "tfoot", "thead", "tr", "ul",
];

/// Rendered text of the first element matching `selector`.
///
/// Approximates what a browser's `innerText` yields: block elements and
/// `<br>` break lines, script and style bodies are skipped, whitespace
/// runs collapse outside `<pre>`. Each line is then trimmed and blank lines
/// are dropped, so indentation churn in the markup does not register as a
/// change.
pub fn extract_text(html: &str, selector: &str) -> Result<String, FetchError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| FetchError::SelectorNotFound {
            selector: selector.to_string(),
        })?;

    let mut raw = String::new();
    collect_text(element, element.value().name() == "pre", &mut raw);
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    Ok(lines.join("\n"))
}

fn collect_text(element: ElementRef<'_>, in_pre: bool, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) if in_pre => out.push_str(text),
            Node::Text(text) => push_collapsed(out, text),
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN_ELEMENTS.contains(&name) || el.attr("hidden").is_some() {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                let Some(child_element) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    break_line(out);
                }
                collect_text(child_element, in_pre || name == "pre", out);
                if block {
                    break_line(out);
                } else if matches!(name, "td" | "th") {
                    out.push('\t');
                }
            }
            _ => {}
        }
    }
}

fn push_collapsed(out: &mut String, text: &str) {
    for ch in text.chars() {
        if !ch.is_whitespace() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with([' ', '\t', '\n']) {
            out.push(' ');
        }
    }
}

fn break_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

pub fn fetcher_from_config(config: &Config) -> Result<Arc<dyn ContentFetcher>, FetchError> {
    match config.fetch_mode {
        FetchMode::Http => Ok(Arc::new(HttpFetcher::new(
            &config.target_url,
            &config.target_selector,
            config.fetch_timeout,
        )?)),
        FetchMode::Browser => Ok(Arc::new(
            BrowserFetcher::new(
                &config.browser_bin,
                &config.target_url,
                &config.target_selector,
            )
            .with_render_budget(config.render_budget),
        )),
    }
}

/// Fetches the raw document over HTTP. Suitable for server-rendered pages.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    selector: String,
}

impl HttpFetcher {
    pub fn new(
        url: impl Into<String>,
        selector: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            selector: selector.into(),
        })
    }
}

impl ContentFetcher for HttpFetcher {
    fn fetch(&self) -> FetchFuture {
        let client = self.client.clone();
        let url = self.url.clone();
        let selector = self.selector.clone();
        Box::pin(async move {
            let resp = client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url,
                    status: status.as_u16(),
                });
            }
            let body = resp.text().await?;
            debug!(url = %url, bytes = body.len(), "fetched document");
            extract_text(&body, &selector)
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Renders the page in a headless Chromium-compatible browser and reads the
/// serialized DOM from stdout.
#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    browser_bin: String,
    url: String,
    selector: String,
    render_budget: Duration,
}

impl BrowserFetcher {
    pub fn new(
        browser_bin: impl Into<String>,
        url: impl Into<String>,
        selector: impl Into<String>,
    ) -> Self {
        Self {
            browser_bin: browser_bin.into(),
            url: url.into(),
            selector: selector.into(),
            render_budget: DEFAULT_RENDER_BUDGET,
        }
    }

    /// Virtual time the browser may spend running scripts and settling
    /// network activity before the DOM is dumped.
    pub fn with_render_budget(mut self, budget: Duration) -> Self {
        self.render_budget = budget;
        self
    }
}

impl ContentFetcher for BrowserFetcher {
    fn fetch(&self) -> FetchFuture {
        let browser_bin = self.browser_bin.clone();
        let url = self.url.clone();
        let selector = self.selector.clone();
        let render_budget = self.render_budget;
        Box::pin(async move {
            let html = dump_dom(&browser_bin, &url, render_budget).await?;
            debug!(url = %url, bytes = html.len(), "rendered document");
            extract_text(&html, &selector)
        })
    }

    fn name(&self) -> &'static str {
        "browser"
    }
}

async fn dump_dom(
    browser_bin: &str,
    url: &str,
    render_budget: Duration,
) -> Result<String, FetchError> {
    let mut cmd = tokio::process::Command::new(browser_bin);
    cmd.args([
        "--headless=new",
        "--no-sandbox",
        "--disable-gpu",
        "--disable-dev-shm-usage",
        "--dump-dom",
    ]);
    // --dump-dom alone returns at the load event; the budget lets late
    // scripts and XHR-driven content land first.
    if !render_budget.is_zero() {
        cmd.arg(format!(
            "--virtual-time-budget={}",
            render_budget.as_millis()
        ));
    }
    cmd.arg(url);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // The browser must not outlive a cancelled or timed-out fetch.
    cmd.kill_on_drop(true);

    let out = cmd.output().await.map_err(|err| FetchError::Browser {
        message: format!("spawn {browser_bin}: {err}"),
    })?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(FetchError::Browser {
            message: format!(
                "{browser_bin} exited with {}: {}",
                out.status,
                tail_chars(stderr.trim(), 400)
            ),
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn tail_chars(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let start = s
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}
