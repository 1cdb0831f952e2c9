use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::fetcher::parse_selector;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Plain HTTP GET of the document.
    Http,
    /// Render the page in a headless browser first.
    Browser,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "websentinel",
    about = "Watches one region of a web page and alerts when its content changes",
    version = crate::version::VERSION
)]
pub struct Cli {
    #[arg(
        long,
        env = "SENTINEL_TARGET_URL",
        value_name = "URL",
        default_value = ""
    )]
    pub target_url: String,

    #[arg(
        long,
        env = "SENTINEL_TARGET_SELECTOR",
        value_name = "CSS",
        default_value = ""
    )]
    pub target_selector: String,

    #[arg(
        long,
        env = "SENTINEL_SNAPSHOT_PATH",
        value_name = "PATH",
        default_value = "./data/stored_data.json"
    )]
    pub snapshot_path: PathBuf,

    #[arg(
        long = "check-interval-secs",
        env = "SENTINEL_CHECK_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..=86400)
    )]
    pub check_interval_secs: u64,

    #[arg(
        long = "fetch-timeout-secs",
        env = "SENTINEL_FETCH_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub fetch_timeout_secs: u64,

    #[arg(
        long = "fetch-mode",
        env = "SENTINEL_FETCH_MODE",
        value_name = "MODE",
        default_value = "browser",
        value_enum
    )]
    pub fetch_mode: FetchMode,

    #[arg(
        long = "browser-bin",
        env = "SENTINEL_BROWSER_BIN",
        value_name = "PATH",
        default_value = "chromium"
    )]
    pub browser_bin: String,

    #[arg(
        long = "render-budget-ms",
        env = "SENTINEL_RENDER_BUDGET_MS",
        value_name = "MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(0..=120000)
    )]
    pub render_budget_ms: u64,

    #[arg(
        long = "notify-webhook-url",
        env = "SENTINEL_NOTIFY_WEBHOOK_URL",
        value_name = "URL",
        default_value = ""
    )]
    pub notify_webhook_url: String,

    #[arg(
        long = "notify-webhook-token",
        env = "SENTINEL_NOTIFY_WEBHOOK_TOKEN",
        value_name = "TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    pub notify_webhook_token: String,

    #[arg(
        long = "smtp-host",
        env = "SENTINEL_SMTP_HOST",
        value_name = "HOST",
        default_value = "smtp.gmail.com"
    )]
    pub smtp_host: String,

    #[arg(
        long = "smtp-port",
        env = "SENTINEL_SMTP_PORT",
        value_name = "PORT",
        default_value_t = 587,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub smtp_port: u16,

    #[arg(
        long = "smtp-user",
        env = "SENTINEL_SMTP_USER",
        value_name = "ADDRESS",
        default_value = ""
    )]
    pub smtp_user: String,

    #[arg(
        long = "smtp-pass",
        env = "SENTINEL_SMTP_PASS",
        value_name = "PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    pub smtp_pass: String,

    /// Recipient; defaults to the sending account.
    #[arg(
        long = "smtp-to",
        env = "SENTINEL_SMTP_TO",
        value_name = "ADDRESS",
        default_value = ""
    )]
    pub smtp_to: String,
}

/// Plain variable names read by earlier deployments of this tool. Consulted
/// only when neither the flag nor its `SENTINEL_*` variable supplied a value.
pub const LEGACY_ENV_ALIASES: [(&str, &str); 4] = [
    ("--target-url", "TARGET_URL"),
    ("--target-selector", "TARGET_SELECTOR"),
    ("--smtp-user", "EMAIL_USER"),
    ("--smtp-pass", "EMAIL_PASS"),
];

#[derive(Debug)]
pub enum ConfigError {
    Missing { flag: &'static str, env: &'static str },
    InvalidUrl { flag: &'static str, value: String, message: String },
    InvalidSelector { selector: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { flag, env } => {
                write!(f, "missing required configuration: {flag} (or {env})")
            }
            Self::InvalidUrl {
                flag,
                value,
                message,
            } => write!(f, "invalid {flag} {value:?}: {message}"),
            Self::InvalidSelector { selector, message } => {
                write!(f, "invalid --target-selector {selector:?}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub to: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("to", &self.to)
            .finish()
    }
}

#[derive(Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validated process configuration. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub target_selector: String,
    pub snapshot_path: PathBuf,
    pub check_interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_mode: FetchMode,
    pub browser_bin: String,
    pub render_budget: Duration,
    /// Email delivery, enabled by SMTP credentials.
    pub smtp: Option<SmtpConfig>,
    /// With neither this nor `smtp` set, alerts are only logged.
    pub webhook: Option<WebhookConfig>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        self.into_config_with_env(|name| std::env::var(name).ok())
    }

    /// Like [`Cli::into_config`], with legacy variable names resolved
    /// through `lookup` instead of the process environment.
    pub fn into_config_with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        for (flag, legacy) in LEGACY_ENV_ALIASES {
            let slot = match flag {
                "--target-url" => &mut self.target_url,
                "--target-selector" => &mut self.target_selector,
                "--smtp-user" => &mut self.smtp_user,
                _ => &mut self.smtp_pass,
            };
            if slot.trim().is_empty()
                && let Some(value) = lookup(legacy)
            {
                *slot = value;
            }
        }

        let target_url = self.target_url.trim().to_string();
        if target_url.is_empty() {
            return Err(ConfigError::Missing {
                flag: "--target-url",
                env: "SENTINEL_TARGET_URL",
            });
        }
        validate_http_url("--target-url", &target_url)?;

        let target_selector = self.target_selector.trim().to_string();
        if target_selector.is_empty() {
            return Err(ConfigError::Missing {
                flag: "--target-selector",
                env: "SENTINEL_TARGET_SELECTOR",
            });
        }
        parse_selector(&target_selector).map_err(|e| ConfigError::InvalidSelector {
            selector: target_selector.clone(),
            message: e.to_string(),
        })?;

        let smtp_user = self.smtp_user.trim().to_string();
        let smtp_pass = self.smtp_pass.trim().to_string();
        let smtp = match (smtp_user.is_empty(), smtp_pass.is_empty()) {
            (true, true) => None,
            (false, true) => {
                return Err(ConfigError::Missing {
                    flag: "--smtp-pass",
                    env: "SENTINEL_SMTP_PASS",
                });
            }
            (true, false) => {
                return Err(ConfigError::Missing {
                    flag: "--smtp-user",
                    env: "SENTINEL_SMTP_USER",
                });
            }
            (false, false) => {
                let to = self.smtp_to.trim();
                Some(SmtpConfig {
                    host: self.smtp_host.trim().to_string(),
                    port: self.smtp_port,
                    to: if to.is_empty() {
                        smtp_user.clone()
                    } else {
                        to.to_string()
                    },
                    user: smtp_user,
                    pass: smtp_pass,
                })
            }
        };

        let webhook_url = self.notify_webhook_url.trim().to_string();
        let webhook = if webhook_url.is_empty() {
            None
        } else {
            validate_http_url("--notify-webhook-url", &webhook_url)?;
            let token = self.notify_webhook_token.trim();
            Some(WebhookConfig {
                url: webhook_url,
                token: (!token.is_empty()).then(|| token.to_string()),
            })
        };

        Ok(Config {
            target_url,
            target_selector,
            snapshot_path: self.snapshot_path,
            check_interval: Duration::from_secs(self.check_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            fetch_mode: self.fetch_mode,
            browser_bin: self.browser_bin,
            render_budget: Duration::from_millis(self.render_budget_ms),
            smtp,
            webhook,
        })
    }
}

fn validate_http_url(flag: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidUrl {
        flag,
        value: value.to_string(),
        message,
    };
    let url = reqwest::Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}
