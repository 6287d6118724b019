use anyhow::{Context, Result, bail};
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_prefix: Url,
    pub bind_addr: String,
    pub command_prefix: String,
    pub bot_username: Option<String>,
    pub err_report_conv: Option<String>,
    pub announcement_conv: Option<String>,
    pub delivery_timeout: Duration,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let Some(database_url) = optional_var("DATABASE_URL") else {
            bail!("DATABASE_URL must be set");
        };

        let Some(prefix) = optional_var("BOT_HTTP_PREFIX") else {
            bail!("BOT_HTTP_PREFIX must be set to the public base URL for webhooks");
        };
        let http_prefix = parse_prefix(&prefix)?;

        let bind_addr = std::env::var("BIND_ADDR")
            .or_else(|_| std::env::var("PORT").map(|p| format!("0.0.0.0:{p}")))
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let command_prefix =
            optional_var("BOT_COMMAND_PREFIX").unwrap_or_else(|| "!webhook".to_string());

        let delivery_timeout = match optional_var("BOT_DELIVERY_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("invalid BOT_DELIVERY_TIMEOUT_SECS {secs:?}"))?,
            ),
            None => Duration::from_secs(10),
        };

        Ok(Self {
            database_url,
            http_prefix,
            bind_addr,
            command_prefix,
            bot_username: optional_var("BOT_USERNAME"),
            err_report_conv: optional_var("BOT_ERR_REPORT_CONV"),
            announcement_conv: optional_var("BOT_ANNOUNCEMENT"),
            delivery_timeout,
        })
    }

    /// The user-facing URL for a webhook token.
    pub fn callback_url(&self, token: &str) -> String {
        let base = self.http_prefix.as_str().trim_end_matches('/');
        format!("{base}/{token}")
    }

    /// Path under which callback routes are served, without a trailing slash
    /// (empty when the prefix is a bare origin).
    pub fn mount_path(&self) -> &str {
        self.http_prefix.path().trim_end_matches('/')
    }

    pub fn log_startup_info(&self) {
        info!("Listening on {}", self.bind_addr);
        info!("Webhook URLs look like {}", self.callback_url("<token>"));
        info!(prefix = %self.command_prefix, "Accepting chat commands");
    }
}

fn parse_prefix(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("BOT_HTTP_PREFIX {raw:?} is not a URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("BOT_HTTP_PREFIX must be an http(s) URL");
    }
    if url.query().is_some() || url.fragment().is_some() {
        bail!("BOT_HTTP_PREFIX must not carry a query or fragment");
    }
    Ok(url)
}

#[cfg(test)]
impl Config {
    pub fn for_test(prefix: &str) -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            http_prefix: parse_prefix(prefix).unwrap(),
            bind_addr: "127.0.0.1:0".to_string(),
            command_prefix: "!webhook".to_string(),
            bot_username: Some("webhookbot".to_string()),
            err_report_conv: None,
            announcement_conv: None,
            delivery_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_joins_prefix_and_token() {
        let config = Config::for_test("https://bots.example.com/webhookbot/");
        assert_eq!(
            config.callback_url("abc"),
            "https://bots.example.com/webhookbot/abc"
        );
        assert_eq!(config.mount_path(), "/webhookbot");
    }

    #[test]
    fn bare_origin_mounts_at_root() {
        let config = Config::for_test("http://localhost:3000");
        assert_eq!(config.callback_url("abc"), "http://localhost:3000/abc");
        assert_eq!(config.mount_path(), "");
    }

    #[test]
    fn prefix_must_be_http_without_query() {
        assert!(parse_prefix("ftp://example.com/hooks").is_err());
        assert!(parse_prefix("https://example.com/hooks?x=1").is_err());
        assert!(parse_prefix("not a url").is_err());
    }
}
