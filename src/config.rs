// Command line / environment configuration and the runtime settings derived
// from it.

use crate::inference::ReplicateConfig;
use crate::mail::SmtpConfig;
use clap::Parser;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Command line arguments for kontext-server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Hostname/IP to bind the server to.
    /// If this option is specified without value, it will default to "*", meaning the server will listen on all interfaces.
    #[arg(long, env = "KONTEXT_SERVER_HOST", default_value = "localhost", num_args = 0..=1, default_missing_value = "*")]
    pub host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "KONTEXT_SERVER_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Processing calls each user may make per UTC day.
    #[arg(long, env = "DAILY_LIMIT", default_value_t = 10)]
    pub daily_limit: u32,

    /// Largest declared Content-Length accepted on upload endpoints.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 10 * MIB)]
    pub max_upload_bytes: u64,

    /// Largest declared Content-Length accepted on JSON endpoints.
    #[arg(long, env = "MAX_JSON_BYTES", default_value_t = MIB)]
    pub max_json_bytes: u64,

    /// Largest accepted image file inside an upload.
    #[arg(long, env = "MAX_IMAGE_BYTES", default_value_t = 5 * MIB)]
    pub max_image_bytes: u64,

    /// Replicate API token. Without it, processing runs in degraded mode and returns the input image.
    #[arg(long, env = "REPLICATE_API_TOKEN", hide_env_values = true)]
    pub replicate_api_token: Option<String>,

    #[arg(long, env = "REPLICATE_API_BASE", default_value = "https://api.replicate.com/v1")]
    pub replicate_api_base: String,

    /// Interval between prediction status polls, in milliseconds.
    #[arg(long, env = "REPLICATE_POLL_INTERVAL_MS", default_value_t = 1500)]
    pub replicate_poll_interval_ms: u64,

    /// Upper bound for one processing call, in seconds.
    #[arg(long, env = "INFERENCE_TIMEOUT_SECS", default_value_t = 120)]
    pub inference_timeout_secs: u64,

    /// Simulated processing time in degraded mode, in milliseconds.
    #[arg(long, env = "MOCK_DELAY_MS", default_value_t = 1000)]
    pub mock_delay_ms: u64,

    /// Supabase project URL used to resolve sessions.
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    pub supabase_anon_key: Option<String>,

    /// SMTP account used to send feedback mail. Feedback is only logged when unset.
    #[arg(long, env = "EMAIL_SERVER_USER")]
    pub email_server_user: Option<String>,

    #[arg(long, env = "EMAIL_SERVER_PASSWORD", hide_env_values = true)]
    pub email_server_password: Option<String>,

    /// Feedback recipient. Defaults to the SMTP account.
    #[arg(long, env = "FEEDBACK_RECEIVER")]
    pub feedback_receiver: Option<String>,

    #[arg(long, env = "SMTP_HOST", default_value = "smtp.gmail.com")]
    pub smtp_host: String,

    #[arg(long, env = "SMTP_PORT", default_value_t = 587)]
    pub smtp_port: u16,

    /// Enable per-IP request bursts limits on all endpoints.
    #[arg(long, env = "KONTEXT_SERVER_IP_RATE_LIMIT", action = clap::ArgAction::SetTrue)]
    pub ip_rate_limit: bool,

    /// Redirect requests forwarded over plain HTTP to HTTPS.
    #[arg(long, env = "KONTEXT_SERVER_FORCE_HTTPS", action = clap::ArgAction::SetTrue)]
    pub force_https: bool,
}

impl AppConfig {
    pub fn settings(&self) -> Settings {
        Settings {
            daily_limit: self.daily_limit,
            max_upload_bytes: self.max_upload_bytes,
            max_json_bytes: self.max_json_bytes,
            max_image_bytes: self.max_image_bytes,
            force_https: self.force_https,
            mail_timeout: Duration::from_secs(10),
        }
    }

    /// `None` selects degraded mode.
    pub fn replicate(&self) -> Option<ReplicateConfig> {
        let api_token = non_empty(&self.replicate_api_token)?;
        Some(ReplicateConfig {
            api_token: api_token.to_string(),
            base_url: self.replicate_api_base.clone(),
            poll_interval: Duration::from_millis(self.replicate_poll_interval_ms),
            timeout: Duration::from_secs(self.inference_timeout_secs),
        })
    }

    pub fn supabase(&self) -> Option<(&str, &str)> {
        Some((
            non_empty(&self.supabase_url)?,
            non_empty(&self.supabase_anon_key)?,
        ))
    }

    /// `None` means feedback is only logged.
    pub fn smtp(&self) -> Option<SmtpConfig> {
        Some(SmtpConfig {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            username: non_empty(&self.email_server_user)?.to_string(),
            password: non_empty(&self.email_server_password)?.to_string(),
            receiver: non_empty(&self.feedback_receiver).map(str::to_string),
            timeout: Duration::from_secs(5),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Limits and switches shared by request handlers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub daily_limit: u32,
    pub max_upload_bytes: u64,
    pub max_json_bytes: u64,
    pub max_image_bytes: u64,
    pub force_https: bool,
    pub mail_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_limit: 10,
            max_upload_bytes: 10 * MIB,
            max_json_bytes: MIB,
            max_image_bytes: 5 * MIB,
            force_https: false,
            mail_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppConfig {
        let mut argv = vec!["kontext-server"];
        argv.extend_from_slice(args);
        AppConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_bare_host_flag_means_wildcard() {
        assert_eq!(parse(&["--host"]).host, "*");
        assert_eq!(parse(&["--host", "127.0.0.1"]).host, "127.0.0.1");
    }

    #[test]
    fn test_blank_credentials_are_ignored() {
        let config = parse(&[
            "--replicate-api-token",
            "  ",
            "--email-server-user",
            "me@example.com",
        ]);
        assert!(config.replicate().is_none());
        assert!(config.smtp().is_none());
    }

    #[test]
    fn test_smtp_receiver_and_replicate() {
        let config = parse(&[
            "--replicate-api-token",
            "r8_token",
            "--email-server-user",
            "me@example.com",
            "--email-server-password",
            "pw",
            "--feedback-receiver",
            "inbox@example.com",
        ]);
        let replicate = config.replicate().unwrap();
        assert_eq!(replicate.api_token, "r8_token");
        assert_eq!(replicate.poll_interval, Duration::from_millis(1500));
        let smtp = config.smtp().unwrap();
        assert_eq!(smtp.receiver.as_deref(), Some("inbox@example.com"));
        assert_eq!(smtp.port, 587);
    }
}
