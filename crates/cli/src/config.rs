use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde::Deserialize;
use sshkey_authorized_keys::MissingFilePolicy;
use sshkey_directory::{GitHubConfig, DEFAULT_API_URL, DEFAULT_KEYS_URL};
use sshkey_protocol::StatusBody;
use sshkey_transport::{
    Backoff, RedisConnector, RedisTransport, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_BACKOFF,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_CACHE_TTL;
use crate::server::DEFAULT_LONGPOLL_TIMEOUT;

pub const ENV_GITHUB_TOKEN: &str = "SSHKEY_PROVIDER_GITHUB_TOKEN";
pub const ENV_REDIS_PASSWORD: &str = "SSHKEY_PROVIDER_REDIS_PASSWORD";
pub const ENV_IMAGE: &str = "SSHKEY_PROVIDER_IMAGE";
pub const ENV_GIT_SHA: &str = "SSHKEY_PROVIDER_GIT_SHA";

const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
const DEFAULT_POLLING_INTERVAL_SECS: u64 = 60;
const DEFAULT_CHANNEL: &str = "sshkey_provider";
const DEFAULT_RECOVER_INTERVAL_SECS: u64 = 30;
const DEFAULT_AUTHORIZED_KEYS_PATH: &str = "authorized_keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Subscribe to pub/sub updates
    #[default]
    Push,
    /// Long-poll the collector over HTTP
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MissingFile {
    /// Create the file on first update
    #[default]
    Create,
    /// Treat a missing file as an error
    Error,
}

impl From<MissingFile> for MissingFilePolicy {
    fn from(value: MissingFile) -> Self {
        match value {
            MissingFile::Create => MissingFilePolicy::Create,
            MissingFile::Error => MissingFilePolicy::Error,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub collector: CollectorSection,
    pub transport: TransportSection,
    pub agent: AgentSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorSection {
    pub listen: Option<String>,
    pub organization: Option<String>,
    pub teams: Option<Vec<String>>,
    pub polling_interval_secs: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub longpoll_timeout_secs: Option<u64>,
    pub github_api_url: Option<String>,
    pub github_keys_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub redis_url: Option<String>,
    pub channel: Option<String>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_backoff_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub team: Option<String>,
    pub authorized_keys_path: Option<PathBuf>,
    pub mode: Option<AgentMode>,
    pub collector_url: Option<String>,
    pub recover_interval_secs: Option<u64>,
    pub missing_file: Option<MissingFile>,
    pub poll_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(Into::into)
    }
}

#[derive(Args, Debug, Default)]
pub struct TransportArgs {
    /// Redis URL, e.g. redis://127.0.0.1:6379
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Channel prefix; each team publishes on `<channel>:<team>`
    #[arg(long)]
    pub channel: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct CollectorArgs {
    /// HTTP bind address
    #[arg(long)]
    pub listen: Option<String>,

    /// GitHub organization owning the teams
    #[arg(long)]
    pub organization: Option<String>,

    /// Team to collect (repeatable)
    #[arg(long = "team")]
    pub teams: Vec<String>,

    /// Seconds between collection cycles
    #[arg(long)]
    pub polling_interval_secs: Option<u64>,

    /// Seconds a fetched team stays fresh
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    #[command(flatten)]
    pub transport: TransportArgs,
}

#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// Team whose keys are installed
    #[arg(long)]
    pub team: Option<String>,

    /// authorized_keys file to manage
    #[arg(long)]
    pub authorized_keys_path: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub mode: Option<AgentMode>,

    /// Collector base URL (required for poll mode, used for bootstrap in push mode)
    #[arg(long)]
    pub collector_url: Option<String>,

    /// Seconds to wait before reconnecting after a failure
    #[arg(long)]
    pub recover_interval_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub missing_file: Option<MissingFile>,

    #[command(flatten)]
    pub transport: TransportArgs,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub redis_url: String,
    pub password: Option<String>,
    pub channel: String,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
}

impl TransportSettings {
    /// `None` when no Redis URL is configured.
    fn resolve(
        file: &TransportSection,
        args: &TransportArgs,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>> {
        let Some(redis_url) = args
            .redis_url
            .clone()
            .or_else(|| file.redis_url.clone())
            .filter(|url| !url.trim().is_empty())
        else {
            return Ok(None);
        };
        let channel = args
            .channel
            .clone()
            .or_else(|| file.channel.clone())
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        if channel.trim().is_empty() {
            bail!("transport channel must not be empty");
        }
        let backoff = Backoff::new(
            file.reconnect_backoff_ms
                .map_or(DEFAULT_RECONNECT_BACKOFF, Duration::from_millis),
            file.reconnect_attempts.unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
        );
        let connect_timeout = file
            .connect_timeout_ms
            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis);
        if connect_timeout.is_zero() {
            bail!("connect_timeout_ms must be positive");
        }
        Ok(Some(Self {
            redis_url,
            password: env(ENV_REDIS_PASSWORD).filter(|p| !p.is_empty()),
            channel,
            backoff,
            connect_timeout,
        }))
    }

    pub fn channel_for(&self, team: &str) -> String {
        format!("{}:{team}", self.channel)
    }

    pub fn transport_for(&self, team: &str) -> Result<RedisTransport> {
        let connector =
            RedisConnector::new(&self.redis_url, self.password.as_deref(), self.connect_timeout)
                .with_context(|| format!("Invalid Redis URL {}", self.redis_url))?;
        Ok(connector.into_transport(self.channel_for(team), self.backoff))
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub listen: String,
    pub organization: String,
    pub teams: Vec<String>,
    pub polling_interval: Duration,
    pub cache_ttl: Duration,
    pub longpoll_timeout: Duration,
    pub github: GitHubConfig,
    pub transport: Option<TransportSettings>,
    pub status: StatusBody,
}

impl CollectorSettings {
    pub fn resolve(
        file: &FileConfig,
        args: &CollectorArgs,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let section = &file.collector;
        let organization = args
            .organization
            .clone()
            .or_else(|| section.organization.clone())
            .unwrap_or_default();
        if organization.trim().is_empty() {
            bail!("collector organization must be set (--organization or [collector].organization)");
        }

        let teams = if args.teams.is_empty() {
            section.teams.clone().unwrap_or_default()
        } else {
            args.teams.clone()
        };
        if teams.is_empty() {
            bail!("at least one team must be configured (--team or [collector].teams)");
        }
        if teams.iter().any(|team| team.trim().is_empty()) {
            bail!("team names must not be empty");
        }

        let polling_interval = positive_secs(
            "polling_interval_secs",
            args.polling_interval_secs
                .or(section.polling_interval_secs)
                .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS),
        )?;
        let cache_ttl = positive_secs(
            "cache_ttl_secs",
            args.cache_ttl_secs
                .or(section.cache_ttl_secs)
                .unwrap_or(DEFAULT_CACHE_TTL.as_secs()),
        )?;
        let longpoll_timeout = section
            .longpoll_timeout_secs
            .map_or(DEFAULT_LONGPOLL_TIMEOUT, Duration::from_secs);

        let github = GitHubConfig {
            api_url: section
                .github_api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            keys_url: section
                .github_keys_url
                .clone()
                .unwrap_or_else(|| DEFAULT_KEYS_URL.to_string()),
            token: env(ENV_GITHUB_TOKEN).filter(|t| !t.is_empty()),
            ..GitHubConfig::default()
        };

        Ok(Self {
            listen: args
                .listen
                .clone()
                .or_else(|| section.listen.clone())
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            organization,
            teams,
            polling_interval,
            cache_ttl,
            longpoll_timeout,
            github,
            transport: TransportSettings::resolve(&file.transport, &args.transport, env)?,
            status: StatusBody {
                status: "ok".to_string(),
                image: env(ENV_IMAGE).filter(|v| !v.is_empty()),
                git_sha: env(ENV_GIT_SHA).filter(|v| !v.is_empty()),
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub team: String,
    pub authorized_keys_path: PathBuf,
    pub mode: AgentMode,
    pub collector_url: Option<String>,
    pub recover_interval: Duration,
    pub missing_file: MissingFilePolicy,
    pub poll_timeout: Duration,
    pub transport: Option<TransportSettings>,
}

impl AgentSettings {
    pub fn resolve(
        file: &FileConfig,
        args: &AgentArgs,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let section = &file.agent;
        let team = args
            .team
            .clone()
            .or_else(|| section.team.clone())
            .unwrap_or_default();
        if team.trim().is_empty() {
            bail!("agent team must be set (--team or [agent].team)");
        }

        let authorized_keys_path = args
            .authorized_keys_path
            .clone()
            .or_else(|| section.authorized_keys_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUTHORIZED_KEYS_PATH));
        if authorized_keys_path.as_os_str().is_empty() {
            bail!("authorized_keys_path must not be empty");
        }

        let mode = args.mode.or(section.mode).unwrap_or_default();
        let collector_url = args
            .collector_url
            .clone()
            .or_else(|| section.collector_url.clone())
            .filter(|url| !url.trim().is_empty());
        let transport = TransportSettings::resolve(&file.transport, &args.transport, env)?;
        match mode {
            AgentMode::Push if transport.is_none() => {
                bail!("push mode needs a Redis URL (--redis-url or [transport].redis_url)")
            }
            AgentMode::Poll if collector_url.is_none() => {
                bail!("poll mode needs a collector URL (--collector-url or [agent].collector_url)")
            }
            _ => {}
        }

        Ok(Self {
            team,
            authorized_keys_path,
            mode,
            collector_url,
            recover_interval: positive_secs(
                "recover_interval_secs",
                args.recover_interval_secs
                    .or(section.recover_interval_secs)
                    .unwrap_or(DEFAULT_RECOVER_INTERVAL_SECS),
            )?,
            missing_file: args
                .missing_file
                .or(section.missing_file)
                .unwrap_or_default()
                .into(),
            poll_timeout: positive_secs(
                "poll_timeout_secs",
                section
                    .poll_timeout_secs
                    .unwrap_or(DEFAULT_LONGPOLL_TIMEOUT.as_secs()),
            )?,
            transport,
        })
    }
}

fn positive_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("{name} must be positive");
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const FULL: &str = r#"
[collector]
listen = "127.0.0.1:4000"
organization = "acme"
teams = ["sre", "dev"]
polling_interval_secs = 15
cache_ttl_secs = 45
longpoll_timeout_secs = 30

[transport]
redis_url = "redis://redis:6379"
reconnect_attempts = 5
reconnect_backoff_ms = 250

[agent]
team = "sre"
authorized_keys_path = "/home/deploy/.ssh/authorized_keys"
mode = "poll"
collector_url = "http://collector:4000/"
missing_file = "error"
"#;

    #[test]
    fn collector_settings_from_file() {
        let file = FileConfig::parse(FULL).unwrap();
        let env = env_of(&[(ENV_GITHUB_TOKEN, "t0k"), (ENV_GIT_SHA, "abc123")]);
        let settings = CollectorSettings::resolve(&file, &CollectorArgs::default(), &env).unwrap();

        assert_eq!(settings.listen, "127.0.0.1:4000");
        assert_eq!(settings.teams, vec!["sre", "dev"]);
        assert_eq!(settings.polling_interval, Duration::from_secs(15));
        assert_eq!(settings.cache_ttl, Duration::from_secs(45));
        assert_eq!(settings.longpoll_timeout, Duration::from_secs(30));
        assert_eq!(settings.github.token.as_deref(), Some("t0k"));
        assert_eq!(settings.status.git_sha.as_deref(), Some("abc123"));
        assert_eq!(settings.status.image, None);

        let transport = settings.transport.unwrap();
        assert_eq!(transport.channel_for("sre"), "sshkey_provider:sre");
        assert_eq!(
            transport.backoff,
            Backoff::new(Duration::from_millis(250), 5)
        );
        assert_eq!(transport.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig::parse(FULL).unwrap();
        let args = CollectorArgs {
            teams: vec!["ops".into()],
            polling_interval_secs: Some(5),
            transport: TransportArgs {
                channel: Some("keys".into()),
                ..TransportArgs::default()
            },
            ..CollectorArgs::default()
        };
        let settings = CollectorSettings::resolve(&file, &args, &env_of(&[])).unwrap();

        assert_eq!(settings.teams, vec!["ops"]);
        assert_eq!(settings.polling_interval, Duration::from_secs(5));
        assert_eq!(settings.organization, "acme");
        assert_eq!(
            settings.transport.unwrap().channel_for("ops"),
            "keys:ops"
        );
    }

    #[test]
    fn collector_requires_organization_and_teams() {
        let err = CollectorSettings::resolve(
            &FileConfig::default(),
            &CollectorArgs::default(),
            &env_of(&[]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("organization"), "{err}");

        let args = CollectorArgs {
            organization: Some("acme".into()),
            ..CollectorArgs::default()
        };
        let err = CollectorSettings::resolve(&FileConfig::default(), &args, &env_of(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("team"), "{err}");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let args = CollectorArgs {
            organization: Some("acme".into()),
            teams: vec!["sre".into()],
            polling_interval_secs: Some(0),
            ..CollectorArgs::default()
        };
        let err = CollectorSettings::resolve(&FileConfig::default(), &args, &env_of(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("polling_interval_secs"), "{err}");
    }

    #[test]
    fn agent_settings_from_file() {
        let file = FileConfig::parse(FULL).unwrap();
        let env = env_of(&[(ENV_REDIS_PASSWORD, "hunter2")]);
        let settings = AgentSettings::resolve(&file, &AgentArgs::default(), &env).unwrap();

        assert_eq!(settings.team, "sre");
        assert_eq!(settings.mode, AgentMode::Poll);
        assert_eq!(settings.missing_file, MissingFilePolicy::Error);
        assert_eq!(settings.collector_url.as_deref(), Some("http://collector:4000/"));
        assert_eq!(settings.recover_interval, Duration::from_secs(30));
        assert_eq!(settings.poll_timeout, DEFAULT_LONGPOLL_TIMEOUT);
        assert_eq!(
            settings.transport.unwrap().password.as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn agent_mode_prerequisites() {
        let push = AgentArgs {
            team: Some("sre".into()),
            ..AgentArgs::default()
        };
        let err = AgentSettings::resolve(&FileConfig::default(), &push, &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("Redis"), "{err}");

        let poll = AgentArgs {
            team: Some("sre".into()),
            mode: Some(AgentMode::Poll),
            ..AgentArgs::default()
        };
        let err = AgentSettings::resolve(&FileConfig::default(), &poll, &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("collector URL"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = FileConfig::parse("[collector]\npoling_interval_secs = 5\n").unwrap_err();
        assert!(err.to_string().contains("poling_interval_secs"), "{err}");
    }
}
