use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Hard cap on a single daemon RPC request frame.
pub const MAX_REQUEST_BYTES: usize = 128 * 1024;

/// Top-level config (kapy.toml + KAPY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KapyConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Name of the agent used when a user has no preference.
    #[serde(default = "default_agent_name")]
    pub default_agent: String,
    /// Agent adapters keyed by their gateway-visible name.
    #[serde(default)]
    pub agents: HashMap<String, AgentCliConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub two_factor: TwoFactorConfig,
    #[serde(default)]
    pub sudo: SudoConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub formatter: FormatterConfig,
    #[serde(default = "default_rules_dir")]
    pub rules_dir: String,
}

impl Default for KapyConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            workspace: WorkspaceConfig::default(),
            default_agent: default_agent_name(),
            agents: HashMap::new(),
            auth: AuthConfig::default(),
            sessions: SessionsConfig::default(),
            billing: BillingConfig::default(),
            memory: MemoryConfig::default(),
            two_factor: TwoFactorConfig::default(),
            sudo: SudoConfig::default(),
            system: SystemConfig::default(),
            formatter: FormatterConfig::default(),
            rules_dir: default_rules_dir(),
        }
    }
}

impl KapyConfig {
    /// Load from an explicit path, falling back to `./kapy.toml`,
    /// then apply `KAPY_*` environment overrides (`__` separates sections).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = path.unwrap_or("kapy.toml");
        Figment::from(Toml::file(file))
            .merge(Env::prefixed("KAPY_").split("__"))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// `session` (user-facing) or `system` (privileged deployment).
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Stable identifier of this gateway instance (e.g. `user-main`, `ops-a`).
    #[serde(default = "default_instance")]
    pub instance_id: String,
    /// Resolved at startup from `.runtime-version` / env; not set in TOML.
    #[serde(default)]
    pub version: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            instance_id: default_instance(),
            version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for per-session agent workspaces.
    #[serde(default = "default_workspace_base")]
    pub base_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: default_workspace_base(),
        }
    }
}

/// Which concrete adapter shape drives a configured agent binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// One-shot JSON output (`claude -p … --output-format json`).
    Claude,
    /// Line-streaming CLI with `--skip-git-repo-check` handling.
    #[default]
    Codex,
    /// Line-streaming CLI with approval-mode/sandbox flag handling.
    Gemini,
}

/// Typed record replacing the original's free-form agent config dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCliConfig {
    pub command: String,
    #[serde(default)]
    pub kind: AgentKind,
    /// Argument template; `{prompt}` and `{session_id}` are substituted.
    #[serde(default)]
    pub args_template: Vec<String>,
    /// Model alias -> full model name.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Supported param key -> CLI flag.
    #[serde(default)]
    pub supported_params: HashMap<String, String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_params: HashMap<String, String>,
    /// Wall-clock limit per invocation.
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
    /// Extra environment for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_state")]
    pub state_file: String,
    /// Max requests per user in a sliding 60s window; 0 disables.
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            state_file: default_auth_state(),
            rate_limit_per_minute: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_sessions_state")]
    pub state_file: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
    /// 0 disables stale-session cleanup.
    #[serde(default)]
    pub cleanup_inactive_after_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            state_file: default_sessions_state(),
            max_sessions_per_user: default_max_sessions(),
            cleanup_inactive_after_hours: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_billing_dir")]
    pub dir: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_billing_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_db")]
    pub db_path: String,
    #[serde(default)]
    pub tiers: MemoryTierConfig,
    #[serde(default)]
    pub retrieval: MemoryRetrievalConfig,
    #[serde(default)]
    pub capture: MemoryCaptureConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub env_probe: EnvProbeConfig,
    #[serde(default = "default_true")]
    pub reject_sensitive: bool,
    #[serde(default = "default_domain")]
    pub default_domain: String,
    #[serde(default = "default_topic")]
    pub default_topic: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_memory_db(),
            tiers: MemoryTierConfig::default(),
            retrieval: MemoryRetrievalConfig::default(),
            capture: MemoryCaptureConfig::default(),
            embedding: EmbeddingConfig::default(),
            env_probe: EnvProbeConfig::default(),
            reject_sensitive: true,
            default_domain: default_domain(),
            default_topic: default_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    #[serde(default = "default_promote_short")]
    pub promote_hits_short_to_mid: u32,
    #[serde(default = "default_promote_mid")]
    pub promote_hits_mid_to_long: u32,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            promote_hits_short_to_mid: default_promote_short(),
            promote_hits_mid_to_long: default_promote_mid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_context_chars")]
    pub context_char_limit: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
}

impl Default for MemoryRetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_char_limit: default_context_chars(),
            min_similarity: default_min_similarity(),
            candidate_limit: default_candidate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCaptureConfig {
    #[serde(default = "default_true")]
    pub enabled_auto: bool,
    #[serde(default = "default_capture_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_capture_chars")]
    pub assistant_max_chars: usize,
}

impl Default for MemoryCaptureConfig {
    fn default() -> Self {
        Self {
            enabled_auto: true,
            max_content_chars: default_capture_chars(),
            assistant_max_chars: default_capture_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_embed_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embed_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_embed_dims")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_embed_endpoint(),
            model: default_embed_model(),
            api_key_env: default_embed_key_env(),
            timeout_seconds: default_embed_timeout(),
            dimensions: default_embed_dims(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvProbeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_probe_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_probe_chars")]
    pub max_output_chars: usize,
    /// Each entry is an argv vector.
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_challenge_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_valid_window")]
    pub valid_window: i64,
    #[serde(default = "default_totp_period")]
    pub period_seconds: u64,
    #[serde(default = "default_totp_digits")]
    pub digits: u32,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_two_factor_state")]
    pub state_file: String,
    /// Chat-scoped grace window after a successful approval.
    #[serde(default = "default_grace")]
    pub approval_grace_seconds: u64,
    /// Enrollment session lifetime.
    #[serde(default = "default_enroll_ttl")]
    pub enrollment_ttl_seconds: u64,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: default_challenge_ttl(),
            valid_window: default_valid_window(),
            period_seconds: default_totp_period(),
            digits: default_totp_digits(),
            issuer: default_issuer(),
            state_file: default_two_factor_state(),
            approval_grace_seconds: default_grace(),
            enrollment_ttl_seconds: default_enroll_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SudoConfig {
    #[serde(default = "default_grace")]
    pub ttl_seconds: u64,
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Unix socket of the privileged daemon. Empty disables the bridge.
    #[serde(default)]
    pub socket_path: String,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_seconds: f64,
    /// When true, agent invocations must go through the daemon (fail closed).
    #[serde(default)]
    pub require_bridge: bool,
    #[serde(default)]
    pub grant: GrantConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            client_timeout_seconds: default_client_timeout(),
            require_bridge: false,
            grant: GrantConfig::default(),
            executor: ExecutorConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_grant_ttl")]
    pub ttl_seconds: u64,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_seconds: default_grant_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_read")]
    pub max_read_bytes: usize,
    #[serde(default = "default_max_journal")]
    pub max_journal_lines: usize,
    #[serde(default = "default_max_docker")]
    pub max_docker_output_bytes: usize,
    #[serde(default = "default_cron_dir")]
    pub cron_dir: String,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_docker_subcommands")]
    pub docker_allowed_subcommands: Vec<String>,
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_read_paths: Vec<String>,
    #[serde(default = "default_write_paths")]
    pub write_allowed_paths: Vec<String>,
    #[serde(default)]
    pub agent_cli: AgentCliExecConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_read_bytes: default_max_read(),
            max_journal_lines: default_max_journal(),
            max_docker_output_bytes: default_max_docker(),
            cron_dir: default_cron_dir(),
            docker_bin: default_docker_bin(),
            docker_allowed_subcommands: default_docker_subcommands(),
            sensitive_read_paths: default_sensitive_paths(),
            write_allowed_paths: default_write_paths(),
            agent_cli: AgentCliExecConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentCliExecConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub run_as_uid: Option<u32>,
    #[serde(default)]
    pub run_as_gid: Option<u32>,
    #[serde(default)]
    pub workspace_parent: String,
    #[serde(default)]
    pub home_parent: String,
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub bwrap: BwrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BwrapConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_bwrap_cmd")]
    pub command: String,
    #[serde(default = "default_true")]
    pub share_network: bool,
    #[serde(default)]
    pub readonly_paths: Vec<String>,
    #[serde(default)]
    pub extra_writable_paths: Vec<String>,
}

impl Default for BwrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            command: default_bwrap_cmd(),
            share_network: true,
            readonly_paths: Vec::new(),
            extra_writable_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub allowed_peer_uids: Vec<u32>,
    #[serde(default)]
    pub allowed_peer_units: Vec<String>,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default)]
    pub require_grant_for_all_ops: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    /// Octal string, e.g. `"0660"`.
    #[serde(default)]
    pub socket_mode: Option<String>,
    #[serde(default)]
    pub socket_uid: Option<u32>,
    #[serde(default)]
    pub socket_gid: Option<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            allowed_peer_uids: Vec::new(),
            allowed_peer_units: Vec::new(),
            max_request_bytes: default_max_request_bytes(),
            require_grant_for_all_ops: false,
            request_timeout_seconds: default_request_timeout(),
            socket_mode: None,
            socket_uid: None,
            socket_gid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatterConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_mode() -> String {
    "session".to_string()
}
fn default_instance() -> String {
    "default".to_string()
}
fn default_agent_name() -> String {
    "codex".to_string()
}
fn default_rules_dir() -> String {
    "./rules".to_string()
}
fn default_workspace_base() -> String {
    "./data/workspaces".to_string()
}
fn default_agent_timeout() -> u64 {
    300
}
fn default_auth_state() -> String {
    "./data/auth.json".to_string()
}
fn default_sessions_state() -> String {
    "./data/sessions.json".to_string()
}
fn default_max_sessions() -> usize {
    5
}
fn default_billing_dir() -> String {
    "./data/billing".to_string()
}
fn default_memory_db() -> String {
    "./data/memory.db".to_string()
}
fn default_promote_short() -> u32 {
    3
}
fn default_promote_mid() -> u32 {
    8
}
fn default_top_k() -> usize {
    6
}
fn default_context_chars() -> usize {
    1800
}
fn default_min_similarity() -> f64 {
    0.2
}
fn default_candidate_limit() -> usize {
    64
}
fn default_capture_chars() -> usize {
    2000
}
fn default_domain() -> String {
    "general".to_string()
}
fn default_topic() -> String {
    "misc".to_string()
}
fn default_embed_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embed_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embed_timeout() -> f64 {
    10.0
}
fn default_embed_dims() -> usize {
    1536
}
fn default_probe_interval() -> u64 {
    3600
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_probe_chars() -> usize {
    1000
}
fn default_challenge_ttl() -> u64 {
    300
}
fn default_valid_window() -> i64 {
    1
}
fn default_totp_period() -> u64 {
    30
}
fn default_totp_digits() -> u32 {
    6
}
fn default_issuer() -> String {
    "CLI Gateway".to_string()
}
fn default_two_factor_state() -> String {
    "./data/two_factor.json".to_string()
}
fn default_grace() -> u64 {
    600
}
fn default_enroll_ttl() -> u64 {
    600
}
fn default_client_timeout() -> f64 {
    10.0
}
fn default_grant_ttl() -> u64 {
    60
}
fn default_max_read() -> usize {
    65536
}
fn default_max_journal() -> usize {
    300
}
fn default_max_docker() -> usize {
    200_000
}
fn default_cron_dir() -> String {
    "/etc/cron.d".to_string()
}
fn default_docker_bin() -> String {
    "docker".to_string()
}
fn default_docker_subcommands() -> Vec<String> {
    ["ps", "logs", "inspect", "images", "stats", "restart", "compose"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_sensitive_paths() -> Vec<String> {
    [
        "/etc/shadow",
        "/etc/sudoers",
        "/etc/ssh",
        "/root",
        "/home",
        "/var/lib/docker",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_write_paths() -> Vec<String> {
    ["/etc", "/opt", "/data", "/var", "/usr/local/etc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_bwrap_cmd() -> String {
    "bwrap".to_string()
}
fn default_max_request_bytes() -> usize {
    MAX_REQUEST_BYTES
}
fn default_request_timeout() -> f64 {
    15.0
}
fn default_max_message_length() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_session_mode() {
        let cfg = KapyConfig::default();
        assert_eq!(cfg.runtime.mode, "session");
        assert_eq!(cfg.sessions.max_sessions_per_user, 5);
        assert_eq!(cfg.two_factor.digits, 6);
        assert_eq!(cfg.system.grant.ttl_seconds, 60);
    }

    #[test]
    fn agent_config_parses_from_toml() {
        let toml = r#"
            default_agent = "claude"

            [agents.claude]
            command = "claude"
            kind = "claude"
            args_template = ["-p", "{prompt}", "--output-format", "json"]
            default_model = "sonnet"
            timeout_seconds = 120

            [agents.claude.models]
            sonnet = "claude-sonnet-4-5"
            opus = "claude-opus-4-6"

            [agents.claude.supported_params]
            model = "--model"
            thinking = "--thinking"
        "#;
        let cfg: KapyConfig = Figment::from(Toml::string(toml)).extract().unwrap();
        let claude = cfg.agents.get("claude").unwrap();
        assert_eq!(claude.kind, AgentKind::Claude);
        assert_eq!(claude.timeout_seconds, 120);
        assert_eq!(claude.models.get("opus").unwrap(), "claude-opus-4-6");
    }
}
