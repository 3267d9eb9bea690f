//! Shared test doubles: an in-memory channel and a scripted agent.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kapy_agent::{AgentAdapter, ChunkStream, HealthReport, SendOptions, SessionInfo, UsageInfo};
use kapy_channels::channel::Channel;
use kapy_channels::error::Result as ChannelResult;
use kapy_channels::IncomingMessage;
use kapy_core::config::{AgentCliConfig, AgentKind, KapyConfig};
use kapy_gateway::Router;

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(String),
    Edit { message_id: String, text: String },
    File { path: String, caption: String },
}

/// Channel that records everything it is asked to deliver.
pub struct FakeChannel {
    pub streaming: bool,
    pub sent: Mutex<Vec<Sent>>,
    counter: Mutex<u64>,
}

impl FakeChannel {
    pub fn new(streaming: bool) -> Self {
        Self {
            streaming,
            sent: Mutex::new(Vec::new()),
            counter: Mutex::new(0),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Sent::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn all(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn start(&self) -> ChannelResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ChannelResult<()> {
        Ok(())
    }

    async fn send_text(&self, _chat_id: &str, text: &str) -> ChannelResult<Option<String>> {
        self.sent.lock().unwrap().push(Sent::Text(text.to_string()));
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        Ok(Some(format!("m{counter}")))
    }

    async fn send_file(&self, _chat_id: &str, path: &str, caption: &str) -> ChannelResult<()> {
        self.sent.lock().unwrap().push(Sent::File {
            path: path.to_string(),
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &str) -> ChannelResult<()> {
        Ok(())
    }

    async fn edit_message(&self, _chat_id: &str, message_id: &str, text: &str) -> ChannelResult<()> {
        self.sent.lock().unwrap().push(Sent::Edit {
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Agent whose turns are scripted: each send pops the next chunk list.
pub struct FakeAgent {
    pub name: String,
    pub sessions: Mutex<HashMap<String, SessionInfo>>,
    pub scripted_chunks: Mutex<Vec<Vec<String>>>,
    pub next_usage: Mutex<Option<UsageInfo>>,
    pub last_usage: Mutex<HashMap<String, UsageInfo>>,
    pub prompts: Mutex<Vec<String>>,
    pub last_options: Mutex<Option<SendOptions>>,
    pub workspace: std::path::PathBuf,
    counter: Mutex<u32>,
}

impl FakeAgent {
    pub fn new(name: &str, workspace: &std::path::Path) -> Self {
        Self {
            name: name.to_string(),
            sessions: Mutex::new(HashMap::new()),
            scripted_chunks: Mutex::new(Vec::new()),
            next_usage: Mutex::new(None),
            last_usage: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
            workspace: workspace.to_path_buf(),
            counter: Mutex::new(0),
        }
    }

    pub fn script_turn(&self, chunks: &[&str]) {
        self.scripted_chunks
            .lock()
            .unwrap()
            .push(chunks.iter().map(|c| c.to_string()).collect());
    }

    pub fn script_usage(&self, usage: UsageInfo) {
        *self.next_usage.lock().unwrap() = Some(usage);
    }

    /// Simulate an adapter restart losing all in-memory sessions.
    pub fn forget_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[async_trait]
impl AgentAdapter for FakeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_session(
        &self,
        user_id: &str,
        chat_id: &str,
        session_id: Option<&str>,
    ) -> kapy_agent::error::Result<SessionInfo> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(sid) = session_id {
            if let Some(existing) = sessions.get_mut(sid) {
                existing.last_active = now_secs();
                return Ok(existing.clone());
            }
        }
        let sid = session_id.map(|s| s.to_string()).unwrap_or_else(|| {
            let mut counter = self.counter.lock().unwrap();
            *counter += 1;
            format!("{:08x}", 0xaabb0000u32 + *counter)
        });
        let work_dir = self.workspace.join(format!("sess_{sid}"));
        kapy_agent::workspace::init_workspace(&work_dir).unwrap();
        let info = SessionInfo {
            session_id: sid.clone(),
            agent_name: self.name.clone(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            work_dir,
            created_at: now_secs(),
            last_active: now_secs(),
            pid: None,
            is_busy: false,
        };
        sessions.insert(sid, info.clone());
        Ok(info)
    }

    fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        opts: SendOptions,
    ) -> kapy_agent::error::Result<ChunkStream> {
        if !self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(kapy_agent::AgentError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        self.prompts.lock().unwrap().push(message.to_string());
        *self.last_options.lock().unwrap() = Some(opts);
        if let Some(usage) = self.next_usage.lock().unwrap().take() {
            self.last_usage
                .lock()
                .unwrap()
                .insert(session_id.to_string(), usage);
        }
        let chunks = {
            let mut scripted = self.scripted_chunks.lock().unwrap();
            if scripted.is_empty() {
                vec!["ok".to_string()]
            } else {
                scripted.remove(0)
            }
        };
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn cancel(&self, _session_id: &str) -> kapy_agent::error::Result<()> {
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> kapy_agent::error::Result<()> {
        self.sessions.lock().unwrap().remove(session_id);
        Ok(())
    }

    fn health_check(&self, session_id: &str) -> HealthReport {
        match self.get_session_info(session_id) {
            Some(info) => HealthReport {
                alive: true,
                pid: info.pid,
                memory_mb: 0.0,
                busy: info.is_busy,
                pending_seconds: None,
            },
            None => HealthReport::dead(),
        }
    }

    fn get_last_usage(&self, session_id: &str) -> Option<UsageInfo> {
        self.last_usage.lock().unwrap().remove(session_id)
    }

    fn is_process_alive(&self, _session_id: &str) -> bool {
        false
    }

    async fn kill_process(&self, session_id: &str) {
        if let Some(info) = self.sessions.lock().unwrap().get_mut(session_id) {
            info.is_busy = false;
        }
    }
}

/// Everything a pipeline test needs, in one bundle.
pub struct Harness {
    pub router: Router,
    pub channel: Arc<FakeChannel>,
    pub agent: Arc<FakeAgent>,
    pub auth: Arc<kapy_auth::AuthManager>,
    pub sessions: Arc<kapy_sessions::SessionStore>,
    pub two_factor: Option<Arc<kapy_privileged::TwoFactorManager>>,
    pub dir: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub streaming: bool,
    pub system_mode: bool,
    pub billing: bool,
    pub two_factor_secret: Option<String>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            system_mode: false,
            billing: true,
            two_factor_secret: None,
        }
    }
}

pub fn agent_config() -> AgentCliConfig {
    AgentCliConfig {
        command: "claude".to_string(),
        kind: AgentKind::Claude,
        args_template: vec!["-p".into(), "{prompt}".into()],
        models: HashMap::from([
            ("sonnet".to_string(), "claude-sonnet-4-5".to_string()),
            ("opus".to_string(), "claude-opus-4-6".to_string()),
        ]),
        supported_params: HashMap::from([
            ("model".to_string(), "--model".to_string()),
            ("thinking".to_string(), "--thinking".to_string()),
        ]),
        default_model: Some("sonnet".to_string()),
        default_params: HashMap::new(),
        timeout_seconds: 10,
        env: HashMap::new(),
    }
}

pub fn build_harness(opts: HarnessOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = KapyConfig::default();
    config.default_agent = "claude".to_string();
    config.agents.insert("claude".to_string(), agent_config());
    config.runtime.mode = if opts.system_mode {
        "system".to_string()
    } else {
        "session".to_string()
    };
    config.runtime.instance_id = "test-main".to_string();
    config.rules_dir = dir.path().join("rules").to_string_lossy().into_owned();
    config.auth.state_file = dir.path().join("auth.json").to_string_lossy().into_owned();
    config.sessions.state_file = dir
        .path()
        .join("sessions.json")
        .to_string_lossy()
        .into_owned();
    config.two_factor.state_file = dir
        .path()
        .join("two_factor.json")
        .to_string_lossy()
        .into_owned();
    config.two_factor.enabled = opts.two_factor_secret.is_some();
    if opts.system_mode {
        config.system.socket_path = dir
            .path()
            .join("sysd.sock")
            .to_string_lossy()
            .into_owned();
    }

    let auth = Arc::new(kapy_auth::AuthManager::new(
        &config.auth.state_file,
        config.auth.rate_limit_per_minute,
    ));
    auth.add_user("123", "telegram");

    let sessions = Arc::new(kapy_sessions::SessionStore::new(
        &config.sessions.state_file,
        config.sessions.max_sessions_per_user,
    ));

    let billing = if opts.billing {
        Some(Arc::new(kapy_billing::BillingLog::new(
            dir.path().join("billing"),
        )))
    } else {
        None
    };

    let two_factor = opts.two_factor_secret.as_ref().map(|secret| {
        let manager = Arc::new(kapy_privileged::TwoFactorManager::new(&config.two_factor));
        manager.set_secret("123", secret);
        manager
    });

    let system_client = if opts.system_mode {
        Some(Arc::new(kapy_privileged::SystemServiceClient::new(
            &config.system.socket_path,
            1.0,
        )))
    } else {
        None
    };

    let agent = Arc::new(FakeAgent::new("claude", &dir.path().join("workspaces")));
    let mut agents: HashMap<String, Arc<dyn AgentAdapter>> = HashMap::new();
    agents.insert("claude".to_string(), agent.clone() as Arc<dyn AgentAdapter>);

    let channel = Arc::new(FakeChannel::new(opts.streaming));

    let router = Router::new(
        config,
        auth.clone(),
        sessions.clone(),
        agents,
        channel.clone() as Arc<dyn Channel>,
        billing,
        None,
        two_factor.clone(),
        system_client,
        None,
    );

    Harness {
        router,
        channel,
        agent,
        auth,
        sessions,
        two_factor,
        dir,
    }
}

pub fn message(text: &str) -> IncomingMessage {
    let mut m = IncomingMessage::text_message("telegram", "chat1", "123", text);
    m.sender_username = Some("alice".to_string());
    m.sender_display_name = Some("Alice".to_string());
    m
}
