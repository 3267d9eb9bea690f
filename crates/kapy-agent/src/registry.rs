//! Construction of the agent adapter map from config.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use kapy_core::config::{AgentKind, KapyConfig};
use kapy_privileged::SystemServiceClient;
use tracing::info;

use crate::adapter::AgentAdapter;
use crate::claude::ClaudeCodeAgent;
use crate::streaming::StreamingCliAgent;

/// Instantiate every configured agent adapter.
pub fn build_agents(
    config: &KapyConfig,
    system_client: Option<Arc<SystemServiceClient>>,
) -> HashMap<String, Arc<dyn AgentAdapter>> {
    let workspace_base = Path::new(&config.workspace.base_dir);
    let runtime_mode = &config.runtime.mode;
    let instance_id = &config.runtime.instance_id;
    let require_bridge = config.system.require_bridge;

    let mut agents: HashMap<String, Arc<dyn AgentAdapter>> = HashMap::new();
    for (name, agent_cfg) in &config.agents {
        let adapter: Arc<dyn AgentAdapter> = match agent_cfg.kind {
            AgentKind::Claude => Arc::new(ClaudeCodeAgent::new(
                name,
                agent_cfg.clone(),
                workspace_base,
                runtime_mode,
                instance_id,
                system_client.clone(),
                require_bridge,
            )),
            AgentKind::Codex | AgentKind::Gemini => Arc::new(StreamingCliAgent::new(
                name,
                agent_cfg.clone(),
                workspace_base,
                runtime_mode,
                instance_id,
                system_client.clone(),
                require_bridge,
            )),
        };
        info!(agent = %name, kind = ?agent_cfg.kind, "registered agent adapter");
        agents.insert(name.clone(), adapter);
    }
    agents
}
