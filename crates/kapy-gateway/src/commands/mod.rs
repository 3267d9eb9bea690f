//! Gateway commands: explicit registry, no registration side effects.

mod agent_cmd;
mod file_cmd;
mod memory_cmd;
mod model_cmd;
mod session_cmd;
mod sudo_cmd;
mod sysauth_cmd;
mod utility;

use std::collections::HashMap;

use kapy_core::Result;

use crate::pipeline::Context;

/// Dispatch key for a registered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Help,
    Whoami,
    History,
    Cancel,
    Agent,
    Sessions,
    Current,
    Switch,
    Kill,
    Name,
    Model,
    Param,
    Params,
    Reset,
    Files,
    Download,
    Memory,
    Sudo,
    Sysauth,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: CommandKind,
}

/// Central store of gateway commands, populated in one initialization
/// step.
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    pub fn standard() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };
        for spec in STANDARD_COMMANDS {
            registry.register(*spec);
        }
        registry
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn list_all(&self) -> Vec<&CommandSpec> {
        let mut all: Vec<&CommandSpec> = self.commands.values().collect();
        all.sort_by_key(|s| s.name);
        all
    }
}

const STANDARD_COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "/start", description: "启动 Gateway", kind: CommandKind::Start },
    CommandSpec { name: "/help", description: "显示帮助", kind: CommandKind::Help },
    CommandSpec { name: "/whoami", description: "查看当前身份与运行模式", kind: CommandKind::Whoami },
    CommandSpec { name: "/history", description: "查看对话历史", kind: CommandKind::History },
    CommandSpec { name: "/cancel", description: "取消当前执行", kind: CommandKind::Cancel },
    CommandSpec { name: "/agent", description: "切换 agent 或查看当前 agent", kind: CommandKind::Agent },
    CommandSpec { name: "/sessions", description: "列出所有会话", kind: CommandKind::Sessions },
    CommandSpec { name: "/current", description: "查看当前会话", kind: CommandKind::Current },
    CommandSpec { name: "/switch", description: "切换到指定会话", kind: CommandKind::Switch },
    CommandSpec { name: "/kill", description: "销毁当前会话", kind: CommandKind::Kill },
    CommandSpec { name: "/name", description: "为当前会话命名", kind: CommandKind::Name },
    CommandSpec { name: "/model", description: "切换模型或查看可用模型", kind: CommandKind::Model },
    CommandSpec { name: "/param", description: "设置参数或查看可用参数", kind: CommandKind::Param },
    CommandSpec { name: "/params", description: "查看当前配置", kind: CommandKind::Params },
    CommandSpec { name: "/reset", description: "重置为默认配置", kind: CommandKind::Reset },
    CommandSpec { name: "/files", description: "列出当前会话输出文件", kind: CommandKind::Files },
    CommandSpec { name: "/download", description: "下载文件", kind: CommandKind::Download },
    CommandSpec { name: "/memory", description: "管理长期记忆", kind: CommandKind::Memory },
    CommandSpec { name: "/sudo", description: "sys 模式提权开关", kind: CommandKind::Sudo },
    CommandSpec { name: "/sysauth", description: "系统级 2FA 审批", kind: CommandKind::Sysauth },
];

/// Run the handler for a matched command.
pub async fn dispatch(kind: CommandKind, ctx: &mut Context) -> Result<()> {
    match kind {
        CommandKind::Start => utility::handle_start(ctx).await,
        CommandKind::Help => utility::handle_help(ctx).await,
        CommandKind::Whoami => utility::handle_whoami(ctx).await,
        CommandKind::History => utility::handle_history(ctx).await,
        CommandKind::Cancel => utility::handle_cancel(ctx).await,
        CommandKind::Agent => agent_cmd::handle_agent(ctx).await,
        CommandKind::Sessions => session_cmd::handle_sessions(ctx).await,
        CommandKind::Current => session_cmd::handle_current(ctx).await,
        CommandKind::Switch => session_cmd::handle_switch(ctx).await,
        CommandKind::Kill => session_cmd::handle_kill(ctx).await,
        CommandKind::Name => session_cmd::handle_name(ctx).await,
        CommandKind::Model => model_cmd::handle_model(ctx).await,
        CommandKind::Param => model_cmd::handle_param(ctx).await,
        CommandKind::Params => model_cmd::handle_params(ctx).await,
        CommandKind::Reset => model_cmd::handle_reset(ctx).await,
        CommandKind::Files => file_cmd::handle_files(ctx).await,
        CommandKind::Download => file_cmd::handle_download(ctx).await,
        CommandKind::Memory => memory_cmd::handle_memory(ctx).await,
        CommandKind::Sudo => sudo_cmd::handle_sudo(ctx).await,
        CommandKind::Sysauth => sysauth_cmd::handle_sysauth(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_resolves_by_name() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.get("/help").unwrap().kind, CommandKind::Help);
        assert_eq!(registry.get("/sudo").unwrap().kind, CommandKind::Sudo);
        assert!(registry.get("/bogus").is_none());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let registry = CommandRegistry::standard();
        let names: Vec<&str> = registry.list_all().iter().map(|s| s.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
