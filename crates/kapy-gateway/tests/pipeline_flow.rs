//! End-to-end pipeline scenarios over fake channel/agent doubles.

mod common;

use common::{build_harness, message, HarnessOptions, Sent};
use kapy_agent::{AgentAdapter, UsageInfo};
use kapy_billing::BillingEntry;

#[tokio::test]
async fn turn_with_cost_recording() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["Hi"]);
    h.agent.script_usage(UsageInfo {
        input_tokens: 10,
        output_tokens: 5,
        cost_usd: 0.002,
        duration_ms: 500,
        model: "claude-sonnet-4-5".to_string(),
        ..Default::default()
    });

    h.router.handle_message(message("hello")).await;

    // One delivered text: the agent's reply.
    let texts = h.channel.texts();
    assert_eq!(texts, vec!["Hi".to_string()]);

    // One active session for the user.
    let sessions = h.sessions.list_user_sessions("123");
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.agent_name, "claude");
    assert_eq!(session.model.as_deref(), Some("sonnet"));

    // Billing line with cost and cumulative both 0.002.
    let billing_file = h
        .dir
        .path()
        .join("billing")
        .join(format!("{}.jsonl", session.session_id));
    let raw = std::fs::read_to_string(billing_file).unwrap();
    let entry: BillingEntry = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(entry.cost_usd, 0.002);
    assert_eq!(entry.cumulative_cost_usd, 0.002);
    assert_eq!(entry.user_id, "123");
    assert_eq!(entry.channel, "telegram");

    // Usage was popped by the billing path.
    assert!(h.agent.get_last_usage(&session.session_id).is_none());

    // History recorded both turns.
    let history = h.sessions.get_history(&session.session_id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[1].content, "Hi");
}

#[tokio::test]
async fn unauthorized_user_is_rejected() {
    let h = build_harness(HarnessOptions::default());
    let mut msg = message("hello");
    msg.user_id = "999".to_string();
    h.router.handle_message(msg).await;

    let texts = h.channel.texts();
    assert_eq!(texts, vec!["⚠️ 未授权访问".to_string()]);
    assert!(h.sessions.list_user_sessions("999").is_empty());
}

#[tokio::test]
async fn oversized_attachment_is_rejected_with_warning() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["done"]);

    let staged = h.dir.path().join("big.bin");
    std::fs::write(&staged, b"x").unwrap();
    let mut msg = message("check this");
    msg.attachments.push(kapy_channels::Attachment {
        filename: "big.bin".to_string(),
        filepath: staged.to_string_lossy().into_owned(),
        mime_type: "application/octet-stream".to_string(),
        size_bytes: 11 * 1024 * 1024,
    });

    h.router.handle_message(msg).await;

    let texts = h.channel.texts();
    let warning = texts
        .iter()
        .find(|t| t.contains("big.bin"))
        .expect("warning about the rejected attachment");
    assert!(warning.contains("11MB"));

    // The turn still proceeded, and the prompt carries no attachment block.
    let prompts = h.agent.recorded_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("附件"));
    assert!(prompts[0].contains("check this"));
}

#[tokio::test]
async fn attachment_at_limit_is_accepted_and_copied() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["done"]);

    let staged = h.dir.path().join("report.txt");
    std::fs::write(&staged, b"data").unwrap();
    let mut msg = message("see file");
    msg.attachments.push(kapy_channels::Attachment {
        filename: "report.txt".to_string(),
        filepath: staged.to_string_lossy().into_owned(),
        mime_type: "text/plain".to_string(),
        size_bytes: kapy_core::MAX_ATTACHMENT_SIZE_BYTES,
    });

    h.router.handle_message(msg).await;

    let prompts = h.agent.recorded_prompts();
    assert!(prompts[0].contains("附件:"));
    assert!(prompts[0].contains("report.txt"));

    // The file landed in the session's user/ directory.
    let session = &h.sessions.list_user_sessions("123")[0];
    let info = h.agent.get_session_info(&session.session_id).unwrap();
    assert!(info.work_dir.join("user/report.txt").is_file());
}

#[tokio::test]
async fn prompt_carries_sender_and_channel_context() {
    let h = build_harness(HarnessOptions::default());
    std::fs::create_dir_all(h.dir.path().join("rules")).unwrap();
    std::fs::write(
        h.dir.path().join("rules/telegram.md"),
        "Telegram replies are short.",
    )
    .unwrap();
    h.agent.script_turn(&["done"]);

    h.router.handle_message(message("hello there")).await;

    let prompt = &h.agent.recorded_prompts()[0];
    assert!(prompt.contains("[CHANNEL CONTEXT]"));
    assert!(prompt.contains("Telegram replies are short."));
    assert!(prompt.contains("[SENDER CONTEXT]"));
    assert!(prompt.contains("sender_username: alice"));
    assert!(prompt.ends_with("hello there"));
}

#[tokio::test]
async fn second_request_fails_fast_while_locked() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["first"]);
    h.router.handle_message(message("one")).await;

    let session = &h.sessions.list_user_sessions("123")[0];
    let deps = h.router.deps();
    let lock = deps.session_lock(&session.session_id);
    let _guard = lock.try_lock().unwrap();

    h.router.handle_message(message("two")).await;
    let texts = h.channel.texts();
    assert!(texts
        .iter()
        .any(|t| t.contains("上一个请求还在处理中")));
}

#[tokio::test]
async fn stale_session_is_recovered_with_same_id_model_params() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["first"]);
    h.router.handle_message(message("hello")).await;

    let session = h.sessions.list_user_sessions("123")[0].clone();
    h.sessions
        .update_model(&session.session_id, Some("opus".to_string()));
    h.sessions
        .update_param(&session.session_id, "thinking", "high");

    // Simulate an adapter restart losing its in-memory sessions.
    h.agent.forget_sessions();
    h.agent.script_turn(&["recovered"]);
    h.router.handle_message(message("again")).await;

    let after = h.sessions.list_user_sessions("123");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].session_id, session.session_id);
    assert_eq!(after[0].model.as_deref(), Some("opus"));
    assert_eq!(after[0].params.get("thinking").unwrap(), "high");

    // The adapter has the session again and the user saw a normal reply.
    assert!(h.agent.get_session_info(&session.session_id).is_some());
    assert!(h.channel.texts().iter().any(|t| t == "recovered"));
    assert!(!h.channel.texts().iter().any(|t| t.contains("❌")));
}

#[tokio::test]
async fn download_rejects_path_traversal() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["made a file"]);
    h.router.handle_message(message("produce output")).await;

    let session = &h.sessions.list_user_sessions("123")[0];
    let info = h.agent.get_session_info(&session.session_id).unwrap();
    std::fs::write(info.work_dir.join("ai/output.py"), "print('hi')").unwrap();

    h.router
        .handle_message(message("/download ../../../etc/passwd"))
        .await;
    assert!(h.channel.texts().iter().any(|t| t.contains("非法路径")));
    assert!(!h
        .channel
        .all()
        .iter()
        .any(|s| matches!(s, Sent::File { .. })));

    // The legitimate file still downloads.
    h.router.handle_message(message("/download output.py")).await;
    assert!(h.channel.all().iter().any(|s| matches!(
        s,
        Sent::File { caption, .. } if caption == "output.py"
    )));
}

#[tokio::test]
async fn kapy_shorthand_reaches_commands() {
    let h = build_harness(HarnessOptions::default());
    h.router.handle_message(message("kapy whoami")).await;
    let texts = h.channel.texts();
    assert!(texts.iter().any(|t| t.contains("当前身份信息")));
    assert!(texts.iter().any(|t| t.contains("mode: <code>user</code>")));
}

#[tokio::test]
async fn model_preference_is_queued_before_first_session() {
    let h = build_harness(HarnessOptions::default());
    h.router.handle_message(message("/model opus")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("下次会话生效")));

    h.agent.script_turn(&["hi"]);
    h.router.handle_message(message("hello")).await;
    let session = &h.sessions.list_user_sessions("123")[0];
    assert_eq!(session.model.as_deref(), Some("opus"));
}

#[tokio::test]
async fn sessions_and_kill_commands_use_scope_pointer() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["hi"]);
    h.router.handle_message(message("hello")).await;
    let session = h.sessions.list_user_sessions("123")[0].clone();

    h.router.handle_message(message("/sessions")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains(&session.session_id)));

    h.router.handle_message(message("/kill")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("已销毁会话")));
    assert!(h.sessions.list_user_sessions("123").is_empty());
    assert!(h.agent.get_session_info(&session.session_id).is_none());
}

#[tokio::test]
async fn unknown_slash_command_is_forwarded_to_agent() {
    let h = build_harness(HarnessOptions::default());
    h.agent.script_turn(&["agent saw it"]);
    h.router.handle_message(message("/compact now")).await;
    assert!(h.channel.texts().iter().any(|t| t == "agent saw it"));
    assert!(h.agent.recorded_prompts()[0].contains("/compact now"));
}

#[tokio::test]
async fn system_commands_disabled_in_user_mode() {
    let h = build_harness(HarnessOptions::default());
    h.router.handle_message(message("/sudo on")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("user 模式") && t.contains("系统级命令已禁用")));

    h.router.handle_message(message("/sys journal")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("/sys 指令已下线")));
}
