//! Sudo window flow: 2FA challenge, code reply, window lifecycle.

mod common;

use common::{build_harness, message, HarnessOptions};

const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

fn system_harness() -> common::Harness {
    let h = build_harness(HarnessOptions {
        system_mode: true,
        two_factor_secret: Some(SECRET.to_string()),
        ..Default::default()
    });
    h.auth.add_system_admin("123");
    h
}

fn current_code() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    kapy_privileged::totp::totp_code(SECRET, now, 30, 6).unwrap()
}

#[tokio::test]
async fn sudo_on_with_correct_code_opens_window() {
    let h = system_harness();

    h.router.handle_message(message("/sudo on")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("sudo on 需要 2FA 验证")));

    // The next message is the 6-digit code; the middleware replays the
    // stored command with the approved challenge.
    h.router.handle_message(message(&current_code())).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("✅ sudo 已开启")));

    // The window is visible via /sudo status and /whoami.
    h.router.handle_message(message("/sudo status")).await;
    assert!(h.channel.texts().iter().any(|t| t.contains("on (剩余")));

    h.router.handle_message(message("/whoami")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("sudo: <code>on</code>")));

    // Subsequent agent turns run with the root flag.
    h.agent.script_turn(&["done"]);
    h.router.handle_message(message("restart the service")).await;
    let opts = h.agent.last_options.lock().unwrap().clone().unwrap();
    assert!(opts.run_as_root);

    // /sudo off closes the window.
    h.router.handle_message(message("/sudo off")).await;
    assert!(h.channel.texts().iter().any(|t| t.contains("✅ sudo 已关闭")));
    h.agent.script_turn(&["done"]);
    h.router.handle_message(message("another task")).await;
    let opts = h.agent.last_options.lock().unwrap().clone().unwrap();
    assert!(!opts.run_as_root);
}

#[tokio::test]
async fn non_code_reply_clears_pending_state() {
    let h = system_harness();

    h.router.handle_message(message("/sudo on")).await;
    h.router
        .handle_message(message("actually never mind"))
        .await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("本次只接受 6 位验证码输入")));

    // Pending state is gone: the code now arrives as a plain message and
    // reaches the agent instead of the 2FA middleware.
    let manager = h.two_factor.clone().unwrap();
    assert!(manager.get_pending_approval_input("123").is_none());

    h.agent.script_turn(&["plain"]);
    h.router.handle_message(message(&current_code())).await;
    assert!(h.channel.texts().iter().any(|t| t == "plain"));
    assert!(!h.sessions.list_user_sessions("123").is_empty());
}

#[tokio::test]
async fn wrong_code_fails_the_approval() {
    let h = system_harness();
    h.router.handle_message(message("/sudo on")).await;

    // A syntactically valid but wrong code fails verification.
    let code = current_code();
    let wrong = if code == "000000" { "000001" } else { "000000" };
    h.router.handle_message(message(wrong)).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("2FA 验证失败") && t.contains("totp_code_invalid")));

    // The pending window is still armed after a wrong code; a non-code
    // message ends it, then status reports sudo off.
    h.router.handle_message(message("abort")).await;
    h.router.handle_message(message("/sudo status")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("当前 sudo: <code>off</code>")));
}

#[tokio::test]
async fn sudo_requires_system_admin() {
    let h = build_harness(HarnessOptions {
        system_mode: true,
        two_factor_secret: Some(SECRET.to_string()),
        ..Default::default()
    });
    // "123" is allowed but not a system admin.
    h.router.handle_message(message("/sudo on")).await;
    assert!(h
        .channel
        .texts()
        .iter()
        .any(|t| t.contains("仅 system_admin 可执行系统级命令")));
}
