//! Host-side keystroke injection: turns an inbound chat message into an
//! IDE agent turn.
//!
//! The capability surface is small (focus the right window, open the
//! conversation, paste, press enter) and three OS implementations live
//! behind it. Steps are separated by short delays so the IDE's UI can
//! settle between them. The clipboard is overwritten and not restored.

use crate::error::{BridgeError, Result};
use crate::{ConversationId, ThreadId};

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Keystroke-injection capabilities, one implementation per host OS.
#[async_trait]
pub trait InputActuator: Send + Sync {
    /// Bring the IDE window whose title contains `label` to the front.
    async fn focus_window(&self, label: &str) -> Result<()>;

    /// Dispatch the IDE's open-specific-conversation command.
    async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()>;

    /// Stage `text` on the system clipboard and inject the paste
    /// chord into the focused composer input.
    async fn paste(&self, text: &str) -> Result<()>;

    /// Inject the Enter key, targeting the window labelled `label`.
    async fn press_enter(&self, label: &str) -> Result<()>;
}

/// Delivery seam consumed by the event router and the `/message` RPC.
#[async_trait]
pub trait ConversationDelivery: Send + Sync {
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        thread_id: Option<&ThreadId>,
    ) -> Result<()>;
}

/// Orchestrates the staged delivery sequence over an actuator.
pub struct MessageInjector {
    actuator: Arc<dyn InputActuator>,
    workspace_label: String,
}

impl MessageInjector {
    pub fn new(actuator: Arc<dyn InputActuator>, workspace_label: String) -> Self {
        Self {
            actuator,
            workspace_label,
        }
    }
}

#[async_trait]
impl ConversationDelivery for MessageInjector {
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        thread_id: Option<&ThreadId>,
    ) -> Result<()> {
        let staged = staged_text(text, thread_id);

        self.actuator.focus_window(&self.workspace_label).await?;
        tokio::time::sleep(Duration::from_millis(250)).await;

        self.actuator.open_conversation(conversation_id).await?;
        tokio::time::sleep(Duration::from_millis(400)).await;

        self.actuator.paste(&staged).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;

        self.actuator.press_enter(&self.workspace_label).await?;

        tracing::info!(
            conversation_id = %conversation_id,
            chars = staged.chars().count(),
            "delivered chat message into IDE conversation"
        );
        Ok(())
    }
}

/// Build the text staged on the clipboard. When the thread is known, a
/// directive block tells the agent where its reply belongs.
pub fn staged_text(text: &str, thread_id: Option<&ThreadId>) -> String {
    match thread_id {
        Some(thread_id) => format!(
            "[Discord Thread: {thread_id}]\n\n{text}\n\nWhen you are done, post your response to this Discord thread using the post_to_thread tool."
        ),
        None => text.to_owned(),
    }
}

/// The platform's actuator.
pub fn platform_actuator() -> Arc<dyn InputActuator> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacActuator)
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(WindowsActuator)
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Arc::new(LinuxActuator)
    }
}

/// Launch the IDE with a conversation deep link; shared by every OS.
async fn open_conversation_uri(conversation_id: &ConversationId) -> Result<()> {
    let uri = format!("cursor://anysphere.cursor-deeplink/composer?id={conversation_id}");
    run_checked("cursor", &["--open-url", &uri], None).await
}

/// Run a command, capture stderr, and translate accessibility refusals
/// into an actionable error.
async fn run_checked(program: &str, args: &[&str], stdin: Option<&str>) -> Result<()> {
    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::null()).stderr(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            BridgeError::TransientIo(format!("`{program}` is not installed or not on PATH"))
        } else {
            BridgeError::Io(error)
        }
    })?;

    if let Some(input) = stdin
        && let Some(mut handle) = child.stdin.take()
    {
        handle.write_all(input.as_bytes()).await?;
        drop(handle);
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_accessibility_refusal(&stderr) {
        return Err(BridgeError::AccessibilityDenied(accessibility_hint()));
    }
    Err(BridgeError::TransientIo(format!(
        "{program} exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}

fn is_accessibility_refusal(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("assistive access")
        || lowered.contains("not authorized")
        || lowered.contains("accessibility")
}

fn accessibility_hint() -> String {
    #[cfg(target_os = "macos")]
    {
        "grant the terminal Accessibility permission under System Settings → Privacy & Security → Accessibility, then retry".to_owned()
    }
    #[cfg(not(target_os = "macos"))]
    {
        "the OS refused synthetic input; check the desktop session's input-injection permissions".to_owned()
    }
}

// ── macOS ───────────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
pub struct MacActuator;

#[cfg(target_os = "macos")]
#[async_trait]
impl InputActuator for MacActuator {
    async fn focus_window(&self, label: &str) -> Result<()> {
        let script = format!(
            r#"tell application "System Events"
  tell (first process whose name is "Cursor")
    set frontmost to true
    try
      perform action "AXRaise" of (first window whose name contains "{label}")
    end try
  end tell
end tell"#,
            label = label.replace('"', "\\\"")
        );
        run_checked("osascript", &["-e", &script], None).await
    }

    async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        open_conversation_uri(conversation_id).await
    }

    async fn paste(&self, text: &str) -> Result<()> {
        run_checked("pbcopy", &[], Some(text)).await?;
        let script = r#"tell application "System Events" to keystroke "v" using command down"#;
        run_checked("osascript", &["-e", script], None).await
    }

    async fn press_enter(&self, _label: &str) -> Result<()> {
        let script = r#"tell application "System Events" to key code 36"#;
        run_checked("osascript", &["-e", script], None).await
    }
}

// ── Windows ─────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
pub struct WindowsActuator;

#[cfg(target_os = "windows")]
#[async_trait]
impl InputActuator for WindowsActuator {
    async fn focus_window(&self, label: &str) -> Result<()> {
        let script = format!(
            "(New-Object -ComObject WScript.Shell).AppActivate('{}') | Out-Null",
            label.replace('\'', "''")
        );
        run_checked("powershell", &["-NoProfile", "-Command", &script], None).await
    }

    async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        open_conversation_uri(conversation_id).await
    }

    async fn paste(&self, text: &str) -> Result<()> {
        run_checked(
            "powershell",
            &["-NoProfile", "-Command", "Set-Clipboard -Value ([Console]::In.ReadToEnd())"],
            Some(text),
        )
        .await?;
        let script = "Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('^v')";
        run_checked("powershell", &["-NoProfile", "-Command", script], None).await
    }

    async fn press_enter(&self, label: &str) -> Result<()> {
        let script = format!(
            "$shell = New-Object -ComObject WScript.Shell; $shell.AppActivate('{}') | Out-Null; Add-Type -AssemblyName System.Windows.Forms; [System.Windows.Forms.SendKeys]::SendWait('{{ENTER}}')",
            label.replace('\'', "''")
        );
        run_checked("powershell", &["-NoProfile", "-Command", &script], None).await
    }
}

// ── Linux (X11 tool chain) ──────────────────────────────────────────

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub struct LinuxActuator;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
#[async_trait]
impl InputActuator for LinuxActuator {
    async fn focus_window(&self, label: &str) -> Result<()> {
        run_checked(
            "xdotool",
            &["search", "--name", label, "windowactivate", "--sync"],
            None,
        )
        .await
    }

    async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        open_conversation_uri(conversation_id).await
    }

    async fn paste(&self, text: &str) -> Result<()> {
        run_checked("xclip", &["-selection", "clipboard"], Some(text)).await?;
        run_checked("xdotool", &["key", "--clearmodifiers", "ctrl+v"], None).await
    }

    async fn press_enter(&self, label: &str) -> Result<()> {
        run_checked(
            "xdotool",
            &["search", "--name", label, "key", "--window", "%1", "Return"],
            None,
        )
        .await
    }
}
