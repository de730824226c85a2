use std::env::consts::{ARCH, OS};

use crate::tools::ToolDescriptor;

pub const TASK_CONTEXT_PLACEHOLDER: &str = "{task_context}";

/// Host facts the model needs to pick the right shortcuts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Self { os: OS.to_string(), arch: ARCH.to_string() }
    }

    pub fn is_macos(&self) -> bool {
        self.os == "macos"
    }

    pub fn primary_modifier(&self) -> &'static str {
        if self.is_macos() {
            "cmd"
        } else {
            "ctrl"
        }
    }

    pub fn launcher(&self) -> &'static str {
        match self.os.as_str() {
            "macos" => "cmd+space (Spotlight), type the app name, press enter",
            "windows" => "the Windows key, type the app name, press enter",
            _ => "the Super key to open the launcher, type the app name, press enter",
        }
    }

    fn shortcut_table(&self) -> String {
        let m = self.primary_modifier();
        let rows = [
            ("copy", format!("{m}+c")),
            ("paste", format!("{m}+v")),
            ("cut", format!("{m}+x")),
            ("undo", format!("{m}+z")),
            ("select all", format!("{m}+a")),
            ("save", format!("{m}+s")),
            ("find", format!("{m}+f")),
            ("new tab", format!("{m}+t")),
            ("close tab/window", format!("{m}+w")),
            ("address bar", format!("{m}+l")),
            (
                "switch app",
                if self.is_macos() { "cmd+tab".to_string() } else { "alt+tab".to_string() },
            ),
            (
                "quit app",
                if self.is_macos() { "cmd+q".to_string() } else { "alt+f4".to_string() },
            ),
        ];
        rows.iter().map(|(what, keys)| format!("- {what}: {keys}")).collect::<Vec<_>>().join("\n")
    }
}

const REACT_PROTOCOL: &str = "\
Work in a loop of THINK, ACT, OBSERVE:
1. THINK about what is on screen and the single next step toward the task.
2. ACT by calling exactly one tool.
3. OBSERVE the result. Take a screenshot whenever you need to see the effect.

Rules:
- Start with a screenshot. Never guess what is on screen.
- Coordinates are normalized 0-1000 across the screenshot (500,500 is the centre).
  Pixel positions from the latest screenshot also work.
- Prefer keyboard shortcuts and find_element over hunting with the mouse.
- After typing into a field, press enter or click the submit control.
- If an action fails, do not repeat it unchanged. Check Known Issues below.
- Call complete_task only after verifying the result on screen.
- Call need_help when blocked by a login, captcha, payment
  or a decision only the user can make.";

/// System prompt with a `{task_context}` slot that is filled every turn.
#[derive(Clone, Debug)]
pub struct SystemPrompt {
    template: String,
}

impl SystemPrompt {
    pub fn new(platform: &Platform, tools: &[ToolDescriptor]) -> Self {
        let tool_lines: Vec<String> =
            tools.iter().map(|t| format!("- {}", t.signature())).collect();
        let template = format!(
            "You are a computer-use agent operating a real desktop.\n\n\
             ## Platform\nOS: {os} ({arch})\nPrimary modifier: {modifier}\n\
             Open apps with: {launcher}\n\n\
             ## Common shortcuts\n{shortcuts}\n\n\
             ## Protocol\n{protocol}\n\n\
             ## Tools\n{tools}\n\n\
             # Current state\n{placeholder}",
            os = platform.os,
            arch = platform.arch,
            modifier = platform.primary_modifier(),
            launcher = platform.launcher(),
            shortcuts = platform.shortcut_table(),
            protocol = REACT_PROTOCOL,
            tools = tool_lines.join("\n"),
            placeholder = TASK_CONTEXT_PLACEHOLDER,
        );
        Self { template }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, task_context: &str) -> String {
        self.template.replace(TASK_CONTEXT_PLACEHOLDER, task_context)
    }
}
