use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{recover, ToolContext, ToolOutcome};
use crate::error::CuaError;

/// Chords often open UI (launchers, menus); give it time to appear.
const KEY_SETTLE: Duration = Duration::from_millis(300);

const MODIFIERS: &[&str] = &["cmd", "ctrl", "alt", "shift"];

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TypeTextArgs {
    pub text: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct KeyPressArgs {
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

pub fn type_text_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "type_text",
        "Type text into the focused element. Works in password fields",
        vec![ParamSpec::required("text", ParamKind::String, "Text to type")],
    )
}

pub fn key_press_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "key_press",
        "Press a key, optionally with modifiers, e.g. key=\"space\" modifiers=[\"cmd\"]",
        vec![
            ParamSpec::required(
                "key",
                ParamKind::String,
                "Key name such as enter, tab, escape, a, f5, or a combo like cmd+c",
            ),
            ParamSpec::optional(
                "modifiers",
                ParamKind::Array,
                "Modifiers held during the press: cmd, ctrl, alt, shift",
            ),
        ],
    )
}

/// Lower-cases a key name and folds platform aliases onto one spelling.
pub fn canonical_key(name: &str) -> String {
    let k = name.trim().to_lowercase();
    let k = match k.as_str() {
        "return" => "enter",
        "esc" => "escape",
        "option" | "opt" => "alt",
        "command" | "meta" | "win" | "super" | "⌘" => "cmd",
        "control" => "ctrl",
        "del" => "delete",
        "bksp" => "backspace",
        "spacebar" => "space",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        other => other,
    };
    k.to_string()
}

/// Splits `key` on `+` and merges any modifiers it carried with `extra`.
/// The main key is last; modifiers keep first-seen order without repeats.
pub fn split_combo(key: &str, extra: &[String]) -> (Vec<String>, String) {
    let mut parts: Vec<String> = key
        .split('+')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(canonical_key)
        .collect();
    // "cmd++" style combos leave the plus key itself behind
    let main = if key.trim().ends_with("++") || key.trim() == "+" {
        "+".to_string()
    } else {
        parts.pop().unwrap_or_default()
    };
    let mut mods: Vec<String> = Vec::new();
    for m in extra.iter().map(|m| canonical_key(m.as_str())).chain(parts) {
        if !m.is_empty() && !mods.contains(&m) {
            mods.push(m);
        }
    }
    (mods, main)
}

pub fn combo_label(key: &str, modifiers: &[String]) -> String {
    let (mods, main) = split_combo(key, modifiers);
    let mut all = mods;
    all.push(main);
    all.join("+")
}

pub async fn type_text(args: &TypeTextArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    if args.text.is_empty() {
        return recover(CuaError::InvalidArguments("text must not be empty".into()));
    }
    match ctx.scope.run(ctx.desktop.type_text(&args.text)).await? {
        Ok(()) => Ok(ToolOutcome::ok(json!({ "typed_chars": args.text.chars().count() }))),
        Err(e) => recover(e),
    }
}

pub async fn key_press(args: &KeyPressArgs, ctx: &ToolContext) -> Result<ToolOutcome, CuaError> {
    let (mods, key) = split_combo(&args.key, &args.modifiers);
    if key.is_empty() {
        return recover(CuaError::InvalidArguments("key must not be empty".into()));
    }
    if let Some(bad) = mods.iter().find(|m| !MODIFIERS.contains(&m.as_str())) {
        return recover(CuaError::InvalidArguments(format!("unknown modifier: {bad}")));
    }

    let pressed = press_chord(&mods, &key, ctx).await;
    if let Err(e) = pressed {
        return recover(e);
    }
    if !mods.is_empty() {
        ctx.scope.sleep(KEY_SETTLE).await?;
    }
    let mut label = mods;
    label.push(key);
    Ok(ToolOutcome::ok(json!({ "pressed": label.join("+") })))
}

/// Holds modifiers in order, taps the key, releases in reverse. Held
/// modifiers are released even if a later event fails.
async fn press_chord(mods: &[String], key: &str, ctx: &ToolContext) -> Result<(), CuaError> {
    let mut held: Vec<&str> = Vec::with_capacity(mods.len());
    let mut result = Ok(());
    for m in mods {
        match ctx.scope.run(ctx.desktop.key_down(m)).await.and_then(|r| r) {
            Ok(()) => held.push(m.as_str()),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    if result.is_ok() {
        result = ctx.scope.run(ctx.desktop.key_tap(key)).await.and_then(|r| r);
    }
    for m in held.iter().rev() {
        if let Err(e) = ctx.desktop.key_up(m).await {
            warn!(key = %m, error = %e, "failed to release modifier");
        }
    }
    result
}
