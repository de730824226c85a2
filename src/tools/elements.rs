use serde::Deserialize;
use serde_json::json;

use super::schema::{ParamKind, ParamSpec, ToolDescriptor};
use super::{recover, ToolContext, ToolOutcome};
use crate::coords::Point;
use crate::desktop::ElementQuery;
use crate::error::CuaError;

pub const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FindElementArgs {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl FindElementArgs {
    fn query(&self) -> ElementQuery {
        ElementQuery {
            role: self.role.clone(),
            name: self.name.clone(),
            name_contains: self.name_contains.clone(),
            title: self.title.clone(),
            max_results: self.max_results.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_RESULTS),
        }
    }

    pub fn selector_label(&self) -> String {
        let parts: Vec<String> = [
            ("role", &self.role),
            ("name", &self.name),
            ("name_contains", &self.name_contains),
            ("title", &self.title),
        ]
        .iter()
        .filter_map(|(k, v)| v.as_deref().map(|v| format!("{k}={v:?}")))
        .collect();
        parts.join(" ")
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "find_element",
        "Search the accessibility tree. Returns elements with a role, name \
         and a center_x/center_y you can pass to click as-is",
        vec![
            ParamSpec::optional("role", ParamKind::String, "Role, e.g. button, textfield, link"),
            ParamSpec::optional("name", ParamKind::String, "Exact accessible name"),
            ParamSpec::optional(
                "name_contains",
                ParamKind::String,
                "Substring of the accessible name",
            ),
            ParamSpec::optional("title", ParamKind::String, "Window or element title"),
            ParamSpec::optional("max_results", ParamKind::Integer, "Result limit")
                .with_default(json!(DEFAULT_MAX_RESULTS)),
        ],
    )
}

pub async fn find_element(
    args: &FindElementArgs,
    ctx: &ToolContext,
) -> Result<ToolOutcome, CuaError> {
    let query = args.query();
    if !query.has_selector() {
        return recover(CuaError::InvalidArguments(
            "find_element needs at least one of role, name, name_contains, title".into(),
        ));
    }
    let mut found = match ctx.scope.run(ctx.desktop.find_elements(&query)).await? {
        Ok(found) => found,
        Err(e) => return recover(e),
    };
    if found.is_empty() {
        return recover(CuaError::ElementNotFound(args.selector_label()));
    }
    found.truncate(query.max_results);
    // backends report logical screen points; the model clicks in screenshot space
    let coords = ctx.ensure_coords().await?;
    let mut elements = Vec::with_capacity(found.len());
    for el in found.iter_mut() {
        // ids are only meaningful within this response
        if el.id.is_empty() {
            el.id = nanoid::nanoid!(8);
        }
        let (cx, cy) = coords.from_logical(Point::new(el.center_x, el.center_y));
        let mut value = json!(el);
        value["center_x"] = json!(cx);
        value["center_y"] = json!(cy);
        value["screen_x"] = json!(el.center_x);
        value["screen_y"] = json!(el.center_y);
        elements.push(value);
    }
    Ok(ToolOutcome::ok(json!({
        "count": elements.len(),
        "elements": elements,
    })))
}
