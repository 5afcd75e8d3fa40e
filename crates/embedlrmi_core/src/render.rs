//! HTML fragments the host page receives.

use html_escape::encode_quoted_attribute;
use serde_json::Value;

use crate::gateway::first_node;

pub mod messages {
    pub const SHOW_LRMI_DATA: &str = "Show LRMI data";
    pub const SHOW_LRMI_LINK: &str = "LRMI data";
    pub const NO_METADATA: &str = "No LRMI metadata available for this page.";
    pub const PURGE_TITLE: &str = "Purge LRMI cache";
    pub const PURGE_DESCRIPTION: &str =
        "Remove all cached LRMI metadata. Pages fetch fresh metadata on their next view.";
    pub const PURGE_BUTTON: &str = "Purge cache";
    pub const PURGE_SUCCESS: &str = "The LRMI cache has been purged.";
    pub const PURGE_UNSUPPORTED: &str =
        "The configured cache cannot enumerate its entries, so nothing was purged.";
    pub const PERMISSION_DENIED: &str = "You do not have permission to purge the LRMI cache.";
    pub const SESSION_FAILURE: &str =
        "There seems to be a problem with your login session; the action was canceled. Please try again.";
}

/// `<script type="application/ld+json">` carrying `node`.
///
/// `<`, `>` and `&` are written as JSON unicode escapes so string values cannot close the
/// script element.
pub fn json_ld_script(node: &Value) -> String {
    let mut json = String::new();
    for ch in node.to_string().chars() {
        match ch {
            '<' => json.push_str("\\u003c"),
            '>' => json.push_str("\\u003e"),
            '&' => json.push_str("\\u0026"),
            other => json.push(other),
        }
    }
    format!("<script type=\"application/ld+json\">{json}</script>")
}

/// Nested `<ul>` listing of a JSON value. Object keys and array indices become bold labels.
pub fn render_tree(value: &Value) -> String {
    let mut html = String::from("<div><ul>");
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                push_item(&mut html, key, child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                push_item(&mut html, &index.to_string(), child);
            }
        }
        scalar => {
            html.push_str("<li>");
            html.push_str(&scalar_text(scalar));
            html.push_str("</li>");
        }
    }
    html.push_str("</ul></div>");
    html
}

fn push_item(html: &mut String, label: &str, child: &Value) {
    html.push_str("<li><b>");
    html.push_str(&encode_quoted_attribute(label));
    html.push_str("</b>: ");
    if child.is_object() || child.is_array() {
        html.push_str(&render_tree(child));
    } else {
        html.push_str(&scalar_text(child));
    }
    html.push_str("</li>");
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => encode_quoted_attribute(text).into_owned(),
        other => encode_quoted_attribute(&other.to_string()).into_owned(),
    }
}

/// Body of the `action=lrmi` view.
pub fn metadata_view(payload: Option<&Value>) -> String {
    let mut html = String::from("<div class=\"lrmi-data-container\">");
    match payload.and_then(first_node) {
        Some(node) => html.push_str(&render_tree(node)),
        None => {
            html.push_str("<p>");
            html.push_str(messages::NO_METADATA);
            html.push_str("</p>");
        }
    }
    html.push_str("</div>");
    html
}

pub fn purge_form(action_url: &str, edit_token: &str) -> String {
    format!(
        "<div class=\"lrmi-purge-form\"><p>{description}</p><form method=\"post\" action=\"{action}\"><input type=\"hidden\" name=\"action\" value=\"purge\"><input type=\"hidden\" name=\"token\" value=\"{token}\"><button type=\"submit\" name=\"submit\" class=\"mw-ui-button mw-ui-progressive\">{button}</button></form></div>",
        description = encode_quoted_attribute(messages::PURGE_DESCRIPTION),
        action = encode_quoted_attribute(action_url),
        token = encode_quoted_attribute(edit_token),
        button = encode_quoted_attribute(messages::PURGE_BUTTON),
    )
}

pub fn success_box(message: &str) -> String {
    format!(
        "<div class=\"mw-message-box mw-message-box-success\">{}</div>",
        encode_quoted_attribute(message)
    )
}

pub fn error_box(message: &str) -> String {
    format!(
        "<div class=\"mw-message-box mw-message-box-error\">{}</div>",
        encode_quoted_attribute(message)
    )
}
