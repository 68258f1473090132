//! Display data formatting for Jupyter output
//!
//! Builds `display_data` MIME bundles for [`Kernel::display`].
//!
//! [`Kernel::display`]: crate::Kernel::display

use crate::content::{DisplayData, JsonObject};
use serde_json::{json, Value};

/// Plain text output
pub fn plain(text: impl Into<String>) -> DisplayData {
    let mut data = JsonObject::new();
    data.insert("text/plain".to_string(), Value::String(text.into()));
    DisplayData {
        data,
        ..Default::default()
    }
}

/// Preformatted text with an HTML rendering for notebook frontends
pub fn preformatted(text: &str) -> DisplayData {
    let mut display = plain(text);
    display.data.insert(
        "text/html".to_string(),
        Value::String(format!("<pre>{}</pre>", escape_html(text))),
    );
    display
}

/// An HTML fragment with a plain-text fallback
pub fn html(html: impl Into<String>, fallback: impl Into<String>) -> DisplayData {
    let mut display = plain(fallback);
    display
        .data
        .insert("text/html".to_string(), Value::String(html.into()));
    display
}

/// A JSON document under a custom MIME type, e.g. `application/vnd.vegalite.v5+json`
pub fn mime_json(mime_type: &str, value: Value, fallback: impl Into<String>) -> DisplayData {
    let mut display = plain(fallback);
    display.data.insert(mime_type.to_string(), value);
    display.metadata.insert(mime_type.to_string(), json!({}));
    display
}

/// Escape HTML special characters
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preformatted_has_both_renderings() {
        let display = preformatted("a < b");
        assert_eq!(display.data["text/plain"], "a < b");
        assert_eq!(display.data["text/html"], "<pre>a &lt; b</pre>");
    }

    #[test]
    fn test_mime_json() {
        let display = mime_json(
            "application/vnd.vegalite.v5+json",
            json!({"mark": "point"}),
            "Vega-Lite chart",
        );
        assert!(display.data["application/vnd.vegalite.v5+json"].is_object());
        assert!(display.data["text/plain"].is_string());
        assert!(display.metadata.contains_key("application/vnd.vegalite.v5+json"));
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            escape_html("<script>alert('xss')</script>"),
            "&lt;script&gt;alert(&#x27;xss&#x27;)&lt;/script&gt;"
        );
    }
}
