//! Unified diagnostic log format: [shellmux][component] key=value ...

const CONTENT_LOG_MAX_LEN: usize = 120;

/// Log prefix for a component, e.g. `[shellmux][sandbox]`.
#[inline]
pub fn prefix(component: &str) -> String {
    format!("[shellmux][{}]", component)
}

/// Truncate content for logging (avoid huge dumps of terminal output).
#[inline]
pub fn truncate_content(content: &str, max_len: usize) -> std::borrow::Cow<'_, str> {
    if content.len() <= max_len {
        std::borrow::Cow::Borrowed(content)
    } else {
        std::borrow::Cow::Owned(format!("{}... ({} bytes)", &content[..max_len], content.len()))
    }
}

#[inline]
pub fn truncate_content_default(content: &str) -> std::borrow::Cow<'_, str> {
    truncate_content(content, CONTENT_LOG_MAX_LEN)
}
