//! Default e-mail text for delivered documents.
//!
//! Kept in one place so the wording can change without touching the
//! transport code. Callers override it through
//! [`crate::config::BatchConfigBuilder::message`].

use serde::{Deserialize, Serialize};

/// Subject line used when none is configured.
pub const DEFAULT_SUBJECT: &str = "Your PDF Document";

/// Plain-text body used when none is configured.
pub const DEFAULT_BODY: &str = "Here is your Certificate.";

/// Subject and body of every outgoing message in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self {
            subject: DEFAULT_SUBJECT.to_string(),
            body: DEFAULT_BODY.to_string(),
        }
    }
}

impl MessageTemplate {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_constants() {
        let m = MessageTemplate::default();
        assert_eq!(m.subject, DEFAULT_SUBJECT);
        assert_eq!(m.body, DEFAULT_BODY);
    }
}
