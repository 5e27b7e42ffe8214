use crate::config::PromptRule;
use crate::error::ConfigError;
use log::debug;
use regex::Regex;

/// Answers interactive prompts seen on a trace stream
///
/// Rules are tried in order; the first matching rule's response is returned.
#[derive(Debug, Clone, Default)]
pub struct PromptResponder {
    rules: Vec<(Regex, String)>,
}

impl PromptResponder {
    /// Compile the configured rules
    pub fn new(rules: &[PromptRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.response.clone()))
                    .map_err(|e| {
                        ConfigError::ValidationError(format!(
                            "prompt pattern {:?}: {}",
                            rule.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Response to write back for `line`, if it is a prompt
    pub fn respond(&self, line: &str) -> Option<&str> {
        let (re, response) = self.rules.iter().find(|(re, _)| re.is_match(line))?;
        debug!("Prompt {:?} matched {:?}", re.as_str(), line);
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, response: &str) -> PromptRule {
        PromptRule {
            pattern: pattern.to_string(),
            response: response.to_string(),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let responder = PromptResponder::new(&[
            rule(r"(?i)password:\s*$", "secret"),
            rule(r"\(yes/no\)", "yes"),
            rule(r"yes", "never"),
        ])
        .unwrap();

        assert_eq!(responder.respond("root@box's Password: "), Some("secret"));
        assert_eq!(
            responder.respond("Are you sure you want to continue connecting (yes/no)?"),
            Some("yes")
        );
        assert_eq!(responder.respond("BOOT COMPLETE"), None);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = PromptResponder::new(&[rule("([", "x")]);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_responder() {
        let responder = PromptResponder::default();
        assert!(responder.is_empty());
        assert_eq!(responder.respond("Password:"), None);
    }
}
