//! Transaction name normalization
//!
//! The collector hands out URL rules on every registration. They are compiled
//! once into a [`RulesEngine`] and applied in `eval_order`; a rule that fails
//! to compile rejects the whole set so a broken rule never half-applies.

use apm_common::UrlRule;
use regex::Regex;

use crate::domain::RulesError;

#[derive(Debug)]
struct CompiledRule {
    pattern: Regex,
    replacement: String,
    ignore: bool,
    terminate_chain: bool,
    each_segment: bool,
    replace_all: bool,
}

impl CompiledRule {
    /// Apply to `name`, returning the rewritten name if the rule matched.
    fn apply(&self, name: &str) -> Option<String> {
        if self.each_segment {
            let mut matched = false;
            let segments: Vec<String> = name
                .split('/')
                .map(|segment| match self.rewrite(segment) {
                    Some(rewritten) => {
                        matched = true;
                        rewritten
                    }
                    None => segment.to_string(),
                })
                .collect();
            return matched.then(|| segments.join("/"));
        }
        self.rewrite(name)
    }

    fn rewrite(&self, text: &str) -> Option<String> {
        if !self.pattern.is_match(text) {
            return None;
        }
        let rewritten = if self.replace_all {
            self.pattern.replace_all(text, self.replacement.as_str())
        } else {
            self.pattern.replace(text, self.replacement.as_str())
        };
        Some(rewritten.into_owned())
    }
}

/// Compiled, ordered set of normalization rules.
#[derive(Debug, Default)]
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
    source: Vec<UrlRule>,
}

impl RulesEngine {
    /// Compile `rules`, sorted by `eval_order` (stable for equal orders).
    ///
    /// Collector replacements use `\1`-style backreferences; they are
    /// translated to the regex crate's `${1}` syntax.
    ///
    /// # Errors
    /// Returns an error naming the first pattern that fails to compile
    pub fn new(rules: &[UrlRule]) -> Result<Self, RulesError> {
        let mut source = rules.to_vec();
        source.sort_by_key(|rule| rule.eval_order);

        let compiled = source
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.match_expression).map_err(|source| {
                    RulesError::InvalidPattern { pattern: rule.match_expression.clone(), source }
                })?;
                Ok(CompiledRule {
                    pattern,
                    replacement: translate_backrefs(&rule.replacement),
                    ignore: rule.ignore,
                    terminate_chain: rule.terminate_chain,
                    each_segment: rule.each_segment,
                    replace_all: rule.replace_all,
                })
            })
            .collect::<Result<Vec<_>, RulesError>>()?;

        Ok(Self { rules: compiled, source })
    }

    /// The rules as received, in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[UrlRule] {
        &self.source
    }

    /// Apply the rules to `name`.
    ///
    /// Returns the normalized name and whether a matching rule flagged the
    /// transaction to be ignored.
    #[must_use]
    pub fn normalize(&self, name: &str) -> (String, bool) {
        let mut current = name.to_string();
        for rule in &self.rules {
            if let Some(rewritten) = rule.apply(&current) {
                if rule.ignore {
                    return (current, true);
                }
                current = rewritten;
                if rule.terminate_chain {
                    break;
                }
            }
        }
        (current, false)
    }
}

fn translate_backrefs(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                out.push_str("${");
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    out.push(d);
                    chars.next();
                }
                out.push('}');
            }
            '$' => out.push_str("$$"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str) -> UrlRule {
        UrlRule {
            match_expression: pattern.to_string(),
            replacement: replacement.to_string(),
            ..UrlRule::default()
        }
    }

    #[test]
    fn test_empty_engine_is_identity() {
        let engine = RulesEngine::new(&[]).unwrap();
        assert_eq!(engine.normalize("/users/42"), ("/users/42".to_string(), false));
    }

    #[test]
    fn test_rules_apply_in_eval_order() {
        let mut first = rule("[0-9]+", "*");
        first.eval_order = 1;
        first.terminate_chain = false;
        first.replace_all = true;
        let mut second = rule(r"^/users/(.*)$", r"/people/\1");
        second.eval_order = 2;

        // Deliberately passed out of order
        let engine = RulesEngine::new(&[second, first]).unwrap();
        assert_eq!(engine.normalize("/users/42/posts/7").0, "/people/*/posts/*");
    }

    #[test]
    fn test_terminate_chain_stops_evaluation() {
        let first = rule("^/a", "/b");
        let second = rule("^/b", "/c");
        let engine = RulesEngine::new(&[first, second]).unwrap();
        assert_eq!(engine.normalize("/a").0, "/b");
    }

    #[test]
    fn test_ignore_rule_flags_name() {
        let mut ignore = rule("^/health", "");
        ignore.ignore = true;
        let engine = RulesEngine::new(&[ignore]).unwrap();
        assert_eq!(engine.normalize("/health"), ("/health".to_string(), true));
        assert!(!engine.normalize("/users").1);
    }

    #[test]
    fn test_each_segment_rewrites_matching_segments() {
        let mut segment = rule("^[0-9a-f]{8}$", "*");
        segment.each_segment = true;
        let engine = RulesEngine::new(&[segment]).unwrap();
        assert_eq!(engine.normalize("/orders/deadbeef/items").0, "/orders/*/items");
    }

    #[test]
    fn test_invalid_pattern_rejects_rule_set() {
        let err = RulesEngine::new(&[rule("^/ok$", "x"), rule("(unclosed", "y")]).unwrap_err();
        assert!(matches!(err, RulesError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn test_translate_backrefs() {
        assert_eq!(translate_backrefs(r"/x/\1/\12"), "/x/${1}/${12}");
        assert_eq!(translate_backrefs("$cost"), "$$cost");
    }
}
