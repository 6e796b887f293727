//! Ordered regex tables that pull candidate identifiers out of free text.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One configured pattern.
///
/// In TOML a bare string is accepted; the identifier is then taken from
/// capture group 1 when the pattern has one, else from the whole match.
/// The table form names the group explicitly:
/// `{ pattern = "KEY=(\\w+)", group = 1 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternDef {
    Plain(String),
    Rule {
        pattern: String,
        #[serde(default)]
        group: Option<usize>,
    },
}

impl PatternDef {
    pub fn pattern(&self) -> &str {
        match self {
            Self::Plain(p) | Self::Rule { pattern: p, .. } => p,
        }
    }

    fn group(&self) -> Option<usize> {
        match self {
            Self::Plain(_) => None,
            Self::Rule { group, .. } => *group,
        }
    }
}

/// A single extracted identifier and the pattern that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub pattern: &'a str,
    pub identifier: String,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
    group: usize,
}

/// An ordered, compiled list of patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

impl PatternSet {
    pub fn compile(defs: &[PatternDef], case_insensitive: bool) -> Result<Self, ConfigError> {
        let mut patterns = Vec::with_capacity(defs.len());
        for def in defs {
            let regex = RegexBuilder::new(def.pattern())
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: def.pattern().to_string(),
                    message: e.to_string(),
                })?;

            let groups = regex.captures_len() - 1;
            let group = match def.group() {
                Some(g) if g > groups => {
                    return Err(ConfigError::InvalidPattern {
                        pattern: def.pattern().to_string(),
                        message: format!("capture group {g} does not exist ({groups} defined)"),
                    });
                }
                Some(g) => g,
                None => usize::from(groups > 0),
            };

            patterns.push(CompiledPattern {
                source: def.pattern().to_string(),
                regex,
                group,
            });
        }
        Ok(Self { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Every match of every pattern, in pattern order then match order.
    ///
    /// Duplicates are kept. A pattern whose identifier group did not
    /// participate in a match contributes nothing for that match.
    pub fn extract(&self, text: Option<&str>) -> Vec<Candidate<'_>> {
        let text = text.unwrap_or_default();
        if text.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for p in &self.patterns {
            for caps in p.regex.captures_iter(text) {
                if let Some(m) = caps.get(p.group) {
                    out.push(Candidate {
                        pattern: &p.source,
                        identifier: m.as_str().to_string(),
                    });
                }
            }
        }
        out
    }

    /// Identifiers only, deduplicated, first occurrence wins.
    pub fn unique_identifiers(&self, text: Option<&str>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.extract(text)
            .into_iter()
            .filter_map(|c| seen.insert(c.identifier.clone()).then_some(c.identifier))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> PatternSet {
        let defs: Vec<_> = patterns
            .iter()
            .map(|p| PatternDef::Plain((*p).to_string()))
            .collect();
        PatternSet::compile(&defs, false).unwrap()
    }

    #[test]
    fn duplicate_mentions_are_kept() {
        let s = set(&[r"[A-Z]+-\d+"]);
        let found = s.extract(Some("See PROJ-42 and also PROJ-42 again"));
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.identifier == "PROJ-42"));
    }

    #[test]
    fn absent_and_empty_text_yield_nothing() {
        let s = set(&[r"[A-Z]+-\d+"]);
        assert!(s.extract(None).is_empty());
        assert!(s.extract(Some("")).is_empty());
    }

    #[test]
    fn pattern_order_then_match_order() {
        let s = set(&[r"GH[:\s]+#?(\d+)", r"#(\d+)"]);
        let found = s.extract(Some("fixes #7, see GH: #9"));
        let ids: Vec<_> = found.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["9", "7", "9"]);
        assert_eq!(found[0].pattern, r"GH[:\s]+#?(\d+)");
    }

    #[test]
    fn capture_group_defaults() {
        let s = set(&[r"JIRA[:\s]+([A-Z]+-\d+)"]);
        let found = s.extract(Some("JIRA: OPS-12"));
        assert_eq!(found[0].identifier, "OPS-12");

        let explicit = PatternSet::compile(
            &[PatternDef::Rule {
                pattern: r"(KEY)=(\w+-\d+)".into(),
                group: Some(2),
            }],
            false,
        )
        .unwrap();
        assert_eq!(
            explicit.extract(Some("KEY=AB-1"))[0].identifier,
            "AB-1"
        );
    }

    #[test]
    fn missing_group_is_invalid() {
        let err = PatternSet::compile(
            &[PatternDef::Rule {
                pattern: r"[A-Z]+".into(),
                group: Some(1),
            }],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn case_insensitive_technologies() {
        let s = PatternSet::compile(
            &[PatternDef::Plain(r"\b(kubernetes|helm)\b".into())],
            true,
        )
        .unwrap();
        let ids: Vec<_> = s
            .extract(Some("Kubernetes and HELM charts"))
            .into_iter()
            .map(|c| c.identifier)
            .collect();
        assert_eq!(ids, vec!["Kubernetes", "HELM"]);
    }

    #[test]
    fn unique_identifiers_keeps_first_order() {
        let s = set(&[r"[A-Z]+-\d+"]);
        assert_eq!(
            s.unique_identifiers(Some("B-2 A-1 B-2")),
            vec!["B-2".to_string(), "A-1".to_string()]
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn every_inserted_key_is_found(
                numbers in proptest::collection::vec(1u32..100_000, 0..10),
                filler in "[a-z ]{0,20}",
            ) {
                let text = numbers
                    .iter()
                    .map(|n| format!("PROJ-{n}"))
                    .collect::<Vec<_>>()
                    .join(&format!(" {filler} "));
                let s = set(&[r"[A-Z]+-\d+"]);
                let found: Vec<_> = s.extract(Some(&text)).into_iter().map(|c| c.identifier).collect();
                let expected: Vec<_> = numbers.iter().map(|n| format!("PROJ-{n}")).collect();
                prop_assert_eq!(found, expected);
            }

            #[test]
            fn extraction_is_deterministic(text in ".{0,200}") {
                let s = set(&[r"[A-Z]+-\d+", r"#(\d+)"]);
                prop_assert_eq!(s.extract(Some(&text)), s.extract(Some(&text)));
            }

            #[test]
            fn lowercase_text_has_no_keys(text in "[a-z0-9 #-]{0,100}") {
                let s = set(&[r"[A-Z]+-\d+"]);
                prop_assert!(s.extract(Some(&text)).is_empty());
            }
        }
    }
}
