use glob::{MatchOptions, Pattern};

// gitignore-style matching: wildcards never cross path separators
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug)]
struct Rule {
    pattern: Pattern,
    negate: bool,
    dir_only: bool,
    // slash-containing patterns match the whole relative path, others only
    // the base name
    path_match: bool,
}

/// Chart packaging ignore rules, parsed from a `.helmignore` file.
#[derive(Debug, Default)]
pub struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    /// Returns an empty rule set.
    pub fn empty() -> Self {
        Rules::default()
    }

    /// Parses ignore rules, one pattern per line. Blank lines and lines
    /// starting with `#` are skipped. A leading `!` negates a pattern, a
    /// trailing `/` restricts it to directories, and a pattern containing a
    /// `/` matches against the whole relative path.
    pub fn parse(contents: &str) -> Result<Self, errors::ParseError> {
        let mut rules = Rules::empty();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.add(line)?;
        }

        Ok(rules)
    }

    /// Adds the default rules applied to every chart.
    pub fn add_defaults(&mut self) {
        // dotfiles under templates are never packaged
        self.add("templates/.?*")
            .expect("default ignore pattern must parse");
    }

    fn add(&mut self, rule: &str) -> Result<(), errors::ParseError> {
        let (rule, negate) = match rule.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (rule, false),
        };
        let (rule, dir_only) = match rule.strip_suffix('/') {
            Some(rest) => (rest, true),
            None => (rule, false),
        };
        // a leading slash only anchors the pattern, which path matching
        // already does
        let anchored = rule.strip_prefix('/');
        let path_match = anchored.is_some() || rule.contains('/');
        let rule = anchored.unwrap_or(rule);

        let pattern = Pattern::new(rule)
            .map_err(|e| errors::ParseError::Pattern(rule.to_string(), e))?;
        self.rules.push(Rule {
            pattern,
            negate,
            dir_only,
            path_match,
        });

        Ok(())
    }

    /// Returns whether a slash-separated relative path should be ignored.
    /// The last matching rule wins.
    pub fn ignore(&self, path: &str, is_dir: bool) -> bool {
        let base = path.rsplit('/').next().unwrap_or(path);

        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let target = if rule.path_match { path } else { base };
            if rule.pattern.matches_with(target, MATCH_OPTIONS) {
                ignored = !rule.negate;
            }
        }

        ignored
    }
}

/// Errors that can occur when parsing ignore rules
pub mod errors {
    use thiserror::Error;

    /// Errors that can occur when parsing ignore rules
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum ParseError {
        /// A pattern is not a valid glob
        #[error("invalid ignore pattern {0}")]
        Pattern(String, #[source] glob::PatternError),
    }
}
