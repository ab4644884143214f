//! Maps archive member paths to container destinations.
//!
//! Rules are tried in declaration order and the first match wins. A rule
//! whose `src` ends in `/` matches a directory and everything below it;
//! once such a directory has been mapped it is remembered in a
//! [`PathIndex`], so later members underneath it only need checking
//! against the rules declared before the one that mapped it.
//!
//! Patterns are globs where `*` stays within one path segment, extended
//! with `{a,b}` alternation.

use std::collections::HashMap;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::paths;
use super::template::TemplateContext;
use crate::error::BuildError;

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One `src -> dst` mapping from an archive asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveFile {
    pub src: String,
    pub dst: String,
}

/// Where a member goes when `rule_dst` is the destination of the rule that
/// matched `src`: a trailing `/` means "into this directory".
pub fn destination(src: &str, rule_dst: &str) -> Result<String, BuildError> {
    if !rule_dst.starts_with('/') {
        return Err(BuildError::config(format!(
            "destination is not absolute: {rule_dst:?}"
        )));
    }
    if rule_dst.ends_with('/') {
        return Ok(format!("{}{}", rule_dst, paths::basename(src)));
    }
    Ok(rule_dst.to_string())
}

/// A glob with `{a,b}` alternations, expanded into plain patterns.
#[derive(Debug, Clone)]
pub struct Glob {
    patterns: Vec<Pattern>,
}

impl Glob {
    pub fn new(glob: &str) -> Result<Self, glob::PatternError> {
        let patterns = expand_braces(glob)
            .iter()
            .map(|alt| Pattern::new(alt))
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// `*` and `?` never match `/`.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_with(path, MATCH))
    }

    /// Leading part of each alternative without glob metacharacters.
    fn literals(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| {
            let glob = p.as_str();
            glob.find(['*', '?', '[']).map_or(glob, |end| &glob[..end])
        })
    }
}

/// Expand the first top-level `{...}` group and recurse. Braces inside
/// `[...]` classes and unbalanced braces are literal.
fn expand_braces(glob: &str) -> Vec<String> {
    let bytes = glob.as_bytes();
    let mut class = false;
    let mut open = None;
    let mut depth = 0;
    let mut commas = Vec::new();

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'[' if !class => class = true,
            b']' if class => class = false,
            _ if class => {}
            b'{' => {
                if depth == 0 {
                    open = Some(i);
                    commas.clear();
                }
                depth += 1;
            }
            b',' if depth == 1 => commas.push(i),
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let Some(start) = open else { break };
                    let (head, tail) = (&glob[..start], &glob[i + 1..]);

                    let mut bounds = vec![start];
                    bounds.extend(&commas);
                    bounds.push(i);
                    return bounds
                        .windows(2)
                        .flat_map(|w| {
                            let alt = &glob[w[0] + 1..w[1]];
                            expand_braces(&format!("{head}{alt}{tail}"))
                        })
                        .collect();
                }
            }
            _ => {}
        }
    }

    vec![glob.to_string()]
}

enum Kind {
    Exact,
    Prefix,
}

struct Rule {
    /// Position in the declared file list.
    index: usize,
    src: String,
    glob: Glob,
    kind: Kind,
    dst: String,
}

/// Outcome of [`Resolver::resolve`] for one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Matched { dst: String, rule: usize },
    Unmatched,
    /// The rule already captured a different source in this archive.
    Conflict {
        rule: String,
        existing: String,
        candidate: String,
    },
}

pub struct Resolver {
    rules: Vec<Rule>,
    index: PathIndex,
    matched: HashMap<usize, String>,
}

impl Resolver {
    /// Template and compile `files`. Entries with an empty side are
    /// skipped with a warning; bad globs and relative destinations are
    /// configuration errors.
    pub fn new(files: &[ArchiveFile], ctx: &TemplateContext) -> Result<Self, BuildError> {
        let mut rules = Vec::with_capacity(files.len());

        for (index, file) in files.iter().enumerate() {
            let src = ctx.apply(&file.src);
            let dst = ctx.apply(&file.dst);
            if src.is_empty() || dst.is_empty() {
                warn!(src = %src, dst = %dst, "skipping invalid archive file rule");
                continue;
            }
            if !dst.starts_with('/') {
                return Err(BuildError::config(format!(
                    "destination is not absolute: {dst:?}"
                )));
            }

            let (kind, glob) = match src.strip_suffix('/') {
                Some(dir) => (Kind::Prefix, dir),
                None => (Kind::Exact, src.as_str()),
            };
            let glob = Glob::new(glob).map_err(|err| {
                BuildError::config(format!("invalid archive file pattern {src:?}: {err}"))
            })?;

            rules.push(Rule {
                index,
                src,
                glob,
                kind,
                dst,
            });
        }

        Ok(Self {
            rules,
            index: PathIndex::default(),
            matched: HashMap::new(),
        })
    }

    /// Decide where the member `name` (already normalised) goes.
    pub fn resolve(&mut self, name: &str, is_dir: bool) -> Result<Resolution, BuildError> {
        // An indexed ancestor settles the member unless a rule declared
        // before the indexed one matches it directly.
        let indexed = self.index.lookup(name);
        let limit = indexed.as_ref().map_or(usize::MAX, |(_, rule)| *rule);

        for rule in self.rules.iter().take_while(|rule| rule.index < limit) {
            let i = rule.index;
            let src = match rule.kind {
                Kind::Exact => {
                    if is_dir || !rule.glob.matches(name) {
                        continue;
                    }
                    name
                }
                Kind::Prefix => match ancestors(name).find(|a| rule.glob.matches(a)) {
                    Some(src) => src,
                    None => continue,
                },
            };

            if let Some(existing) = self.matched.get(&i) {
                if existing != src {
                    return Ok(Resolution::Conflict {
                        rule: rule.src.clone(),
                        existing: existing.clone(),
                        candidate: src.to_string(),
                    });
                }
            } else {
                self.matched.insert(i, src.to_string());
            }

            let base = destination(src, &rule.dst)?;
            let dst = if src == name {
                base.clone()
            } else {
                paths::join(&base, &name[src.len() + 1..])
            };

            if matches!(rule.kind, Kind::Prefix) && (src != name || is_dir) {
                self.index.insert(src, base, i);
            }

            return Ok(Resolution::Matched { dst, rule: i });
        }

        Ok(match indexed {
            Some((dst, rule)) => Resolution::Matched { dst, rule },
            None => Resolution::Unmatched,
        })
    }

    /// Could any rule match something below the unmatched directory `dir`?
    ///
    /// Conservative: only rules whose literal prefix rules out `dir`
    /// entirely allow the subtree to be skipped.
    pub fn may_match_under(&self, dir: &str) -> bool {
        let dir = format!("{dir}/");
        self.rules
            .iter()
            .flat_map(|rule| rule.glob.literals())
            .any(|literal| literal.starts_with(&dir) || dir.starts_with(literal))
    }
}

/// `name`, then each of its parents, stopping before the archive root.
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(name), |path| path.rsplit_once('/').map(|(parent, _)| parent))
}

/// Directory-to-destination index keyed by path segment.
#[derive(Default)]
pub struct PathIndex {
    root: Node,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    entry: Option<(String, usize)>,
}

impl PathIndex {
    pub fn insert(&mut self, dir: &str, dst: String, rule: usize) {
        let mut node = &mut self.root;
        for part in dir.split('/') {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.entry = Some((dst, rule));
    }

    /// Destination of `name` via its deepest indexed strict ancestor.
    pub fn lookup(&self, name: &str) -> Option<(String, usize)> {
        let parts: Vec<&str> = name.split('/').collect();
        let mut node = &self.root;
        let mut found = None;

        for (depth, part) in parts.iter().enumerate().take(parts.len().saturating_sub(1)) {
            match node.children.get(*part) {
                Some(child) => node = child,
                None => break,
            }
            if let Some(entry) = &node.entry {
                found = Some((entry, depth + 1));
            }
        }

        found.map(|((dst, rule), depth)| (paths::join(dst, &parts[depth..].join("/")), *rule))
    }
}
