//! A small, self-contained gitignore-style matcher.
//!
//! Rules (matching the subset of gitignore syntax this tool commits to):
//!
//! - A blank line or a line starting with `#` is ignored.
//! - A leading `!` negates the pattern: a previously-ignored path becomes
//!   un-ignored again if it also matches a later negated pattern.
//! - A trailing `/` restricts the pattern to directories only.
//! - A pattern containing a `/` anywhere but at the end is anchored to the
//!   directory the `.gitignore` file lives in; a pattern with no `/` (other
//!   than a possible trailing one) matches at any depth.
//! - `*` matches any run of characters except `/`.
//! - `**/` matches zero or more whole path segments.
//! - A literal `/` at the very start anchors to the root explicitly (same
//!   effect as containing a `/` in the middle, since gitignore treats a
//!   leading slash as anchoring too).
//!
//! `.gitignore` files are loaded lazily, one per directory, as a walk
//! descends into it; a rule's anchoring is always resolved relative to the
//! directory its `.gitignore` lives in, not the walk's root, so a nested
//! `/dist` pattern only excludes `dist` directly under *that* directory.
//!
//! Patterns are translated to `regex::Regex` once at load time and then
//! reused for every path tested against them.

use std::fs;
use std::path::Path;

use anyhow::Result;
use regex::Regex;

#[derive(Debug, Clone)]
struct Rule {
    /// The directory (relative to the walk root, `/`-separated, `""` for
    /// the root) whose `.gitignore` declared this rule. A rule only
    /// applies to paths within this directory's own subtree.
    owner_dir: String,
    regex: Regex,
    negate: bool,
    dir_only: bool,
}

/// Holds every ignore rule accumulated so far while descending a tree, in
/// load order (later rules win, matching gitignore's override semantics,
/// and a nested `.gitignore`'s rules are loaded after its ancestors' and so
/// take precedence over them).
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    pub fn new() -> Self {
        IgnoreMatcher { rules: Vec::new() }
    }

    /// Seeds a fixed set of defaults nozem always excludes regardless of
    /// `.gitignore` content (`.git`, `node_modules`, the build cache
    /// sidecar). `dir`'s own `.gitignore` is not read here: a walk starting
    /// at `dir` loads it on its first descent, same as every other
    /// directory it visits.
    pub fn from_root(_dir: &Path) -> Result<Self> {
        let mut matcher = IgnoreMatcher::new();
        matcher.add_pattern_at("", ".git")?;
        matcher.add_pattern_at("", "node_modules")?;
        matcher.add_pattern_at("", ".nzm-buildcache")?;
        Ok(matcher)
    }

    /// Reads `dir`'s own `.gitignore` (if any) and appends its rules,
    /// anchored to `owner_dir` (`dir`'s path relative to the walk root).
    /// Called once per directory as a walk descends into it.
    pub fn load_dir(&mut self, dir: &Path, owner_dir: &str) -> Result<()> {
        let gitignore = dir.join(".gitignore");
        if gitignore.is_file() {
            let contents = fs::read_to_string(&gitignore)?;
            self.add_patterns_at(owner_dir, &contents)?;
        }
        Ok(())
    }

    /// Returns a clone of this matcher with `dir`'s own `.gitignore` (if
    /// any) layered on top, for handing to a recursive descent into a
    /// child directory without mutating the caller's matcher.
    pub fn descend(&self, dir: &Path, owner_dir: &str) -> Result<IgnoreMatcher> {
        let mut child = self.clone();
        child.load_dir(dir, owner_dir)?;
        Ok(child)
    }

    /// Adds patterns anchored to the walk root (`owner_dir = ""`), for
    /// non-`.gitignore`-derived rules such as a unit's declared
    /// `nonSources`/`nonArtifacts`/`extractPatterns` lists.
    pub fn add_patterns(&mut self, contents: &str) -> Result<()> {
        self.add_patterns_at("", contents)
    }

    fn add_patterns_at(&mut self, owner_dir: &str, contents: &str) -> Result<()> {
        for line in contents.lines() {
            let trimmed = line.trim_end();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            self.add_pattern_at(owner_dir, trimmed)?;
        }
        Ok(())
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        self.add_pattern_at("", pattern)
    }

    fn add_pattern_at(&mut self, owner_dir: &str, pattern: &str) -> Result<()> {
        let mut pattern = pattern;
        let negate = pattern.starts_with('!');
        if negate {
            pattern = &pattern[1..];
        }
        let dir_only = pattern.ends_with('/');
        let mut core = pattern.trim_end_matches('/').to_string();
        let anchored = core.contains('/');
        if let Some(stripped) = core.strip_prefix('/') {
            core = stripped.to_string();
        }
        let regex_str = glob_to_regex(&core, anchored);
        let regex = Regex::new(&regex_str)?;
        self.rules.push(Rule {
            owner_dir: owner_dir.to_string(),
            regex,
            negate,
            dir_only,
        });
        Ok(())
    }

    /// Returns whether `rel` (relative to the walk root, always using `/`
    /// separators) should be excluded. `is_dir` distinguishes
    /// directory-only patterns. Only rules whose `owner_dir` is an
    /// ancestor of `rel` apply; among those, the last matching rule wins.
    pub fn is_ignored(&self, rel: &Path, is_dir: bool) -> bool {
        let normalized = rel.to_string_lossy().replace('\\', "/");
        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let Some(local) = strip_owner(&normalized, &rule.owner_dir) else {
                continue;
            };
            if rule.regex.is_match(local) {
                ignored = !rule.negate;
            }
        }
        ignored
    }
}

/// Returns `path` made relative to `owner_dir` if `path` lies within it
/// (or `owner_dir` is the root, `""`), else `None`.
fn strip_owner<'a>(path: &'a str, owner_dir: &str) -> Option<&'a str> {
    if owner_dir.is_empty() {
        return Some(path);
    }
    path.strip_prefix(owner_dir).and_then(|rest| rest.strip_prefix('/'))
}

/// Translates a gitignore-subset glob into an anchored regex string.
///
/// `*` -> `[^/]*`, `**/` -> `(?:.*/)?`, everything else is escaped
/// literally. If the original pattern contained no `/` (before trimming a
/// trailing one), it is allowed to match starting at any path segment,
/// otherwise it must match from the start of the relative path.
fn glob_to_regex(core: &str, anchored: bool) -> String {
    let mut out = String::from("^");
    if !anchored {
        out.push_str("(?:.*/)?");
    }
    let mut chars = core.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push_str("(?:/.*)?$");
    out
}
