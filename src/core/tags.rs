//! Tag scanning.
//!
//! A tag is a marker inside a source comment:
//!
//! ```text
//! // @REQ AUTH-001 verify Login rejects expired sessions
//! #  DESIGN AUTH-010 depends REQ-AUTH-001
//! ```
//!
//! The host text is tokenized just enough to know where comments and string
//! literals are, so a marker quoted in a docstring or string constant is never
//! reported. Scanning never fails: broken input (an unterminated string or
//! comment) yields whatever was recognized before the break.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Top-level buckets of the index document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Primary,
    Steering,
    Implementation,
    Quality,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Primary,
        Category::Steering,
        Category::Implementation,
        Category::Quality,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Primary => "PRIMARY",
            Category::Steering => "STEERING",
            Category::Implementation => "IMPLEMENTATION",
            Category::Quality => "QUALITY",
        }
    }
}

/// Fixed directive → category table. A directive is the first segment of a spec_id.
pub const DIRECTIVES: &[(&str, Category)] = &[
    ("REQ", Category::Primary),
    ("DESIGN", Category::Primary),
    ("PRODUCT", Category::Steering),
    ("TECH", Category::Steering),
    ("STRUCTURE", Category::Steering),
    ("TASK", Category::Implementation),
    ("CODE", Category::Implementation),
    ("TEST", Category::Quality),
    ("REVIEW", Category::Quality),
];

pub fn category_of(directive: &str) -> Option<Category> {
    DIRECTIVES
        .iter()
        .find(|(d, _)| *d == directive)
        .map(|(_, c)| *c)
}

/// Directives belonging to `category`, in table order.
pub fn directives_in(category: Category) -> impl Iterator<Item = &'static str> {
    DIRECTIVES
        .iter()
        .filter(move |(_, c)| *c == category)
        .map(|(d, _)| *d)
}

/// `REQ-AUTH-001` -> `REQ`
pub fn directive_of(spec_id: &str) -> &str {
    spec_id.split('-').next().unwrap_or(spec_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Impl,
    Verify,
    Depends,
    Related,
}

impl Verb {
    pub fn parse(word: &str) -> Option<Verb> {
        match word {
            "impl" => Some(Verb::Impl),
            "verify" => Some(Verb::Verify),
            "depends" => Some(Verb::Depends),
            "related" => Some(Verb::Related),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Impl => "impl",
            Verb::Verify => "verify",
            Verb::Depends => "depends",
            Verb::Related => "related",
        }
    }

    /// Verbs that relate two tags rather than annotating code.
    pub fn is_relation(self) -> bool {
        matches!(self, Verb::Depends | Verb::Related)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One marker occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMatch {
    pub spec_id: String,
    pub directive: String,
    pub verb: Verb,
    pub file: String,
    /// 1-based.
    pub line: usize,
    pub description: Option<String>,
    /// Chain target for `depends`/`related`.
    pub target: Option<String>,
}

impl TagMatch {
    pub fn category(&self) -> Option<Category> {
        category_of(&self.directive)
    }
}

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^@?(?P<directive>[A-Z]+)\s+(?:(?P<qual>[A-Z]+)-)?(?P<domain>[A-Z][A-Z0-9_]*)-(?P<num>[0-9]{3,})\b(?P<rest>.*)$",
    )
    .unwrap()
});

static SPEC_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<directive>[A-Z]+)-[A-Z][A-Z0-9_]*-[0-9]{3,}$").unwrap()
});

/// Whether `s` is a fully-qualified spec_id with a known directive.
pub fn is_spec_id(s: &str) -> bool {
    SPEC_ID_RE
        .captures(s)
        .and_then(|c| c.name("directive"))
        .is_some_and(|d| category_of(d.as_str()).is_some())
}

/// Scan `source` for markers. `file_path` selects the comment syntax and is
/// copied into every match.
pub fn extract(source: &str, file_path: &str) -> Vec<TagMatch> {
    let syntax = syntax_for(Path::new(file_path));
    let mut out = Vec::new();
    let truncated = Lexer::new(source, syntax).run(|text, line| {
        if let Some(tag) = parse_marker(text, file_path, line) {
            out.push(tag);
        }
    });
    if truncated {
        tracing::debug!(file = file_path, tags = out.len(), "scan stopped at unterminated literal");
    }
    out
}

/// Read a file and scan it. Unreadable or binary files yield no tags.
pub fn extract_from_path(abs_path: &Path, rel_path: &str) -> Vec<TagMatch> {
    let bytes = match std::fs::read(abs_path) {
        Ok(b) => b,
        Err(err) => {
            tracing::debug!(file = rel_path, "unreadable, no tags: {err}");
            return Vec::new();
        }
    };
    if bytes.iter().take(8192).any(|b| *b == 0) {
        return Vec::new();
    }
    extract(&String::from_utf8_lossy(&bytes), rel_path)
}

fn parse_marker(comment_line: &str, file: &str, line: usize) -> Option<TagMatch> {
    let text = comment_line
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '/' | '!' | '*' | '#' | '-' | ';'))
        .trim_end();
    // Cheap reject before the regex: every marker has an uppercase directive and a dash.
    if !text.starts_with(|c: char| c == '@' || c.is_ascii_uppercase()) || !text.contains('-') {
        return None;
    }
    let caps = MARKER_RE.captures(text)?;
    let directive = caps.name("directive")?.as_str();
    category_of(directive)?;
    if let Some(qual) = caps.name("qual") {
        if qual.as_str() != directive {
            return None;
        }
    }
    let spec_id = format!(
        "{}-{}-{}",
        directive,
        caps.name("domain")?.as_str(),
        caps.name("num")?.as_str()
    );

    let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or("");
    // The id must be followed by whitespace, a separator, or nothing.
    if !rest.is_empty() && !rest.starts_with(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | '.' | ')')) {
        return None;
    }
    let mut rest = rest.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | ','));

    let mut verb = Verb::Impl;
    if let Some(word) = rest.split_whitespace().next() {
        if let Some(v) = Verb::parse(word) {
            verb = v;
            rest = rest[word.len()..].trim_start();
        }
    }

    let mut target = None;
    if verb.is_relation() {
        if let Some(word) = rest.split_whitespace().next() {
            let candidate = word.trim_end_matches(|c: char| matches!(c, ',' | ';' | '.' | ':'));
            if is_spec_id(candidate) {
                target = Some(candidate.to_string());
                rest = rest[word.len()..].trim_start();
            }
        }
    }

    let description = rest
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '—'))
        .trim_end();
    Some(TagMatch {
        spec_id,
        directive: directive.to_string(),
        verb,
        file: file.to_string(),
        line,
        description: (!description.is_empty()).then(|| description.to_string()),
        target,
    })
}

/// Comment and literal syntax of a host language.
struct Syntax {
    line_comments: &'static [&'static str],
    block_comments: &'static [(&'static str, &'static str)],
    /// Quote characters whose literals may span lines.
    multiline_quotes: &'static [u8],
    /// Quote characters whose literals end at a newline.
    line_quotes: &'static [u8],
    triple_quotes: bool,
    /// Raw strings, nested block comments, and `'a` lifetimes.
    rust: bool,
}

const RUST: Syntax = Syntax {
    line_comments: &["//"],
    block_comments: &[("/*", "*/")],
    multiline_quotes: &[b'"'],
    line_quotes: &[],
    triple_quotes: false,
    rust: true,
};

const C_LIKE: Syntax = Syntax {
    line_comments: &["//"],
    block_comments: &[("/*", "*/")],
    multiline_quotes: &[],
    line_quotes: &[b'"', b'\''],
    triple_quotes: false,
    rust: false,
};

const JS_LIKE: Syntax = Syntax {
    line_comments: &["//"],
    block_comments: &[("/*", "*/")],
    multiline_quotes: &[b'`'],
    line_quotes: &[b'"', b'\''],
    triple_quotes: false,
    rust: false,
};

const PYTHON: Syntax = Syntax {
    line_comments: &["#"],
    block_comments: &[],
    multiline_quotes: &[],
    line_quotes: &[b'"', b'\''],
    triple_quotes: true,
    rust: false,
};

const HASH: Syntax = Syntax {
    line_comments: &["#"],
    block_comments: &[],
    multiline_quotes: &[],
    line_quotes: &[b'"', b'\''],
    triple_quotes: false,
    rust: false,
};

const DASH_DASH: Syntax = Syntax {
    line_comments: &["--"],
    block_comments: &[("/*", "*/")],
    multiline_quotes: &[],
    line_quotes: &[b'\'', b'"'],
    triple_quotes: false,
    rust: false,
};

const SEMICOLON: Syntax = Syntax {
    line_comments: &[";"],
    block_comments: &[],
    multiline_quotes: &[],
    line_quotes: &[b'"'],
    triple_quotes: false,
    rust: false,
};

const MARKUP: Syntax = Syntax {
    line_comments: &[],
    block_comments: &[("<!--", "-->")],
    multiline_quotes: &[],
    line_quotes: &[],
    triple_quotes: false,
    rust: false,
};

const GENERIC: Syntax = Syntax {
    line_comments: &["//", "#"],
    block_comments: &[("/*", "*/"), ("<!--", "-->")],
    multiline_quotes: &[],
    line_quotes: &[b'"'],
    triple_quotes: false,
    rust: false,
};

fn syntax_for(path: &Path) -> &'static Syntax {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "rs" => &RUST,
        "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "java" | "kt" | "kts" | "swift" | "scala"
        | "dart" | "proto" => &C_LIKE,
        "go" | "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => &JS_LIKE,
        "py" | "pyi" => &PYTHON,
        "sh" | "bash" | "zsh" | "rb" | "pl" | "r" | "yaml" | "yml" | "toml" | "cfg" | "conf"
        | "mk" | "dockerfile" => &HASH,
        "sql" | "lua" | "hs" | "elm" => &DASH_DASH,
        "clj" | "cljs" | "el" | "lisp" | "scm" | "ini" | "asm" | "s" => &SEMICOLON,
        "md" | "markdown" | "html" | "htm" | "xml" | "vue" | "svelte" => &MARKUP,
        _ => &GENERIC,
    }
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    syntax: &'static Syntax,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str, syntax: &'static Syntax) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            syntax,
            pos: 0,
            line: 1,
        }
    }

    /// Feeds every comment line to `on_comment`. Returns true when the scan
    /// stopped inside an unterminated literal or comment.
    fn run<F: FnMut(&str, usize)>(mut self, mut on_comment: F) -> bool {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b == b'\n' {
                self.line += 1;
                self.pos += 1;
                continue;
            }
            if let Some(tok) = self.match_any(self.syntax.line_comments) {
                let start = self.pos + tok.len();
                let end = self.find_byte(b'\n', start).unwrap_or(self.bytes.len());
                on_comment(&self.src[start..end], self.line);
                self.pos = end;
                continue;
            }
            if let Some((open, close)) = self
                .syntax
                .block_comments
                .iter()
                .find(|(open, _)| self.starts_with(self.pos, open))
            {
                let body_start = self.pos + open.len();
                let (body_end, resume) = self.block_end(body_start, open, close);
                for (offset, text) in self.src[body_start..body_end].split('\n').enumerate() {
                    on_comment(text, self.line + offset);
                }
                let Some(resume) = resume else {
                    return true;
                };
                self.advance_to(resume);
                continue;
            }
            if self.syntax.triple_quotes
                && (self.starts_with(self.pos, "\"\"\"") || self.starts_with(self.pos, "'''"))
            {
                let delim = [b, b, b];
                let Some(end) = self.skip_quoted(self.pos + 3, &delim, true) else {
                    return true;
                };
                self.advance_to(end);
                continue;
            }
            if self.syntax.rust {
                if let Some(end) = self.rust_raw_string() {
                    let Some(end) = end else {
                        return true;
                    };
                    self.advance_to(end);
                    continue;
                }
                if b == b'\'' {
                    self.pos = self.rust_quote_end();
                    continue;
                }
            }
            if self.syntax.multiline_quotes.contains(&b) {
                let Some(end) = self.skip_quoted(self.pos + 1, &[b], true) else {
                    return true;
                };
                self.advance_to(end);
                continue;
            }
            if self.syntax.line_quotes.contains(&b) {
                let Some(end) = self.skip_quoted(self.pos + 1, &[b], false) else {
                    return true;
                };
                self.advance_to(end);
                continue;
            }
            self.pos += 1;
        }
        false
    }

    fn starts_with(&self, at: usize, token: &str) -> bool {
        self.bytes
            .get(at..at + token.len())
            .is_some_and(|s| s == token.as_bytes())
    }

    fn match_any(&self, tokens: &'static [&'static str]) -> Option<&'static str> {
        tokens.iter().copied().find(|t| self.starts_with(self.pos, t))
    }

    fn find_byte(&self, needle: u8, from: usize) -> Option<usize> {
        self.bytes
            .get(from..)?
            .iter()
            .position(|b| *b == needle)
            .map(|p| from + p)
    }

    fn advance_to(&mut self, end: usize) {
        let end = end.min(self.bytes.len());
        self.line += self.bytes[self.pos..end]
            .iter()
            .filter(|b| **b == b'\n')
            .count();
        self.pos = end;
    }

    /// Returns the body end and, when the comment is closed, the position
    /// after the closing token. Rust block comments nest.
    fn block_end(&self, from: usize, open: &str, close: &str) -> (usize, Option<usize>) {
        let mut depth = 1usize;
        let mut i = from;
        while i < self.bytes.len() {
            if self.syntax.rust && self.starts_with(i, open) {
                depth += 1;
                i += open.len();
                continue;
            }
            if self.starts_with(i, close) {
                depth -= 1;
                if depth == 0 {
                    return (i, Some(i + close.len()));
                }
                i += close.len();
                continue;
            }
            i += 1;
        }
        (self.bytes.len(), None)
    }

    /// Position just past the closing delimiter. Single-line literals also
    /// end at a newline. `None` when input ends inside the literal.
    fn skip_quoted(&self, from: usize, delim: &[u8], multiline: bool) -> Option<usize> {
        let mut i = from;
        while i < self.bytes.len() {
            let b = self.bytes[i];
            if b == b'\\' {
                i += 2;
                continue;
            }
            if !multiline && b == b'\n' {
                return Some(i);
            }
            if self.bytes.get(i..i + delim.len()) == Some(delim) {
                return Some(i + delim.len());
            }
            i += 1;
        }
        None
    }

    /// `r"..."`, `r#"..."#`, `br"..."` starting at the current position.
    /// Outer `None`: not a raw string. Inner `None`: unterminated.
    fn rust_raw_string(&self) -> Option<Option<usize>> {
        let i = self.pos;
        if self.bytes[i] != b'r' {
            return None;
        }
        let prev_ident = |at: usize| at > 0 && is_ident_byte(self.bytes[at - 1]);
        if prev_ident(i) && !(self.bytes[i - 1] == b'b' && !prev_ident(i - 1)) {
            return None;
        }
        let mut j = i + 1;
        while self.bytes.get(j) == Some(&b'#') {
            j += 1;
        }
        if self.bytes.get(j) != Some(&b'"') {
            return None;
        }
        let hashes = j - i - 1;
        let end = (j + 1..self.bytes.len())
            .find(|k| {
                self.bytes[*k] == b'"'
                    && self
                        .bytes
                        .get(k + 1..k + 1 + hashes)
                        .is_some_and(|s| s.iter().all(|b| *b == b'#'))
            })
            .map(|k| k + 1 + hashes);
        Some(end)
    }

    /// Char literal (`'x'`, `'\\n'`, `'é'`) or lifetime (`'a`).
    fn rust_quote_end(&self) -> usize {
        let i = self.pos;
        if self.bytes.get(i + 1) == Some(&b'\\') {
            let limit = (i + 12).min(self.bytes.len());
            return (i + 3..limit)
                .find(|k| self.bytes[*k] == b'\'')
                .map(|k| k + 1)
                .unwrap_or(i + 1);
        }
        let width = self
            .src
            .get(i + 1..)
            .and_then(|s| s.chars().next())
            .map(char::len_utf8)
            .unwrap_or(1);
        if self.bytes.get(i + 1 + width) == Some(&b'\'') {
            i + 2 + width
        } else {
            i + 1
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
