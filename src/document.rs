//! Specification document parsing.
//!
//! A specification document is Markdown. Every ATX heading opens a fragment that spans until the
//! next heading of the same or a higher level. Lines of the form `@ref <path>` declare references
//! to other files.

use std::collections::HashMap;

/// Marker that declares a reference to another file.
pub const REFERENCE_MARKER: &str = "@ref";

/// A zero-based (line, column) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

/// An addressable region of a specification document.
///
/// `file` and `parent` are lookup handles into the owning [`crate::project::Project`], never
/// owning links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Globally unique id: `<filename>#<slug>/<slug>/...`.
    pub full_id: String,
    pub title: String,
    /// Heading level (1 for `#`).
    pub depth: usize,
    /// Position of the heading.
    pub start: Position,
    /// One past the last non-blank line of the fragment's span.
    pub end: Position,
    /// Exclusive line where the span stops (next heading of the same or higher level, or EOF).
    pub span_end: usize,
    /// Filename of the owning document.
    pub file: String,
    /// `full_id` of the enclosing fragment.
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// Paths referenced directly in this fragment's own lines.
    pub references: Vec<String>,
}

impl Fragment {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether a line lies inside the fragment's span, including nested fragments.
    pub fn contains_line(&self, line: usize) -> bool {
        line >= self.start.line && line < self.span_end
    }
}

/// A parsed specification file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Project-relative path with `/` separators.
    pub filename: String,
    pub content: String,
    /// Every fragment in document order.
    pub fragments: Vec<Fragment>,
    /// `full_id`s of the top-level fragments, in document order.
    pub roots: Vec<String>,
    /// Every referenced path, de-duplicated, in declaration order.
    pub references: Vec<String>,
}

impl Document {
    /// Parse `content` as the document named `filename`.
    pub fn parse(filename: &str, content: &str) -> Self {
        let filename = normalize_path(filename);
        let mut parser = Parser::new(&filename);

        for (index, raw) in content.split('\n').enumerate() {
            parser.line(index, raw.trim_end_matches('\r'));
        }
        let line_count = content.split('\n').count();
        let (fragments, roots, references) = parser.finish(line_count);

        Self {
            filename,
            content: content.to_string(),
            fragments,
            roots,
            references,
        }
    }

    pub fn fragment(&self, full_id: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.full_id == full_id)
    }

    /// The first declared root fragment.
    pub fn first_root(&self) -> Option<&Fragment> {
        self.roots.first().and_then(|id| self.fragment(id))
    }

    pub fn root_fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.roots.iter().filter_map(|id| self.fragment(id))
    }

    /// The deepest fragment whose span contains `line`.
    pub fn innermost_at(&self, line: usize) -> Option<&Fragment> {
        self.fragments
            .iter()
            .filter(|f| f.contains_line(line))
            .max_by_key(|f| f.depth)
    }

    /// The text of a fragment's full span, heading included.
    pub fn fragment_text(&self, fragment: &Fragment) -> String {
        self.content
            .split('\n')
            .skip(fragment.start.line)
            .take(fragment.span_end.saturating_sub(fragment.start.line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Paths referenced anywhere in the subtree rooted at `root`, de-duplicated.
    pub fn references_within(&self, root: &Fragment) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        let subtree = self
            .fragments
            .iter()
            .filter(|f| f.start.line >= root.start.line && f.span_end <= root.span_end);
        for path in subtree.flat_map(|f| f.references.iter()) {
            if !paths.contains(&path.as_str()) {
                paths.push(path.as_str());
            }
        }
        paths
    }

    /// Whether any fragment in the subtree rooted at `root` declares `path`.
    pub fn subtree_references(&self, root: &Fragment, path: &str) -> bool {
        self.references_within(root).contains(&path)
    }
}

/// A fragment that has been opened but not yet closed by a later heading.
struct OpenFragment {
    index: usize,
    level: usize,
    last_non_blank: usize,
}

struct Parser<'a> {
    filename: &'a str,
    fragments: Vec<Fragment>,
    roots: Vec<String>,
    references: Vec<String>,
    stack: Vec<OpenFragment>,
    /// Slug counts per parent (`""` for roots) to disambiguate siblings.
    slugs: HashMap<String, HashMap<String, usize>>,
    fence: Option<&'static str>,
}

impl<'a> Parser<'a> {
    fn new(filename: &'a str) -> Self {
        Self {
            filename,
            fragments: Vec::new(),
            roots: Vec::new(),
            references: Vec::new(),
            stack: Vec::new(),
            slugs: HashMap::new(),
            fence: None,
        }
    }

    fn line(&mut self, index: usize, line: &str) {
        let trimmed = line.trim_start();

        if let Some(marker) = ["```", "~~~"].into_iter().find(|m| trimmed.starts_with(m)) {
            match self.fence {
                Some(open) if open == marker => self.fence = None,
                Some(_) => {}
                None => self.fence = Some(marker),
            }
            self.mark_non_blank(index);
            return;
        }

        if self.fence.is_none()
            && let Some((level, title)) = parse_heading(line)
        {
            self.open(index, level, title);
            return;
        }

        if trimmed.is_empty() {
            return;
        }
        self.mark_non_blank(index);

        if self.fence.is_none()
            && let Some(path) = parse_reference(trimmed)
        {
            if let Some(top) = self.stack.last() {
                let refs = &mut self.fragments[top.index].references;
                if !refs.contains(&path) {
                    refs.push(path.clone());
                }
            }
            if !self.references.contains(&path) {
                self.references.push(path);
            }
        }
    }

    fn mark_non_blank(&mut self, index: usize) {
        for open in &mut self.stack {
            open.last_non_blank = index;
        }
    }

    fn open(&mut self, index: usize, level: usize, title: &str) {
        while self.stack.last().is_some_and(|top| top.level >= level) {
            self.close_top(index);
        }

        let parent = self
            .stack
            .last()
            .map(|top| self.fragments[top.index].full_id.clone());
        let slug = self.unique_slug(parent.as_deref().unwrap_or(""), &slugify(title));
        let full_id = match &parent {
            Some(parent_id) => format!("{}/{}", parent_id, slug),
            None => format!("{}#{}", self.filename, slug),
        };

        match &parent {
            Some(parent_id) => {
                if let Some(p) = self.fragments.iter_mut().find(|f| &f.full_id == parent_id) {
                    p.children.push(full_id.clone());
                }
            }
            None => self.roots.push(full_id.clone()),
        }

        self.mark_non_blank(index);
        self.fragments.push(Fragment {
            full_id,
            title: title.to_string(),
            depth: level,
            start: Position::new(index, 0),
            end: Position::new(index + 1, 0),
            span_end: index + 1,
            file: self.filename.to_string(),
            parent,
            children: Vec::new(),
            references: Vec::new(),
        });
        self.stack.push(OpenFragment {
            index: self.fragments.len() - 1,
            level,
            last_non_blank: index,
        });
    }

    fn close_top(&mut self, span_end: usize) {
        if let Some(open) = self.stack.pop() {
            let fragment = &mut self.fragments[open.index];
            fragment.span_end = span_end;
            fragment.end = Position::new(open.last_non_blank + 1, 0);
        }
    }

    fn unique_slug(&mut self, parent: &str, slug: &str) -> String {
        let seen = self
            .slugs
            .entry(parent.to_string())
            .or_default()
            .entry(slug.to_string())
            .or_insert(0);
        *seen += 1;
        if *seen == 1 {
            slug.to_string()
        } else {
            format!("{}-{}", slug, seen)
        }
    }

    fn finish(mut self, line_count: usize) -> (Vec<Fragment>, Vec<String>, Vec<String>) {
        while !self.stack.is_empty() {
            self.close_top(line_count);
        }
        (self.fragments, self.roots, self.references)
    }
}

/// Parse an ATX heading into (level, title).
fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end();
    Some((level, title))
}

fn parse_reference(trimmed: &str) -> Option<String> {
    let rest = trimmed.strip_prefix(REFERENCE_MARKER)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    rest.split_whitespace().next().map(normalize_path)
}

/// Normalize a path string to the project-relative form used as document and reference keys.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut path = path.as_str();
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped;
    }
    path.to_string()
}

/// Turn a heading title into an id segment.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Preamble text
# Login
Users sign in.
@ref src/auth.rs

## Errors
- bad password

# Logout
@ref ./src/session.rs
";

    #[test]
    fn test_parse_roots_and_children() {
        let doc = Document::parse("auth.spec.md", SAMPLE);
        assert_eq!(
            doc.roots,
            vec!["auth.spec.md#login", "auth.spec.md#logout"]
        );
        let login = doc.fragment("auth.spec.md#login").unwrap();
        assert_eq!(login.children, vec!["auth.spec.md#login/errors"]);
        assert!(login.is_root());

        let errors = doc.fragment("auth.spec.md#login/errors").unwrap();
        assert_eq!(errors.parent.as_deref(), Some("auth.spec.md#login"));
        assert_eq!(errors.depth, 2);
    }

    #[test]
    fn test_parse_positions() {
        let doc = Document::parse("auth.spec.md", SAMPLE);
        let login = doc.fragment("auth.spec.md#login").unwrap();
        assert_eq!(login.start, Position::new(1, 0));
        // Ends after "- bad password" (line 6), trailing blank excluded.
        assert_eq!(login.end, Position::new(7, 0));
        assert_eq!(login.span_end, 8);

        let logout = doc.fragment("auth.spec.md#logout").unwrap();
        assert_eq!(logout.start, Position::new(8, 0));
        assert_eq!(logout.end, Position::new(10, 0));
    }

    #[test]
    fn test_parse_references() {
        let doc = Document::parse("auth.spec.md", SAMPLE);
        assert_eq!(doc.references, vec!["src/auth.rs", "src/session.rs"]);
        let login = doc.fragment("auth.spec.md#login").unwrap();
        assert_eq!(login.references, vec!["src/auth.rs"]);
        assert!(doc.subtree_references(login, "src/auth.rs"));
        assert!(!doc.subtree_references(login, "src/session.rs"));
    }

    #[test]
    fn test_duplicate_sibling_titles_get_suffix() {
        let doc = Document::parse("a.spec.md", "# Notes\n# Notes\n## Notes\n");
        assert_eq!(doc.roots, vec!["a.spec.md#notes", "a.spec.md#notes-2"]);
        assert!(doc.fragment("a.spec.md#notes-2/notes").is_some());
    }

    #[test]
    fn test_headings_in_fences_ignored() {
        let doc = Document::parse("a.spec.md", "# Real\n```\n# not a heading\n@ref x.rs\n```\n");
        assert_eq!(doc.fragments.len(), 1);
        assert!(doc.references.is_empty());
        assert_eq!(doc.fragments[0].end, Position::new(5, 0));
    }

    #[test]
    fn test_ids_stable_across_reparse() {
        let first = Document::parse("auth.spec.md", SAMPLE);
        let edited = SAMPLE.replace("Users sign in.", "Users sign in with a password.");
        let second = Document::parse("auth.spec.md", &edited);
        let ids = |d: &Document| d.fragments.iter().map(|f| f.full_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first, Document::parse("auth.spec.md", SAMPLE));
    }

    #[test]
    fn test_no_headings_means_no_roots() {
        let doc = Document::parse("empty.spec.md", "just text\n@ref a.rs\n");
        assert!(doc.roots.is_empty());
        assert!(doc.first_root().is_none());
        assert_eq!(doc.references, vec!["a.rs"]);
    }

    #[test]
    fn test_innermost_at() {
        let doc = Document::parse("auth.spec.md", SAMPLE);
        assert_eq!(
            doc.innermost_at(6).map(|f| f.full_id.as_str()),
            Some("auth.spec.md#login/errors")
        );
        assert_eq!(
            doc.innermost_at(2).map(|f| f.full_id.as_str()),
            Some("auth.spec.md#login")
        );
        assert!(doc.innermost_at(0).is_none());
    }

    #[test]
    fn test_fragment_text() {
        let doc = Document::parse("auth.spec.md", SAMPLE);
        let logout = doc.fragment("auth.spec.md#logout").unwrap();
        assert_eq!(doc.fragment_text(logout), "# Logout\n@ref ./src/session.rs\n");
    }

    #[test]
    fn test_heading_requires_space() {
        assert_eq!(parse_heading("#tag"), None);
        assert_eq!(parse_heading("## Title ##"), Some((2, "Title")));
        assert_eq!(parse_heading("####### seven"), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Login & Sign-up!"), "login-sign-up");
        assert_eq!(slugify("  "), "section");
        assert_eq!(slugify("API v2"), "api-v2");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/util.ts"), "src/util.ts");
        assert_eq!(normalize_path("src\\util.ts"), "src/util.ts");
    }
}
