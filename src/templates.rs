//! Prompt templates and the catalog that decides which ones apply to a fragment.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collab::{EscapeAction, PickItem};
use crate::document::{Document, Fragment};
use crate::error::{Error, Result};

/// Group used when a template does not name one.
const DEFAULT_GROUP: &str = "General";

/// Templates shipped with the binary. User templates with the same id replace these.
pub const BUILTIN_TEMPLATES: &str = r#"
[[template]]
id = "implement"
title = "Implement"
description = "Write or update the referenced code so it satisfies this section"
group = "Code"
prompt = """
Implement the following specification section in the files it references.

Referenced files:
{{references}}

Specification ({{file}}):

{{fragment}}
"""
[template.applies_to]
has_references = true

[[template]]
id = "expand"
title = "Expand specification"
description = "Fill in missing requirements, edge cases and error handling"
group = "Specification"
prompt = """
Expand the specification section below. Add missing requirements, edge cases and error
behavior. Edit {{file}} in place and keep the existing heading structure.

{{fragment}}
"""

[[template]]
id = "tests"
title = "Write tests"
description = "Write tests for the referenced code that cover this section"
group = "Code"
prompt = """
Write tests that verify the referenced code meets this specification section.

Referenced files:
{{references}}

{{fragment}}
"""
[template.applies_to]
has_references = true

[[template]]
id = "split"
title = "Split into sub-sections"
description = "Break a long section into smaller addressable sections"
group = "Specification"
prompt = """
Split the specification section below into smaller sub-sections, each with its own heading
one level deeper than "{{title}}". Edit {{file}} in place and do not change the meaning.

{{fragment}}
"""
[template.applies_to]
has_children = false

[[template]]
id = "review"
title = "Review specification"
description = "Point out ambiguity, contradictions and gaps"
group = "Review"
prompt = """
Review this specification section. List ambiguous statements, contradictions and missing
cases. Do not edit any files.

{{fragment}}
"""

[[template]]
id = "review-code"
title = "Review code against specification"
description = "Check whether the referenced code does what the section says"
group = "Review"
prompt = """
Compare the referenced code with the specification section and report every place where
they disagree. Do not edit any files.

Referenced files:
{{references}}

{{fragment}}
"""
[template.applies_to]
has_references = true
"#;

/// Starting point written when the user chooses to author a new template.
pub const TEMPLATE_SKELETON: &str = r#"# Prompt templates for specprompt.
#
# Placeholders: {{title}} {{file}} {{fragment}} {{references}} {{label}}
# Every criterion under applies_to is optional; all present criteria must hold.

[[template]]
id = "my-template"
title = "My template"
description = "What this template does"
group = "Custom"
prompt = """
{{fragment}}
"""

[template.applies_to]
# has_references = true
# has_children = false
# min_depth = 1
# max_depth = 2
# title_matches = "(?i)api"
"#;

/// Shape criteria a fragment must satisfy for a template to apply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Applicability {
    pub has_references: Option<bool>,
    pub has_children: Option<bool>,
    pub min_depth: Option<usize>,
    pub max_depth: Option<usize>,
    pub title_matches: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default, rename = "template")]
    templates: Vec<TemplateDef>,
}

#[derive(Debug, Deserialize)]
struct TemplateDef {
    id: String,
    title: String,
    description: Option<String>,
    group: Option<String>,
    prompt: String,
    #[serde(default)]
    applies_to: Applicability,
}

/// A named generation recipe.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub group: String,
    pub prompt: String,
    pub applies_to: Applicability,
    title_pattern: Option<Regex>,
}

impl PromptTemplate {
    fn from_def(def: TemplateDef) -> Result<Self> {
        let title_pattern = def
            .applies_to
            .title_matches
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidTemplate {
                id: def.id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: def.id,
            title: def.title,
            description: def.description,
            group: def.group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            prompt: def.prompt,
            applies_to: def.applies_to,
            title_pattern,
        })
    }

    /// Whether this template accepts the fragment's shape.
    pub fn applies_to(&self, fragment: &Fragment) -> bool {
        let rules = &self.applies_to;
        if let Some(wanted) = rules.has_references
            && wanted == fragment.references.is_empty()
        {
            return false;
        }
        if let Some(wanted) = rules.has_children
            && wanted == fragment.children.is_empty()
        {
            return false;
        }
        if rules.min_depth.is_some_and(|min| fragment.depth < min) {
            return false;
        }
        if rules.max_depth.is_some_and(|max| fragment.depth > max) {
            return false;
        }
        if let Some(pattern) = &self.title_pattern
            && !pattern.is_match(&fragment.title)
        {
            return false;
        }
        true
    }

    /// Fill the prompt's placeholders from a fragment of `document`.
    pub fn render(&self, document: &Document, fragment: &Fragment, label: &str) -> String {
        let references = document.references_within(fragment);
        let references = if references.is_empty() {
            "(none)".to_string()
        } else {
            references
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n")
        };

        self.prompt
            .replace("{{title}}", &fragment.title)
            .replace("{{file}}", &fragment.file)
            .replace("{{label}}", label)
            .replace("{{references}}", &references)
            .replace("{{fragment}}", &document.fragment_text(fragment))
    }
}

/// Every known template in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: Vec<PromptTemplate>,
}

impl TemplateCatalog {
    /// Parse a template file's contents.
    pub fn parse(source: &str) -> Result<Vec<PromptTemplate>> {
        let file: TemplateFile = toml::from_str(source)?;
        file.templates
            .into_iter()
            .map(PromptTemplate::from_def)
            .collect()
    }

    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::default();
        for template in Self::parse(BUILTIN_TEMPLATES)? {
            catalog.add(template);
        }
        Ok(catalog)
    }

    /// Built-in templates followed by every `*.toml` file in `dir`, sorted by file name.
    ///
    /// Unreadable or invalid files are skipped with a warning.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        let Some(dir) = dir else {
            return Ok(catalog);
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = ?dir, "templates_dir_missing");
                return Ok(catalog);
            }
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|source| Self::parse(&source));
            match parsed {
                Ok(templates) => {
                    debug!(file = ?path, count = templates.len(), "templates_loaded");
                    for template in templates {
                        catalog.add(template);
                    }
                }
                Err(e) => warn!(file = ?path, error = %e, "template_file_invalid"),
            }
        }

        info!(count = catalog.templates.len(), "template_catalog_ready");
        Ok(catalog)
    }

    /// Append a template, or replace the one with the same id in place.
    pub fn add(&mut self, template: PromptTemplate) {
        match self.templates.iter_mut().find(|t| t.id == template.id) {
            Some(existing) => *existing = template,
            None => self.templates.push(template),
        }
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn templates(&self) -> &[PromptTemplate] {
        &self.templates
    }

    /// Templates that accept `fragment`, in catalog order.
    pub fn applicable_templates(&self, fragment: &Fragment) -> Vec<&PromptTemplate> {
        self.templates
            .iter()
            .filter(|t| t.applies_to(fragment))
            .collect()
    }
}

/// Group templates for a picker and append the escape actions.
///
/// Groups appear in first-seen order; templates keep their order within a group.
pub fn present(templates: &[&PromptTemplate]) -> Vec<PickItem> {
    let mut groups: Vec<(&str, Vec<&PromptTemplate>)> = Vec::new();
    for &template in templates {
        match groups.iter().position(|(name, _)| *name == template.group) {
            Some(index) => groups[index].1.push(template),
            None => groups.push((template.group.as_str(), vec![template])),
        }
    }

    let mut items: Vec<PickItem> = groups
        .into_iter()
        .flat_map(|(group, members)| {
            members.into_iter().map(move |template| PickItem::Template {
                template: template.clone(),
                group: group.to_string(),
            })
        })
        .collect();
    items.push(PickItem::Action(EscapeAction::NewTemplate));
    items.push(PickItem::Action(EscapeAction::CommunityDiscussion));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(source: &str, full_id: &str) -> (Document, Fragment) {
        let document = Document::parse("x.spec.md", source);
        let fragment = document.fragment(full_id).unwrap().clone();
        (document, fragment)
    }

    fn template(id: &str, group: &str, applies_to: &str) -> PromptTemplate {
        let source = format!(
            "[[template]]\nid = \"{id}\"\ntitle = \"{id}\"\ngroup = \"{group}\"\nprompt = \"p\"\n[template.applies_to]\n{applies_to}\n"
        );
        TemplateCatalog::parse(&source).unwrap().remove(0)
    }

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = TemplateCatalog::builtin().unwrap();
        assert_eq!(catalog.templates().len(), 6);
        assert!(catalog.get("implement").is_some());
        assert_eq!(catalog.get("expand").unwrap().group, "Specification");
    }

    #[test]
    fn test_applicability_excludes_rejected_templates() {
        let (_, with_refs) = fragment("# A\n@ref a.rs\n## B\n", "x.spec.md#a");
        let (_, plain) = fragment("# Plain\ntext\n", "x.spec.md#plain");

        let mut catalog = TemplateCatalog::default();
        catalog.add(template("refs", "G", "has_references = true"));
        catalog.add(template("no-refs", "G", "has_references = false"));
        catalog.add(template("leaf", "G", "has_children = false"));
        catalog.add(template("shallow", "G", "max_depth = 1"));
        catalog.add(template("titled", "G", "title_matches = \"^Pl\""));
        catalog.add(template("any", "G", ""));

        for fragment in [&with_refs, &plain] {
            let applicable = catalog.applicable_templates(fragment);
            for t in catalog.templates() {
                let listed = applicable.iter().any(|a| a.id == t.id);
                assert_eq!(listed, t.applies_to(fragment), "template {}", t.id);
            }
        }

        let ids = |f: &Fragment| {
            catalog
                .applicable_templates(f)
                .iter()
                .map(|t| t.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&with_refs), vec!["refs", "shallow", "any"]);
        assert_eq!(ids(&plain), vec!["no-refs", "leaf", "shallow", "titled", "any"]);
    }

    #[test]
    fn test_min_depth() {
        let t = template("deep", "G", "min_depth = 2");
        let (_, root) = fragment("# A\n", "x.spec.md#a");
        assert!(!t.applies_to(&root));
    }

    #[test]
    fn test_invalid_title_pattern() {
        let source = "[[template]]\nid = \"bad\"\ntitle = \"b\"\nprompt = \"p\"\n[template.applies_to]\ntitle_matches = \"(\"\n";
        let err = TemplateCatalog::parse(source).unwrap_err();
        assert!(matches!(err, Error::InvalidTemplate { ref id, .. } if id == "bad"));
    }

    #[test]
    fn test_missing_group_defaults() {
        let source = "[[template]]\nid = \"t\"\ntitle = \"T\"\nprompt = \"p\"\n";
        let templates = TemplateCatalog::parse(source).unwrap();
        assert_eq!(templates[0].group, "General");
        assert!(templates[0].description.is_none());
    }

    #[test]
    fn test_add_replaces_in_place() {
        let mut catalog = TemplateCatalog::default();
        catalog.add(template("a", "G", ""));
        catalog.add(template("b", "G", ""));
        catalog.add(template("a", "Other", ""));
        let ids: Vec<_> = catalog.templates().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(catalog.get("a").unwrap().group, "Other");
    }

    #[test]
    fn test_present_groups_in_first_seen_order() {
        let x1 = template("x1", "X", "");
        let y1 = template("y1", "Y", "");
        let x2 = template("x2", "X", "");
        let a1 = template("a1", "A", "");
        let items = present(&[&x1, &y1, &x2, &a1]);

        let labels: Vec<_> = items
            .iter()
            .map(|item| match item {
                PickItem::Template { template, group } => format!("{}/{}", group, template.id),
                PickItem::Action(action) => format!("{:?}", action),
                PickItem::Choice { key, .. } => key.clone(),
            })
            .collect();
        assert_eq!(
            labels,
            vec!["X/x1", "X/x2", "Y/y1", "A/a1", "NewTemplate", "CommunityDiscussion"]
        );
    }

    #[test]
    fn test_present_empty_still_offers_actions() {
        let items = present(&[]);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], PickItem::Action(EscapeAction::NewTemplate)));
        assert!(matches!(
            items[1],
            PickItem::Action(EscapeAction::CommunityDiscussion)
        ));
    }

    #[test]
    fn test_render_placeholders() {
        let (document, root) = fragment("# Login\n@ref src/a.rs\n## Errors\n@ref src/b.rs\n", "x.spec.md#login");
        let t = PromptTemplate {
            prompt: "{{title}}|{{file}}|{{label}}\n{{references}}\n{{fragment}}".to_string(),
            ..template("t", "G", "")
        };
        let rendered = t.render(&document, &root, "first");
        assert_eq!(
            rendered,
            "Login|x.spec.md|first\n- src/a.rs\n- src/b.rs\n# Login\n@ref src/a.rs\n## Errors\n@ref src/b.rs\n"
        );
    }

    #[test]
    fn test_skeleton_parses() {
        let templates = TemplateCatalog::parse(TEMPLATE_SKELETON).unwrap();
        assert_eq!(templates[0].id, "my-template");
    }

    #[test]
    fn test_load_directory_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-custom.toml"),
            "[[template]]\nid = \"review\"\ntitle = \"Strict review\"\nprompt = \"p\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("20-broken.toml"), "not = [valid").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = TemplateCatalog::load(Some(dir.path())).unwrap();
        assert_eq!(catalog.templates().len(), 6);
        assert_eq!(catalog.get("review").unwrap().title, "Strict review");
    }

    #[test]
    fn test_load_missing_directory_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = TemplateCatalog::load(Some(&dir.path().join("absent"))).unwrap();
        assert_eq!(catalog.templates().len(), 6);
    }
}
