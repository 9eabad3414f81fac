//! In-memory model of the user's projects
//!
//! A `Solution` is immutable-by-value: every text replacement produces a new
//! value and leaves the old one untouched, so the driver can keep the
//! last-committed solution while an edit session works on its successor.
//! Document texts are shared (`Arc<str>`), which keeps those copies cheap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_protocol::new_id;

/// A source document (or additional document, e.g. markup) within a project.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub path: PathBuf,
    pub text: Arc<str>,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<Arc<str>>) -> Self {
        Self {
            id: new_id(),
            path: path.into(),
            text: text.into(),
        }
    }
}

/// A project: an ordered set of primary documents plus additional documents.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub documents: Vec<Document>,
    pub additional_documents: Vec<Document>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            documents: Vec::new(),
            additional_documents: Vec::new(),
        }
    }
}

/// Where a path was found within the solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentKind {
    Primary,
    Additional,
}

/// A document located by path, with enough identity to produce the successor
/// solution.
#[derive(Debug, Clone)]
pub struct LocatedDocument {
    pub project_id: String,
    pub document_id: String,
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, Default)]
pub struct Solution {
    pub projects: Vec<Project>,
}

impl Solution {
    pub fn new(projects: Vec<Project>) -> Self {
        Self { projects }
    }

    /// Locate a path anywhere in the solution. When a path appears both as a
    /// primary and an additional document, the primary wins.
    pub fn locate(&self, path: &Path) -> Option<LocatedDocument> {
        for project in &self.projects {
            if let Some(doc) = project.documents.iter().find(|d| d.path == path) {
                return Some(LocatedDocument {
                    project_id: project.id.clone(),
                    document_id: doc.id.clone(),
                    kind: DocumentKind::Primary,
                });
            }
        }
        for project in &self.projects {
            if let Some(doc) = project.additional_documents.iter().find(|d| d.path == path) {
                return Some(LocatedDocument {
                    project_id: project.id.clone(),
                    document_id: doc.id.clone(),
                    kind: DocumentKind::Additional,
                });
            }
        }
        None
    }

    /// Produce a new solution with one primary document's text replaced.
    /// Document identity is preserved.
    pub fn with_document_text(&self, document_id: &str, text: impl Into<Arc<str>>) -> Solution {
        self.replace_text(document_id, text.into(), DocumentKind::Primary)
    }

    /// Produce a new solution with one additional document's text replaced.
    /// Document identity is preserved.
    pub fn with_additional_document_text(
        &self,
        document_id: &str,
        text: impl Into<Arc<str>>,
    ) -> Solution {
        self.replace_text(document_id, text.into(), DocumentKind::Additional)
    }

    fn replace_text(&self, document_id: &str, text: Arc<str>, kind: DocumentKind) -> Solution {
        let mut next = self.clone();
        for project in &mut next.projects {
            let docs = match kind {
                DocumentKind::Primary => &mut project.documents,
                DocumentKind::Additional => &mut project.additional_documents,
            };
            if let Some(doc) = docs.iter_mut().find(|d| d.id == document_id) {
                doc.text = text;
                return next;
            }
        }
        next
    }

    /// Document text by id, searching both primary and additional documents.
    pub fn document_text(&self, document_id: &str) -> Option<&Arc<str>> {
        self.projects.iter().find_map(|p| {
            p.documents
                .iter()
                .chain(p.additional_documents.iter())
                .find(|d| d.id == document_id)
                .map(|d| &d.text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_solution() -> (Solution, String, String) {
        let mut project = Project::new("WebApp");
        project
            .documents
            .push(Document::new("/app/Program.cs", "class Program {}"));
        project
            .additional_documents
            .push(Document::new("/app/Index.razor", "<h1>hi</h1>"));
        let primary_id = project.documents[0].id.clone();
        let additional_id = project.additional_documents[0].id.clone();
        (Solution::new(vec![project]), primary_id, additional_id)
    }

    #[test]
    fn locate_finds_primary_document() {
        let (solution, primary_id, _) = sample_solution();
        let located = solution.locate(Path::new("/app/Program.cs")).unwrap();
        assert_eq!(located.document_id, primary_id);
        assert_eq!(located.kind, DocumentKind::Primary);
    }

    #[test]
    fn locate_finds_additional_document() {
        let (solution, _, additional_id) = sample_solution();
        let located = solution.locate(Path::new("/app/Index.razor")).unwrap();
        assert_eq!(located.document_id, additional_id);
        assert_eq!(located.kind, DocumentKind::Additional);
    }

    #[test]
    fn locate_prefers_primary_over_additional() {
        let mut project = Project::new("WebApp");
        project
            .documents
            .push(Document::new("/app/Shared.razor", "primary copy"));
        project
            .additional_documents
            .push(Document::new("/app/Shared.razor", "additional copy"));
        let primary_id = project.documents[0].id.clone();
        let solution = Solution::new(vec![project]);

        let located = solution.locate(Path::new("/app/Shared.razor")).unwrap();
        assert_eq!(located.kind, DocumentKind::Primary);
        assert_eq!(located.document_id, primary_id);
    }

    #[test]
    fn replacing_text_preserves_identity_and_old_value() {
        let (solution, primary_id, _) = sample_solution();
        let next = solution.with_document_text(&primary_id, "class Program { static int F() => 2; }");

        assert_eq!(
            next.document_text(&primary_id).unwrap().as_ref(),
            "class Program { static int F() => 2; }"
        );
        // The prior value is untouched.
        assert_eq!(
            solution.document_text(&primary_id).unwrap().as_ref(),
            "class Program {}"
        );
        // Same document identity in the successor.
        let located = next.locate(Path::new("/app/Program.cs")).unwrap();
        assert_eq!(located.document_id, primary_id);
    }

    #[test]
    fn replacing_additional_text_preserves_identity() {
        let (solution, _, additional_id) = sample_solution();
        let next = solution.with_additional_document_text(&additional_id, "<h1>new</h1>");

        assert_eq!(
            next.document_text(&additional_id).unwrap().as_ref(),
            "<h1>new</h1>"
        );
        let located = next.locate(Path::new("/app/Index.razor")).unwrap();
        assert_eq!(located.document_id, additional_id);
        assert_eq!(located.kind, DocumentKind::Additional);
    }

    #[test]
    fn locate_misses_unknown_path() {
        let (solution, _, _) = sample_solution();
        assert!(solution.locate(Path::new("/elsewhere/Other.cs")).is_none());
    }
}
