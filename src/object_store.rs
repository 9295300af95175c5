//! Object Store Adapter (C3): scoped read/write/signed-URL issuance for
//! PDFs, extracted images, and generated Markdown, keyed by ownership path.
//!
//! Backed by a local filesystem root standing in for the bucket (no
//! concrete cloud binding is in scope, per the Non-goals); the path
//! conventions and elevated-vs-scoped client distinction are what's
//! specified, not the storage medium itself.

use std::path::{Path, PathBuf};

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::models::AccessLevel;

/// The two canonical path conventions of §4.3.
pub enum StoragePathKind<'a> {
    EmailPdf { run_id: &'a str, doc_id: &'a str },
    EmailWikiPage { run_id: &'a str, wiki_run_id: &'a str, page_name: &'a str },
    EmailImage { run_id: &'a str, image_id: &'a str },
    ProjectPdf { owner_id: &'a str, project_id: &'a str, run_id: &'a str, doc_id: &'a str },
    ProjectWikiPage {
        owner_id: &'a str,
        project_id: &'a str,
        run_id: &'a str,
        wiki_run_id: &'a str,
        page_name: &'a str,
    },
    ProjectImage {
        owner_id: &'a str,
        project_id: &'a str,
        run_id: &'a str,
        image_id: &'a str,
    },
}

pub fn storage_path(kind: StoragePathKind<'_>) -> String {
    match kind {
        StoragePathKind::EmailPdf { run_id, doc_id } => {
            format!("email-uploads/{run_id}/pdfs/{doc_id}.pdf")
        }
        StoragePathKind::EmailWikiPage {
            run_id,
            wiki_run_id,
            page_name,
        } => format!("email-uploads/{run_id}/generated/wiki/{wiki_run_id}/{page_name}.md"),
        StoragePathKind::EmailImage { run_id, image_id } => {
            format!("email-uploads/{run_id}/generated/images/{image_id}.png")
        }
        StoragePathKind::ProjectPdf {
            owner_id,
            project_id,
            run_id,
            doc_id,
        } => format!(
            "users/{owner_id}/projects/{project_id}/index-runs/{run_id}/pdfs/{doc_id}.pdf"
        ),
        StoragePathKind::ProjectWikiPage {
            owner_id,
            project_id,
            run_id,
            wiki_run_id,
            page_name,
        } => format!(
            "users/{owner_id}/projects/{project_id}/index-runs/{run_id}/generated/wiki/{wiki_run_id}/{page_name}.md"
        ),
        StoragePathKind::ProjectImage {
            owner_id,
            project_id,
            run_id,
            image_id,
        } => format!(
            "users/{owner_id}/projects/{project_id}/index-runs/{run_id}/generated/images/{image_id}.png"
        ),
    }
}

/// Whether a path falls under the public `email-uploads/` tree or a
/// project owner's private tree — determines which client an operation
/// needs.
fn is_elevated_only(path: &str) -> bool {
    !path.starts_with("email-uploads/")
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Server-side ingestion/generation: bypasses scoping, per §3.3's
    /// "elevated identity" carve-out for workers.
    pub async fn put_elevated(&self, path: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    /// User-initiated read, scoped to the caller's `RequestContext`. Rejects
    /// reads into another owner's private project tree.
    pub async fn get_scoped(
        &self,
        path: &str,
        owner_id: Option<&str>,
        access_level: AccessLevel,
        ctx: &RequestContext,
    ) -> Result<Vec<u8>, CoreError> {
        if is_elevated_only(path) && !access_level.readable_by(owner_id, ctx) {
            return Err(CoreError::Authorization(format!(
                "path {path} is not readable by this caller"
            )));
        }
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub async fn get_elevated(&self, path: &str) -> Result<Vec<u8>, CoreError> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let dir = self.resolve(prefix);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(CoreError::Storage(e.to_string())),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?
        {
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                entries.push(rel.to_string_lossy().into_owned());
            }
        }
        Ok(entries)
    }

    /// A signed URL stands in for a pre-signed cloud-storage link; here it
    /// is a `file://`-style reference carrying the TTL as metadata, since
    /// no concrete cloud binding is in scope.
    pub fn signed_url(&self, path: &str, ttl_seconds: u64) -> String {
        format!(
            "byggeviden://objects/{path}?expires_in={ttl_seconds}",
            path = path
        )
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), CoreError> {
        let dir = self.resolve(prefix);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Storage(e.to_string())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_pdf_path_matches_convention() {
        let path = storage_path(StoragePathKind::EmailPdf {
            run_id: "r1",
            doc_id: "d1",
        });
        assert_eq!(path, "email-uploads/r1/pdfs/d1.pdf");
    }

    #[test]
    fn project_pdf_path_matches_convention() {
        let path = storage_path(StoragePathKind::ProjectPdf {
            owner_id: "u1",
            project_id: "p1",
            run_id: "r1",
            doc_id: "d1",
        });
        assert_eq!(path, "users/u1/projects/p1/index-runs/r1/pdfs/d1.pdf");
    }

    #[tokio::test]
    async fn put_then_get_elevated_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.put_elevated("email-uploads/r1/pdfs/d1.pdf", b"hello").await.unwrap();
        let bytes = store.get_elevated("email-uploads/r1/pdfs/d1.pdf").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn scoped_get_rejects_foreign_private_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let path = "users/owner-a/projects/p1/index-runs/r1/pdfs/d1.pdf";
        store.put_elevated(path, b"secret").await.unwrap();

        let ctx = RequestContext::authenticated("owner-b");
        let result = store
            .get_scoped(path, Some("owner-a"), AccessLevel::Private, &ctx)
            .await;
        assert!(result.is_err());
    }
}
