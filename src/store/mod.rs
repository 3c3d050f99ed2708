mod sqlite;

pub mod object;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::model::{
    self, AuditLogEntry, Fields, FileRecord, Project, Role, UserRoleDocument, AUDIT_LOGS,
    PROJECTS, USERS,
};

pub use sqlite::SqliteStore;

/// A stored document: its id within the collection plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

/// Change notification published after every committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub collection: String,
    pub id: String,
    pub before: Option<Fields>,
    pub after: Option<Fields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl DocumentChange {
    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), Some(_)) => ChangeKind::Updated,
            _ => ChangeKind::Deleted,
        }
    }

    /// Value of `field` before and after the write.
    pub fn field(&self, field: &str) -> (Option<&Value>, Option<&Value>) {
        let before = self.before.as_ref().and_then(|f| f.get(field));
        let after = self.after.as_ref().and_then(|f| f.get(field));
        (before, after)
    }
}

/// Keyed document storage with per-document atomic writes and change
/// notifications. Collections are slash-separated paths, e.g.
/// `projects/{projectId}/files`.
pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Creates the document only if it does not exist yet, in one
    /// transaction. Returns whether it was created.
    fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<bool>;

    /// Creates or replaces the whole document.
    fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Creates the document, or overwrites only the given top-level fields.
    fn merge(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Creates a document under a generated id and returns the id.
    fn add(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Lists a collection in creation order, optionally keeping only documents
    /// whose top-level `field` equals `value`.
    fn list(&self, collection: &str, filter: Option<(&str, &Value)>) -> Result<Vec<Document>>;

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;
}

/// Typed access to the portal collections on top of any [`DocumentStore`].
pub trait Records: DocumentStore {
    fn get_user(&self, uid: &str) -> Result<Option<UserRoleDocument>> {
        let user = self
            .get(USERS, uid)?
            .map(|doc| UserRoleDocument::from_fields(doc.id, &doc.fields));
        Ok(user)
    }

    fn list_users(&self) -> Result<Vec<UserRoleDocument>> {
        let users = self
            .list(USERS, None)?
            .into_iter()
            .map(|doc| UserRoleDocument::from_fields(doc.id, &doc.fields))
            .collect();
        Ok(users)
    }

    /// First login creates the role document as a client; later logins only
    /// touch `lastLogin` and `email`.
    fn upsert_login(&self, uid: &str, email: &str, now: u64) -> Result<bool> {
        let user = UserRoleDocument {
            uid: uid.to_string(),
            role: Role::Client.to_string(),
            email: Some(email.to_string()),
            created_at: Some(now),
            last_login: Some(now),
        };
        if self.create(USERS, uid, model::encode(&user)?)? {
            return Ok(true);
        }

        let fields = model::encode(&json!({ "email": email, "lastLogin": now }))?;
        self.merge(USERS, uid, fields)?;
        Ok(false)
    }

    fn set_role(&self, uid: &str, role: Role) -> Result<()> {
        let fields = model::encode(&json!({ "role": role.as_str() }))?;
        self.merge(USERS, uid, fields)
    }

    fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let doc = match self.get(PROJECTS, id)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let mut project: Project = model::decode(&doc.fields)?;
        project.id = doc.id;
        Ok(Some(project))
    }

    fn list_projects(&self, client_email: Option<&str>) -> Result<Vec<Project>> {
        let email = client_email.map(|e| Value::String(e.to_string()));
        let filter = email.as_ref().map(|e| ("clientEmail", e));
        self.list(PROJECTS, filter)?
            .into_iter()
            .map(|doc| {
                let mut project: Project = model::decode(&doc.fields)?;
                project.id = doc.id;
                Ok(project)
            })
            .collect()
    }

    fn create_project(&self, project: &Project) -> Result<String> {
        self.add(PROJECTS, model::encode(project)?)
    }

    fn get_file(&self, project_id: &str, file_id: &str) -> Result<Option<FileRecord>> {
        let doc = match self.get(&model::files_collection(project_id), file_id)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let mut file: FileRecord = model::decode(&doc.fields)?;
        file.id = doc.id;
        Ok(Some(file))
    }

    /// Newest upload first.
    fn list_files(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let mut files = self
            .list(&model::files_collection(project_id), None)?
            .into_iter()
            .map(|doc| {
                let mut file: FileRecord = model::decode(&doc.fields)?;
                file.id = doc.id;
                Ok(file)
            })
            .collect::<Result<Vec<_>>>()?;
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    fn create_file(&self, project_id: &str, file: &FileRecord) -> Result<String> {
        self.add(&model::files_collection(project_id), model::encode(file)?)
    }

    fn put_file(&self, project_id: &str, file: &FileRecord) -> Result<()> {
        self.set(
            &model::files_collection(project_id),
            &file.id,
            model::encode(file)?,
        )
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<String> {
        self.add(AUDIT_LOGS, model::encode(entry)?)
            .context("append audit log")
    }

    fn list_audit(&self, project_id: &str) -> Result<Vec<AuditLogEntry>> {
        let project_id = Value::String(project_id.to_string());
        let mut entries = self
            .list(AUDIT_LOGS, Some(("projectId", &project_id)))?
            .into_iter()
            .map(|doc| {
                let mut entry: AuditLogEntry = model::decode(&doc.fields)?;
                entry.id = doc.id;
                Ok(entry)
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

impl<S: DocumentStore + ?Sized> Records for S {}
