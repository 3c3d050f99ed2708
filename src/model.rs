use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level fields of a stored document.
pub type Fields = serde_json::Map<String, Value>;

pub const USERS: &str = "users";
pub const PROJECTS: &str = "projects";
pub const AUDIT_LOGS: &str = "projectLogs";

const FILES_SUFFIX: &str = "/files";

pub fn files_collection(project_id: &str) -> String {
    format!("{PROJECTS}/{project_id}{FILES_SUFFIX}")
}

/// Inverse of [`files_collection`].
pub fn files_collection_project(collection: &str) -> Option<&str> {
    let rest = collection.strip_prefix(PROJECTS)?.strip_prefix('/')?;
    let project_id = rest.strip_suffix(FILES_SUFFIX)?;
    if project_id.is_empty() || project_id.contains('/') {
        return None;
    }
    Some(project_id)
}

pub fn encode<T: Serialize>(record: &T) -> Result<Fields> {
    match serde_json::to_value(record).context("encode record")? {
        Value::Object(fields) => Ok(fields),
        other => bail!("record must encode to an object, got {other}"),
    }
}

pub fn decode<T: DeserializeOwned>(fields: &Fields) -> Result<T> {
    serde_json::from_value(Value::Object(fields.clone())).context("decode record")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Client => "client",
        }
    }

    /// Desired state read off a role field: only the literal `"admin"` grants.
    pub fn from_field(value: &str) -> Self {
        if value == "admin" {
            Role::Admin
        } else {
            Role::Client
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "client" => Ok(Role::Client),
            _ => bail!("unknown role '{s}', expect 'admin' or 'client'"),
        }
    }
}

/// `users/{uid}`. The `role` field is desired state for claims sync; it
/// never grants access by itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleDocument {
    #[serde(skip)]
    pub uid: String,

    #[serde(default)]
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<u64>,
}

impl UserRoleDocument {
    /// Reads a role document field by field. Hand-edited documents may carry
    /// any JSON type; a field of the wrong type reads as absent, so a
    /// malformed `role` is a client.
    pub fn from_fields(uid: String, fields: &Fields) -> Self {
        let string = |key: &str| fields.get(key).and_then(Value::as_str).map(String::from);
        Self {
            uid,
            role: string("role").unwrap_or_default(),
            email: string("email"),
            created_at: fields.get("createdAt").and_then(Value::as_u64),
            last_login: fields.get("lastLogin").and_then(Value::as_u64),
        }
    }

    pub fn desired_role(&self) -> Role {
        Role::from_field(&self.role)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(skip)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub client_email: String,

    #[serde(default = "Project::default_status")]
    pub status: String,

    #[serde(default)]
    pub created_at: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Project {
    fn default_status() -> String {
        String::from("active")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Approved,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Approved => "approved",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            FileStatus::Pending => FileStatus::Approved,
            FileStatus::Approved => FileStatus::Pending,
        }
    }
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `projects/{projectId}/files/{fileId}`.
///
/// `reviewed_by`/`reviewed_at` always serialize (as null when cleared) so a
/// merge write erases stale reviewer data instead of leaving it behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(skip)]
    pub id: String,

    pub name: String,
    pub url: String,
    pub size: u64,
    pub status: FileStatus,
    pub uploaded_by: String,
    pub uploaded_at: u64,

    #[serde(default)]
    pub reviewed_by: Option<String>,

    #[serde(default)]
    pub reviewed_at: Option<u64>,

    /// Last principal to flip `status`, kept for audit attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_changed_by: Option<String>,
}

impl FileRecord {
    /// Every upload starts `pending`, whoever the uploader is.
    pub fn new_upload(name: String, url: String, size: u64, uploaded_by: String, now: u64) -> Self {
        Self {
            id: String::new(),
            name,
            url,
            size,
            status: FileStatus::Pending,
            uploaded_by,
            uploaded_at: now,
            reviewed_by: None,
            reviewed_at: None,
            status_changed_by: None,
        }
    }
}

/// `projectLogs/{id}`, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[serde(skip)]
    pub id: String,

    pub project_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    pub action: String,
    pub timestamp: u64,
    pub actor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_files_collection() {
        assert_eq!(files_collection("p1"), "projects/p1/files");
        assert_eq!(files_collection_project("projects/p1/files"), Some("p1"));
        assert_eq!(files_collection_project("projects"), None);
        assert_eq!(files_collection_project("projects//files"), None);
        assert_eq!(files_collection_project("projects/a/b/files"), None);
        assert_eq!(files_collection_project("users/p1/files"), None);
    }

    #[test]
    fn test_role() {
        assert_eq!(Role::from_field("admin"), Role::Admin);
        assert_eq!(Role::from_field("client"), Role::Client);
        assert_eq!(Role::from_field("Admin"), Role::Client);
        assert_eq!(Role::from_field(""), Role::Client);
        assert!("owner".parse::<Role>().is_err());
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
    }

    #[test]
    fn test_user_from_fields() {
        let fields = encode(&json!({"role": "admin", "email": "a@x.com", "lastLogin": 7})).unwrap();
        let user = UserRoleDocument::from_fields(String::from("u1"), &fields);
        assert_eq!(user.uid, "u1");
        assert_eq!(user.desired_role(), Role::Admin);
        assert_eq!(user.email.as_deref(), Some("a@x.com"));
        assert_eq!(user.last_login, Some(7));
        assert_eq!(user.created_at, None);

        for role in [json!(null), json!(1), json!(true), json!(["admin"])] {
            let fields = encode(&json!({"role": role, "email": 42})).unwrap();
            let user = UserRoleDocument::from_fields(String::from("u1"), &fields);
            assert_eq!(user.desired_role(), Role::Client);
            assert_eq!(user.email, None);
        }
    }

    #[test]
    fn test_file_record_fields() {
        let mut file = FileRecord::new_upload(
            String::from("proposal.pdf"),
            String::from("/objects/projects/p1/proposal.pdf"),
            2048,
            String::from("client@example.com"),
            100,
        );
        let fields = encode(&file).unwrap();
        assert_eq!(fields["status"], json!("pending"));
        assert_eq!(fields["uploadedBy"], json!("client@example.com"));
        assert_eq!(fields["reviewedBy"], Value::Null);
        assert!(!fields.contains_key("id"));

        file.status = FileStatus::Approved;
        file.reviewed_by = Some(String::from("admin@example.com"));
        let decoded: FileRecord = decode(&encode(&file).unwrap()).unwrap();
        assert_eq!(decoded.status, FileStatus::Approved);
        assert_eq!(decoded.reviewed_by.as_deref(), Some("admin@example.com"));
    }

    #[test]
    fn test_user_document_lenient() {
        let fields = encode(&json!({"email": "a@x.com", "name": "New User"})).unwrap();
        let doc: UserRoleDocument = decode(&fields).unwrap();
        assert_eq!(doc.desired_role(), Role::Client);
        assert_eq!(doc.email.as_deref(), Some("a@x.com"));
    }
}
