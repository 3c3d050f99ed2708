use log::info;

use crate::error::{AuthError, AuthResult};
use crate::model::{self, AuditLogEntry, FileRecord, FileStatus};
use crate::store::{DocumentChange, DocumentStore, Records};

const UNKNOWN_ACTOR: &str = "unknown";

/// Flips `pending <-> approved`. Entering `approved` records the reviewer,
/// entering `pending` clears it. The caller must already hold an admin
/// session.
pub fn toggle(file: &FileRecord, actor: &str, now: u64) -> FileRecord {
    let mut next = file.clone();
    next.status = file.status.toggled();
    next.status_changed_by = Some(actor.to_string());
    match next.status {
        FileStatus::Approved => {
            next.reviewed_by = Some(actor.to_string());
            next.reviewed_at = Some(now);
        }
        FileStatus::Pending => {
            next.reviewed_by = None;
            next.reviewed_at = None;
        }
    }
    next
}

/// Reads the file, applies [`toggle`] and writes it back. Concurrent
/// toggles on one file are last-write-wins.
pub fn toggle_approval(
    store: &dyn DocumentStore,
    project_id: &str,
    file_id: &str,
    actor: &str,
    now: u64,
) -> AuthResult<FileRecord> {
    let file = store
        .get_file(project_id, file_id)
        .map_err(AuthError::store)?
        .ok_or_else(|| AuthError::NotFound(format!("file {project_id}/{file_id}")))?;

    let next = toggle(&file, actor, now);
    store.put_file(project_id, &next).map_err(AuthError::store)?;

    info!(
        "File {project_id}/{file_id} {} -> {} by {actor}",
        file.status, next.status
    );
    Ok(next)
}

/// Audit entry for a file write whose `status` changed, `None` otherwise.
pub fn status_change_entry(change: &DocumentChange, now: u64) -> Option<AuditLogEntry> {
    let project_id = model::files_collection_project(&change.collection)?;
    let (before, after) = change.field("status");
    let old = before?.as_str()?;
    let new = after?.as_str()?;
    if old == new {
        return None;
    }

    let actor = change
        .after
        .as_ref()
        .and_then(|f| f.get("statusChangedBy"))
        .and_then(|v| v.as_str())
        .unwrap_or(UNKNOWN_ACTOR);
    let name = change
        .after
        .as_ref()
        .and_then(|f| f.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or(&change.id);

    Some(AuditLogEntry {
        id: String::new(),
        project_id: project_id.to_string(),
        file_id: Some(change.id.clone()),
        action: format!("status:{old}->{new}"),
        timestamp: now,
        actor: actor.to_string(),
        message: Some(format!("File {name} status changed from {old} to {new}")),
    })
}
