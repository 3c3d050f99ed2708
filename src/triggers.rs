use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::approval;
use crate::claims::ClaimsSyncService;
use crate::model::{self, AuditLogEntry, Fields, PROJECTS, USERS};
use crate::store::object::ObjectStore;
use crate::store::{ChangeKind, DocumentChange, DocumentStore, Records};

const UPDATED_AT: &str = "updatedAt";

/// Reacts to committed document writes with best-effort side effects. A
/// failing side effect is logged; the write that caused it stands.
pub struct TriggerDispatcher {
    store: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    claims: Arc<ClaimsSyncService>,
}

impl TriggerDispatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        claims: Arc<ClaimsSyncService>,
    ) -> Self {
        Self {
            store,
            objects,
            claims,
        }
    }

    /// Consumes changes until the store is dropped.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<DocumentChange>) {
        info!("Trigger dispatcher started");
        loop {
            match rx.recv().await {
                Ok(change) => {
                    let now = Utc::now().timestamp() as u64;
                    self.dispatch(&change, now).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Trigger dispatcher lagged, {skipped} changes skipped");
                }
                Err(RecvError::Closed) => {
                    info!("Document change channel closed, trigger dispatcher exits");
                    return;
                }
            }
        }
    }

    /// Dispatches every queued change, including the ones produced by the
    /// side effects themselves, until the queue is empty. Returns the number
    /// of changes handled.
    pub async fn drain(&self, rx: &mut broadcast::Receiver<DocumentChange>, now: u64) -> usize {
        let mut handled = 0;
        loop {
            match rx.try_recv() {
                Ok(change) => {
                    self.dispatch(&change, now).await;
                    handled += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Trigger drain lagged, {skipped} changes skipped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return handled,
            }
        }
    }

    pub async fn dispatch(&self, change: &DocumentChange, now: u64) {
        debug!(
            "Trigger {:?} {}/{}",
            change.kind(),
            change.collection,
            change.id
        );
        if change.kind() == ChangeKind::Deleted {
            return;
        }

        if change.collection == USERS {
            self.on_user_write(change).await;
        } else if change.collection == PROJECTS {
            if change.kind() == ChangeKind::Created {
                self.on_project_created(change, now);
            }
            self.on_project_write(change, now);
        } else if model::files_collection_project(&change.collection).is_some() {
            if change.kind() == ChangeKind::Updated {
                self.on_file_updated(change, now);
            }
        }
    }

    /// Converges against the role document as stored now, not the change
    /// payload: notifications of concurrent writes may arrive out of order.
    async fn on_user_write(&self, change: &DocumentChange) {
        let user = match self.store.get_user(&change.id) {
            Ok(Some(user)) => user,
            Ok(None) => return,
            Err(e) => {
                error!("Read role document {} failed: {e:#}", change.id);
                return;
            }
        };
        self.claims.on_role_write(&user).await;
    }

    fn on_project_created(&self, change: &DocumentChange, now: u64) {
        let key = format!("{PROJECTS}/{}/.init", change.id);
        if let Err(e) = self.objects.put(&key, b"") {
            error!("Initialize upload folder for project {} failed: {e:#}", change.id);
        }

        let after = change.after.as_ref();
        let field = |name: &str| {
            after
                .and_then(|f| f.get(name))
                .and_then(|v| v.as_str())
                .map(String::from)
        };
        let entry = AuditLogEntry {
            id: String::new(),
            project_id: change.id.clone(),
            file_id: None,
            action: String::from("project:created"),
            timestamp: now,
            actor: field("createdBy").unwrap_or_else(|| String::from("unknown")),
            message: Some(format!(
                "Project {} created",
                field("name").unwrap_or_else(|| change.id.clone())
            )),
        };
        if let Err(e) = self.store.append_audit(&entry) {
            error!("Audit creation of project {} failed: {e:#}", change.id);
        }
    }

    fn on_project_write(&self, change: &DocumentChange, now: u64) {
        if only_updated_at_changed(change) {
            return;
        }
        let mut fields = Fields::new();
        fields.insert(String::from(UPDATED_AT), json!(now));
        if let Err(e) = self.store.merge(PROJECTS, &change.id, fields) {
            error!("Stamp updatedAt of project {} failed: {e:#}", change.id);
        }
    }

    fn on_file_updated(&self, change: &DocumentChange, now: u64) {
        let entry = match approval::status_change_entry(change, now) {
            Some(entry) => entry,
            None => return,
        };
        if let Err(e) = self.store.append_audit(&entry) {
            error!(
                "Audit status change of file {}/{} failed: {e:#}",
                entry.project_id, change.id
            );
        }
    }
}

fn without_updated_at(fields: &Fields) -> Fields {
    let mut fields = fields.clone();
    fields.remove(UPDATED_AT);
    fields
}

/// True when nothing but `updatedAt` differs, i.e. the write is the stamp
/// itself or a no-op rewrite.
fn only_updated_at_changed(change: &DocumentChange) -> bool {
    match (&change.before, &change.after) {
        (Some(before), Some(after)) => without_updated_at(before) == without_updated_at(after),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use crate::identity::{IdentityProvider, LocalIdentityProvider};
    use crate::model::{FileRecord, Project, Role};
    use crate::store::object::MemoryObjectStore;
    use crate::store::SqliteStore;

    use super::*;

    struct Fixture {
        provider: Arc<LocalIdentityProvider>,
        store: Arc<SqliteStore>,
        objects: Arc<MemoryObjectStore>,
        dispatcher: TriggerDispatcher,
        rx: broadcast::Receiver<DocumentChange>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(LocalIdentityProvider::new_test());
        let store = Arc::new(SqliteStore::memory().unwrap());
        let objects = Arc::new(MemoryObjectStore::new(String::from("/objects")));
        let claims = Arc::new(ClaimsSyncService::new(
            provider.clone(),
            store.clone(),
            Duration::from_secs(1),
        ));
        let rx = store.subscribe();
        let dispatcher = TriggerDispatcher::new(store.clone(), objects.clone(), claims);
        Fixture {
            provider,
            store,
            objects,
            dispatcher,
            rx,
        }
    }

    #[tokio::test]
    async fn test_role_write_syncs_claims() {
        let mut f = fixture();
        let token = f.provider.sign_in("gina@example.com", 100).unwrap();
        let uid = f.provider.verify_id_token(&token, 100).await.unwrap().uid;

        f.store.upsert_login(&uid, "gina@example.com", 100).unwrap();
        f.dispatcher.drain(&mut f.rx, 100).await;
        assert!(!f.provider.get_user(&uid).await.unwrap().is_admin());

        f.store.set_role(&uid, Role::Admin).unwrap();
        f.dispatcher.drain(&mut f.rx, 101).await;
        assert!(f.provider.get_user(&uid).await.unwrap().is_admin());

        f.store.set_role(&uid, Role::Client).unwrap();
        f.dispatcher.drain(&mut f.rx, 102).await;
        assert!(!f.provider.get_user(&uid).await.unwrap().is_admin());
    }

    #[tokio::test]
    async fn test_malformed_role_demotes() {
        let mut f = fixture();
        let token = f.provider.sign_in("ivan@example.com", 100).unwrap();
        let uid = f.provider.verify_id_token(&token, 100).await.unwrap().uid;

        f.store.set_role(&uid, Role::Admin).unwrap();
        f.dispatcher.drain(&mut f.rx, 100).await;
        assert!(f.provider.get_user(&uid).await.unwrap().is_admin());

        for role in [json!(null), json!(1)] {
            f.store.set_role(&uid, Role::Admin).unwrap();
            f.dispatcher.drain(&mut f.rx, 101).await;
            f.store
                .merge(USERS, &uid, model::encode(&json!({ "role": role })).unwrap())
                .unwrap();
            f.dispatcher.drain(&mut f.rx, 102).await;
            assert!(!f.provider.get_user(&uid).await.unwrap().is_admin());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_role_change() {
        let mut f = fixture();
        let token = f.provider.sign_in("judy@example.com", 100).unwrap();
        let uid = f.provider.verify_id_token(&token, 100).await.unwrap().uid;

        f.store.set_role(&uid, Role::Admin).unwrap();
        f.store.set_role(&uid, Role::Client).unwrap();
        let first = f.rx.try_recv().unwrap();
        let second = f.rx.try_recv().unwrap();

        // The later write is delivered first.
        f.dispatcher.dispatch(&second, 101).await;
        f.dispatcher.dispatch(&first, 101).await;
        assert!(!f.provider.get_user(&uid).await.unwrap().is_admin());
    }

    #[tokio::test]
    async fn test_project_created() {
        let mut f = fixture();
        let project = Project {
            name: String::from("Brand refresh"),
            client_email: String::from("client@example.com"),
            status: String::from("active"),
            created_at: 100,
            created_by: Some(String::from("admin@example.com")),
            ..Default::default()
        };
        let id = f.store.create_project(&project).unwrap();

        // create + updatedAt stamp (ignored) + audit append
        let handled = f.dispatcher.drain(&mut f.rx, 150).await;
        assert_eq!(handled, 3);

        assert_eq!(f.objects.get(&format!("projects/{id}/.init")).unwrap(), b"");

        let stored = f.store.get_project(&id).unwrap().unwrap();
        assert_eq!(stored.updated_at, Some(150));

        let audit = f.store.list_audit(&id).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "project:created");
        assert_eq!(audit[0].actor, "admin@example.com");
    }

    #[tokio::test]
    async fn test_project_updated_at() {
        let mut f = fixture();
        let id = f
            .store
            .create_project(&Project {
                client_email: String::from("client@example.com"),
                ..Default::default()
            })
            .unwrap();
        f.dispatcher.drain(&mut f.rx, 150).await;

        f.store
            .merge(PROJECTS, &id, model::encode(&json!({"status": "archived"})).unwrap())
            .unwrap();
        f.dispatcher.drain(&mut f.rx, 200).await;
        let stored = f.store.get_project(&id).unwrap().unwrap();
        assert_eq!(stored.status, "archived");
        assert_eq!(stored.updated_at, Some(200));
        assert_eq!(f.store.list_audit(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_status_audit() {
        let mut f = fixture();
        let file = FileRecord::new_upload(
            String::from("a.pdf"),
            String::from("/objects/a.pdf"),
            1,
            String::from("client@example.com"),
            100,
        );
        let file_id = f.store.create_file("p1", &file).unwrap();
        f.dispatcher.drain(&mut f.rx, 100).await;
        assert!(f.store.list_audit("p1").unwrap().is_empty());

        approval::toggle_approval(f.store.as_ref(), "p1", &file_id, "admin@example.com", 200).unwrap();
        f.dispatcher.drain(&mut f.rx, 200).await;
        approval::toggle_approval(f.store.as_ref(), "p1", &file_id, "admin@example.com", 300).unwrap();
        f.dispatcher.drain(&mut f.rx, 300).await;

        let actions: Vec<_> = f
            .store
            .list_audit("p1")
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["status:pending->approved", "status:approved->pending"]);
    }

    #[test]
    fn test_only_updated_at_changed() {
        let fields = |v: Value| model::encode(&v).unwrap();
        let change = DocumentChange {
            collection: String::from(PROJECTS),
            id: String::from("p1"),
            before: Some(fields(json!({"name": "a", "updatedAt": 1}))),
            after: Some(fields(json!({"name": "a", "updatedAt": 2}))),
        };
        assert!(only_updated_at_changed(&change));

        let change = DocumentChange {
            after: Some(fields(json!({"name": "b", "updatedAt": 1}))),
            ..change
        };
        assert!(!only_updated_at_changed(&change));

        let change = DocumentChange {
            before: None,
            ..change
        };
        assert!(!only_updated_at_changed(&change));
    }
}
