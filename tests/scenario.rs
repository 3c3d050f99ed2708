use std::sync::Arc;

use actix_web::cookie::Cookie;
use actix_web::http::header::LOCATION;
use actix_web::http::StatusCode;
use actix_web::middleware::from_fn;
use actix_web::{test, web, App};
use chrono::Utc;
use portal_auth::config::ServerConfig;
use portal_auth::context::ServerContext;
use portal_auth::gate::{self, SessionState};
use portal_auth::identity::{IdentityProvider, LocalIdentityProvider};
use portal_auth::model::Role;
use portal_auth::restful;
use portal_auth::store::object::MemoryObjectStore;
use portal_auth::store::{Records, SqliteStore};
use serde_json::{json, Value};

const COOKIE: &str = "__session";

struct Reply {
    status: StatusCode,
    location: Option<String>,
    cookie: Option<Cookie<'static>>,
    json: Value,
}

macro_rules! send {
    ($app:expr, $req:expr) => {{
        let resp = test::call_service(&$app, $req.to_request()).await;
        let status = resp.status();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let cookie = resp
            .response()
            .cookies()
            .find(|c| c.name() == COOKIE)
            .map(|c| c.into_owned());
        let body = test::read_body(resp).await;
        let json: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        Reply {
            status,
            location,
            cookie,
            json,
        }
    }};
}

fn now() -> u64 {
    Utc::now().timestamp() as u64
}

fn setup() -> (Arc<ServerContext>, Arc<LocalIdentityProvider>) {
    let provider = Arc::new(
        LocalIdentityProvider::memory(
            include_bytes!("../src/testdata/identity_private.pem"),
            include_bytes!("../src/testdata/identity_public.pem"),
            3600,
        )
        .unwrap(),
    );
    let ctx = ServerContext::new(
        ServerConfig::default(),
        provider.clone(),
        Arc::new(SqliteStore::memory().unwrap()),
        Arc::new(MemoryObjectStore::new(String::from("/objects"))),
        include_bytes!("../src/testdata/session_private.pem"),
        include_bytes!("../src/testdata/session_public.pem"),
    )
    .unwrap();
    (Arc::new(ctx), provider)
}

fn mint_request(id_token: &str) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/api/session")
        .set_json(json!({ "idToken": id_token }))
}

#[actix_web::test]
async fn scenario() {
    let (ctx, provider) = setup();
    let mut changes = ctx.store.subscribe();
    let app = test::init_service(
        App::new()
            .wrap(from_fn(gate::authorize))
            .configure(restful::configure(ctx.clone(), 32))
            .default_service(web::route().to(restful::default_handler)),
    )
    .await;

    // No cookie: protected routes redirect to sign-in with a return target.
    let reply = send!(app, test::TestRequest::get().uri("/dashboard/x"));
    assert_eq!(reply.status, StatusCode::FOUND);
    assert_eq!(reply.location.as_deref(), Some("/login?redirect=/dashboard/x"));

    let reply = send!(app, test::TestRequest::get().uri("/login?redirect=/dashboard/x"));
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["redirect"], "/dashboard/x");

    // Bad identity tokens never set a cookie.
    let reply = send!(app, mint_request("garbage"));
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json["error"], "invalid-token");
    assert!(reply.cookie.is_none());
    let reply = send!(app, test::TestRequest::post().uri("/api/session"));
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    // Admin A signs in as a client first.
    let a_token = provider.sign_in("a@x.com", now()).unwrap();
    let reply = send!(app, mint_request(&a_token));
    assert_eq!(reply.status, StatusCode::OK);
    let a_uid = reply.json["uid"].as_str().unwrap().to_string();
    let a_stale = reply.cookie.unwrap();
    assert_eq!(a_stale.http_only(), Some(true));
    changes_drain(&ctx, &mut changes).await;
    assert_eq!(
        ctx.store.get_user(&a_uid).unwrap().unwrap().desired_role(),
        Role::Client
    );

    // Promote through the role document; the claim follows the trigger.
    ctx.store.set_role(&a_uid, Role::Admin).unwrap();
    changes_drain(&ctx, &mut changes).await;
    assert!(provider.get_user(&a_uid).await.unwrap().is_admin());

    // The old credential still carries the non-admin snapshot.
    let reply = send!(app, test::TestRequest::get().uri("/admin").cookie(a_stale.clone()));
    assert_eq!(reply.status, StatusCode::FOUND);
    assert_eq!(reply.location.as_deref(), Some("/portal"));
    assert!(matches!(
        ctx.gate.session_state(Some(a_stale.value()), now()),
        SessionState::NonAdmin(_)
    ));

    // Refreshing with the cached identity token changes nothing.
    let reply = send!(
        app,
        test::TestRequest::post()
            .uri("/api/session/refresh")
            .set_json(json!({ "idToken": a_token }))
    );
    assert_eq!(reply.status, StatusCode::OK);
    let cookie = reply.cookie.unwrap();
    assert!(matches!(
        ctx.gate.session_state(Some(cookie.value()), now()),
        SessionState::NonAdmin(_)
    ));

    // A force-fetched identity token makes the promotion visible.
    let fresh = provider.issue_id_token(&a_uid, now()).unwrap();
    let reply = send!(
        app,
        test::TestRequest::post()
            .uri("/api/session/refresh")
            .set_json(json!({ "idToken": fresh }))
    );
    assert_eq!(reply.status, StatusCode::OK);
    let a_cookie = reply.cookie.unwrap();
    let reply = send!(app, test::TestRequest::get().uri("/admin/projects").cookie(a_cookie.clone()));
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["admin"], true);
    assert_eq!(reply.json["path"], "/admin/projects");

    // A creates a project for client P.
    let reply = send!(
        app,
        test::TestRequest::post()
            .uri("/api/projects")
            .cookie(a_cookie.clone())
            .set_json(json!({ "name": "Launch", "clientEmail": "p@x.com" }))
    );
    assert_eq!(reply.status, StatusCode::OK);
    let pid = reply.json["id"].as_str().unwrap().to_string();
    changes_drain(&ctx, &mut changes).await;
    let project = ctx.store.get_project(&pid).unwrap().unwrap();
    assert!(project.updated_at.is_some());
    let audit = ctx.store.list_audit(&pid).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "project:created");
    assert_eq!(audit[0].actor, "a@x.com");

    // Client P signs in and uploads F.
    let p_token = provider.sign_in("p@x.com", now()).unwrap();
    let reply = send!(app, mint_request(&p_token));
    let p_cookie = reply.cookie.unwrap();
    changes_drain(&ctx, &mut changes).await;

    let reply = send!(
        app,
        test::TestRequest::post()
            .uri(&format!("/api/projects/{pid}/files"))
            .cookie(p_cookie.clone())
            .insert_header(("X-File-Name", "brief.pdf"))
            .set_payload("pdf bytes")
    );
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["status"], "pending");
    assert_eq!(reply.json["url"], format!("/objects/client_uploads/{pid}/brief.pdf"));
    assert_eq!(reply.json["size"], 9);
    let fid = reply.json["id"].as_str().unwrap().to_string();
    changes_drain(&ctx, &mut changes).await;

    // Clients can neither toggle nor grant.
    let toggle_uri = format!("/api/projects/{pid}/files/{fid}/toggle");
    let reply = send!(app, test::TestRequest::post().uri(&toggle_uri).cookie(p_cookie.clone()));
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    let reply = send!(
        app,
        test::TestRequest::post()
            .uri("/api/admin/grant")
            .cookie(p_cookie.clone())
            .set_json(json!({ "email": "p@x.com" }))
    );
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.json["error"], "permission-denied");

    // Client pages are reachable, admin pages bounce to the portal.
    let reply = send!(app, test::TestRequest::get().uri("/portal").cookie(p_cookie.clone()));
    assert_eq!(reply.status, StatusCode::OK);
    let reply = send!(app, test::TestRequest::get().uri("/admin").cookie(p_cookie.clone()));
    assert_eq!(reply.status, StatusCode::FOUND);
    assert_eq!(reply.location.as_deref(), Some("/portal"));

    // A approves F.
    let reply = send!(app, test::TestRequest::post().uri(&toggle_uri).cookie(a_cookie.clone()));
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["status"], "approved");
    assert_eq!(reply.json["reviewedBy"], "a@x.com");
    assert!(reply.json["reviewedAt"].is_u64());
    changes_drain(&ctx, &mut changes).await;

    let audit: Vec<_> = ctx
        .store
        .list_audit(&pid)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(audit, vec!["project:created", "status:pending->approved"]);

    // P sees the approved file on their dashboard query.
    let reply = send!(
        app,
        test::TestRequest::get()
            .uri(&format!("/api/projects/{pid}/files"))
            .cookie(p_cookie.clone())
    );
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json[0]["id"], fid.as_str());
    assert_eq!(reply.json[0]["status"], "approved");

    // P only sees their own project.
    let reply = send!(app, test::TestRequest::get().uri("/api/projects").cookie(p_cookie.clone()));
    assert_eq!(reply.json.as_array().unwrap().len(), 1);
    assert_eq!(reply.json[0]["clientEmail"], "p@x.com");

    // Toggling back clears the reviewer and audits the reverse transition.
    let reply = send!(app, test::TestRequest::post().uri(&toggle_uri).cookie(a_cookie.clone()));
    assert_eq!(reply.json["status"], "pending");
    assert_eq!(reply.json["reviewedBy"], Value::Null);
    assert_eq!(reply.json["reviewedAt"], Value::Null);
    changes_drain(&ctx, &mut changes).await;
    let audit = ctx.store.list_audit(&pid).unwrap();
    assert_eq!(audit.len(), 3);
    assert_eq!(audit[2].action, "status:approved->pending");

    // Logout clears the cookie; replaying the cleared value is unauthenticated.
    let reply = send!(app, test::TestRequest::post().uri("/api/session/logout").cookie(p_cookie.clone()));
    assert_eq!(reply.status, StatusCode::OK);
    let cleared = reply.cookie.unwrap();
    assert_eq!(cleared.value(), "");
    assert_eq!(cleared.max_age(), Some(actix_web::cookie::time::Duration::ZERO));
    assert_eq!(
        ctx.gate.session_state(Some(cleared.value()), now()),
        SessionState::Unauthenticated
    );
    let reply = send!(app, test::TestRequest::get().uri("/dashboard").cookie(cleared));
    assert_eq!(reply.status, StatusCode::FOUND);
    assert_eq!(reply.location.as_deref(), Some("/login?redirect=/dashboard"));

    let reply = send!(app, test::TestRequest::get().uri("/nothing/here"));
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json["error"], "not-found");
}

#[actix_web::test]
async fn admin_grant() {
    let (ctx, provider) = setup();
    let mut changes = ctx.store.subscribe();
    let app = test::init_service(
        App::new()
            .wrap(from_fn(gate::authorize))
            .configure(restful::configure(ctx.clone(), 32))
            .default_service(web::route().to(restful::default_handler)),
    )
    .await;

    let reply = send!(
        app,
        test::TestRequest::post()
            .uri("/api/admin/grant")
            .set_json(json!({ "email": "b@x.com" }))
    );
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.json["error"], "unauthenticated");

    // Bootstrap an admin through the role document.
    let admin_token = provider.sign_in("root@x.com", now()).unwrap();
    let admin_uid = provider.verify_id_token(&admin_token, now()).await.unwrap().uid;
    ctx.store.upsert_login(&admin_uid, "root@x.com", now()).unwrap();
    ctx.store.set_role(&admin_uid, Role::Admin).unwrap();
    changes_drain(&ctx, &mut changes).await;
    let fresh = provider.issue_id_token(&admin_uid, now()).unwrap();
    let admin_cookie = send!(app, mint_request(&fresh)).cookie.unwrap();

    let b_token = provider.sign_in("b@x.com", now()).unwrap();
    let b_uid = send!(app, mint_request(&b_token)).json["uid"]
        .as_str()
        .unwrap()
        .to_string();
    changes_drain(&ctx, &mut changes).await;

    let grant = |email: &str| {
        test::TestRequest::post()
            .uri("/api/admin/grant")
            .cookie(admin_cookie.clone())
            .set_json(json!({ "email": email }))
    };

    let reply = send!(app, grant(""));
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json["error"], "invalid-argument");

    let reply = send!(app, grant("ghost@x.com"));
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.json["error"], "internal");
    assert!(!reply.json.to_string().contains("ghost"));

    let reply = send!(app, grant("b@x.com"));
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json["uid"], b_uid.as_str());

    // The role document was promoted too, so the trigger keeps the claim.
    changes_drain(&ctx, &mut changes).await;
    assert!(provider.get_user(&b_uid).await.unwrap().is_admin());
    assert_eq!(
        ctx.store.get_user(&b_uid).unwrap().unwrap().desired_role(),
        Role::Admin
    );

    // Demotion through the role edit endpoint converges the claim back.
    let reply = send!(
        app,
        test::TestRequest::put()
            .uri(&format!("/api/users/{b_uid}/role"))
            .cookie(admin_cookie.clone())
            .set_json(json!({ "role": "client" }))
    );
    assert_eq!(reply.status, StatusCode::OK);
    changes_drain(&ctx, &mut changes).await;
    assert!(!provider.get_user(&b_uid).await.unwrap().is_admin());

    let reply = send!(
        app,
        test::TestRequest::put()
            .uri(&format!("/api/users/{b_uid}/role"))
            .cookie(admin_cookie.clone())
            .set_json(json!({ "role": "owner" }))
    );
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

async fn changes_drain(
    ctx: &ServerContext,
    changes: &mut tokio::sync::broadcast::Receiver<portal_auth::store::DocumentChange>,
) {
    ctx.triggers.drain(changes, now()).await;
}
