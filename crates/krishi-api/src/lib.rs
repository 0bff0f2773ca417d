pub mod auth;
pub mod blobs;
pub mod chat;
pub mod error;
pub mod middleware;
pub mod otp;
pub mod posts;
pub mod reply;
pub mod state;
pub mod users;
pub mod validation;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};

use krishi_db::DomainError;
use krishi_types::api::ApiResponse;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, AppStateInner, AuthSettings};

/// Every REST route, mounted under `/api/v1`.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/verify-otp", post(auth::verify_otp))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh-token", post(auth::refresh_token));

    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        // Users
        .route("/users/me", get(users::get_me).patch(users::update_me))
        .route(
            "/users/me/avatar",
            post(users::upload_avatar).layer(DefaultBodyLimit::max(users::MAX_AVATAR_SIZE + 1024)),
        )
        .route("/users/search", get(users::search))
        .route("/users/{user_id}", get(users::get_user))
        .route("/users/{user_id}/follow", post(users::follow).delete(users::unfollow))
        .route("/users/{user_id}/followers", get(users::followers))
        .route("/users/{user_id}/following", get(users::following))
        // Posts
        .route("/posts", post(posts::create_post).get(posts::feed))
        .route("/posts/user/{user_id}", get(posts::user_posts))
        .route("/posts/hashtag/{tag}", get(posts::by_hashtag))
        .route(
            "/posts/{post_id}",
            get(posts::get_post).patch(posts::update_post).delete(posts::delete_post),
        )
        .route("/posts/{post_id}/like", post(posts::like_post).delete(posts::unlike_post))
        .route("/posts/{post_id}/comments", post(posts::add_comment).get(posts::comments))
        .route(
            "/comments/{comment_id}/like",
            post(posts::like_comment).delete(posts::unlike_comment),
        )
        // Chat
        .route(
            "/chat/conversations",
            post(chat::create_conversation).get(chat::list_conversations),
        )
        .route(
            "/chat/conversations/{conversation_id}/messages",
            get(chat::get_messages).post(chat::send_message),
        )
        .route(
            "/chat/conversations/{conversation_id}/participants/{user_id}",
            delete(chat::remove_participant),
        )
        .route("/chat/messages/{message_id}/read", post(chat::mark_read))
        .route("/chat/messages/{message_id}", delete(chat::delete_message))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_auth));

    let api = public
        .merge(protected)
        .method_not_allowed_fallback(method_not_allowed);

    Router::new()
        .nest("/api/v1", api)
        .fallback(route_not_found)
        .with_state(state)
}

async fn route_not_found() -> ApiError {
    ApiError(DomainError::not_found("Route not found"))
}

async fn method_not_allowed() -> Response {
    let status = StatusCode::METHOD_NOT_ALLOWED;
    let body = ApiResponse::failure(status.as_u16(), "Method not allowed", Vec::new());
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode, header},
    };
    use chrono::Duration;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use krishi_db::{Database, DomainError};
    use krishi_gateway::Gateway;
    use krishi_types::auth::TokenSigner;

    use super::*;
    use crate::blobs::LocalBlobStore;
    use crate::otp::OtpSender;

    /// Captures OTPs instead of texting them.
    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl OtpSender for Outbox {
        async fn send(&self, phone_number: &str, code: &str) -> Result<(), DomainError> {
            self.0.lock().unwrap().push((phone_number.into(), code.into()));
            Ok(())
        }
    }

    impl Outbox {
        fn code_for(&self, phone: &str) -> String {
            self.0
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(p, _)| p == phone)
                .map(|(_, code)| code.clone())
                .expect("an OTP was sent")
        }
    }

    struct Harness {
        app: Router,
        outbox: Arc<Outbox>,
    }

    struct Account {
        id: String,
        access: String,
        refresh: String,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let signer = TokenSigner::new("access", "refresh", Duration::days(7), Duration::days(30));
        let outbox = Arc::new(Outbox::default());
        let uploads = std::env::temp_dir().join(format!("krishi-api-{}", uuid::Uuid::new_v4()));

        let state: AppState = Arc::new(AppStateInner {
            gateway: Gateway::new(db.clone(), signer.clone()),
            db,
            signer,
            auth: AuthSettings::default(),
            otp: outbox.clone(),
            blobs: Arc::new(LocalBlobStore::new(uploads, "/uploads")),
        });
        Harness {
            app: router(state),
            outbox,
        }
    }

    impl Harness {
        async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let body = match body {
                Some(v) => {
                    req = req.header(header::CONTENT_TYPE, "application/json");
                    Body::from(serde_json::to_vec(&v).unwrap())
                }
                None => Body::empty(),
            };

            let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
            let status = resp.status();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, json)
        }

        async fn signup(&self, phone: &str, name: &str) -> Account {
            let (status, _) = self
                .call(
                    Method::POST,
                    "/api/v1/auth/register",
                    None,
                    Some(json!({ "phoneNumber": phone, "name": name, "password": "secret1" })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);

            let otp = self.outbox.code_for(phone);
            let (status, body) = self
                .call(
                    Method::POST,
                    "/api/v1/auth/verify-otp",
                    None,
                    Some(json!({ "phoneNumber": phone, "otp": otp })),
                )
                .await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            Account {
                id: body["data"]["user"]["id"].as_str().unwrap().to_string(),
                access: body["data"]["tokens"]["accessToken"].as_str().unwrap().to_string(),
                refresh: body["data"]["tokens"]["refreshToken"].as_str().unwrap().to_string(),
            }
        }
    }

    #[tokio::test]
    async fn registration_requires_the_sent_otp() {
        let h = harness();
        let me = h.signup("9876543210", "Ramesh").await;

        let (status, body) = h.call(Method::GET, "/api/v1/users/me", Some(me.access.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["name"], "Ramesh");
        assert_eq!(body["data"]["id"], me.id.as_str());
        assert!(body["data"].get("password").is_none());
    }

    #[tokio::test]
    async fn invalid_registration_lists_each_field() {
        let h = harness();
        let (status, body) = h
            .call(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({ "phoneNumber": "12345", "name": "", "password": "x" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);
        assert!(body["data"].is_null());
        let fields: Vec<&str> = body["meta"]["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, ["phoneNumber", "name", "password"]);
    }

    #[tokio::test]
    async fn duplicate_phone_is_a_conflict() {
        let h = harness();
        h.signup("9876543210", "Ramesh").await;
        let (status, body) = h
            .call(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({ "phoneNumber": "9876543210", "name": "Other", "password": "secret1" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Phone number already registered");
    }

    #[tokio::test]
    async fn otp_locks_after_max_attempts() {
        let h = harness();
        let phone = "9876543210";
        h.call(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(json!({ "phoneNumber": phone, "name": "Ramesh", "password": "secret1" })),
        )
        .await;
        let code = h.outbox.code_for(phone);
        let wrong = if code == "111111" { "222222" } else { "111111" };

        let attempt = |otp: String| {
            h.call(
                Method::POST,
                "/api/v1/auth/verify-otp",
                None,
                Some(json!({ "phoneNumber": phone, "otp": otp })),
            )
        };
        assert_eq!(attempt(wrong.into()).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(attempt(wrong.into()).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(attempt(wrong.into()).await.0, StatusCode::TOO_MANY_REQUESTS);
        // the code is gone once locked
        let (status, body) = attempt(code).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "OTP expired or not found");
    }

    #[tokio::test]
    async fn login_checks_the_password() {
        let h = harness();
        h.signup("9876543210", "Ramesh").await;

        let login = |password: &str| {
            h.call(
                Method::POST,
                "/api/v1/auth/login",
                None,
                Some(json!({ "phoneNumber": "9876543210", "password": password })),
            )
        };
        let (status, body) = login("wrong-password").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid credentials");

        let (status, body) = login("secret1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["user"]["lastLogin"].is_string());
        assert!(body["data"]["tokens"]["accessToken"].is_string());
    }

    #[tokio::test]
    async fn protected_routes_require_a_bearer_token() {
        let h = harness();
        let (status, body) = h.call(Method::GET, "/api/v1/users/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = h.call(Method::GET, "/api/v1/users/me", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_path_and_query_use_the_envelope() {
        let h = harness();
        let me = h.signup("9876543210", "Ramesh").await;
        let token = Some(me.access.as_str());

        let (status, body) = h.call(Method::GET, "/api/v1/posts/not-a-uuid", token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["success"], false);

        let (status, body) = h.call(Method::GET, "/api/v1/posts?page=abc", token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);

        let (status, body) = h.call(Method::GET, "/api/v1/nowhere", token, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["message"], "Route not found");
    }

    #[tokio::test]
    async fn oversized_avatar_is_a_field_error() {
        let h = harness();
        let me = h.signup("9876543210", "Ramesh").await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/users/me/avatar")
            .header(header::AUTHORIZATION, format!("Bearer {}", me.access))
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(vec![0u8; users::MAX_AVATAR_SIZE + 4096]))
            .unwrap();

        let resp = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["meta"]["errors"][0]["field"], "avatar");
    }

    #[tokio::test]
    async fn logout_revokes_the_refresh_token() {
        let h = harness();
        let me = h.signup("9876543210", "Ramesh").await;
        let refresh = || {
            h.call(
                Method::POST,
                "/api/v1/auth/refresh-token",
                None,
                Some(json!({ "refreshToken": me.refresh })),
            )
        };

        let (status, body) = refresh().await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["accessToken"].is_string());

        let (status, _) = h
            .call(
                Method::POST,
                "/api/v1/auth/logout",
                Some(me.access.as_str()),
                Some(json!({ "refreshToken": me.refresh })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refresh().await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn follow_rules_and_listing() {
        let h = harness();
        let a = h.signup("9876543210", "Ramesh").await;
        let b = h.signup("9876543211", "Suresh").await;

        let follow_uri = |id: &str| format!("/api/v1/users/{}/follow", id);
        let (status, _) = h.call(Method::POST, &follow_uri(&a.id), Some(a.access.as_str()), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = h.call(Method::POST, &follow_uri(&b.id), Some(a.access.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = h.call(Method::POST, &follow_uri(&b.id), Some(a.access.as_str()), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = h
            .call(
                Method::GET,
                &format!("/api/v1/users/{}/followers", b.id),
                Some(a.access.as_str()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["pagination"]["totalItems"], 1);
        assert_eq!(body["data"][0]["follower"]["name"], "Ramesh");

        let (_, body) = h
            .call(Method::GET, &format!("/api/v1/users/{}", b.id), Some(a.access.as_str()), None)
            .await;
        assert_eq!(body["data"]["isFollowing"], true);
        assert_eq!(body["data"]["stats"]["followersCount"], 1);
    }

    #[tokio::test]
    async fn post_like_is_reflected_for_the_viewer() {
        let h = harness();
        let author = h.signup("9876543210", "Ramesh").await;
        let reader = h.signup("9876543211", "Suresh").await;

        let (status, body) = h
            .call(
                Method::POST,
                "/api/v1/posts",
                Some(author.access.as_str()),
                Some(json!({ "type": "text", "content": { "text": "Sowing wheat #rabi" } })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["hashtags"], json!(["rabi"]));
        let post_id = body["data"]["id"].as_str().unwrap().to_string();

        let like_uri = format!("/api/v1/posts/{}/like", post_id);
        assert_eq!(h.call(Method::POST, &like_uri, Some(reader.access.as_str()), None).await.0, StatusCode::OK);
        assert_eq!(
            h.call(Method::POST, &like_uri, Some(reader.access.as_str()), None).await.0,
            StatusCode::CONFLICT
        );

        let (_, body) = h
            .call(Method::GET, &format!("/api/v1/posts/{}", post_id), Some(reader.access.as_str()), None)
            .await;
        assert_eq!(body["data"]["isLiked"], true);
        assert_eq!(body["data"]["stats"]["likes"], 1);

        let (_, body) = h.call(Method::GET, "/api/v1/posts/hashtag/rabi", Some(reader.access.as_str()), None).await;
        assert_eq!(body["meta"]["pagination"]["totalItems"], 1);
    }

    #[tokio::test]
    async fn direct_conversation_is_created_once() {
        let h = harness();
        let a = h.signup("9876543210", "Ramesh").await;
        let b = h.signup("9876543211", "Suresh").await;
        let outsider = h.signup("9876543212", "Mahesh").await;

        let body = json!({ "type": "direct", "participants": [b.id] });
        let (status, first) = h
            .call(Method::POST, "/api/v1/chat/conversations", Some(a.access.as_str()), Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, again) = h
            .call(Method::POST, "/api/v1/chat/conversations", Some(a.access.as_str()), Some(body))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["id"], again["data"]["id"]);

        let messages_uri = format!(
            "/api/v1/chat/conversations/{}/messages",
            first["data"]["id"].as_str().unwrap()
        );
        let (status, sent) = h
            .call(
                Method::POST,
                &messages_uri,
                Some(b.access.as_str()),
                Some(json!({ "content": { "text": "namaste" } })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["data"]["content"]["text"], "namaste");

        let (status, history) = h.call(Method::GET, &messages_uri, Some(a.access.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["meta"]["pagination"]["limit"], 50);
        assert_eq!(history["data"][0]["id"], sent["data"]["id"]);

        let (status, _) = h.call(Method::GET, &messages_uri, Some(outsider.access.as_str()), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
