use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Category, ConversationType, Location, MessageContent, MessageType, Poll, PostContent,
    PostMedia, PostType, User, Visibility,
};

// -- Envelope --

/// A single field-level problem reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Page metadata returned alongside every list result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

/// A bounded page of materialized items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            data: self.data.into_iter().map(f).collect(),
            pagination: self.pagination,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

/// Uniform response envelope used for every HTTP response, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub status_code: u16,
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn new(status_code: u16, data: T, message: impl Into<String>) -> Self {
        Self {
            status_code,
            success: status_code < 400,
            data: Some(data),
            message: message.into(),
            meta: None,
        }
    }
}

impl<T> ApiResponse<Vec<T>> {
    pub fn paginated(status_code: u16, page: Page<T>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            success: status_code < 400,
            data: Some(page.data),
            message: message.into(),
            meta: Some(Meta {
                pagination: Some(page.pagination),
                errors: Vec::new(),
            }),
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(status_code: u16, message: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            status_code,
            success: false,
            data: None,
            message: message.into(),
            meta: (!errors.is_empty()).then(|| Meta {
                pagination: None,
                errors,
            }),
        }
    }
}

// -- Auth --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterRequest {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub otp_sent: bool,
    pub phone_number: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyOtpRequest {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub otp: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoginRequest {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefreshTokenRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub tokens: AuthTokens,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
}

// -- Users --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub location: Option<Location>,
    pub farm_size: Option<f64>,
    pub crops: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserFilter {
    #[default]
    All,
    Experts,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    #[serde(default)]
    pub filter: UserFilter,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

// -- Posts --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFilter {
    #[default]
    Following,
    Latest,
    Trending,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub filter: FeedFilter,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    #[serde(rename = "type")]
    pub kind: PostType,
    #[serde(default)]
    pub content: PostContent,
    #[serde(default)]
    pub media: Vec<PostMedia>,
    #[serde(default)]
    pub poll: Option<Poll>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePostRequest {
    pub content: Option<PostContent>,
    pub category: Option<Category>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub parent_comment: Option<Uuid>,
}

// -- Chat --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default, rename = "type")]
    pub kind: ConversationType,
    #[serde(default)]
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default, rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    /// Only messages created strictly before this message are returned.
    pub before: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageQuery {
    #[serde(default)]
    pub for_everyone: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_envelope_carries_field_errors_in_meta() {
        let resp = ApiResponse::failure(
            400,
            "Validation failed",
            vec![FieldError::new("phoneNumber", "is required")],
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["statusCode"], 400);
        assert_eq!(json["success"], false);
        assert!(json["data"].is_null());
        assert_eq!(json["meta"]["errors"][0]["field"], "phoneNumber");
    }

    #[test]
    fn paginated_envelope_uses_camel_case_meta() {
        let page = Page {
            data: vec![1, 2],
            pagination: Pagination {
                page: 1,
                limit: 2,
                total_items: 3,
                total_pages: 2,
                has_next: true,
                has_prev: false,
            },
        };
        let json = serde_json::to_value(ApiResponse::paginated(200, page, "ok")).unwrap();
        assert_eq!(json["meta"]["pagination"]["totalItems"], 3);
        assert_eq!(json["meta"]["pagination"]["hasNext"], true);
        assert_eq!(json["data"], serde_json::json!([1, 2]));
    }
}
