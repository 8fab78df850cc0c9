//! Request handlers for the permissions and bulk-regenerate endpoints.
//!
//! Routing and authentication happen upstream: each handler receives the
//! authenticated caller, the already-extracted query parameters or raw JSON
//! body, and returns a status code with an optional JSON body. Every
//! handled call leaves a request record with its method, path and status;
//! callers rejected upstream are reported through
//! [`Api::authentication_failed`].
//!
//! | Call | Success |
//! |---|---|
//! | `GET /permissions?credential_name=` | 200 with the ACL |
//! | `POST /permissions` | 200 with the applied entries |
//! | `DELETE /permissions?credential_name=&actor=` | 204 |
//! | `POST /bulk-regenerate` | 200 with the regenerated names |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{AuthFailureAuditRecord, RequestAuditRecord, RequestContext};
use crate::clock::Clock;
use crate::error::CredvaultError;
use crate::manager::CredentialManager;
use crate::permissions::PermissionEntry;

/// Status and JSON body of a handled call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    fn ok(status: u16, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self {
                status,
                body: Some(body),
            },
            Err(e) => Self::from_error(&CredvaultError::Integrity(format!("unencodable response: {e}"))),
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }

    /// Render an error as `{"error": message}`.
    pub fn from_error(err: &CredvaultError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            body: Some(json!({ "error": err.response_message() })),
        }
    }
}

pub const PERMISSIONS_PATH: &str = "/permissions";
pub const BULK_REGENERATE_PATH: &str = "/bulk-regenerate";

/// Body of a 401. The reason stays in the audit trail.
pub const AUTHENTICATION_FAILED_MESSAGE: &str = "The request could not be authenticated.";

#[derive(Debug, Deserialize)]
pub struct PermissionsRequest {
    pub credential_name: String,
    #[serde(default)]
    pub permissions: Vec<PermissionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BulkRegenerateRequest {
    #[serde(default)]
    pub signed_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkRegenerateResponse {
    pub regenerated_credentials: Vec<String>,
}

pub struct Api {
    manager: Arc<CredentialManager>,
}

impl Api {
    pub fn new(manager: Arc<CredentialManager>) -> Self {
        Self { manager }
    }

    pub fn get_permissions(&self, context: &RequestContext, credential_name: Option<&str>) -> ApiResponse {
        let response = match credential_name {
            None => ApiResponse::from_error(&CredvaultError::validation("missing_credential_name")),
            Some(credential_name) => match self.manager.list_permissions(context, credential_name) {
                Ok(view) => ApiResponse::ok(200, view),
                Err(err) => ApiResponse::from_error(&err),
            },
        };
        self.record(context, "GET", PERMISSIONS_PATH, response)
    }

    pub fn post_permissions(&self, context: &RequestContext, body: &str) -> ApiResponse {
        let response = match parse::<PermissionsRequest>(body) {
            Err(err) => ApiResponse::from_error(&err),
            Ok(request) => match self
                .manager
                .set_permissions(context, &request.credential_name, request.permissions)
            {
                Ok(view) => ApiResponse::ok(200, view),
                Err(err) => ApiResponse::from_error(&err),
            },
        };
        self.record(context, "POST", PERMISSIONS_PATH, response)
    }

    /// A missing entry is reported like a missing credential.
    pub fn delete_permissions(
        &self,
        context: &RequestContext,
        credential_name: Option<&str>,
        actor: Option<&str>,
    ) -> ApiResponse {
        let response = match (credential_name, actor) {
            (Some(credential_name), Some(actor)) => {
                match self.manager.delete_permission(context, credential_name, actor) {
                    Ok(()) => ApiResponse::no_content(),
                    Err(err) => ApiResponse::from_error(&err),
                }
            }
            _ => ApiResponse::from_error(&CredvaultError::validation("bad_request")),
        };
        self.record(context, "DELETE", PERMISSIONS_PATH, response)
    }

    pub fn post_bulk_regenerate(&self, context: &RequestContext, body: &str) -> ApiResponse {
        let response = match parse::<BulkRegenerateRequest>(body) {
            Err(err) => ApiResponse::from_error(&err),
            Ok(request) => match self
                .manager
                .bulk_regenerate(context, request.signed_by.as_deref())
            {
                Ok(regenerated_credentials) => ApiResponse::ok(
                    200,
                    BulkRegenerateResponse {
                        regenerated_credentials,
                    },
                ),
                Err(err) => ApiResponse::from_error(&err),
            },
        };
        self.record(context, "POST", BULK_REGENERATE_PATH, response)
    }

    /// Answer a request whose caller could not be authenticated, and audit
    /// it. No actor exists, so no operation records are written.
    pub fn authentication_failed(&self, method: &str, path: &str, reason: &str) -> ApiResponse {
        let store = self.manager.store();
        let record = AuthFailureAuditRecord::new(method, path, reason, store.clock().now());
        tracing::warn!(request_uuid = %record.request_uuid, %method, %path, %reason, "authentication failed");
        let status = record.status_code;
        store.record_auth_failure(record);
        ApiResponse {
            status,
            body: Some(json!({ "error": AUTHENTICATION_FAILED_MESSAGE })),
        }
    }

    fn record(&self, context: &RequestContext, method: &str, path: &str, response: ApiResponse) -> ApiResponse {
        let store = self.manager.store();
        store.record_request(RequestAuditRecord::new(
            context,
            method,
            path,
            response.status,
            store.clock().now(),
        ));
        response
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, CredvaultError> {
    serde_json::from_str(body).map_err(|e| {
        tracing::debug!(error = %e, "malformed request body");
        CredvaultError::validation("bad_request")
    })
}
