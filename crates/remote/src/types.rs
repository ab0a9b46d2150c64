//! Wire types for the document store and push APIs.

use serde::{Deserialize, Serialize};

use attendsync_core::sync::{FieldMap, RemoteRecord};

/// One document as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
}

impl From<DocumentDto> for RemoteRecord {
    fn from(doc: DocumentDto) -> Self {
        RemoteRecord {
            id: doc.id,
            fields: doc.fields,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentListResponse {
    #[serde(default)]
    pub documents: Vec<DocumentDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDocumentRequest<'a> {
    pub id: &'a str,
    pub fields: &'a FieldMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateDocumentRequest<'a> {
    pub fields: &'a FieldMap,
}

/// Error body returned by either API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub error: String,
    pub code: String,
    pub message: String,
}

/// Push API response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSendResponse {
    #[serde(default)]
    pub accepted: Option<bool>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}
