use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::document::active::ActiveDocument;
use crate::error::{DocHostError, Result};

/// The client connection a session was opened from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    pub conn_id: Uuid,
    pub user: String,
}

impl ClientConnection {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn can_edit(self) -> bool {
        self == Access::ReadWrite
    }
}

/// Decides what a client may do with a document. Evaluated once, when the
/// client attaches.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, doc_id: &str, client: &ClientConnection) -> Result<Access>;
}

/// Grants full access to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _doc_id: &str, _client: &ClientConnection) -> Result<Access> {
        Ok(Access::ReadWrite)
    }
}

/// Grants read-only access to everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewOnly;

impl Authorizer for ViewOnly {
    fn authorize(&self, _doc_id: &str, _client: &ClientConnection) -> Result<Access> {
        Ok(Access::ReadOnly)
    }
}

/// Denies every client.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, doc_id: &str, client: &ClientConnection) -> Result<Access> {
        Err(DocHostError::AccessDenied(format!(
            "{} may not open {}",
            client.user, doc_id
        )))
    }
}

/// One client attached to one open document.
///
/// Created by [`ActiveDocument::add_client`] and consumed by
/// [`ActiveDocument::close_doc`]. Holds only a weak reference to the document,
/// so a lingering session never keeps a closed document alive.
#[derive(Debug)]
pub struct ClientSession {
    session_id: Uuid,
    doc_id: String,
    doc: Weak<ActiveDocument>,
    client: ClientConnection,
    access: Access,
}

impl ClientSession {
    pub(crate) fn new(doc: &Arc<ActiveDocument>, client: ClientConnection, access: Access) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            doc_id: doc.doc_id().to_string(),
            doc: Arc::downgrade(doc),
            client,
            access,
        }
    }

    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn client(&self) -> &ClientConnection {
        &self.client
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// The document, if it has not been dropped yet.
    pub fn document(&self) -> Option<Arc<ActiveDocument>> {
        self.doc.upgrade()
    }

    pub(crate) fn belongs_to(&self, doc: &ActiveDocument) -> bool {
        std::ptr::eq(self.doc.as_ptr(), doc)
    }
}
