use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DocHostConfig;
use crate::document::{ActiveDocument, ClientSession};
use crate::engine::EngineFactory;
use crate::error::Result;
use crate::shutdown::ShutdownMode;

/// Open documents keyed by document id.
pub(crate) type DocTable = Mutex<HashMap<String, Arc<ActiveDocument>>>;

/// Process-wide table of open documents.
///
/// All opens, closes and reloads go through here. The table is the only
/// state shared between requests; lookups and insertions happen under one
/// lock so concurrent opens of the same document create it exactly once.
pub struct DocRegistry {
    config: Arc<DocHostConfig>,
    factory: Arc<dyn EngineFactory>,
    docs: Arc<DocTable>,
}

impl DocRegistry {
    pub fn new(config: DocHostConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            docs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &DocHostConfig {
        &self.config
    }

    fn lock_docs(&self) -> MutexGuard<'_, HashMap<String, Arc<ActiveDocument>>> {
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the open document for `doc_id`, creating and loading it if
    /// needed. Waits until loading has finished.
    pub async fn create_or_get_doc(&self, doc_id: &str) -> Result<Arc<ActiveDocument>> {
        let (doc, created) = {
            let mut docs = self.lock_docs();
            match docs.get(doc_id) {
                Some(doc) if !doc.is_closed() => (doc.clone(), false),
                _ => {
                    let doc =
                        ActiveDocument::new(doc_id, self.config.clone(), Arc::downgrade(&self.docs));
                    docs.insert(doc_id.to_string(), doc.clone());
                    (doc, true)
                }
            }
        };

        if created {
            tracing::info!(doc_id = %doc_id, "Loading document");
            tokio::spawn(doc.clone().load(self.factory.clone()));
        }

        doc.wait_ready().await?;
        Ok(doc)
    }

    /// The document for `doc_id` if it is open, without creating it.
    pub fn get_doc(&self, doc_id: &str) -> Option<Arc<ActiveDocument>> {
        self.lock_docs()
            .get(doc_id)
            .filter(|doc| !doc.is_closed())
            .cloned()
    }

    /// Detach a client session from its document.
    pub fn close_doc(&self, session: ClientSession) {
        match session.document() {
            Some(doc) => doc.close_doc(session),
            None => {
                tracing::debug!(
                    doc_id = %session.doc_id(),
                    session_id = %session.id(),
                    "Session outlived its document"
                );
            }
        }
    }

    /// Shut a document down without waiting for in-flight calls, so the next
    /// open starts a fresh engine. Finishes within the shutdown-item timeout
    /// plus the kill delay even if the engine never answers.
    pub async fn force_reload(&self, doc_id: &str) {
        match self.get_doc(doc_id) {
            Some(doc) => doc.reload_doc().await,
            None => tracing::debug!(doc_id = %doc_id, "Reload requested for a document that is not open"),
        }
    }

    pub fn num_open_docs(&self) -> usize {
        self.lock_docs()
            .values()
            .filter(|doc| !doc.is_closed())
            .count()
    }

    pub fn open_doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_docs()
            .iter()
            .filter(|(_, doc)| !doc.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Gracefully shut down every open document, e.g. when the process exits.
    pub async fn shutdown_all(&self) {
        let docs: Vec<Arc<ActiveDocument>> = self.lock_docs().values().cloned().collect();
        tracing::info!(count = docs.len(), "Shutting down all documents");
        futures::future::join_all(
            docs.iter()
                .map(|doc| doc.shutdown(ShutdownMode::Graceful)),
        )
        .await;
    }
}
