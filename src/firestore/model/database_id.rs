use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Project and database a client is bound to. Every resource name on the wire is rooted here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        self.to_string()
    }

    /// Parent of every document name; the empty resource path encodes to this.
    pub fn documents_root(&self) -> String {
        format!("{self}/documents")
    }

    /// Path relative to the documents root, or an error when `name` belongs to another database.
    pub fn relative_document_path<'a>(&self, name: &'a str) -> FirestoreResult<&'a str> {
        name.strip_prefix(&self.documents_root())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in database {self}")))
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/databases/{}", self.project_id, self.database)
    }
}
