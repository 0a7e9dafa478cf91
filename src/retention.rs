//! Retention policy: which dataset schemas survive the cleanup sweep.

use crate::bookkeeping::ImportRecord;

/// Pure decision function from the post-commit inventory to the set of
/// schemas to keep. Everything not returned is a deletion candidate,
/// whether it is an old successful import or an orphan from a crashed run.
///
/// Swappable via configuration; the default keeps the two most recent
/// successful imports. A replacement policy is responsible for retaining
/// the schema of the import committed by the current run.
pub trait RetentionPolicy: Send + Sync {
    fn schemas_to_retain(
        &self,
        successful_imports: &[ImportRecord],
        all_schemas: &[String],
    ) -> Vec<String>;
}

/// Keep the `count` most recent successful imports.
pub struct KeepMostRecent {
    pub count: usize,
}

impl Default for KeepMostRecent {
    fn default() -> Self {
        Self { count: 2 }
    }
}

impl RetentionPolicy for KeepMostRecent {
    fn schemas_to_retain(
        &self,
        successful_imports: &[ImportRecord],
        _all_schemas: &[String],
    ) -> Vec<String> {
        // successful_imports is ordered most recent first by the store.
        successful_imports
            .iter()
            .take(self.count)
            .map(|record| record.schema_name.clone())
            .collect()
    }
}
