//! Remote folder creation that tolerates concurrent creators.
//!
//! Another client may create a folder with the same title under the same
//! parent at the same time. After creating ours, every same-titled folder in
//! the parent is recorded and the oldest one wins, so all clients converge on
//! the same folder. The losers are left for the conflict resolver.

use bridge_traits::{FileResource, RemoteFileService};
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};
use crate::metadata_database::MetadataDatabase;

#[derive(Debug, Clone)]
pub struct FolderCreator {
    parent_folder_id: String,
    title: String,
}

impl FolderCreator {
    pub fn new(parent_folder_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            parent_folder_id: parent_folder_id.into(),
            title: title.into(),
        }
    }

    /// Creates the folder and returns the file id of the folder that should be
    /// used, which is not necessarily the one just created.
    #[instrument(skip(self, service, database), fields(parent = %self.parent_folder_id, title = %self.title))]
    pub async fn run(
        &self,
        service: &dyn RemoteFileService,
        database: &mut MetadataDatabase,
    ) -> Result<String> {
        let created = service
            .create_folder(&self.parent_folder_id, &self.title)
            .await
            .map_err(SyncError::Remote)?;
        debug!(file_id = %created.file_id, "Created remote folder");

        let listing = service
            .search_by_title(&self.title, &self.parent_folder_id)
            .await
            .map_err(SyncError::Remote)?;

        let mut candidates: Vec<FileResource> = listing
            .items
            .into_iter()
            .filter(|resource| {
                resource.is_folder()
                    && !resource.trashed
                    && resource.has_parent(&self.parent_folder_id)
            })
            .collect();
        // Search results may lag behind the create.
        if !candidates.iter().any(|c| c.file_id == created.file_id) {
            candidates.push(created);
        }

        database.update_by_file_resource_list(&candidates).await?;

        let oldest = candidates
            .iter()
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.file_id.cmp(&b.file_id))
            })
            .map(|resource| resource.file_id.clone())
            .ok_or_else(|| SyncError::NotFound(format!("folder {}", self.title)))?;

        if database.find_file_by_file_id(&oldest).is_none() {
            return Err(SyncError::NotFound(format!(
                "no metadata for folder {}",
                oldest
            )));
        }

        debug!(file_id = %oldest, candidates = candidates.len(), "Selected folder");
        Ok(oldest)
    }
}
