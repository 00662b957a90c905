//! The server's side of the core's host boundary.

use crate::permissions::JsonPermissionBackend;
use async_trait::async_trait;
use ranksync::{
    ConfigProvider, GameRankResource, NameResource, RankMapping, RankResource, RankSyncHost,
    StaticNameResource,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ServerHost {
    config: toml::Value,
    data_folder: PathBuf,
    permissions: Arc<JsonPermissionBackend>,
    names: Arc<StaticNameResource>,
}

impl ServerHost {
    pub fn new(
        config: toml::Value,
        data_folder: PathBuf,
        permissions: Arc<JsonPermissionBackend>,
        names: Arc<StaticNameResource>,
    ) -> Self {
        Self {
            config,
            data_folder,
            permissions,
            names,
        }
    }
}

#[async_trait]
impl RankSyncHost for ServerHost {
    fn config(&self) -> &dyn ConfigProvider {
        &self.config
    }

    fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    fn create_name_resource(&self) -> Arc<dyn NameResource> {
        self.names.clone()
    }

    async fn validate_dependencies(&self, mapping: &RankMapping) -> Option<Arc<dyn RankResource>> {
        let resource = GameRankResource::validate(self.permissions.clone(), mapping).await?;
        Some(Arc::new(resource))
    }
}
