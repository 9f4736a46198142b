//! Per-type validation and construction of blob stores.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::cloud::CloudDescriptor;
use crate::configuration::{normalize_name, BlobStoreConfiguration};
use crate::error::{BlobStoreError, Result};
use crate::file::FileDescriptor;
use crate::group::GroupDescriptor;
use crate::quota::SoftQuota;
use crate::registry::{Registry, RegistryRef};
use crate::store::BlobStore;

const MAX_NAME_LENGTH: usize = 200;

/// What a validator may consult besides the configuration itself.
#[derive(Debug)]
pub struct ValidationContext<'a> {
    pub registry: &'a Registry,
    /// Configuration being replaced, `None` on create.
    pub previous: Option<&'a BlobStoreConfiguration>,
}

impl ValidationContext<'_> {
    pub fn is_update(&self) -> bool {
        self.previous.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Lets composite stores resolve members without owning them.
    pub registry: RegistryRef,
}

/// Knows how to check and construct one backend type.
pub trait BlobStoreDescriptor: Send + Sync + Debug {
    fn type_name(&self) -> &'static str;

    /// `(section, key)` attributes that are masked when a configuration is
    /// handed out.
    fn secret_attributes(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn validate(&self, config: &BlobStoreConfiguration, ctx: &ValidationContext<'_>) -> Result<()>;

    fn build(&self, config: BlobStoreConfiguration, ctx: &BuildContext)
        -> Result<Arc<dyn BlobStore>>;
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
    descriptors: BTreeMap<String, Arc<dyn BlobStoreDescriptor>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File, cloud and group backends.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(FileDescriptor)
            .with(CloudDescriptor::default())
            .with(GroupDescriptor)
    }

    pub fn with(mut self, descriptor: impl BlobStoreDescriptor + 'static) -> Self {
        self.register(Arc::new(descriptor));
        self
    }

    /// Adds a descriptor, replacing any previous one for the same type.
    pub fn register(&mut self, descriptor: Arc<dyn BlobStoreDescriptor>) {
        self.descriptors
            .insert(descriptor.type_name().to_string(), descriptor);
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn BlobStoreDescriptor>> {
        self.descriptors.get(type_name).cloned().ok_or_else(|| {
            BlobStoreError::configuration(format!("unknown blob store type '{type_name}'"))
        })
    }

    pub fn types(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    /// Common rules first, then the type's own.
    pub fn validate(
        &self,
        config: &BlobStoreConfiguration,
        ctx: &ValidationContext<'_>,
    ) -> Result<Arc<dyn BlobStoreDescriptor>> {
        let descriptor = self.get(&config.type_name)?;
        validate_common(config, ctx)?;
        descriptor.validate(config, ctx)?;
        Ok(descriptor)
    }
}

fn validate_common(config: &BlobStoreConfiguration, ctx: &ValidationContext<'_>) -> Result<()> {
    validate_name(&config.name)?;

    match ctx.previous {
        None => {
            if ctx.registry.contains(&config.name) {
                return Err(BlobStoreError::DuplicateStore(config.name.clone()));
            }
        }
        Some(previous) => {
            if normalize_name(&previous.name) != config.key() {
                return Err(BlobStoreError::configuration(format!(
                    "blob store '{}' cannot be renamed to '{}'",
                    previous.name, config.name
                )));
            }
            if previous.type_name != config.type_name {
                return Err(BlobStoreError::configuration(format!(
                    "blob store '{}' cannot change type from '{}' to '{}'",
                    config.name, previous.type_name, config.type_name
                )));
            }
        }
    }

    SoftQuota::from_config(config)?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid_start || !valid_rest || name.len() > MAX_NAME_LENGTH {
        return Err(BlobStoreError::configuration(format!(
            "invalid blob store name '{name}': use letters, digits, '.', '_' or '-', starting with a letter or digit"
        )));
    }
    Ok(())
}
