//! Composite backend: one logical store over an ordered list of members.
//!
//! Writes go to the first member that is writable and within its soft quota.
//! Blob refs always name the member that owns the blob, so reads and deletes
//! pass straight through to that member. Members are resolved by name through
//! a weak registry handle; the group never owns them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::blob::{Blob, BlobHeaders, BlobRef, ExternalMetadata};
use crate::configuration::{normalize_name, BlobStoreConfiguration};
use crate::descriptor::{BlobStoreDescriptor, BuildContext, ValidationContext};
use crate::error::{BlobStoreError, Result};
use crate::quota::SoftQuota;
use crate::registry::RegistryRef;
use crate::store::{BlobStore, CompactionStats, StoreCore, StoreMetrics, StoreState};
use crate::usage::UsageChecker;

pub const TYPE: &str = "group";
pub const SECTION: &str = "group";
pub const MEMBERS: &str = "members";
pub const FILL_POLICY: &str = "fillPolicy";
pub const RESPECT_SOFT_QUOTA: &str = "respectSoftQuota";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    #[default]
    WriteToFirst,
}

impl FillPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillPolicy::WriteToFirst => "writeToFirst",
        }
    }

    fn from_config(config: &BlobStoreConfiguration) -> Result<Self> {
        config
            .string_attribute(SECTION, FILL_POLICY)
            .map_or(Ok(FillPolicy::default()), str::parse)
    }
}

impl fmt::Display for FillPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FillPolicy {
    type Err = BlobStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "writeToFirst" => Ok(FillPolicy::WriteToFirst),
            other => Err(BlobStoreError::configuration(format!(
                "unknown group fill policy '{other}'"
            ))),
        }
    }
}

fn member_names(config: &BlobStoreConfiguration) -> Vec<String> {
    config
        .string_list_attribute(SECTION, MEMBERS)
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct BlobStoreGroup {
    core: StoreCore,
    registry: RegistryRef,
}

impl BlobStoreGroup {
    pub fn new(config: BlobStoreConfiguration, registry: RegistryRef) -> Self {
        Self {
            core: StoreCore::new(config),
            registry,
        }
    }

    /// Member names in configured order.
    pub fn members(&self) -> Vec<String> {
        member_names(&self.core.configuration())
    }

    pub fn contains_member(&self, name: &str) -> bool {
        let wanted = normalize_name(name);
        self.members().iter().any(|m| normalize_name(m) == wanted)
    }

    /// Live member instances in configured order.
    pub fn resolve_members(&self) -> Result<Vec<Arc<dyn BlobStore>>> {
        self.members()
            .iter()
            .map(|name| {
                self.registry
                    .resolve(name)
                    .ok_or_else(|| BlobStoreError::NotFound(name.clone()))
            })
            .collect()
    }

    fn respects_soft_quota(&self) -> bool {
        self.core
            .configuration()
            .bool_attribute(SECTION, RESPECT_SOFT_QUOTA)
            .unwrap_or(true)
    }

    /// The member owning `blob`, or `None` when the ref names a store outside
    /// this group.
    fn owner(&self, blob: &BlobRef) -> Result<Option<Arc<dyn BlobStore>>> {
        if !self.contains_member(&blob.store) {
            debug!(group = %self.core.name(), store = %blob.store, "blob ref names a non-member");
            return Ok(None);
        }
        self.registry
            .resolve(&blob.store)
            .map(Some)
            .ok_or_else(|| BlobStoreError::NotFound(blob.store.clone()))
    }

    /// First writable member within its soft quota. When every member is
    /// over quota the first member is used anyway.
    pub fn select_write_target(&self) -> Result<Arc<dyn BlobStore>> {
        let members = self.resolve_members()?;
        let respect_quota = self.respects_soft_quota();
        let mut fallback = None;

        for member in members {
            if !member.is_writable() {
                continue;
            }
            if respect_quota {
                if let Some(quota) = SoftQuota::from_config(&member.configuration())? {
                    let result = quota.check(&member.name(), &member.metrics());
                    if result.violation {
                        debug!(group = %self.core.name(), member = %member.name(), reason = %result.message, "skipping member over soft quota");
                        fallback.get_or_insert(member);
                        continue;
                    }
                }
            }
            return Ok(member);
        }

        match fallback {
            Some(member) => {
                warn!(
                    group = %self.core.name(),
                    member = %member.name(),
                    "every member is over its soft quota, writing to the first"
                );
                Ok(member)
            }
            None => Err(BlobStoreError::configuration(format!(
                "blob store group '{}' has no writable member",
                self.core.name()
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for BlobStoreGroup {
    fn configuration(&self) -> BlobStoreConfiguration {
        self.core.configuration()
    }

    fn init(&self, config: BlobStoreConfiguration) -> Result<()> {
        FillPolicy::from_config(&config)?;
        self.core.replace_configuration(config)
    }

    async fn start(&self) -> Result<()> {
        if self.core.state() == StoreState::Started {
            return Ok(());
        }
        if let Err(e) = FillPolicy::from_config(&self.core.configuration())
            .and_then(|_| self.resolve_members())
        {
            self.core.set_state(StoreState::Failed);
            return Err(e);
        }
        self.core.set_state(StoreState::Started);
        info!(group = %self.core.name(), members = ?self.members(), "blob store group started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.core.set_state(StoreState::Stopped);
        Ok(())
    }

    fn state(&self) -> StoreState {
        self.core.state()
    }

    fn freeze(&self) {
        self.core.freeze();
    }

    fn unfreeze(&self) {
        self.core.unfreeze();
    }

    fn is_frozen(&self) -> bool {
        self.core.is_frozen()
    }

    /// Sum over the members that currently resolve.
    fn metrics(&self) -> StoreMetrics {
        self.members()
            .iter()
            .filter_map(|name| self.registry.resolve(name))
            .map(|member| member.metrics())
            .fold(StoreMetrics::default(), |acc, m| acc + m)
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Blob>> {
        self.core.ensure_started()?;
        match self.owner(blob)? {
            Some(member) => member.get(blob).await,
            None => Ok(None),
        }
    }

    async fn create(&self, content: Bytes, headers: BlobHeaders) -> Result<Blob> {
        self.core.ensure_writable()?;
        let target = self.select_write_target()?;
        target.create(content, headers).await
    }

    async fn delete(&self, blob: &BlobRef, reason: &str) -> Result<bool> {
        self.core.ensure_writable()?;
        match self.owner(blob)? {
            Some(member) => member.delete(blob, reason).await,
            None => Ok(false),
        }
    }

    async fn compact(
        &self,
        usage: &dyn UsageChecker,
        inactivity: Duration,
    ) -> Result<CompactionStats> {
        self.core.ensure_writable()?;
        let mut stats = CompactionStats::default();
        for member in self.resolve_members()? {
            stats += member.compact(usage, inactivity).await?;
        }
        Ok(stats)
    }

    async fn external_metadata(&self, blob: &BlobRef) -> Result<Option<ExternalMetadata>> {
        match self.owner(blob)? {
            Some(member) => member.external_metadata(blob).await,
            None => Ok(None),
        }
    }

    fn as_group(&self) -> Option<&BlobStoreGroup> {
        Some(self)
    }
}

/// Validates and builds `group` stores.
#[derive(Debug, Default)]
pub struct GroupDescriptor;

impl BlobStoreDescriptor for GroupDescriptor {
    fn type_name(&self) -> &'static str {
        TYPE
    }

    fn validate(&self, config: &BlobStoreConfiguration, ctx: &ValidationContext<'_>) -> Result<()> {
        FillPolicy::from_config(config)?;

        let members = member_names(config);
        if members.is_empty() {
            return Err(BlobStoreError::configuration(format!(
                "blob store group '{}' needs at least one member",
                config.name
            )));
        }

        let own_key = config.key();
        let mut seen = HashSet::new();
        for member in &members {
            let key = normalize_name(member);
            if !seen.insert(key.clone()) {
                return Err(BlobStoreError::configuration(format!(
                    "blob store '{member}' is listed more than once in group '{}'",
                    config.name
                )));
            }
            if key == own_key {
                return Err(BlobStoreError::configuration(format!(
                    "blob store group '{}' cannot contain itself",
                    config.name
                )));
            }
            let store = ctx.registry.get(member).ok_or_else(|| {
                BlobStoreError::configuration(format!(
                    "member '{member}' of group '{}' does not exist",
                    config.name
                ))
            })?;
            if store.type_name() == TYPE {
                return Err(BlobStoreError::configuration(format!(
                    "blob store group '{}' cannot contain group '{member}'",
                    config.name
                )));
            }
        }

        for other in ctx.registry.list() {
            let Some(group) = other.as_group() else {
                continue;
            };
            if normalize_name(&other.name()) == own_key {
                continue;
            }
            if let Some(shared) = members.iter().find(|m| group.contains_member(m)) {
                return Err(BlobStoreError::configuration(format!(
                    "blob store '{shared}' already belongs to group '{}'",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    fn build(
        &self,
        config: BlobStoreConfiguration,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(BlobStoreGroup::new(config, ctx.registry.clone())))
    }
}
