//! Downstream publication of canonical property changes.
//!
//! Handlers build the current canonical `Property` from provider data, diff
//! it against the last published snapshot and hand only the changeset to the
//! booking platform.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::context::JobContext;
use crate::diff::{diff, Diff};
use crate::entity::Property;

/// Client for the downstream booking platform.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// First publication of a property.
    async fn publish_created(&self, property: &Property) -> Result<()>;

    /// Incremental update; `changes` is never empty.
    async fn publish_updated(&self, identifier: &str, changes: &Diff) -> Result<()>;
}

/// What [`publish_property_changes`] sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    Created,
    Updated(Diff),
    Unchanged,
}

/// Publish `current` relative to the `previous` snapshot, if any.
pub async fn publish_property_changes(
    ctx: &JobContext,
    publisher: &dyn ChangePublisher,
    previous: Option<&Property>,
    current: &Property,
) -> Result<Publication> {
    let Some(previous) = previous else {
        publisher
            .publish_created(current)
            .await
            .with_context(|| format!("Publishing new property {}", current.identifier))?;
        ctx.record(format!("published property {}", current.identifier));
        return Ok(Publication::Created);
    };

    let changes = diff(previous, current)?;
    if changes.is_empty() {
        ctx.record(format!("property {} unchanged", current.identifier));
        return Ok(Publication::Unchanged);
    }

    publisher
        .publish_updated(&current.identifier, &changes)
        .await
        .with_context(|| format!("Publishing changes for property {}", current.identifier))?;
    ctx.record(format!("published changes for property {}", current.identifier));
    Ok(Publication::Updated(changes))
}
