use super::node::CacheNode;
use crate::commands::{GlobalTransactionId, InvocationContext, WriteCommand, WriteKind};
use crate::error::Result;

/// An open transaction. Writes are staged until [`Transaction::commit`].
///
/// Dropping a transaction without committing leaves it open on this node only; nothing was
/// sent anywhere yet.
pub struct Transaction<'a> {
    node: &'a CacheNode,
    gtx: GlobalTransactionId,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(node: &'a CacheNode, gtx: GlobalTransactionId) -> Self {
        Self { node, gtx }
    }

    pub fn id(&self) -> &GlobalTransactionId {
        &self.gtx
    }

    fn ctx(&self) -> InvocationContext {
        InvocationContext::local().in_transaction(self.gtx.clone())
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.node
            .coordinator()
            .handle_write(&self.ctx(), WriteCommand::put(key, value))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.node
            .coordinator()
            .handle_write(&self.ctx(), WriteCommand::remove(key))
            .await?;
        Ok(())
    }

    /// Reads through the staged writes of this transaction, then the cache.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let staged = self.node.transactions().local_transaction(&self.gtx)?;
        for write in staged.modifications.iter().rev() {
            match &write.kind {
                WriteKind::Put { key: k, value } if k == key => return Ok(Some(value.clone())),
                WriteKind::Remove { key: k } if k == key => return Ok(None),
                WriteKind::PutAll { entries } => {
                    if let Some(value) = entries.get(key) {
                        return Ok(Some(value.clone()));
                    }
                }
                _ => {}
            }
        }
        self.node.get(key).await
    }

    /// Prepares and commits. A failed prepare is rolled back before the error is returned.
    pub async fn commit(self) -> Result<()> {
        let ctx = self.ctx();
        let coordinator = self.node.coordinator();
        if let Err(e) = coordinator.handle_prepare(&ctx, &self.gtx).await {
            tracing::warn!("Prepare of {} failed, rolling back: {}", self.gtx, e);
            if let Err(rollback) = coordinator.handle_rollback(&ctx, &self.gtx).await {
                tracing::warn!("Rollback of {} failed: {}", self.gtx, rollback);
            }
            return Err(e);
        }
        coordinator.handle_commit(&ctx, &self.gtx).await
    }

    pub async fn rollback(self) -> Result<()> {
        self.node
            .coordinator()
            .handle_rollback(&self.ctx(), &self.gtx)
            .await
    }
}
