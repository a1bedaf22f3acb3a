use std::collections::HashSet;

use async_trait::async_trait;
use novoindex_primitives::script::HashX;

/// Receives index changes once the initial sync has caught up.
#[async_trait]
pub trait Notifications: Send + Sync + 'static {
    async fn on_block(&self, touched: &HashSet<HashX>, height: i32);
}
