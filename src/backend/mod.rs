//! The synchronization contract shared by every backend.
//!
//! A backend is constructed once at startup from configuration and handed to
//! the plugin as a `Box<dyn Backend>`. The plugin owns the routing table and
//! calls into the backend after each table mutation; lookups of fronting sets
//! go through the table itself.

pub mod template;

use crate::error::Result;
use crate::model::{FrontingSet, RouteBinding};
use crate::table::RoutingTable;
use async_trait::async_trait;

pub use template::TemplateBackend;

#[async_trait]
pub trait Backend: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Prepare the backend and return the table to start from
    async fn initialize(&mut self) -> Result<RoutingTable>;

    /// Make sure backend objects for a fronting set exist
    async fn create_frontend(&mut self, set: &FrontingSet) -> Result<()>;

    /// Tear down backend objects of a fronting set that is no longer referenced
    async fn delete_frontend(&mut self, set: &FrontingSet) -> Result<()>;

    /// Converge backend members to the endpoints currently in `set`
    async fn sync_endpoints(&mut self, set: &FrontingSet) -> Result<()>;

    /// Install the routing objects of one binding
    async fn add_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()>;

    /// Remove the routing objects of one binding
    async fn remove_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()>;

    /// Apply the full table
    async fn commit(&mut self, table: &RoutingTable) -> Result<()>;
}
