//! Record source collaborators
//!
//! A [`RecordSource`] lists lightweight descriptors, newest filter timestamp first.
//! A [`ParentResolver`] answers the two questions parent promotion asks: what is the
//! parent of this record, and can an anonymous client see it.

mod api;

pub use api::ApiClient;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::filters::FilterParams;
use crate::model::{RecordDescriptor, RecordKind};

/// Forward-only, finite listing of records
pub trait RecordSource: Send + Sync {
    /// Descriptors in descending filter-timestamp order. A failing item does not end
    /// the stream unless the source cannot continue past it.
    fn open(
        &self,
        kind: RecordKind,
        filters: &FilterParams,
    ) -> BoxStream<'_, Result<RecordDescriptor>>;
}

/// Reference to a parent record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub id: String,
    /// Address used for the anonymous accessibility probe
    pub url: String,
}

#[async_trait]
pub trait ParentResolver: Send + Sync {
    /// Parent of `id`, or None for a root record
    async fn parent_of(&self, kind: RecordKind, id: &str) -> Result<Option<ParentRef>>;

    /// False when an unauthenticated fetch is denied
    async fn is_accessible(&self, parent: &ParentRef) -> Result<bool>;
}
