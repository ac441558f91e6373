//! Upstream enrichment API boundary
//!
//! The gateway never speaks HTTP itself; the application injects an
//! [`EnrichmentFetcher`] and the optimizer, batcher and preloader all
//! route through that single contract. Failures must be mapped by the
//! implementor onto the gateway's fixed error vocabulary.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Demographic parameters for one enrichment request
///
/// This is the only parameter schema the core understands; it exists to
/// be normalized into coarse cache keys. Request/response schemas of the
/// actual API are the caller's concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemographicParams {
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl DemographicParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }
}

/// Contract for fetching cultural-affinity results from the upstream API
#[async_trait]
pub trait EnrichmentFetcher: Send + Sync {
    /// Fetch up to `count` affinity entries for `category` given the
    /// demographic parameters.
    async fn fetch(
        &self,
        category: &str,
        params: &DemographicParams,
        count: usize,
    ) -> Result<Vec<String>>;
}

/// Adapter turning a closure into an [`EnrichmentFetcher`]
///
/// Keeps application glue and test doubles free of trait boilerplate.
pub struct FnFetcher<F>
where
    F: Fn(String, DemographicParams, usize) -> BoxFuture<'static, Result<Vec<String>>>
        + Send
        + Sync,
{
    f: F,
}

impl<F> FnFetcher<F>
where
    F: Fn(String, DemographicParams, usize) -> BoxFuture<'static, Result<Vec<String>>>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EnrichmentFetcher for FnFetcher<F>
where
    F: Fn(String, DemographicParams, usize) -> BoxFuture<'static, Result<Vec<String>>>
        + Send
        + Sync,
{
    async fn fetch(
        &self,
        category: &str,
        params: &DemographicParams,
        count: usize,
    ) -> Result<Vec<String>> {
        (self.f)(category.to_string(), params.clone(), count).await
    }
}
