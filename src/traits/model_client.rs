//! The underlying model invocation client.
//!
//! Implementations translate provider failures into [`ProviderError`] variants at this boundary,
//! so a rate limit is always `ProviderError::RateLimited` no matter which provider produced it.

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::ProviderError;
use crate::types::{ModelKey, ModelRequest, ModelResponse, StreamChunk};

/// A streamed model response. Failures after the stream opened arrive in-band as
/// [`StreamChunk::Error`].
pub type ModelStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run the request to completion against the model identified by `model`.
    async fn generate(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ProviderError>;

    /// Open a streamed response. Errors returned here happened before the first chunk.
    async fn stream(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelStream, ProviderError>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn generate(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ProviderError> {
        (**self).generate(model, request).await
    }

    async fn stream(
        &self,
        model: &ModelKey,
        request: &ModelRequest,
    ) -> Result<ModelStream, ProviderError> {
        (**self).stream(model, request).await
    }
}
