//! # wirekit
//!
//! Client-side HTTP networking layer: endpoint descriptors, an
//! adapter/processor pipeline, retries, bearer-token authorization with
//! single-flight refresh, and managers for long-running uploads and
//! resumable downloads.
//!
//! ## Design Philosophy
//!
//! wirekit is designed to be:
//! - **Pipeline-first** - every call runs build → adapters → transport → processors
//! - **Collaborator-driven** - transport, token storage and file system are traits
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Observable** - transfers expose state streams, calls log through `tracing`
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde::Deserialize;
//! use wirekit::{ApiManager, Config, Endpoint};
//!
//! #[derive(Deserialize)]
//! struct Page {
//!     data: Vec<serde_json::Value>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = ApiManager::from_config(&Config::default())?;
//!
//!     let page: Page = api
//!         .request_decoded(Endpoint::get("https://reqres.in/api", "/users").with_query("page", 2))
//!         .await?;
//!     println!("{} users", page.data.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Request execution core
pub mod api;
/// Bearer-token authorization
pub mod auth;
/// Endpoint to wire-request conversion
pub mod builder;
/// Configuration types
pub mod config;
/// Download task manager
pub mod download;
/// Endpoint descriptors
pub mod endpoint;
/// Error types
pub mod error;
/// File-system collaborator
pub mod fs;
/// Wire-level request and response values
pub mod http;
/// Adapter/processor chain and standard stages
pub mod pipeline;
/// Network reachability monitoring
pub mod reachability;
/// Retry policy and per-request retry state
pub mod retry;
/// Transport collaborators
pub mod transport;
/// Core identifiers and transfer events
pub mod types;
/// Upload task manager and multipart encoding
pub mod upload;
/// Utility functions
pub mod utils;

mod transfer;

// Re-export commonly used types
pub use api::{ApiManager, ApiManagerBuilder};
pub use auth::{
    AuthorizationData, AuthorizationManager, AuthorizationStorage, EndpointTokenRefresher,
    InMemoryAuthorizationStorage, TokenRefresher,
};
pub use config::{Config, DelayPolicy, RetryConfig, TransferConfig};
pub use download::{DownloadManager, DownloadState, DownloadTask};
pub use endpoint::{ArrayEncoding, Endpoint, EndpointRequest, QueryValue};
pub use error::{AuthorizationError, Error, Result};
pub use fs::{FileSystem, MemoryFileSystem, TokioFileSystem};
pub use http::{HttpResponse, WireRequest};
pub use pipeline::{ErrorMapper, Pipeline, RequestAdapter, ResponseProcessor};
pub use reachability::{Reachability, ReachabilityMonitor};
pub use transport::{ReplayTransport, ReqwestTransport, Transport};
pub use types::{EndpointIdentifier, RequestId, SessionId, TaskId, TransferEvent, TransferStatus};
pub use upload::{MultipartForm, UploadManager, UploadPayload, UploadState, UploadTask};
