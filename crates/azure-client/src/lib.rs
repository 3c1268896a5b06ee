//! Azure Resource Manager network client
//!
//! A Rust client for the parts of ARM a Kubernetes Service load balancer
//! controller needs: load balancers, public IPs, network security groups,
//! private link services, subnets, and the VM/NIC reads used to place nodes
//! into backend pools.
//!
//! # Example
//!
//! ```no_run
//! use azure_client::{AzureClient, AzureClientTrait, RetryPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AzureClient::new(
//!     "https://management.azure.com".to_string(),
//!     "00000000-0000-0000-0000-000000000000".to_string(),
//!     "arm-bearer-token".to_string(),
//!     RetryPolicy::default(),
//! )?;
//!
//! let lbs = client.list_load_balancers("my-cluster-rg").await?;
//! for lb in &lbs {
//!     println!("{} has {} frontends", lb.name, lb.properties.frontend_ip_configurations.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Optimistic concurrency**: writes accept an ETag sent as `If-Match`
//! - **Long-running operations**: PUT/DELETE wait for `Azure-AsyncOperation`
//! - **Retry Logic**: exponential backoff with jitter for throttling and 5xx
//! - **Pagination**: list calls follow `nextLink`
//! - **Timed cache**: per-key TTL cache used by callers to avoid re-reading ARM
//! - **Mock**: an in-memory client behind the `test-util` feature

pub mod cache;
pub mod client;
pub mod common;
pub mod error;
pub mod models;
pub mod retry;
#[path = "trait.rs"]
pub mod azure_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use azure_trait::AzureClientTrait;
pub use cache::{CacheReadType, Getter, GetterFuture, TimedCache};
pub use client::{AzureClient, COMPUTE_API_VERSION, DEFAULT_RESOURCE_MANAGER_ENDPOINT, NETWORK_API_VERSION};
pub use common::HttpClient;
pub use error::AzureError;
pub use models::*;
pub use retry::{RetryPolicy, with_retry};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockAzureClient;
